//! # Bluetooth Topology Controller
//!
//! Weaves the independent radio links between peer daemons into a single
//! logical message bus. One controller runs per physical Bluetooth radio;
//! many controllers cooperate per piconet/scatternet, advertising and
//! discovering well-known names on behalf of their local clients.
//!
//! The controller does not talk to the radio or to the local message bus
//! directly — see [`Accessor`] for the radio-facing seam this crate
//! consumes, and [`Controller::handle_bus_event`]/[`Controller`] for the
//! entry points a daemon integrates against.
//!
//! ## Basic usage
//! Construct a [`Controller`] with [`Controller::new`], passing a local
//! [`BusAddress`], a GUID, a [`Config`], and an [`Accessor`] implementation.
//! Then drive client requests through [`Controller::add_advertise_name`],
//! [`Controller::add_find_name`], and friends.

use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use strum::EnumString;

mod accessor;
mod config;
mod controller;
mod delegation;
mod dispatcher;
mod found_cache;
mod name_args;
mod node;
mod role;
mod wire;

pub use accessor::{Accessor, AccessorEvent, SdpRecord};
pub use config::Config;
pub use controller::{
    Controller, DbusSetStateCaller, DbusSignalSink, SetStateCall, SetStateCaller, SetStateReply, SignalSink,
};
pub use delegation::{DelegateAdvertise, DelegateFind};
pub use node::{NodeId, NodeInfo};
pub use role::Role;
pub use wire::{AdvertiseInfoEntry, FoundNodeEntry, NodeStateEntry};

pub(crate) const INVALID_UUIDREV: u32 = 0;
pub(crate) const INCOMING_PSM: u16 = u16::MAX;

/// Bluetooth controller error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human readable message, empty if the kind's doc text says it all.
    pub message: String,
}

/// Bluetooth controller error kind, following the §7 error table.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// incoming signal referenced a bus address not present in the node database
    NoSuchNode,
    /// advertisement scrape yielded a malformed or address-less SDP record
    InvalidSdp,
    /// SetState method-call reply was not a method_return
    SetStateRejected,
    /// SetState received while not master, or from a sender already known to us
    RoleViolation,
    /// SetState peer's bus address equals our own
    SelfConnect,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error sub-kind: argument marshalling and similar local failures.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// argument marshalling failed while constructing a signal: {0}
    Marshal(String),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to the message bus
    BusConnectionLost,
    /// join error: {0}
    Join(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// Bluetooth result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth radio address (48-bit, `u48`).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RadioAddress(pub [u8; 6]);

impl Display for RadioAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for RadioAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for RadioAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: std::result::Result<Vec<u8>, _> =
            s.split(':').map(|s| u8::from_str_radix(s, 16)).collect();
        let fields = fields.map_err(|_| {
            Error::with_message(ErrorKind::InvalidSdp, format!("invalid radio address: {}", s))
        })?;
        let arr: [u8; 6] = fields
            .try_into()
            .map_err(|_| Error::with_message(ErrorKind::InvalidSdp, format!("invalid radio address: {}", s)))?;
        Ok(Self(arr))
    }
}

impl From<[u8; 6]> for RadioAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<RadioAddress> for [u8; 6] {
    fn from(addr: RadioAddress) -> Self {
        addr.0
    }
}

/// A node's bus address: its radio address paired with the PSM its
/// BluetoothController interface listens on.
///
/// Ordering is lexicographic over `(radio, psm)`; this ordering is
/// protocol-significant (used for the SetState tie-break).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BusAddress {
    /// Radio address of the daemon hosting this node.
    pub radio: RadioAddress,
    /// L2CAP PSM of the node's controller endpoint, or [`INCOMING_PSM`] if
    /// not yet negotiated.
    pub psm: u16,
}

impl BusAddress {
    /// Bus address for an endpoint that has connected but not yet completed
    /// the SetState handshake.
    pub fn incoming(radio: RadioAddress) -> Self {
        Self { radio, psm: INCOMING_PSM }
    }
}

impl Display for BusAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.radio, self.psm)
    }
}
