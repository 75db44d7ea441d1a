//! Wire protocol types for the `BluetoothController` bus interface (§6.1).
//!
//! These are plain data types; the D-Bus marshalling glue (`dbus-crossroads`
//! method/signal registration) lives in [`crate::controller`] and converts
//! to/from the raw tuple shapes these types mirror.

use std::collections::BTreeSet;

use crate::node::NodeNameDelta;
use crate::{BusAddress, RadioAddress};

/// `BusAddr = (u48 radio, u16 psm)`. The radio address travels as a 6-byte
/// array over D-Bus, which has no fixed-size-array signature of its own, so
/// the wire shape carries it as `Vec<u8>` and [`addr_from_raw`] validates
/// the length back down to `[u8; 6]`.
pub type RawBusAddr = (Vec<u8>, u16);

pub(crate) fn addr_to_raw(addr: BusAddress) -> RawBusAddr {
    (addr.radio.0.to_vec(), addr.psm)
}

pub(crate) fn addr_from_raw(raw: RawBusAddr) -> BusAddress {
    let mut radio = [0u8; 6];
    let len = raw.0.len().min(6);
    radio[..len].copy_from_slice(&raw.0[..len]);
    BusAddress { radio: RadioAddress(radio), psm: raw.1 }
}

/// `AdNameMapE = (string guid, BusAddr, NameList)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdvertiseInfoEntry {
    pub guid: String,
    pub connect_addr: BusAddress,
    pub names: Vec<String>,
}

pub type RawAdNameMapE = (String, RawBusAddr, Vec<String>);

impl AdvertiseInfoEntry {
    pub(crate) fn to_raw(&self) -> RawAdNameMapE {
        (self.guid.clone(), addr_to_raw(self.connect_addr), self.names.clone())
    }

    pub(crate) fn from_raw(raw: RawAdNameMapE) -> Self {
        Self { guid: raw.0, connect_addr: addr_from_raw(raw.1), names: raw.2 }
    }
}

/// `NodeStateE = (string guid, string unique_name, BusAddr, NameList advertise_names, NameList find_names)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeStateEntry {
    pub guid: String,
    pub unique_name: String,
    pub bus_address: BusAddress,
    pub advertise_names: Vec<String>,
    pub find_names: Vec<String>,
}

pub type RawNodeStateE = (String, String, RawBusAddr, Vec<String>, Vec<String>);

impl NodeStateEntry {
    pub(crate) fn to_raw(&self) -> RawNodeStateE {
        (
            self.guid.clone(),
            self.unique_name.clone(),
            addr_to_raw(self.bus_address),
            self.advertise_names.clone(),
            self.find_names.clone(),
        )
    }

    pub(crate) fn from_raw(raw: RawNodeStateE) -> Self {
        Self {
            guid: raw.0,
            unique_name: raw.1,
            bus_address: addr_from_raw(raw.2),
            advertise_names: raw.3,
            find_names: raw.4,
        }
    }
}

/// `FoundNodeE = (BusAddr connect_addr, u32 uuid_rev, AdNameMap)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FoundNodeEntry {
    pub connect_addr: BusAddress,
    pub uuid_rev: u32,
    pub names: Vec<AdvertiseInfoEntry>,
}

pub type RawFoundNodeE = (RawBusAddr, u32, Vec<RawAdNameMapE>);

impl FoundNodeEntry {
    pub(crate) fn to_raw(&self) -> RawFoundNodeE {
        (addr_to_raw(self.connect_addr), self.uuid_rev, self.names.iter().map(|e| e.to_raw()).collect())
    }

    pub(crate) fn from_raw(raw: RawFoundNodeE) -> Self {
        Self {
            connect_addr: addr_from_raw(raw.0),
            uuid_rev: raw.1,
            names: raw.2.into_iter().map(AdvertiseInfoEntry::from_raw).collect(),
        }
    }

    /// Groups a flat list of name deltas by connect address into the
    /// `FoundNodeE` shape used by `FoundNames`/`LostNames`.
    pub(crate) fn group_by_connect_addr(deltas: &[NodeNameDelta], find_only: bool) -> Vec<FoundNodeEntry> {
        use std::collections::BTreeMap;
        let mut by_connect: BTreeMap<BusAddress, Vec<AdvertiseInfoEntry>> = BTreeMap::new();
        let mut uuid_revs: BTreeMap<BusAddress, u32> = BTreeMap::new();
        for d in deltas {
            let names: BTreeSet<String> = d.advertise_names.clone();
            if find_only && names.is_empty() {
                continue;
            }
            uuid_revs.insert(d.connect_address, d.uuid_rev);
            by_connect.entry(d.connect_address).or_default().push(AdvertiseInfoEntry {
                guid: d.guid.clone(),
                connect_addr: d.bus_address,
                names: names.into_iter().collect(),
            });
        }
        by_connect
            .into_iter()
            .map(|(connect_addr, names)| FoundNodeEntry {
                connect_addr,
                uuid_rev: uuid_revs.get(&connect_addr).copied().unwrap_or(0),
                names,
            })
            .collect()
    }
}

/// Names of every method, signal, and the fixed object path of the
/// `BluetoothController` bus interface (§6.1).
pub mod names {
    pub const INTERFACE: &str = "org.btctl.experimental.BluetoothController";
    pub const PATH: &str = "/org/btctl/experimental/BluetoothController";

    pub const METHOD_SET_STATE: &str = "SetState";

    pub const SIGNAL_FIND_NAME: &str = "FindName";
    pub const SIGNAL_CANCEL_FIND_NAME: &str = "CancelFindName";
    pub const SIGNAL_ADVERTISE_NAME: &str = "AdvertiseName";
    pub const SIGNAL_CANCEL_ADVERTISE_NAME: &str = "CancelAdvertiseName";
    pub const SIGNAL_DELEGATE_ADVERTISE: &str = "DelegateAdvertise";
    pub const SIGNAL_DELEGATE_FIND: &str = "DelegateFind";
    pub const SIGNAL_FOUND_NAMES: &str = "FoundNames";
    pub const SIGNAL_LOST_NAMES: &str = "LostNames";
    pub const SIGNAL_FOUND_DEVICE: &str = "FoundDevice";
}
