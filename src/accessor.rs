//! The radio-facing seam the controller consumes, per §6.2. The platform
//! SDP/L2CAP/RFCOMM/inquiry machinery itself is out of scope for this
//! crate (§1); only this trait is specified.

use std::future::Future;
use std::pin::Pin;

use crate::node::NodeDb;
use crate::{BusAddress, RadioAddress, Result};

/// A pending async call returned by [`Accessor`] methods.
///
/// Plain `async fn` in traits isn't assumed here (the teacher crate
/// targets edition 2018); trait objects with boxed futures are used
/// instead, the same shape the teacher already depends on `futures` for.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// SDP record scraped from a device found over the air.
#[derive(Clone, Debug, Default)]
pub struct SdpRecord {
    /// New UUID revision advertised by the device.
    pub uuid_rev: u32,
    /// The connectable bus address found in the record.
    pub connect_addr: Option<BusAddress>,
    /// The node database the remote piconet's master advertised.
    pub node_db: NodeDb,
}

/// Radio-accessor trait: what the core controller consumes from the
/// platform Bluetooth stack (§6.2).
pub trait Accessor: Send + Sync {
    /// Starts listening for incoming connections, returning the bus
    /// address now accepting them.
    fn start_listen(&self) -> BoxFuture<'_, BusAddress>;

    /// Stops listening for incoming connections.
    fn stop_listen(&self) -> BoxFuture<'_, ()>;

    /// Starts advertising the given node database under `uuid_rev` from
    /// `local_addr`, for `duration`. `duration == None` means forever.
    fn start_advertise(
        &self, uuid_rev: u32, local_addr: BusAddress, node_db: &NodeDb, duration: Option<std::time::Duration>,
    ) -> BoxFuture<'_, ()>;

    /// Stops advertising.
    fn stop_advertise(&self) -> BoxFuture<'_, ()>;

    /// Starts an inquiry, ignoring any device whose radio address is in
    /// `ignore_addrs`, for `duration`. `duration == None` means forever.
    fn start_find(&self, ignore_addrs: &[RadioAddress], duration: Option<std::time::Duration>) -> BoxFuture<'_, ()>;

    /// Stops the inquiry.
    fn stop_find(&self) -> BoxFuture<'_, ()>;

    /// Queries SDP for the device at `radio`, returning its scraped record.
    fn get_device_info(&self, radio: RadioAddress) -> BoxFuture<'_, SdpRecord>;

    /// Tears down the transport connection to `unique_name`.
    fn disconnect(&self, unique_name: &str) -> BoxFuture<'_, ()>;
}

/// Events the accessor delivers back into the controller, per §6.2's
/// callback pathway. Handed to the controller as an `mpsc` channel at
/// construction, mirroring how the teacher's event subsystem hands back an
/// `mpsc::UnboundedReceiver` (see `session.rs`).
#[derive(Clone, Debug)]
pub enum AccessorEvent {
    /// The local radio became available (`true`) or unavailable (`false`).
    BtDeviceAvailable(bool),
    /// An over-the-air inquiry heard a device's EIR.
    DeviceFound { radio: RadioAddress, uuid_rev: u32 },
    /// A remote daemon's advertised name set changed.
    FoundNamesChange { guid: String, names: Vec<String>, connect_addr: BusAddress, lost: bool },
}
