//! The top-level controller object (§2): wires `NodeDb`, `FoundCache`,
//! `RoleState`, and `DelegationEngine` behind one lock, drives every
//! mutation through the [`Dispatcher`], and exposes both the
//! `BluetoothController` bus interface (§6.1) and the local entry points a
//! daemon's name-table layer calls into.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use dbus::arg::AppendAll;
use dbus::channel::Sender;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Message;
use dbus_crossroads::{Context, Crossroads, IfaceBuilder, IfaceToken};
use futures::channel::oneshot;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Resolves the per-path `Arc<Controller>` and replies once `f` completes,
/// the same `data_ref`/`ctx.reply` shape the teacher uses for every
/// crossroads async method.
fn method_call<R: AppendAll, F: Future<Output = Result<R>> + Send + 'static>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<Controller>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<Controller> = cr.data_mut(ctx.path()).unwrap();
    let data = data_ref.clone();
    async move {
        let result = f(data).await.map_err(|e| dbus::MethodErr::failed(&e.to_string()));
        ctx.reply(result)
    }
}

use crate::accessor::{Accessor, AccessorEvent};
use crate::config::Config;
use crate::delegation::{AdmissionInputs, DelegateAdvertise, DelegateFind, DelegationEngine};
use crate::dispatcher::{AlarmId, Dispatcher};
use crate::found_cache::{DeviceFoundOutcome, FoundCache};
use crate::node::{NodeDb, NodeInfo};
use crate::role::{Role, RoleState, SetStateOutcome, TieBreak};
use crate::wire::{self, names, AdvertiseInfoEntry, FoundNodeEntry, NodeStateEntry};
use crate::{BusAddress, Error, ErrorKind, RadioAddress, Result, INVALID_UUIDREV};

/// Body of an incoming SetState call (§6.1). The reply echoes the same
/// shape minus `caller_minion_count`.
#[derive(Clone, Debug)]
pub struct SetStateCall {
    pub caller_minion_count: u8,
    pub caller_uuid_rev: u32,
    pub caller_addr: BusAddress,
    pub node_states: Vec<NodeStateEntry>,
    pub found_nodes: Vec<FoundNodeEntry>,
}

/// Reply to a SetState call, and the shape a reply to our own outgoing
/// SetState arrives in.
#[derive(Clone, Debug)]
pub struct SetStateReply {
    pub uuid_rev: u32,
    pub bus_addr: BusAddress,
    pub node_states: Vec<NodeStateEntry>,
    pub found_nodes: Vec<FoundNodeEntry>,
}

impl SetStateReply {
    /// The reply sent when the simultaneous-SetState tie-break tells us to
    /// discard the peer's call (§4.3).
    fn ignore_marker(our_addr: BusAddress) -> Self {
        Self { uuid_rev: INVALID_UUIDREV, bus_addr: our_addr, node_states: Vec::new(), found_nodes: Vec::new() }
    }
}

/// Where outgoing `BluetoothController` signals and local name-change
/// notifications go (§4.6, §6.1). Production code backs this with a live
/// connection; tests record into memory.
pub trait SignalSink: Send + Sync {
    /// `FoundNames`/`LostNames` addressed to one direct minion with
    /// non-empty `find_names` (§4.6 point 2).
    fn found_names(&self, to: BusAddress, entries: Vec<FoundNodeEntry>);
    fn lost_names(&self, to: BusAddress, entries: Vec<FoundNodeEntry>);
    /// Same payloads, delivered to this daemon's own local bus listeners
    /// (§4.6 point 3).
    fn local_found_names(&self, entries: Vec<FoundNodeEntry>);
    fn local_lost_names(&self, entries: Vec<FoundNodeEntry>);
    fn delegate_advertise(&self, to: BusAddress, signal: DelegateAdvertise);
    fn delegate_find(&self, to: BusAddress, signal: DelegateFind);
    /// A minion pushing a local name-table change up to its master (§6.1);
    /// `requester` is this daemon's own bus address.
    fn advertise_name(&self, to: BusAddress, requester: BusAddress, name: &str);
    fn cancel_advertise_name(&self, to: BusAddress, requester: BusAddress, name: &str);
    fn find_name(&self, to: BusAddress, requester: BusAddress, name: &str);
    fn cancel_find_name(&self, to: BusAddress, requester: BusAddress, name: &str);
    /// `FoundDevice(radio, uuid_rev)`: a raw over-the-air inquiry hit,
    /// broadcast to local bus listeners independent of whatever the
    /// found-cache does with it (§6.1).
    fn found_device(&self, radio: RadioAddress, uuid_rev: u32);
}

/// Makes the synchronous SetState method call (§6.1) to a peer's
/// `BluetoothController` endpoint. Split out from [`SignalSink`] because
/// it is a method call awaiting a reply, not a fire-and-forget signal; the
/// dispatcher is the only caller, per §4.5 "Blocking calls".
pub trait SetStateCaller: Send + Sync {
    fn call_set_state(
        &self, to: BusAddress, to_unique_name: &str, call: SetStateCall, timeout: Duration,
    ) -> crate::accessor::BoxFuture<'_, SetStateReply>;
}

/// Calls `SetState` over a live D-Bus connection via `nonblock::Proxy`,
/// the same `Proxy::new(service, path, timeout, connection)` /
/// `proxy.method_call(...)` idiom the teacher uses for outgoing calls
/// (`gatt/remote.rs`, `adapter.rs`).
pub struct DbusSetStateCaller {
    connection: Arc<SyncConnection>,
}

impl DbusSetStateCaller {
    pub fn new(connection: Arc<SyncConnection>) -> Self {
        Self { connection }
    }
}

impl SetStateCaller for DbusSetStateCaller {
    fn call_set_state(
        &self, to: BusAddress, to_unique_name: &str, call: SetStateCall, timeout: Duration,
    ) -> crate::accessor::BoxFuture<'_, SetStateReply> {
        let _ = to;
        let destination = to_unique_name.to_string();
        let connection = self.connection.clone();
        Box::pin(async move {
            let proxy = Proxy::new(destination, names::PATH, timeout, connection);
            let args = (
                call.caller_minion_count,
                call.caller_uuid_rev,
                wire::addr_to_raw(call.caller_addr),
                call.node_states.iter().map(NodeStateEntry::to_raw).collect::<Vec<_>>(),
                call.found_nodes.iter().map(FoundNodeEntry::to_raw).collect::<Vec<_>>(),
            );
            let (uuid_rev, bus_addr, node_states, found_nodes): (
                u32,
                wire::RawBusAddr,
                Vec<wire::RawNodeStateE>,
                Vec<wire::RawFoundNodeE>,
            ) = proxy
                .method_call(names::INTERFACE, names::METHOD_SET_STATE, args)
                .await
                .map_err(|e| Error::with_message(ErrorKind::SetStateRejected, e.to_string()))?;
            Ok(SetStateReply {
                uuid_rev,
                bus_addr: wire::addr_from_raw(bus_addr),
                node_states: node_states.into_iter().map(NodeStateEntry::from_raw).collect(),
                found_nodes: found_nodes.into_iter().map(FoundNodeEntry::from_raw).collect(),
            })
        })
    }
}

/// Emits `BluetoothController` signals over a live D-Bus connection,
/// following the `Message::new_signal(...).append(...)` idiom the teacher
/// crate uses for outgoing method calls (`bluetooth_obex.rs`).
pub struct DbusSignalSink {
    connection: Arc<SyncConnection>,
}

impl DbusSignalSink {
    pub fn new(connection: Arc<SyncConnection>) -> Self {
        Self { connection }
    }

    fn send<A: AppendAll>(&self, member: &str, args: A) {
        match Message::new_signal(names::PATH, names::INTERFACE, member) {
            Ok(mut msg) => {
                msg.append_all(args);
                let _ = self.connection.send(msg);
            }
            Err(err) => log::error!("failed to build {} signal: {}", member, err),
        }
    }
}

impl SignalSink for DbusSignalSink {
    fn found_names(&self, _to: BusAddress, entries: Vec<FoundNodeEntry>) {
        self.send(names::SIGNAL_FOUND_NAMES, (entries.iter().map(FoundNodeEntry::to_raw).collect::<Vec<_>>(),));
    }

    fn lost_names(&self, _to: BusAddress, entries: Vec<FoundNodeEntry>) {
        self.send(names::SIGNAL_LOST_NAMES, (entries.iter().map(FoundNodeEntry::to_raw).collect::<Vec<_>>(),));
    }

    fn local_found_names(&self, entries: Vec<FoundNodeEntry>) {
        self.found_names(BusAddress::incoming(RadioAddress::default()), entries);
    }

    fn local_lost_names(&self, entries: Vec<FoundNodeEntry>) {
        self.lost_names(BusAddress::incoming(RadioAddress::default()), entries);
    }

    fn delegate_advertise(&self, _to: BusAddress, signal: DelegateAdvertise) {
        let name_map = signal.name_map.iter().map(|e| e.to_raw()).collect::<Vec<_>>();
        let duration_ms = signal.duration.map(|d| d.as_millis() as u32).unwrap_or(0);
        self.send(
            names::SIGNAL_DELEGATE_ADVERTISE,
            (signal.uuid_rev, wire::addr_to_raw(signal.connect_addr), name_map, duration_ms),
        );
    }

    fn delegate_find(&self, _to: BusAddress, signal: DelegateFind) {
        let ignore: Vec<Vec<u8>> = signal.ignore_addrs.iter().map(|a| a.0.to_vec()).collect();
        let duration_ms = signal.duration.map(|d| d.as_millis() as u32).unwrap_or(0);
        self.send(names::SIGNAL_DELEGATE_FIND, (signal.result_dest, ignore, duration_ms));
    }

    fn advertise_name(&self, _to: BusAddress, requester: BusAddress, name: &str) {
        self.send(names::SIGNAL_ADVERTISE_NAME, (wire::addr_to_raw(requester), name.to_string()));
    }

    fn cancel_advertise_name(&self, _to: BusAddress, requester: BusAddress, name: &str) {
        self.send(names::SIGNAL_CANCEL_ADVERTISE_NAME, (wire::addr_to_raw(requester), name.to_string()));
    }

    fn find_name(&self, _to: BusAddress, requester: BusAddress, name: &str) {
        self.send(names::SIGNAL_FIND_NAME, (wire::addr_to_raw(requester), name.to_string()));
    }

    fn cancel_find_name(&self, _to: BusAddress, requester: BusAddress, name: &str) {
        self.send(names::SIGNAL_CANCEL_FIND_NAME, (wire::addr_to_raw(requester), name.to_string()));
    }

    fn found_device(&self, radio: RadioAddress, uuid_rev: u32) {
        self.send(names::SIGNAL_FOUND_DEVICE, (radio.0.to_vec(), uuid_rev));
    }
}

/// Which aggregated name set a local mutation targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NameKind {
    Advertise,
    Find,
}

/// All state guarded by the controller lock (§5): acquired before any
/// `NodeDb`/`FoundCache` internal operation, never released mid-mutation.
struct ControllerState {
    local_addr: BusAddress,
    node_db: NodeDb,
    found_cache: FoundCache,
    role: RoleState,
    delegation: DelegationEngine,
    config: Config,
    listening: bool,
    /// Alarm that auto-stops a delegated advertise/find we are currently
    /// running on a master's behalf, cancelled and reissued whenever a
    /// fresh `DelegateAdvertise`/`DelegateFind` arrives (§4.4).
    advertise_stop_alarm: Option<AlarmId>,
    find_stop_alarm: Option<AlarmId>,
    /// Single absolute-time alarm for found-cache expiry (§4.2), cancelled
    /// and reposted whenever `next_expiration()` changes.
    found_cache_alarm: Option<AlarmId>,
}

impl ControllerState {
    fn is_master(&self) -> bool {
        self.role.is_master()
    }

    fn direct_minion_count(&self) -> usize {
        self.node_db.direct_minion_count()
    }

    fn admission_inputs(&self) -> AdmissionInputs {
        AdmissionInputs {
            is_master: self.is_master(),
            direct_minion_count: self.direct_minion_count(),
            max_connections: self.config.max_connections,
            radio_listening: self.listening,
        }
    }

    /// Merges `entries` into the node database as nodes reachable via
    /// `connect_addr`, marking `connect_addr` itself as a direct minion.
    fn import_node_states(&mut self, connect_addr: BusAddress, entries: &[NodeStateEntry]) {
        let connect_id = match self.node_db.find_by_addr(connect_addr) {
            Some(id) => id,
            None => {
                let mut bridge = NodeInfo::new_self(String::new(), String::new(), connect_addr);
                bridge.direct_minion = true;
                self.node_db.insert(bridge)
            }
        };
        if let Some(node) = self.node_db.get_mut(connect_id) {
            node.connect_node = connect_id;
            node.direct_minion = true;
        }

        for e in entries {
            let mut info = NodeInfo::new_self(e.guid.clone(), e.unique_name.clone(), e.bus_address);
            info.advertise_names = e.advertise_names.iter().cloned().collect();
            info.find_names = e.find_names.iter().cloned().collect();
            info.connect_node = connect_id;
            info.direct_minion = e.bus_address == connect_addr;
            match self.node_db.find_by_addr(e.bus_address) {
                Some(id) if id != connect_id => {
                    if let Some(slot) = self.node_db.get_mut(id) {
                        *slot = info;
                    }
                }
                Some(_) => {}
                None => {
                    self.node_db.insert(info);
                }
            }
        }
        // Piconet membership just changed: the next delegation rotation
        // must re-advertise the joining names and re-ignore their radios
        // during delegated find (§4.4), not reuse the stale cached payload.
        self.delegation.mark_advertise_dirty();
        self.delegation.mark_find_dirty();
    }

    /// Inserts (or refreshes) our own master's bus address as a node in
    /// our database, per §8 scenario 2 ("B's NodeDB has self+A"). Unlike
    /// [`Self::import_node_states`], this node is *not* flagged
    /// `direct_minion`: it is our master, not a minion of ours, and must
    /// stay out of `direct_minion_count`/delegate rotation.
    fn insert_master_node(&mut self, master_addr: BusAddress) {
        let id = match self.node_db.find_by_addr(master_addr) {
            Some(id) => id,
            None => self.node_db.insert(NodeInfo::new_self(String::new(), String::new(), master_addr)),
        };
        if let Some(node) = self.node_db.get_mut(id) {
            node.connect_node = id;
        }
    }

    fn export_node_states(&self) -> Vec<NodeStateEntry> {
        self.node_db
            .iter()
            .map(|(_, n)| NodeStateEntry {
                guid: n.guid.clone(),
                unique_name: n.unique_name.clone(),
                bus_address: n.bus_address,
                advertise_names: n.advertise_names.iter().cloned().collect(),
                find_names: n.find_names.iter().cloned().collect(),
            })
            .collect()
    }

    /// Our own found-cache contents, grouped into the `FoundNodeE` wire
    /// shape, as handed to a peer that just lost mastery to us (§4.3).
    fn export_found_nodes(&self) -> Vec<FoundNodeEntry> {
        let empty = NodeDb::new();
        let (present, _) = self.found_cache.db().diff(&empty);
        FoundNodeEntry::group_by_connect_addr(&present, false)
    }

    /// Absorbs found-cache entries handed to us by a peer, e.g. the
    /// winning master's cache on our own loss (§4.3 "copies the winner's
    /// found-cache deltas into its own FoundCache").
    fn import_found_nodes(&mut self, entries: &[FoundNodeEntry]) {
        let deadline = Instant::now() + self.config.lost_device_timeout;
        for fe in entries {
            let mut scraped = NodeDb::new();
            for name_entry in &fe.names {
                let mut info = NodeInfo::new_self(name_entry.guid.clone(), String::new(), name_entry.connect_addr);
                info.advertise_names = name_entry.names.iter().cloned().collect();
                info.uuid_rev = fe.uuid_rev;
                scraped.insert(info);
            }
            self.found_cache.apply_scrape(fe.connect_addr, &scraped, deadline.into());
        }
    }

    /// Handles an incoming SetState call (§4.3 `HandleSetState`).
    fn handle_set_state(&mut self, call: SetStateCall) -> Result<SetStateReply> {
        crate::role::check_not_self(self.local_addr, call.caller_addr)?;

        if !self.is_master() || self.node_db.find_by_addr(call.caller_addr).is_some() {
            return Err(crate::role::reject_role_violation());
        }

        if self.role.has_outgoing(call.caller_addr)
            && self.role.tie_break(self.local_addr, call.caller_addr) == TieBreak::IgnoreIncoming
        {
            return Ok(SetStateReply::ignore_marker(self.local_addr));
        }

        let our_minions = self.direct_minion_count() as u8;
        match self.role.decide_incoming_set_state(call.caller_addr, call.caller_minion_count, our_minions) {
            SetStateOutcome::WeRemainMaster => {
                self.import_node_states(call.caller_addr, &call.node_states);
                self.role.regenerate_uuid_rev(call.caller_uuid_rev);
                Ok(SetStateReply {
                    uuid_rev: self.role.master_uuid_rev(),
                    bus_addr: self.local_addr,
                    node_states: Vec::new(),
                    found_nodes: self.export_found_nodes(),
                })
            }
            SetStateOutcome::WeBecomeMinionOf(peer_addr) => {
                // The reply carries our own (pre-transition) uuid_rev, not
                // the caller's: the caller is becoming master and needs our
                // old revision to regenerate its own outside our band
                // (§4.3 "UUID-revision bookkeeping").
                let our_old_uuid_rev = self.role.master_uuid_rev();
                let flush_deadline = Instant::now() + self.config.lost_device_timeout;
                self.found_cache.flush(flush_deadline.into());
                self.import_found_nodes(&call.found_nodes);
                self.role.become_minion_of(peer_addr, String::new(), call.caller_uuid_rev);
                let reply = SetStateReply {
                    uuid_rev: our_old_uuid_rev,
                    bus_addr: self.local_addr,
                    node_states: self.export_node_states(),
                    found_nodes: Vec::new(),
                };
                Ok(reply)
            }
        }
    }

    /// Handles the reply to a SetState call we originated (§4.3
    /// `DeferredProcessSetStateReply`): empty `node_states` means the
    /// replier remained master and we become its minion.
    fn handle_set_state_reply(&mut self, peer_addr: BusAddress, reply: SetStateReply) {
        self.role.clear_outgoing(peer_addr);
        if reply.uuid_rev == INVALID_UUIDREV {
            return;
        }
        if reply.node_states.is_empty() {
            self.insert_master_node(peer_addr);
            self.import_found_nodes(&reply.found_nodes);
            self.role.become_minion_of(peer_addr, String::new(), reply.uuid_rev);
        } else {
            self.import_node_states(peer_addr, &reply.node_states);
            self.role.regenerate_uuid_rev(reply.uuid_rev);
        }
    }

    /// Master loss (§4.3): drop the stale master node entry, promote
    /// self, and flush the found-cache so stale names are re-sourced
    /// from the new topology.
    fn handle_master_lost(&mut self, master_addr: BusAddress) {
        if let Some(id) = self.node_db.find_by_addr(master_addr) {
            self.node_db.remove(id);
        }
        let deadline = Instant::now() + self.config.lost_device_timeout;
        self.found_cache.flush(deadline.into());
        self.role.promote_to_master();
        self.delegation.mark_advertise_dirty();
        self.delegation.mark_find_dirty();
    }

    /// Minion loss (§4.3): downgrade the departing node into the
    /// found-cache with a fresh expiry so clients still see a timed-out
    /// LostNames rather than a silent disappearance.
    fn handle_minion_lost(&mut self, addr: BusAddress) {
        let reachable = self.node_db.nodes_reachable_via(addr);
        let deadline = Instant::now() + self.config.lost_device_timeout;
        for id in reachable {
            if let Some(info) = self.node_db.remove(id) {
                self.found_cache.insert_departing(info, deadline.into());
            }
        }
        self.delegation.mark_advertise_dirty();
        self.delegation.mark_find_dirty();
    }

    fn mutate_self_names(&mut self, kind: NameKind, f: impl FnOnce(&mut NodeInfo)) -> (Vec<crate::node::NodeNameDelta>, Vec<crate::node::NodeNameDelta>) {
        self.mutate_node_names(self.local_addr, kind, f)
    }

    /// Mutates the name set of whichever node sits at `addr`, master or
    /// not (§6.1: a master applies the same mutation on behalf of a minion
    /// that pushed it an `AdvertiseName`/`FindName` signal).
    fn mutate_node_names(
        &mut self, addr: BusAddress, kind: NameKind, f: impl FnOnce(&mut NodeInfo),
    ) -> (Vec<crate::node::NodeNameDelta>, Vec<crate::node::NodeNameDelta>) {
        let before = self.node_db.clone();
        if let Some(id) = self.node_db.find_by_addr(addr) {
            if let Some(info) = self.node_db.get_mut(id) {
                f(info);
            }
        }
        match kind {
            NameKind::Advertise => self.delegation.mark_advertise_dirty(),
            NameKind::Find => self.delegation.mark_find_dirty(),
        }
        if self.is_master() {
            self.role.increment_uuid_rev();
        }
        self.node_db.diff(&before)
    }
}

/// Immediate operations funneled through the [`Dispatcher`] (§4.5).
enum ControllerOp {
    AddAdvertiseName(String),
    RemoveAdvertiseName(String),
    AddFindName(String),
    RemoveFindName(String),
    /// A bus-delivered `AdvertiseName`/`CancelAdvertiseName`/`FindName`/
    /// `CancelFindName` signal from a minion we are master of (§6.1).
    RemoteAdvertiseName { requester: BusAddress, name: String },
    RemoteCancelAdvertiseName { requester: BusAddress, name: String },
    RemoteFindName { requester: BusAddress, name: String },
    RemoteCancelFindName { requester: BusAddress, name: String },
    DeviceFound { radio: RadioAddress, uuid_rev: u32 },
    EndpointLost { addr: BusAddress },
    IncomingSetState { call: SetStateCall, reply: oneshot::Sender<Result<SetStateReply>> },
    SetStateReplyReceived { peer_addr: BusAddress, reply: SetStateReply },
    /// The origination side of the SetState exchange (§4.3 "Origination
    /// rule"): posted once an outgoing transport connection to `peer_addr`
    /// finishes authenticating.
    SendSetState { peer_addr: BusAddress, peer_unique_name: String },
    /// A `DelegateAdvertise`/`DelegateFind` signal received from our
    /// master, telling us to run (or stop) inquiry-scan/inquiry on its
    /// behalf (§4.4).
    HandleDelegateAdvertise {
        uuid_rev: u32,
        connect_addr: BusAddress,
        name_map: Vec<AdvertiseInfoEntry>,
        duration: Option<Duration>,
    },
    HandleDelegateFind { ignore_addrs: Vec<RadioAddress>, duration: Option<Duration> },
    /// Fired by the auto-stop alarm a delegated advertise/find schedules
    /// for itself.
    StopDelegatedAdvertise,
    StopDelegatedFind,
    BtDeviceAvailable(bool),
    /// §6.2 callback: a delegated (or locally run) inquiry reported a
    /// remote node's name set, or its loss.
    FoundNamesChange { guid: String, names: Vec<String>, connect_addr: BusAddress, lost: bool },
    RotateDelegation,
    ExpireFoundCache,
}

/// Top-level Bluetooth topology controller; one instance per physical
/// radio (§1).
pub struct Controller {
    state: Mutex<ControllerState>,
    accessor: Arc<dyn Accessor>,
    sink: Arc<dyn SignalSink>,
    caller: Arc<dyn SetStateCaller>,
    dispatcher: Dispatcher<ControllerOp>,
}

impl Controller {
    /// Builds a controller for a freshly booted daemon: master of itself,
    /// with an empty node database save for `self`.
    pub fn new(
        guid: impl Into<String>, unique_name: impl Into<String>, local_addr: BusAddress, config: Config,
        accessor: Arc<dyn Accessor>, sink: Arc<dyn SignalSink>, caller: Arc<dyn SetStateCaller>,
    ) -> Arc<Self> {
        let mut node_db = NodeDb::new();
        node_db.insert_self(NodeInfo::new_self(guid, unique_name, local_addr));

        let state = ControllerState {
            local_addr,
            node_db,
            found_cache: FoundCache::new(),
            role: RoleState::new(),
            delegation: DelegationEngine::new(),
            config,
            listening: false,
            advertise_stop_alarm: None,
            find_stop_alarm: None,
            found_cache_alarm: None,
        };

        let (dispatcher, mut ops) = Dispatcher::new();
        let controller = Arc::new(Self { state: Mutex::new(state), accessor, sink, caller, dispatcher });

        let worker = controller.clone();
        tokio::spawn(async move {
            while let Some(op) = ops.recv().await {
                worker.run_op(op).await;
            }
        });

        // Starts the radio listening for incoming connections, then kicks
        // off the self-rescheduling delegation-rotation alarm (§4.4) once
        // we know whether the radio is actually up; found-cache expiry
        // schedules its own first alarm lazily, the first time a scrape or
        // device-found populates the cache.
        let starter = controller.clone();
        tokio::spawn(async move {
            match starter.accessor.start_listen().await {
                Ok(_) => starter.state.lock().await.listening = true,
                Err(err) => log::error!("failed to start listening: {}", err),
            }
            starter.rotate_delegation();
        });

        controller
    }

    /// Spawns a task translating the accessor's callback pathway (§6.2)
    /// into controller operations, mirroring how the teacher's event
    /// subsystem is drained by one spawned task per `mpsc::UnboundedReceiver`
    /// (`session.rs`).
    pub fn spawn_accessor_events(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<AccessorEvent>) {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AccessorEvent::BtDeviceAvailable(available) => controller.bt_device_available(available),
                    AccessorEvent::DeviceFound { radio, uuid_rev } => controller.device_found(radio, uuid_rev),
                    AccessorEvent::FoundNamesChange { guid, names, connect_addr, lost } => {
                        controller.dispatcher.post(ControllerOp::FoundNamesChange { guid, names, connect_addr, lost });
                    }
                }
            }
        });
    }

    async fn run_op(&self, op: ControllerOp) {
        match op {
            ControllerOp::AddAdvertiseName(name) => {
                let resend_name = name.clone();
                self.apply_name_mutation(NameKind::Advertise, move |n| {
                    n.advertise_names.insert(name);
                }, move |sink, to, requester| sink.advertise_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoveAdvertiseName(name) => {
                let resend_name = name.clone();
                self.apply_name_mutation(NameKind::Advertise, move |n| {
                    n.advertise_names.remove(&name);
                }, move |sink, to, requester| sink.cancel_advertise_name(to, requester, &resend_name)).await
            }
            ControllerOp::AddFindName(name) => {
                let resend_name = name.clone();
                self.apply_name_mutation(NameKind::Find, move |n| {
                    n.find_names.insert(name);
                }, move |sink, to, requester| sink.find_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoveFindName(name) => {
                let resend_name = name.clone();
                self.apply_name_mutation(NameKind::Find, move |n| {
                    n.find_names.remove(&name);
                }, move |sink, to, requester| sink.cancel_find_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoteAdvertiseName { requester, name } => {
                let resend_name = name.clone();
                self.apply_remote_name_mutation(requester, NameKind::Advertise, move |n| {
                    n.advertise_names.insert(name);
                }, move |sink, to, requester| sink.advertise_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoteCancelAdvertiseName { requester, name } => {
                let resend_name = name.clone();
                self.apply_remote_name_mutation(requester, NameKind::Advertise, move |n| {
                    n.advertise_names.remove(&name);
                }, move |sink, to, requester| sink.cancel_advertise_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoteFindName { requester, name } => {
                let resend_name = name.clone();
                self.apply_remote_name_mutation(requester, NameKind::Find, move |n| {
                    n.find_names.insert(name);
                }, move |sink, to, requester| sink.find_name(to, requester, &resend_name)).await
            }
            ControllerOp::RemoteCancelFindName { requester, name } => {
                let resend_name = name.clone();
                self.apply_remote_name_mutation(requester, NameKind::Find, move |n| {
                    n.find_names.remove(&name);
                }, move |sink, to, requester| sink.cancel_find_name(to, requester, &resend_name)).await
            }
            ControllerOp::DeviceFound { radio, uuid_rev } => self.apply_device_found(radio, uuid_rev).await,
            ControllerOp::EndpointLost { addr } => self.apply_endpoint_lost(addr).await,
            ControllerOp::IncomingSetState { call, reply } => {
                let result = self.state.lock().await.handle_set_state(call);
                let _ = reply.send(result);
                self.ensure_found_cache_alarm().await;
            }
            ControllerOp::SetStateReplyReceived { peer_addr, reply } => {
                self.state.lock().await.handle_set_state_reply(peer_addr, reply);
                self.ensure_found_cache_alarm().await;
            }
            ControllerOp::SendSetState { peer_addr, peer_unique_name } => {
                self.apply_send_set_state(peer_addr, peer_unique_name).await
            }
            ControllerOp::HandleDelegateAdvertise { uuid_rev, connect_addr, name_map, duration } => {
                self.apply_handle_delegate_advertise(uuid_rev, connect_addr, name_map, duration).await
            }
            ControllerOp::HandleDelegateFind { ignore_addrs, duration } => {
                self.apply_handle_delegate_find(ignore_addrs, duration).await
            }
            ControllerOp::StopDelegatedAdvertise => {
                let _ = self.accessor.stop_advertise().await;
            }
            ControllerOp::StopDelegatedFind => {
                let _ = self.accessor.stop_find().await;
            }
            ControllerOp::BtDeviceAvailable(available) => self.apply_bt_device_available(available).await,
            ControllerOp::FoundNamesChange { guid, names, connect_addr, lost } => {
                self.apply_found_names_change(guid, names, connect_addr, lost).await
            }
            ControllerOp::RotateDelegation => self.apply_delegation_rotation().await,
            ControllerOp::ExpireFoundCache => self.apply_found_cache_expiry().await,
        }
    }

    /// Origination side of the SetState exchange (§4.3 "Origination
    /// rule"): builds a call from our current state and sends it
    /// synchronously to `peer_addr`. A rejected/timed-out call is treated
    /// as a peer disconnect (§5 "Cancellation / timeout").
    async fn apply_send_set_state(&self, peer_addr: BusAddress, peer_unique_name: String) {
        let (call, timeout) = {
            let mut st = self.state.lock().await;
            st.role.begin_outgoing(peer_addr);
            let call = SetStateCall {
                caller_minion_count: st.direct_minion_count() as u8,
                caller_uuid_rev: st.role.master_uuid_rev(),
                caller_addr: st.local_addr,
                node_states: st.export_node_states(),
                found_nodes: st.export_found_nodes(),
            };
            (call, st.config.set_state_timeout)
        };

        match self.caller.call_set_state(peer_addr, &peer_unique_name, call, timeout).await {
            Ok(reply) => {
                self.state.lock().await.handle_set_state_reply(peer_addr, reply);
                self.ensure_found_cache_alarm().await;
                self.apply_delegation_rotation().await;
            }
            Err(err) => {
                log::warn!("SetState to {} rejected or timed out: {}", peer_addr, err);
                self.state.lock().await.role.clear_outgoing(peer_addr);
                let _ = self.accessor.disconnect(&peer_unique_name).await;
            }
        }
    }

    /// We are a direct minion and our master has delegated advertising to
    /// us (§4.4). An empty `name_map`/`duration` is the stop marker.
    async fn apply_handle_delegate_advertise(
        &self, uuid_rev: u32, connect_addr: BusAddress, name_map: Vec<AdvertiseInfoEntry>, duration: Option<Duration>,
    ) {
        if let Some(id) = self.state.lock().await.advertise_stop_alarm.take() {
            self.dispatcher.cancel(id);
        }
        let Some(duration) = duration.filter(|_| !name_map.is_empty()) else {
            let _ = self.accessor.stop_advertise().await;
            return;
        };
        let mut db = NodeDb::new();
        for e in &name_map {
            let mut info = NodeInfo::new_self(e.guid.clone(), String::new(), e.connect_addr);
            info.advertise_names = e.names.iter().cloned().collect();
            db.insert(info);
        }
        if let Err(err) = self.accessor.start_advertise(uuid_rev, connect_addr, &db, Some(duration)).await {
            log::warn!("delegated start_advertise failed: {}", err);
            return;
        }
        let alarm = self.dispatcher.post_delayed(ControllerOp::StopDelegatedAdvertise, Instant::now() + duration);
        self.state.lock().await.advertise_stop_alarm = Some(alarm);
    }

    /// We are a direct minion and our master has delegated inquiry to us
    /// (§4.4). A `None` duration is the stop marker.
    async fn apply_handle_delegate_find(&self, ignore_addrs: Vec<RadioAddress>, duration: Option<Duration>) {
        if let Some(id) = self.state.lock().await.find_stop_alarm.take() {
            self.dispatcher.cancel(id);
        }
        let Some(duration) = duration else {
            let _ = self.accessor.stop_find().await;
            return;
        };
        if let Err(err) = self.accessor.start_find(&ignore_addrs, Some(duration)).await {
            log::warn!("delegated start_find failed: {}", err);
            return;
        }
        let alarm = self.dispatcher.post_delayed(ControllerOp::StopDelegatedFind, Instant::now() + duration);
        self.state.lock().await.find_stop_alarm = Some(alarm);
    }

    /// §6.2 `bt_device_available`: radio coming up re-arms delegation
    /// (admission depends on `radio_listening`); going down stops whatever
    /// we were locally running.
    async fn apply_bt_device_available(&self, available: bool) {
        {
            self.state.lock().await.listening = available;
        }
        if available {
            self.apply_delegation_rotation().await;
        } else {
            let _ = self.accessor.stop_advertise().await;
            let _ = self.accessor.stop_find().await;
        }
    }

    /// §6.2 `found_names_change`: a delegated (or locally run) inquiry
    /// reported `guid`'s current name set at `connect_addr`, or its loss.
    /// Reuses the found-cache scrape pathway: an empty scraped db for
    /// `lost == true` diffs away everything previously cached there.
    async fn apply_found_names_change(&self, guid: String, names: Vec<String>, connect_addr: BusAddress, lost: bool) {
        let deadline = {
            let st = self.state.lock().await;
            Instant::now() + st.config.lost_device_timeout
        };
        let mut scraped = NodeDb::new();
        if !lost {
            let mut info = NodeInfo::new_self(guid, String::new(), connect_addr);
            info.advertise_names = names.into_iter().collect();
            scraped.insert(info);
        }
        let (added, removed) = {
            let mut st = self.state.lock().await;
            st.found_cache.apply_scrape(connect_addr, &scraped, deadline.into())
        };
        self.emit_name_changes(added, removed).await;
        self.ensure_found_cache_alarm().await;
    }

    /// Applies a local `AddAdvertiseName`/`RemoveAdvertiseName`/`AddFindName`/
    /// `RemoveFindName` request. When we are not master, `resend` also pushes
    /// the same change up to our master over the matching bus signal (§6.1
    /// scenario 3: "B then calls AddAdvertiseName... A receives the
    /// AdvertiseName signal").
    async fn apply_name_mutation(
        &self, kind: NameKind, f: impl FnOnce(&mut NodeInfo),
        resend: impl FnOnce(&dyn SignalSink, BusAddress, BusAddress),
    ) {
        let (added, removed, local_addr, master_addr) = {
            let mut st = self.state.lock().await;
            let (added, removed) = st.mutate_self_names(kind, f);
            (added, removed, st.local_addr, st.role.master_addr())
        };
        if let Some(master_addr) = master_addr {
            resend(self.sink.as_ref(), master_addr, local_addr);
        }
        self.emit_name_changes(added, removed).await;
    }

    /// Applies a name-set mutation pushed onto us by `requester` over an
    /// `AdvertiseName`/`FindName` bus signal (§6.1). We act on it only as
    /// `requester`'s master; a drone instead relays the signal one hop
    /// further up its own outgoing link, using `resend` to re-emit the same
    /// kind of signal toward our own master.
    async fn apply_remote_name_mutation(
        &self, requester: BusAddress, kind: NameKind, f: impl FnOnce(&mut NodeInfo),
        resend: impl FnOnce(&dyn SignalSink, BusAddress, BusAddress),
    ) {
        let (added, removed, forward_to) = {
            let mut st = self.state.lock().await;
            if st.is_master() {
                let (added, removed) = st.mutate_node_names(requester, kind, f);
                (added, removed, None)
            } else {
                (Vec::new(), Vec::new(), st.role.master_addr())
            }
        };
        if let Some(master_addr) = forward_to {
            resend(self.sink.as_ref(), master_addr, requester);
        }
        self.emit_name_changes(added, removed).await;
    }

    async fn apply_device_found(&self, radio: RadioAddress, uuid_rev: u32) {
        self.sink.found_device(radio, uuid_rev);
        let refresh_deadline = {
            let st = self.state.lock().await;
            Instant::now() + st.config.lost_device_timeout
        };
        let outcome = { self.state.lock().await.found_cache.device_found(radio, uuid_rev, refresh_deadline.into()) };
        if outcome == DeviceFoundOutcome::Refreshed {
            return;
        }
        match self.accessor.get_device_info(radio).await {
            Ok(record) => {
                let Some(connect_addr) = record.connect_addr else {
                    log::warn!("SDP record for {} carried no connect address", radio);
                    return;
                };
                let (added, removed) = {
                    let mut st = self.state.lock().await;
                    let deadline = Instant::now() + st.config.lost_device_timeout;
                    st.found_cache.apply_scrape(connect_addr, &record.node_db, deadline.into())
                };
                self.emit_name_changes(added, removed).await;
                self.ensure_found_cache_alarm().await;
            }
            Err(err) => log::warn!("SDP query for {} failed: {}", radio, err),
        }
    }

    async fn apply_endpoint_lost(&self, addr: BusAddress) {
        let became_master = {
            let mut st = self.state.lock().await;
            let was_master_addr = st.role.master_addr();
            if was_master_addr == Some(addr) {
                st.handle_master_lost(addr);
                true
            } else {
                st.handle_minion_lost(addr);
                false
            }
        };
        if became_master {
            self.apply_delegation_rotation().await;
        }
        self.ensure_found_cache_alarm().await;
    }

    /// Rebuilds and (re)issues this round's advertise/find delegation
    /// (§4.4). When `directMinions` is too few to delegate to
    /// (`use_local_find`/`use_local_advertise`), the operation is run
    /// directly against our own [`Accessor`] instead of being signalled
    /// to a minion.
    async fn apply_delegation_rotation(&self) {
        let (duration, local_advertise, local_find) = {
            let mut st = self.state.lock().await;
            if !st.is_master() {
                return;
            }
            let minions = st.node_db.direct_minions();
            let (advertise_target, find_target) = st.delegation.pick_delegates(&minions);
            let inputs = st.admission_inputs();
            let duration = st.config.delegation_rotation;
            let uuid_rev = st.role.master_uuid_rev();
            let local_addr = st.local_addr;

            let ControllerState { ref node_db, ref mut delegation, .. } = *st;

            let advertise_signal = delegation.build_advertise(&inputs, uuid_rev, local_addr, node_db, duration);
            let find_nonempty = !crate::name_args::total_find_names(node_db).is_empty();
            let find_signal = delegation.build_find(&inputs, local_addr.to_string(), node_db, find_nonempty, duration);

            let mut local_advertise = None;
            match advertise_target.and_then(|id| node_db.get(id)) {
                Some(minion) => self.sink.delegate_advertise(minion.bus_address, advertise_signal),
                None => local_advertise = Some((advertise_signal.uuid_rev, advertise_signal.connect_addr, advertise_signal.name_map, advertise_signal.duration)),
            }

            let mut local_find = None;
            match find_target.and_then(|id| node_db.get(id)) {
                Some(minion) => self.sink.delegate_find(minion.bus_address, find_signal),
                None => local_find = Some((find_signal.ignore_addrs, find_signal.duration)),
            }

            (duration, local_advertise, local_find)
        };

        if let Some((uuid_rev, connect_addr, name_map, dur)) = local_advertise {
            if let Some(dur) = dur {
                let mut db = NodeDb::new();
                for e in &name_map {
                    let mut info = NodeInfo::new_self(e.guid.clone(), String::new(), e.connect_addr);
                    info.advertise_names = e.names.iter().cloned().collect();
                    db.insert(info);
                }
                if let Err(err) = self.accessor.start_advertise(uuid_rev, connect_addr, &db, Some(dur)).await {
                    log::warn!("local start_advertise failed: {}", err);
                }
            } else {
                let _ = self.accessor.stop_advertise().await;
            }
        }
        if let Some((ignore_addrs, dur)) = local_find {
            if let Some(dur) = dur {
                if let Err(err) = self.accessor.start_find(&ignore_addrs, Some(dur)).await {
                    log::warn!("local start_find failed: {}", err);
                }
            } else {
                let _ = self.accessor.stop_find().await;
            }
        }

        // Reschedules itself (§4.4): rotation keeps running for as long as
        // we remain master, independent of name-table activity.
        self.dispatcher.post_delayed(ControllerOp::RotateDelegation, Instant::now() + duration);
    }

    async fn apply_found_cache_expiry(&self) {
        let expired_deltas = {
            let mut st = self.state.lock().await;
            let now = Instant::now();
            let expired = st.found_cache.pop_expired(now.into());
            let mut deltas = Vec::new();
            for info in expired {
                deltas.push(crate::node::NodeNameDelta {
                    guid: info.guid,
                    bus_address: info.bus_address,
                    connect_address: info.bus_address,
                    uuid_rev: info.uuid_rev,
                    advertise_names: info.advertise_names,
                    find_names: info.find_names,
                });
            }
            deltas
        };
        if !expired_deltas.is_empty() {
            self.emit_name_changes(Vec::new(), expired_deltas).await;
        }
        // Reschedules for whichever entry now expires soonest, batching
        // nearby expirations behind `lost_device_grace` (§4.2).
        self.ensure_found_cache_alarm().await;
    }

    /// Maintains the single absolute-time found-cache expiry alarm (§4.2):
    /// cancels whatever is currently pending and reposts for whichever
    /// entry now expires soonest, called after any mutation that might
    /// change `next_expiration()`.
    async fn ensure_found_cache_alarm(&self) {
        let mut st = self.state.lock().await;
        if let Some(id) = st.found_cache_alarm.take() {
            self.dispatcher.cancel(id);
        }
        let deadline = st.found_cache.next_expiration().map(|d| tokio::time::Instant::from(d) + st.config.lost_device_grace);
        if let Some(deadline) = deadline {
            st.found_cache_alarm = Some(self.dispatcher.post_delayed(ControllerOp::ExpireFoundCache, deadline));
        }
    }

    /// §4.6: FoundNames/LostNames, to every direct minion with non-empty
    /// `find_names`, plus the local bus. Scoped to advertised-name changes
    /// only — a pure find-name mutation yields a delta with empty
    /// `advertise_names` and must not surface as an empty signal.
    async fn emit_name_changes(&self, added: Vec<crate::node::NodeNameDelta>, removed: Vec<crate::node::NodeNameDelta>) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let lost = FoundNodeEntry::group_by_connect_addr(&removed, true);
        let found = FoundNodeEntry::group_by_connect_addr(&added, true);

        let interested: Vec<BusAddress> = {
            let st = self.state.lock().await;
            st.node_db
                .direct_minions()
                .into_iter()
                .filter_map(|id| st.node_db.get(id))
                .filter(|n| !n.find_names.is_empty())
                .map(|n| n.bus_address)
                .collect()
        };

        for to in interested {
            if !lost.is_empty() {
                self.sink.lost_names(to, lost.clone());
            }
            if !found.is_empty() {
                self.sink.found_names(to, found.clone());
            }
        }
        if !lost.is_empty() {
            self.sink.local_lost_names(lost);
        }
        if !found.is_empty() {
            self.sink.local_found_names(found);
        }
    }

    // ---- public API: local name-table layer entry points (§6.2) ----

    pub fn add_advertise_name(&self, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::AddAdvertiseName(name.into()));
    }

    pub fn remove_advertise_name(&self, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoveAdvertiseName(name.into()));
    }

    pub fn add_find_name(&self, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::AddFindName(name.into()));
    }

    pub fn remove_find_name(&self, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoveFindName(name.into()));
    }

    // ---- public API: incoming `AdvertiseName`/`FindName` bus signals (§6.1) ----

    pub fn handle_advertise_name(&self, requester: BusAddress, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoteAdvertiseName { requester, name: name.into() });
    }

    pub fn handle_cancel_advertise_name(&self, requester: BusAddress, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoteCancelAdvertiseName { requester, name: name.into() });
    }

    pub fn handle_find_name(&self, requester: BusAddress, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoteFindName { requester, name: name.into() });
    }

    pub fn handle_cancel_find_name(&self, requester: BusAddress, name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::RemoteCancelFindName { requester, name: name.into() });
    }

    pub fn device_found(&self, radio: RadioAddress, uuid_rev: u32) {
        self.dispatcher.post(ControllerOp::DeviceFound { radio, uuid_rev });
    }

    pub fn endpoint_lost(&self, addr: BusAddress) {
        self.dispatcher.post(ControllerOp::EndpointLost { addr });
    }

    pub fn rotate_delegation(&self) {
        self.dispatcher.post(ControllerOp::RotateDelegation);
    }

    pub fn expire_found_cache(&self) {
        self.dispatcher.post(ControllerOp::ExpireFoundCache);
    }

    /// Origination side of the SetState exchange (§4.3): call once an
    /// outgoing transport connection to `peer_addr` finishes
    /// authenticating. Per the "Origination rule", only the initiating
    /// side calls this.
    pub fn outgoing_connected(&self, peer_addr: BusAddress, peer_unique_name: impl Into<String>) {
        self.dispatcher.post(ControllerOp::SendSetState { peer_addr, peer_unique_name: peer_unique_name.into() });
    }

    /// A `DelegateAdvertise` signal received from our master (§6.1, §4.4).
    pub fn handle_delegate_advertise(
        &self, uuid_rev: u32, connect_addr: BusAddress, name_map: Vec<AdvertiseInfoEntry>, duration: Option<Duration>,
    ) {
        self.dispatcher.post(ControllerOp::HandleDelegateAdvertise { uuid_rev, connect_addr, name_map, duration });
    }

    /// A `DelegateFind` signal received from our master (§6.1, §4.4).
    pub fn handle_delegate_find(&self, ignore_addrs: Vec<RadioAddress>, duration: Option<Duration>) {
        self.dispatcher.post(ControllerOp::HandleDelegateFind { ignore_addrs, duration });
    }

    /// §6.2 `bt_device_available` callback.
    pub fn bt_device_available(&self, available: bool) {
        self.dispatcher.post(ControllerOp::BtDeviceAvailable(available));
    }

    /// Handles an incoming SetState method call, returning its reply.
    /// Exposed for the `BluetoothController` interface's method handler
    /// and directly callable in tests without a live D-Bus connection.
    pub async fn handle_set_state(&self, call: SetStateCall) -> Result<SetStateReply> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(ControllerOp::IncomingSetState { call, reply: tx });
        rx.await.map_err(|_| Error::with_message(ErrorKind::Internal(crate::InternalErrorKind::BusConnectionLost), "dispatcher dropped"))?
    }

    /// Feeds back the reply to a SetState call we originated.
    pub fn handle_set_state_reply(&self, peer_addr: BusAddress, reply: SetStateReply) {
        self.dispatcher.post(ControllerOp::SetStateReplyReceived { peer_addr, reply });
    }

    pub async fn is_master(&self) -> bool {
        self.state.lock().await.is_master()
    }

    /// Our current role (§4.3): master, drone, or minion.
    pub async fn role(&self) -> Role {
        let st = self.state.lock().await;
        st.role.role(st.direct_minion_count())
    }

    /// Our master's bus unique name, empty while we're master ourselves.
    pub async fn master_unique_name(&self) -> String {
        self.state.lock().await.role.master_unique_name().to_string()
    }

    pub async fn master_uuid_rev(&self) -> u32 {
        self.state.lock().await.role.master_uuid_rev()
    }

    pub async fn direct_minion_count(&self) -> usize {
        self.state.lock().await.direct_minion_count()
    }

    pub async fn node_count(&self) -> usize {
        self.state.lock().await.node_db.len()
    }

    pub async fn total_advertise_names(&self) -> usize {
        self.state.lock().await.node_db.total_advertise_names()
    }

    /// Registers the `BluetoothController` interface's `SetState` method
    /// on a `dbus-crossroads` instance, following the teacher's
    /// `method_with_cr_async`/per-path `Arc<T>` data idiom
    /// (`gatt/local.rs`).
    pub fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Controller>> {
        cr.register(names::INTERFACE, |ib: &mut IfaceBuilder<Arc<Controller>>| {
            ib.method_with_cr_async(
                names::METHOD_SET_STATE,
                ("minion_count", "uuid_rev", "bus_addr", "node_states", "found_nodes"),
                ("uuid_rev", "bus_addr", "node_states", "found_nodes"),
                |ctx,
                 cr,
                 (minion_count, uuid_rev, bus_addr, node_states, found_nodes): (
                    u8,
                    u32,
                    wire::RawBusAddr,
                    Vec<wire::RawNodeStateE>,
                    Vec<wire::RawFoundNodeE>,
                )| {
                    method_call(ctx, cr, move |controller: Arc<Controller>| async move {
                        let call = SetStateCall {
                            caller_minion_count: minion_count,
                            caller_uuid_rev: uuid_rev,
                            caller_addr: wire::addr_from_raw(bus_addr),
                            node_states: node_states.into_iter().map(NodeStateEntry::from_raw).collect(),
                            found_nodes: found_nodes.into_iter().map(FoundNodeEntry::from_raw).collect(),
                        };
                        controller.handle_set_state(call).await.map(|reply| {
                            (
                                reply.uuid_rev,
                                wire::addr_to_raw(reply.bus_addr),
                                reply.node_states.iter().map(NodeStateEntry::to_raw).collect::<Vec<_>>(),
                                reply.found_nodes.iter().map(FoundNodeEntry::to_raw).collect::<Vec<_>>(),
                            )
                        })
                    })
                },
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{Accessor, BoxFuture, SdpRecord};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    fn addr(b: u8) -> BusAddress {
        BusAddress { radio: RadioAddress([0, 0, 0, 0, 0, b]), psm: 0x1001 }
    }

    struct FakeAccessor;

    impl Accessor for FakeAccessor {
        fn start_listen(&self) -> BoxFuture<'_, BusAddress> {
            Box::pin(async { Ok(addr(1)) })
        }
        fn stop_listen(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn start_advertise(&self, _: u32, _: BusAddress, _: &NodeDb, _: Option<StdDuration>) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn stop_advertise(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn start_find(&self, _: &[RadioAddress], _: Option<StdDuration>) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn stop_find(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn get_device_info(&self, _: RadioAddress) -> BoxFuture<'_, SdpRecord> {
            Box::pin(async { Ok(SdpRecord::default()) })
        }
        fn disconnect(&self, _: &str) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Records which radio operations the controller actually invoked, for
    /// tests that exercise the local (non-delegated) and delegate-receiver
    /// accessor paths (§4.4).
    #[derive(Default)]
    struct RecordingAccessor {
        advertise_starts: StdMutex<Vec<(u32, BusAddress)>>,
        advertise_stops: StdMutex<u32>,
        find_starts: StdMutex<Vec<Vec<RadioAddress>>>,
        find_stops: StdMutex<u32>,
    }

    impl Accessor for RecordingAccessor {
        fn start_listen(&self) -> BoxFuture<'_, BusAddress> {
            Box::pin(async { Ok(addr(1)) })
        }
        fn stop_listen(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn start_advertise(
            &self, uuid_rev: u32, connect_addr: BusAddress, _: &NodeDb, _: Option<StdDuration>,
        ) -> BoxFuture<'_, ()> {
            self.advertise_starts.lock().unwrap().push((uuid_rev, connect_addr));
            Box::pin(async { Ok(()) })
        }
        fn stop_advertise(&self) -> BoxFuture<'_, ()> {
            *self.advertise_stops.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }
        fn start_find(&self, ignore_addrs: &[RadioAddress], _: Option<StdDuration>) -> BoxFuture<'_, ()> {
            self.find_starts.lock().unwrap().push(ignore_addrs.to_vec());
            Box::pin(async { Ok(()) })
        }
        fn stop_find(&self) -> BoxFuture<'_, ()> {
            *self.find_stops.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }
        fn get_device_info(&self, _: RadioAddress) -> BoxFuture<'_, SdpRecord> {
            Box::pin(async { Ok(SdpRecord::default()) })
        }
        fn disconnect(&self, _: &str) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        found: StdMutex<Vec<(BusAddress, Vec<FoundNodeEntry>)>>,
        lost: StdMutex<Vec<(BusAddress, Vec<FoundNodeEntry>)>>,
        local_found: StdMutex<Vec<Vec<FoundNodeEntry>>>,
        local_lost: StdMutex<Vec<Vec<FoundNodeEntry>>>,
        pushed_up: StdMutex<Vec<(&'static str, BusAddress, BusAddress, String)>>,
    }

    impl SignalSink for RecordingSink {
        fn found_names(&self, to: BusAddress, entries: Vec<FoundNodeEntry>) {
            self.found.lock().unwrap().push((to, entries));
        }
        fn lost_names(&self, to: BusAddress, entries: Vec<FoundNodeEntry>) {
            self.lost.lock().unwrap().push((to, entries));
        }
        fn local_found_names(&self, entries: Vec<FoundNodeEntry>) {
            self.local_found.lock().unwrap().push(entries);
        }
        fn local_lost_names(&self, entries: Vec<FoundNodeEntry>) {
            self.local_lost.lock().unwrap().push(entries);
        }
        fn delegate_advertise(&self, _to: BusAddress, _signal: DelegateAdvertise) {}
        fn delegate_find(&self, _to: BusAddress, _signal: DelegateFind) {}
        fn advertise_name(&self, to: BusAddress, requester: BusAddress, name: &str) {
            self.pushed_up.lock().unwrap().push(("advertise", to, requester, name.to_string()));
        }
        fn cancel_advertise_name(&self, to: BusAddress, requester: BusAddress, name: &str) {
            self.pushed_up.lock().unwrap().push(("cancel_advertise", to, requester, name.to_string()));
        }
        fn find_name(&self, to: BusAddress, requester: BusAddress, name: &str) {
            self.pushed_up.lock().unwrap().push(("find", to, requester, name.to_string()));
        }
        fn cancel_find_name(&self, to: BusAddress, requester: BusAddress, name: &str) {
            self.pushed_up.lock().unwrap().push(("cancel_find", to, requester, name.to_string()));
        }
        fn found_device(&self, _radio: RadioAddress, _uuid_rev: u32) {}
    }

    /// In-memory stand-in for the daemon message bus's method-call
    /// transport: routes an outgoing SetState straight to the peer
    /// `Controller` registered under its bus address, so tests can drive
    /// the full two-daemon origination flow without a live connection.
    #[derive(Default)]
    struct FakeBus {
        controllers: StdMutex<std::collections::HashMap<BusAddress, Arc<Controller>>>,
    }

    impl FakeBus {
        fn register(&self, addr: BusAddress, controller: Arc<Controller>) {
            self.controllers.lock().unwrap().insert(addr, controller);
        }
    }

    impl SetStateCaller for FakeBus {
        fn call_set_state(
            &self, to: BusAddress, _to_unique_name: &str, call: SetStateCall, _timeout: StdDuration,
        ) -> crate::accessor::BoxFuture<'_, SetStateReply> {
            let target = self.controllers.lock().unwrap().get(&to).cloned();
            Box::pin(async move {
                match target {
                    Some(controller) => controller.handle_set_state(call).await,
                    None => Err(Error::new(ErrorKind::SetStateRejected)),
                }
            })
        }
    }

    async fn settle() {
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn scenario_one_single_daemon_bootstrap() {
        let sink = Arc::new(RecordingSink::default());
        let controller =
            Controller::new("guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink.clone(), Arc::new(FakeBus::default()));

        let before = controller.master_uuid_rev().await;
        controller.add_advertise_name("com.x.s");
        settle().await;

        assert!(controller.is_master().await);
        assert_ne!(controller.master_uuid_rev().await, before);
        assert_eq!(controller.total_advertise_names().await, 1);
        assert_eq!(controller.node_count().await, 1);
    }

    #[tokio::test]
    async fn scenario_two_tie_yields_lower_address_master() {
        let sink = Arc::new(RecordingSink::default());
        let a = Controller::new("guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink.clone(), Arc::new(FakeBus::default()));

        // B (address 2) initiates; A (address 1, lower) is the receiver.
        let call = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 99,
            caller_addr: addr(2),
            node_states: vec![],
            found_nodes: vec![],
        };
        let reply = a.handle_set_state(call).await.unwrap();

        assert!(a.is_master().await);
        assert!(reply.node_states.is_empty());
        assert_eq!(a.node_count().await, 2);
    }

    #[tokio::test]
    async fn scenario_three_name_propagation_emits_found_names() {
        let sink = Arc::new(RecordingSink::default());
        let a = Controller::new("guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink.clone(), Arc::new(FakeBus::default()));

        let call = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 99,
            caller_addr: addr(2),
            node_states: vec![],
            found_nodes: vec![],
        };
        a.handle_set_state(call).await.unwrap();

        // B adds "com.y": simulated as an AdvertiseName signal merged
        // directly into B's node (the daemon message bus carries the
        // signal itself; out of scope here).
        let before = a.state.lock().await.node_db.clone();
        {
            let mut st = a.state.lock().await;
            if let Some(id) = st.node_db.find_by_addr(addr(2)) {
                st.node_db.get_mut(id).unwrap().advertise_names.insert("com.y".to_string());
            }
        }
        let (added, removed) = {
            let mut st = a.state.lock().await;
            st.role.increment_uuid_rev();
            st.node_db.diff(&before)
        };
        a.emit_name_changes(added, removed).await;

        assert_eq!(sink.local_found.lock().unwrap().len(), 1);
        assert!(sink.local_found.lock().unwrap()[0][0].names[0].names.contains(&"com.y".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_four_minion_loss_expires_into_lost_names() {
        let sink = Arc::new(RecordingSink::default());
        let a = Controller::new("guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink.clone(), Arc::new(FakeBus::default()));

        let call = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 99,
            caller_addr: addr(2),
            node_states: vec![],
            found_nodes: vec![],
        };
        a.handle_set_state(call).await.unwrap();
        {
            let mut st = a.state.lock().await;
            let id = st.node_db.find_by_addr(addr(2)).unwrap();
            st.node_db.get_mut(id).unwrap().advertise_names.insert("com.y".to_string());
        }

        a.endpoint_lost(addr(2));
        settle().await;

        assert_eq!(a.node_count().await, 1);
        assert!(sink.local_lost.lock().unwrap().is_empty());

        tokio::time::advance(StdDuration::from_millis(30_001)).await;
        a.expire_found_cache();
        settle().await;

        assert_eq!(sink.local_lost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scenario_six_tie_break_by_lower_address() {
        let sink_a = Arc::new(RecordingSink::default());
        let a = Controller::new("guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink_a, Arc::new(FakeBus::default()));
        {
            let mut st = a.state.lock().await;
            st.role.begin_outgoing(addr(2));
        }
        let call_from_b = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 5,
            caller_addr: addr(2),
            node_states: vec![],
            found_nodes: vec![],
        };
        let reply = a.handle_set_state(call_from_b).await.unwrap();
        assert!(reply.node_states.is_empty());
        assert!(a.is_master().await);

        let sink_b = Arc::new(RecordingSink::default());
        let b = Controller::new("guid-b", "b.1", addr(2), Config::default(), Arc::new(FakeAccessor), sink_b, Arc::new(FakeBus::default()));
        {
            let mut st = b.state.lock().await;
            st.role.begin_outgoing(addr(1));
        }
        let call_from_a = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 5,
            caller_addr: addr(1),
            node_states: vec![],
            found_nodes: vec![],
        };
        let reply_to_a = b.handle_set_state(call_from_a).await.unwrap();
        assert_eq!(reply_to_a.uuid_rev, INVALID_UUIDREV);
        assert!(b.is_master().await);
    }

    #[tokio::test]
    async fn local_rotation_drives_accessor_when_no_minions() {
        let sink = Arc::new(RecordingSink::default());
        let accessor = Arc::new(RecordingAccessor::default());
        let a = Controller::new(
            "guid-a", "a.1", addr(1), Config::default(), accessor.clone(), sink, Arc::new(FakeBus::default()),
        );
        settle().await;
        settle().await;

        // Fresh bootstrap has no names yet: the rotation that fires at
        // startup is a stop marker on both operations.
        assert_eq!(*accessor.advertise_stops.lock().unwrap(), 1);
        assert_eq!(*accessor.find_stops.lock().unwrap(), 1);
        assert!(accessor.advertise_starts.lock().unwrap().is_empty());

        a.add_advertise_name("com.x.s");
        a.add_find_name("com.y.c");
        settle().await;
        // No direct minions: with a nonempty name set the local daemon runs
        // both operations itself (§4.4 `use_local_advertise`/`use_local_find`).
        a.bt_device_available(true);
        settle().await;
        settle().await;

        assert_eq!(accessor.advertise_starts.lock().unwrap().len(), 1);
        assert_eq!(accessor.find_starts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delegate_advertise_and_find_invoke_accessor_then_stop() {
        let sink = Arc::new(RecordingSink::default());
        let accessor = Arc::new(RecordingAccessor::default());
        let minion = Controller::new(
            "guid-b", "b.1", addr(2), Config::default(), accessor.clone(), sink, Arc::new(FakeBus::default()),
        );
        settle().await;
        settle().await;
        // Startup's local stop-marker rotation runs once before the master
        // delegates to us; clear it so only the delegate signal is counted.
        *accessor.advertise_stops.lock().unwrap() = 0;
        *accessor.find_stops.lock().unwrap() = 0;

        let name_map =
            vec![AdvertiseInfoEntry { guid: "guid-a".into(), connect_addr: addr(1), names: vec!["com.x.s".into()] }];
        minion.handle_delegate_advertise(7, addr(1), name_map, Some(StdDuration::from_secs(30)));
        minion.handle_delegate_find(vec![], Some(StdDuration::from_secs(30)));
        settle().await;
        settle().await;

        assert_eq!(*accessor.advertise_starts.lock().unwrap(), vec![(7, addr(1))]);
        assert_eq!(accessor.find_starts.lock().unwrap().len(), 1);

        minion.handle_delegate_advertise(7, addr(1), vec![], None);
        minion.handle_delegate_find(vec![], None);
        settle().await;
        settle().await;

        assert_eq!(*accessor.advertise_stops.lock().unwrap(), 1);
        assert_eq!(*accessor.find_stops.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn role_violation_rejected_when_not_master() {
        let sink = Arc::new(RecordingSink::default());
        let b = Controller::new("guid-b", "b.1", addr(2), Config::default(), Arc::new(FakeAccessor), sink, Arc::new(FakeBus::default()));
        {
            let mut st = b.state.lock().await;
            st.role.become_minion_of(addr(1), "a.1", 42);
        }
        let call = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 1,
            caller_addr: addr(3),
            node_states: vec![],
            found_nodes: vec![],
        };
        let err = b.handle_set_state(call).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RoleViolation);
    }

    #[tokio::test]
    async fn outgoing_connected_drives_full_origination_flow() {
        let bus = Arc::new(FakeBus::default());
        let sink_a = Arc::new(RecordingSink::default());
        let a = Controller::new(
            "guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink_a, bus.clone(),
        );
        let sink_b = Arc::new(RecordingSink::default());
        let b = Controller::new(
            "guid-b", "b.1", addr(2), Config::default(), Arc::new(FakeAccessor), sink_b, bus.clone(),
        );
        bus.register(addr(1), a.clone());
        bus.register(addr(2), b.clone());

        // A dialed out to B over the radio link; A originates SetState
        // per §4.3's "lower address calls higher" rule, with B (higher
        // address) as the receiver deciding the outcome.
        a.outgoing_connected(addr(2), "b.1");
        for _ in 0..20 {
            settle().await;
        }

        assert!(b.is_master().await);
        assert!(!a.is_master().await);
        assert_eq!(b.node_count().await, 2);
        assert_eq!(a.node_count().await, 2);
        assert_eq!(b.role().await, Role::Master);
        assert_eq!(a.role().await, Role::Minion);

        // A's master (B) disconnects: A promotes itself back to master and
        // drops the now-stale master node entry (§4.3 "master loss").
        a.endpoint_lost(addr(2));
        settle().await;
        settle().await;

        assert!(a.is_master().await);
        assert_eq!(a.role().await, Role::Master);
        assert_eq!(a.node_count().await, 1);
    }

    fn fresh_state() -> ControllerState {
        let mut node_db = NodeDb::new();
        node_db.insert_self(NodeInfo::new_self("guid-a", "a.1", addr(1)));
        ControllerState {
            local_addr: addr(1),
            node_db,
            found_cache: FoundCache::new(),
            role: RoleState::new(),
            delegation: DelegationEngine::new(),
            config: Config::default(),
            listening: true,
            advertise_stop_alarm: None,
            find_stop_alarm: None,
            found_cache_alarm: None,
        }
    }

    /// A minion already advertising "com.y" joins via incoming SetState;
    /// the next delegation rotation must re-advertise its names and
    /// re-ignore its radio during delegated find rather than reuse a
    /// stale cached payload (§4.4).
    #[test]
    fn import_node_states_marks_delegation_dirty() {
        let mut st = fresh_state();
        // NameArgSet starts dirty; consume that so the assertions below
        // only see the dirty bit `import_node_states` itself sets.
        st.delegation.take_advertise_dirty();
        st.delegation.take_find_dirty();

        let entry = NodeStateEntry {
            guid: "guid-b".into(),
            unique_name: "b.1".into(),
            bus_address: addr(2),
            advertise_names: vec!["com.y".into()],
            find_names: vec![],
        };
        st.import_node_states(addr(2), &[entry]);

        assert!(st.delegation.take_advertise_dirty());
        assert!(st.delegation.take_find_dirty());
    }

    #[test]
    fn minion_lost_marks_delegation_dirty() {
        let mut st = fresh_state();
        let entry = NodeStateEntry {
            guid: "guid-b".into(),
            unique_name: "b.1".into(),
            bus_address: addr(2),
            advertise_names: vec!["com.y".into()],
            find_names: vec![],
        };
        st.import_node_states(addr(2), &[entry]);
        st.delegation.take_advertise_dirty();
        st.delegation.take_find_dirty();

        st.handle_minion_lost(addr(2));

        assert!(st.delegation.take_advertise_dirty());
        assert!(st.delegation.take_find_dirty());
    }

    #[test]
    fn master_lost_marks_delegation_dirty() {
        let mut st = fresh_state();
        st.insert_master_node(addr(9));
        st.role.become_minion_of(addr(9), "m.1", 42);
        st.delegation.take_advertise_dirty();
        st.delegation.take_find_dirty();

        st.handle_master_lost(addr(9));

        assert!(st.delegation.take_advertise_dirty());
        assert!(st.delegation.take_find_dirty());
    }

    /// §4.2: the found-cache expiry alarm is a single rescheduled handle,
    /// not a fresh never-cancelled alarm on every insertion.
    #[tokio::test(start_paused = true)]
    async fn found_cache_alarm_is_rescheduled_not_accumulated() {
        let sink = Arc::new(RecordingSink::default());
        let a = Controller::new(
            "guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink, Arc::new(FakeBus::default()),
        );
        settle().await;

        {
            let mut st = a.state.lock().await;
            let mut scraped = NodeDb::new();
            let mut node = NodeInfo::new_self("g", "", addr(9));
            node.advertise_names.insert("com.x".into());
            scraped.insert_self(node);
            st.found_cache.apply_scrape(addr(9), &scraped, (Instant::now() + StdDuration::from_secs(30)).into());
        }
        a.ensure_found_cache_alarm().await;
        let first = a.state.lock().await.found_cache_alarm;
        assert!(first.is_some());

        {
            let mut st = a.state.lock().await;
            let mut scraped = NodeDb::new();
            let mut node = NodeInfo::new_self("g2", "", addr(10));
            node.advertise_names.insert("com.z".into());
            scraped.insert_self(node);
            st.found_cache.apply_scrape(addr(10), &scraped, (Instant::now() + StdDuration::from_secs(60)).into());
        }
        a.ensure_found_cache_alarm().await;
        let second = a.state.lock().await.found_cache_alarm;
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    /// §4.6: a pure find-name mutation must not surface as an empty
    /// FoundNames/LostNames signal.
    #[tokio::test]
    async fn find_name_only_change_emits_no_signal() {
        let sink = Arc::new(RecordingSink::default());
        let a = Controller::new(
            "guid-a", "a.1", addr(1), Config::default(), Arc::new(FakeAccessor), sink.clone(), Arc::new(FakeBus::default()),
        );

        let call = SetStateCall {
            caller_minion_count: 0,
            caller_uuid_rev: 99,
            caller_addr: addr(2),
            node_states: vec![],
            found_nodes: vec![],
        };
        a.handle_set_state(call).await.unwrap();

        let before = a.state.lock().await.node_db.clone();
        {
            let mut st = a.state.lock().await;
            let id = st.node_db.find_by_addr(addr(2)).unwrap();
            st.node_db.get_mut(id).unwrap().find_names.insert("com.y".to_string());
        }
        let (added, removed) = {
            let st = a.state.lock().await;
            st.node_db.diff(&before)
        };
        a.emit_name_changes(added, removed).await;

        assert!(sink.local_found.lock().unwrap().is_empty());
        assert!(sink.local_lost.lock().unwrap().is_empty());
        assert!(sink.found.lock().unwrap().is_empty());
        assert!(sink.lost.lock().unwrap().is_empty());
    }
}
