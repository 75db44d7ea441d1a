//! Chooses which direct minion performs inquiry / inquiry-scan on the
//! master's behalf, rotates the assignment, and builds the
//! `DelegateAdvertise`/`DelegateFind` signal arguments (§4.4).

use std::time::Duration;

use crate::name_args::{build_advertise_name_map, ignore_addrs, NameArgSet};
use crate::node::{NodeDb, NodeId};
use crate::wire::AdvertiseInfoEntry;
use crate::{BusAddress, RadioAddress};

/// `directMinions == 0`: no one to delegate inquiry to, so find runs
/// locally.
pub fn use_local_find(direct_minion_count: usize) -> bool {
    direct_minion_count == 0
}

/// `directMinions <= 1`: with at most one minion there's no one left to
/// also run the advertise delegate without colliding with find, so
/// advertise runs locally.
pub fn use_local_advertise(direct_minion_count: usize) -> bool {
    direct_minion_count <= 1
}

/// The four admission conditions of §4.4, shared by both delegate kinds
/// (only the name-set emptiness differs between them).
#[derive(Clone, Copy, Debug)]
pub struct AdmissionInputs {
    pub is_master: bool,
    pub direct_minion_count: usize,
    pub max_connections: u8,
    pub radio_listening: bool,
}

fn admitted(inputs: &AdmissionInputs, names_nonempty: bool) -> bool {
    inputs.is_master
        && (inputs.direct_minion_count as u8) < inputs.max_connections
        && inputs.radio_listening
        && names_nonempty
}

/// `DelegateAdvertise(uuid_rev, connect_addr, name_map, duration)`. A
/// `None` duration or empty `name_map` tells the delegate to stop (§4.4).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DelegateAdvertise {
    pub uuid_rev: u32,
    pub connect_addr: BusAddress,
    pub name_map: Vec<AdvertiseInfoEntry>,
    pub duration: Option<Duration>,
}

/// `DelegateFind(result_dest, ignore_addrs, duration)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DelegateFind {
    pub result_dest: String,
    pub ignore_addrs: Vec<RadioAddress>,
    pub duration: Option<Duration>,
}

/// Rotation state: a round-robin cursor per operation, advanced on the
/// shared delegation-rotation alarm (§4.4; the original uses one timer
/// for both).
#[derive(Default)]
pub struct DelegationEngine {
    advertise_names: NameArgSet,
    find_names: NameArgSet,
    advertise_cursor: usize,
    find_cursor: usize,
    last_advertise: Option<DelegateAdvertise>,
    last_find: Option<DelegateFind>,
}

impl DelegationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_advertise_dirty(&mut self) {
        self.advertise_names.mark_dirty();
    }

    pub fn mark_find_dirty(&mut self) {
        self.find_names.mark_dirty();
    }

    /// Rebuilds signal arguments only if dirty, per §4.4 "Dirty tracking";
    /// returns whether `master_uuid_rev` must be bumped as a result.
    pub fn take_advertise_dirty(&mut self) -> bool {
        self.advertise_names.take_dirty()
    }

    pub fn take_find_dirty(&mut self) -> bool {
        self.find_names.take_dirty()
    }

    /// Advances both rotation cursors and picks this round's delegate for
    /// each operation. Returns `None` for an operation that should run
    /// locally (§4.4 `use_local_find`/`use_local_advertise`). When both are
    /// delegated, the two choices never coincide unless `minions.len() == 1`.
    pub fn pick_delegates(&mut self, minions: &[NodeId]) -> (Option<NodeId>, Option<NodeId>) {
        let n = minions.len();

        let advertise_target = if use_local_advertise(n) {
            None
        } else {
            self.advertise_cursor = (self.advertise_cursor + 1) % n;
            Some(minions[self.advertise_cursor])
        };

        let find_target = if use_local_find(n) {
            None
        } else {
            self.find_cursor = (self.find_cursor + 1) % n;
            if n > 1 && Some(minions[self.find_cursor]) == advertise_target {
                self.find_cursor = (self.find_cursor + 1) % n;
            }
            Some(minions[self.find_cursor])
        };

        (advertise_target, find_target)
    }

    /// Builds the `DelegateAdvertise` signal: a real payload when admitted,
    /// a stop marker (empty map, no duration) otherwise. Rebuilds the name
    /// map only when the advertise set is dirty (§4.4 "Dirty tracking");
    /// an unchanged rotation reuses the last built payload, still fresh for
    /// whichever minion this round's delegate is.
    pub fn build_advertise(
        &mut self, inputs: &AdmissionInputs, uuid_rev: u32, local_addr: BusAddress, db: &NodeDb, duration: Duration,
    ) -> DelegateAdvertise {
        if !self.take_advertise_dirty() {
            if let Some(cached) = &self.last_advertise {
                let mut reused = cached.clone();
                reused.uuid_rev = uuid_rev;
                reused.duration = reused.duration.map(|_| duration);
                self.last_advertise = Some(reused.clone());
                return reused;
            }
        }
        let name_map = build_advertise_name_map(db);
        let built = if admitted(inputs, !name_map.is_empty()) {
            DelegateAdvertise { uuid_rev, connect_addr: local_addr, name_map, duration: Some(duration) }
        } else {
            DelegateAdvertise { uuid_rev, connect_addr: local_addr, name_map: Vec::new(), duration: None }
        };
        self.last_advertise = Some(built.clone());
        built
    }

    /// Builds the `DelegateFind` signal: a real payload when admitted, a
    /// stop marker otherwise. Same dirty-gated rebuild as
    /// [`Self::build_advertise`].
    pub fn build_find(
        &mut self, inputs: &AdmissionInputs, result_dest: impl Into<String>, db: &NodeDb, find_names_nonempty: bool,
        duration: Duration,
    ) -> DelegateFind {
        let result_dest = result_dest.into();
        if !self.take_find_dirty() {
            if let Some(cached) = &self.last_find {
                let mut reused = cached.clone();
                reused.result_dest = result_dest;
                reused.duration = reused.duration.map(|_| duration);
                self.last_find = Some(reused.clone());
                return reused;
            }
        }
        let addrs = ignore_addrs(db);
        let built = if admitted(inputs, find_names_nonempty) {
            DelegateFind { result_dest, ignore_addrs: addrs, duration: Some(duration) }
        } else {
            DelegateFind { result_dest, ignore_addrs: Vec::new(), duration: None }
        };
        self.last_find = Some(built.clone());
        built
    }
}
