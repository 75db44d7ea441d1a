//! Time-expiring cache of nodes heard over the air but not (yet)
//! connected (§4.2). Shares `NodeDb`'s representation; this module adds
//! only the mandatory-expiry and SDP-refresh-vs-rescrape decision that
//! distinguishes it from the connected node database.

use std::time::Instant;

use crate::node::{NodeDb, NodeInfo, NodeNameDelta};
use crate::{BusAddress, RadioAddress};

/// What an over-the-air `device_found` hit requires of the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceFoundOutcome {
    /// Already cached under the same `uuid_rev`; expiry was refreshed in
    /// place, nothing else changed.
    Refreshed,
    /// Not cached, or cached under a different `uuid_rev`: the caller must
    /// run an SDP query and feed the result to [`FoundCache::apply_scrape`].
    NeedsScrape,
}

/// The found-device cache.
#[derive(Default)]
pub struct FoundCache {
    db: NodeDb,
}

impl FoundCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db(&self) -> &NodeDb {
        &self.db
    }

    /// §4.2 `device_found`: if `radio` is already cached under `uuid_rev`,
    /// refreshes every node reachable through its connect address and
    /// reports so; otherwise tells the caller to scrape the device's SDP
    /// record.
    pub fn device_found(&mut self, radio: RadioAddress, uuid_rev: u32, refresh_deadline: Instant) -> DeviceFoundOutcome {
        let Some(id) = self.db.find_by_radio(radio) else { return DeviceFoundOutcome::NeedsScrape };
        let Some(info) = self.db.get(id) else { return DeviceFoundOutcome::NeedsScrape };
        if info.uuid_rev != uuid_rev {
            return DeviceFoundOutcome::NeedsScrape;
        }
        let connect_addr = info.bus_address;
        self.db.refresh_expiration(connect_addr, refresh_deadline);
        DeviceFoundOutcome::Refreshed
    }

    /// Replaces the sub-piconet behind `connect_addr` with a freshly
    /// scraped node database, timestamping every new entry with
    /// `expire_deadline`, and returns the `(added, removed)` name deltas
    /// for the §4.6 LostNames/FoundNames pathway.
    pub fn apply_scrape(
        &mut self, connect_addr: BusAddress, scraped: &NodeDb, expire_deadline: Instant,
    ) -> (Vec<NodeNameDelta>, Vec<NodeNameDelta>) {
        let mut stale = NodeDb::new();
        for id in self.db.nodes_reachable_via(connect_addr) {
            if let Some(info) = self.db.remove(id) {
                stale.insert(info);
            }
        }

        let mut fresh = NodeDb::new();
        for (_, info) in scraped.iter() {
            let mut info = info.clone();
            info.expire_time = Some(expire_deadline);
            fresh.insert(info.clone());
            self.db.insert(info);
        }

        fresh.diff(&stale)
    }

    /// Moves `info` into the cache with a fresh `expire_time`, used when a
    /// direct minion disconnects while we remain master (§4.3 "Minion
    /// loss") — the node is downgraded to found-cache tracking rather than
    /// dropped outright, so clients still see a timed-out LostNames rather
    /// than a silent disappearance.
    pub fn insert_departing(&mut self, mut info: NodeInfo, expire_deadline: Instant) {
        info.direct_minion = false;
        info.expire_time = Some(expire_deadline);
        self.db.insert(info);
    }

    /// Refreshes every cached node to expire at `deadline` at once (§4.3
    /// "Master loss": flush the entire cache so names are re-sourced from
    /// the new topology rather than trusted stale).
    pub fn flush(&mut self, deadline: Instant) {
        let radios: Vec<BusAddress> = self.db.iter().map(|(_, info)| info.bus_address).collect();
        for addr in radios {
            self.db.refresh_expiration(addr, deadline);
        }
    }

    pub fn pop_expired(&mut self, now: Instant) -> Vec<NodeInfo> {
        self.db.pop_expired(now)
    }

    pub fn next_expiration(&self) -> Option<Instant> {
        self.db.next_expiration()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
