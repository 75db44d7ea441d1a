//! Aggregated name sets the delegation engine hands to a direct minion
//! (§2, §4.4): the advertise variant unions every node's `advertise_names`
//! into the `AdNameMap` wire shape; the find variant contributes the
//! ignore-address list `DelegateFind` carries instead of names.

use std::collections::BTreeSet;

use crate::node::NodeDb;
use crate::wire::AdvertiseInfoEntry;
use crate::RadioAddress;

/// Dirty flag for one aggregated name set: set whenever a name is
/// added/removed or the underlying node set changes, cleared once the
/// delegation engine rebuilds its signal arguments from it.
#[derive(Clone, Copy, Debug)]
pub struct NameArgSet {
    dirty: bool,
}

impl NameArgSet {
    pub fn new() -> Self {
        Self { dirty: true }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears and returns the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Default for NameArgSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the `AdNameMap` wire argument: one entry per node with a
/// non-empty `advertise_names` set (§6.1 `AdNameMapE`).
pub fn build_advertise_name_map(db: &NodeDb) -> Vec<AdvertiseInfoEntry> {
    db.iter()
        .filter(|(_, info)| !info.advertise_names.is_empty())
        .map(|(_, info)| AdvertiseInfoEntry {
            guid: info.guid.clone(),
            connect_addr: info.bus_address,
            names: info.advertise_names.iter().cloned().collect(),
        })
        .collect()
}

/// Union of every node's `find_names` across the piconet; used only to
/// decide whether the find set is active (`use_local_find`/admission),
/// since `DelegateFind`'s wire payload is the ignore-address list below,
/// not the names themselves.
pub fn total_find_names(db: &NodeDb) -> BTreeSet<String> {
    db.iter().fold(BTreeSet::new(), |mut acc, (_, info)| {
        acc.extend(info.find_names.iter().cloned());
        acc
    })
}

/// Radio addresses of every node in the piconet: the `ignore_addrs`
/// argument to `DelegateFind`, so a delegate's inquiry doesn't report its
/// own piconet-mates as newly found devices (§4.4).
pub fn ignore_addrs(db: &NodeDb) -> Vec<RadioAddress> {
    db.iter().map(|(_, info)| info.bus_address.radio).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;
    use crate::BusAddress;

    fn addr(b: u8) -> BusAddress {
        BusAddress { radio: RadioAddress([0, 0, 0, 0, 0, b]), psm: 0x1001 }
    }

    #[test]
    fn fresh_name_arg_set_starts_dirty() {
        let mut set = NameArgSet::new();
        assert!(set.is_dirty());
        assert!(set.take_dirty());
        assert!(!set.is_dirty());
        set.mark_dirty();
        assert!(set.take_dirty());
    }

    #[test]
    fn advertise_name_map_skips_names_empty_nodes() {
        let mut db = NodeDb::new();
        let mut self_node = NodeInfo::new_self("g", "a.1", addr(1));
        self_node.advertise_names.insert("com.x".into());
        db.insert_self(self_node);
        db.insert(NodeInfo::new_self("g2", "b.1", addr(2)));

        let map = build_advertise_name_map(&db);
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].names, vec!["com.x".to_string()]);
    }

    #[test]
    fn ignore_addrs_covers_every_node() {
        let mut db = NodeDb::new();
        db.insert_self(NodeInfo::new_self("g", "a.1", addr(1)));
        db.insert(NodeInfo::new_self("g2", "b.1", addr(2)));
        let radios = ignore_addrs(&db);
        assert_eq!(radios.len(), 2);
    }
}
