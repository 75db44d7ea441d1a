//! Master/drone/minion role protocol: the SetState exchange, tie-break,
//! master-selection rule, UUID-revision bookkeeping, and recovery on
//! master loss (§4.3).
//!
//! The master-selection rule is resolved from the AllJoyn `BTController`
//! this spec was distilled from: the side that *receives* an incoming
//! SetState call decides unilaterally, comparing the caller's minion count
//! against its own; on a tie it keeps its own mastery. The caller then
//! mirrors whatever the callee decided. This matches the worked example
//! in §8 scenario 2 (B calls A; both have zero minions; A — the callee —
//! remains master) and is reproduced as-is per §9's instruction not to
//! "fix" preserved behavior.

use std::collections::HashSet;

use rand::Rng;
use strum::Display as StrumDisplay;

use crate::{BusAddress, Result, INVALID_UUIDREV};

/// The three roles a controller can hold in its piconet (§4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, StrumDisplay)]
pub enum Role {
    /// `master_proxy == None`.
    #[strum(serialize = "master")]
    Master,
    /// `master_proxy == Some` and at least one direct minion.
    #[strum(serialize = "drone")]
    Drone,
    /// `master_proxy == Some` and zero direct minions.
    #[strum(serialize = "minion")]
    Minion,
}

/// Outcome of receiving an incoming SetState call, per the master-selection
/// rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetStateOutcome {
    /// Our minion count did not exceed the caller's; we keep mastery.
    WeRemainMaster,
    /// The caller had strictly more direct minions; we become its minion
    /// (or drone, if we still have minions of our own once it merges).
    WeBecomeMinionOf(BusAddress),
}

/// Outcome of the simultaneous-SetState tie-break (§4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TieBreak {
    /// Accept the peer's incoming SetState and reply normally.
    AcceptPeer,
    /// Reply with the ignore marker; our own outgoing SetState's reply will
    /// update our state instead.
    IgnoreIncoming,
}

/// Per-controller role bookkeeping.
pub struct RoleState {
    /// `None` iff we are master.
    master_addr: Option<BusAddress>,
    master_unique_name: String,
    /// Never `INVALID_UUIDREV` once initialized (invariant 5, §8).
    master_uuid_rev: u32,
    /// Remote bus addresses we have an outgoing SetState in flight to.
    outgoing_set_state: HashSet<BusAddress>,
}

impl RoleState {
    /// A freshly booted controller: master of itself, with a random
    /// nonzero initial UUID revision.
    pub fn new() -> Self {
        let mut rev = 0u32;
        while rev == INVALID_UUIDREV {
            rev = rand::thread_rng().gen();
        }
        Self {
            master_addr: None,
            master_unique_name: String::new(),
            master_uuid_rev: rev,
            outgoing_set_state: HashSet::new(),
        }
    }

    pub fn master_uuid_rev(&self) -> u32 {
        self.master_uuid_rev
    }

    pub fn master_addr(&self) -> Option<BusAddress> {
        self.master_addr
    }

    pub fn master_unique_name(&self) -> &str {
        &self.master_unique_name
    }

    pub fn is_master(&self) -> bool {
        self.master_addr.is_none()
    }

    /// The role we hold, given our current count of direct minions.
    pub fn role(&self, direct_minion_count: usize) -> Role {
        match self.master_addr {
            None => Role::Master,
            Some(_) if direct_minion_count > 0 => Role::Drone,
            Some(_) => Role::Minion,
        }
    }

    /// Begins tracking an outgoing SetState to `peer`. Returns `false` if
    /// one was already in flight (shouldn't normally happen; callers treat
    /// this as a no-op resend).
    pub fn begin_outgoing(&mut self, peer: BusAddress) -> bool {
        self.outgoing_set_state.insert(peer)
    }

    /// Whether we have an outgoing SetState in flight to `peer`.
    pub fn has_outgoing(&self, peer: BusAddress) -> bool {
        self.outgoing_set_state.contains(&peer)
    }

    /// Clears in-flight tracking for `peer` — on reply, timeout, or
    /// disconnect (§5 cancellation/timeout).
    pub fn clear_outgoing(&mut self, peer: BusAddress) {
        self.outgoing_set_state.remove(&peer);
    }

    /// Tie-break for a simultaneous incoming SetState from `peer` while we
    /// also have an outgoing one to them (§4.3).
    pub fn tie_break(&self, our_addr: BusAddress, peer_addr: BusAddress) -> TieBreak {
        debug_assert!(self.has_outgoing(peer_addr));
        if our_addr < peer_addr {
            TieBreak::AcceptPeer
        } else {
            TieBreak::IgnoreIncoming
        }
    }

    /// Master-selection rule applied by the *receiver* of an incoming
    /// SetState: the caller's `direct_minion_count` must strictly exceed
    /// ours for mastery to pass to them; ties keep our own mastery.
    pub fn decide_incoming_set_state(
        &self, caller_addr: BusAddress, caller_minion_count: u8, our_minion_count: u8,
    ) -> SetStateOutcome {
        if caller_minion_count > our_minion_count {
            SetStateOutcome::WeBecomeMinionOf(caller_addr)
        } else {
            SetStateOutcome::WeRemainMaster
        }
    }

    /// Installs `peer` as our master after losing the selection.
    pub fn become_minion_of(&mut self, peer: BusAddress, peer_unique_name: impl Into<String>, peer_uuid_rev: u32) {
        self.master_addr = Some(peer);
        self.master_unique_name = peer_unique_name.into();
        self.master_uuid_rev = peer_uuid_rev;
    }

    /// Regenerates `master_uuid_rev` to a value outside a ±10 band of
    /// `peer_rev`, skipping 0, after winning a master transition (§4.3).
    pub fn regenerate_uuid_rev(&mut self, peer_rev: u32) {
        self.master_uuid_rev = Self::sample_uuid_rev(peer_rev);
    }

    fn sample_uuid_rev(avoid: u32) -> u32 {
        let lower = avoid.saturating_sub(10);
        let upper = avoid.saturating_add(10);
        loop {
            let candidate: u32 = rand::thread_rng().gen();
            if candidate != INVALID_UUIDREV && !(lower..=upper).contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Increments `master_uuid_rev`, skipping the zero sentinel on
    /// rollover (§3 "UUID revision").
    pub fn increment_uuid_rev(&mut self) {
        self.master_uuid_rev = self.master_uuid_rev.wrapping_add(1);
        if self.master_uuid_rev == INVALID_UUIDREV {
            self.master_uuid_rev = 1;
        }
    }

    /// Promotes self to master after losing our former master (master
    /// loss, §4.3). Returns the old master's address, if any.
    pub fn promote_to_master(&mut self) -> Option<BusAddress> {
        let old = self.master_addr.take();
        self.master_unique_name.clear();
        self.increment_uuid_rev();
        old
    }
}

impl Default for RoleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the SetState rejection error for a peer whose bus address
/// equals ours (§7 `SelfConnect`).
pub fn reject_self_connect() -> crate::Error {
    crate::Error::new(crate::ErrorKind::SelfConnect)
}

/// Builds the SetState rejection error for a caller we already know about,
/// or a call received while we are not master (§7 `RoleViolation`).
pub fn reject_role_violation() -> crate::Error {
    crate::Error::new(crate::ErrorKind::RoleViolation)
}

pub(crate) fn check_not_self(our_addr: BusAddress, peer_addr: BusAddress) -> Result<()> {
    if our_addr == peer_addr {
        Err(reject_self_connect())
    } else {
        Ok(())
    }
}
