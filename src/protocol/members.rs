use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::order::Order;
use crate::protocol::types::NodeId;

/// Protocol periods a dismissed id is remembered before it may be treated as
/// unknown again. Roughly one day at the default one-second tick.
const DISMISSAL_RETENTION: u64 = 86_400;

/// What the local node knows about one live peer.
#[derive(Debug, Clone)]
pub struct Profile {
    /// The peer's latest known incarnation.
    pub incarnation: u64,
    /// The peer's UDP address.
    pub addr: SocketAddr,
    /// True once we have ever assembled a packet for this peer; governs the
    /// introductory alive message.
    pub contacted: bool,
}

/// The membership table: live peers, suspicion counters, dismissed ids, and
/// the probe ordering. The order is kept in lockstep with the member map so
/// the two can be treated as one structure.
#[derive(Debug, Default)]
pub struct MemberTable {
    members: HashMap<NodeId, Profile>,
    suspects: HashMap<NodeId, u32>,
    dismissed: HashMap<NodeId, u64>,
    order: Order<NodeId>,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn is_suspect(&self, id: &NodeId) -> bool {
        self.suspects.contains_key(id)
    }

    pub fn is_dismissed(&self, id: &NodeId) -> bool {
        self.dismissed.contains_key(id)
    }

    pub fn profile(&self, id: &NodeId) -> Option<&Profile> {
        self.members.get(id)
    }

    pub fn profile_mut(&mut self, id: &NodeId) -> Option<&mut Profile> {
        self.members.get_mut(id)
    }

    /// Admits a new peer: creates its profile and inserts it at a random
    /// position in the probe order.
    pub fn insert<R: Rng>(&mut self, id: NodeId, incarnation: u64, addr: SocketAddr, rng: &mut R) {
        if self.members.contains_key(&id) {
            return;
        }
        self.members.insert(
            id.clone(),
            Profile {
                incarnation,
                addr,
                contacted: false,
            },
        );
        self.order.add(id, rng);
    }

    /// Removes a peer from membership and dismisses it permanently (until
    /// retention expires). Returns the removed profile if it was a member.
    pub fn remove(&mut self, id: &NodeId, period: u64) -> Option<Profile> {
        let profile = self.members.remove(id)?;
        self.suspects.remove(id);
        self.order.remove(id);
        self.dismissed.insert(id.clone(), period);
        Some(profile)
    }

    /// Starts suspecting a peer, resetting any existing counter.
    pub fn set_suspect(&mut self, id: &NodeId) {
        self.suspects.insert(id.clone(), 0);
    }

    /// Starts suspecting a peer unless it is already under suspicion; an
    /// existing counter is left untouched.
    pub fn mark_suspect_if_new(&mut self, id: &NodeId) {
        self.suspects.entry(id.clone()).or_insert(0);
    }

    pub fn clear_suspect(&mut self, id: &NodeId) {
        self.suspects.remove(id);
    }

    /// Advances every suspicion counter by one period and returns the ids
    /// whose counters have reached the timeout.
    pub fn advance_suspects(&mut self, timeout: u32) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for (id, periods) in self.suspects.iter_mut() {
            *periods += 1;
            if *periods >= timeout {
                expired.push(id.clone());
            }
        }
        expired
    }

    /// Selects the next probe target.
    pub fn next_target<R: Rng>(&mut self, rng: &mut R) -> Option<NodeId> {
        self.order.next(rng)
    }

    /// Draws up to n distinct members other than `exclude` for indirect
    /// probing.
    pub fn sample<R: Rng>(&self, n: usize, exclude: &NodeId, rng: &mut R) -> Vec<NodeId> {
        self.order.independent_sample(n, exclude, rng)
    }

    /// Forgets dismissals older than the retention window.
    pub fn expire_dismissed(&mut self, period: u64) {
        self.dismissed
            .retain(|_, dismissed_at| period.saturating_sub(*dismissed_at) < DISMISSAL_RETENTION);
    }

    /// Snapshot of the live membership with addresses.
    pub fn snapshot(&self) -> Vec<(NodeId, SocketAddr)> {
        self.members
            .iter()
            .map(|(id, profile)| (id.clone(), profile.addr))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self, own: &NodeId) {
        assert!(!self.members.contains_key(own), "own id in members");
        assert!(!self.suspects.contains_key(own), "own id in suspects");
        assert!(!self.dismissed.contains_key(own), "own id in dismissed");
        for id in self.suspects.keys() {
            assert!(self.members.contains_key(id), "suspect {id} not a member");
        }
        for id in self.members.keys() {
            assert!(
                !self.dismissed.contains_key(id),
                "{id} both member and dismissed"
            );
            assert!(self.order.contains(id), "{id} missing from order");
        }
        assert_eq!(
            self.order.len(),
            self.members.len(),
            "order and members out of sync"
        );
    }
}
