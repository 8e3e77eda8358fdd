//! Bounded per-torrent registry of open connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::connection::Connection;
use super::protocol::PeerMessage;
use super::{ContentDigest, PeerId, SwarmError};

/// Process-wide connection budget shared by every peer set.
///
/// Cloning shares the underlying counter. Acquire/release are lock-free;
/// the per-torrent cap is enforced separately by each `PeerSet`.
#[derive(Clone)]
pub(crate) struct ConnectionBudget {
    inner: Arc<BudgetInner>,
}

struct BudgetInner {
    limit: usize,
    used: AtomicUsize,
}

impl ConnectionBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                limit,
                used: AtomicUsize::new(0),
            }),
        }
    }

    pub fn in_use(&self) -> usize {
        self.inner.used.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.inner
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.inner.limit).then_some(used + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.inner.used.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of open connections for one torrent, keyed by peer identity.
///
/// Enforces both the per-torrent connection cap and the process-wide budget.
/// Only the owning dispatcher mutates it, so enumeration always observes a
/// consistent snapshot.
pub(crate) struct PeerSet {
    digest: ContentDigest,
    capacity: usize,
    budget: ConnectionBudget,
    members: HashMap<PeerId, Connection>,
}

impl PeerSet {
    pub fn new(digest: ContentDigest, capacity: usize, budget: ConnectionBudget) -> Self {
        Self {
            digest,
            capacity,
            budget,
            members: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.members.contains_key(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut Connection> {
        self.members.get_mut(&peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.members.values()
    }

    /// Updates the per-torrent cap (applied to subsequent inserts only).
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Registers a connection.
    ///
    /// A duplicate peer identity replaces the existing connection rather
    /// than doubling it (the dropped connection's link closes).
    ///
    /// # Errors
    /// - `SwarmError::CapacityExceeded` - Torrent cap or global budget hit
    pub fn insert(&mut self, conn: Connection) -> Result<(), SwarmError> {
        let peer = conn.peer_id();
        if self.members.contains_key(&peer) {
            self.members.insert(peer, conn);
            return Ok(());
        }
        if self.members.len() >= self.capacity || !self.budget.try_acquire() {
            return Err(SwarmError::CapacityExceeded {
                digest: self.digest,
            });
        }
        self.members.insert(peer, conn);
        Ok(())
    }

    /// Removes a connection. Idempotent: removing an absent peer is a no-op.
    pub fn remove(&mut self, peer: PeerId) -> Option<Connection> {
        let conn = self.members.remove(&peer);
        if conn.is_some() {
            self.budget.release();
        }
        conn
    }

    /// Sends a message to every member.
    ///
    /// A member whose outbound queue is full or closed is removed and
    /// returned; the broadcast continues to the rest.
    pub fn broadcast(&mut self, message: &PeerMessage) -> Vec<PeerId> {
        let failed: Vec<PeerId> = self
            .members
            .values()
            .filter(|conn| !conn.try_send(message.clone()))
            .map(Connection::peer_id)
            .collect();
        for peer in &failed {
            self.remove(*peer);
        }
        failed
    }

    /// Snapshot of peers currently advertising a piece.
    pub fn peers_with_piece(&self, index: u32) -> Vec<PeerId> {
        self.members
            .values()
            .filter(|conn| conn.remote_pieces.has(index))
            .map(Connection::peer_id)
            .collect()
    }

    /// Removes every member, releasing the global budget.
    pub fn clear(&mut self) {
        let count = self.members.len();
        self.members.clear();
        for _ in 0..count {
            self.budget.release();
        }
    }
}

impl Drop for PeerSet {
    fn drop(&mut self) {
        self.clear();
    }
}
