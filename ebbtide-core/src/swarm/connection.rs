//! Dispatcher-owned state for one active peer link.

use std::time::Instant;

use tokio::sync::mpsc;

use super::protocol::PeerMessage;
use super::{Bitfield, PeerId};

/// One active peer link: outbound send queue plus the remote peer's
/// advertised pieces and exchange counters.
///
/// All mutation happens on the owning dispatcher's control thread. Dropping
/// a `Connection` drops its outbound sender, which closes the link.
pub(crate) struct Connection {
    peer_id: PeerId,
    /// Distinguishes this link from an earlier one to the same peer, so
    /// events from a replaced link cannot act on its replacement.
    link_id: u64,
    outbound: mpsc::Sender<PeerMessage>,
    /// Pieces the remote peer advertises
    pub remote_pieces: Bitfield,
    /// Piece requests we have outstanding to this peer
    pub outstanding_requests: usize,
    /// Hash or deadline failures attributed to this peer
    pub failures: u32,
    /// Last time a message moved on this link in either direction
    pub last_active: Instant,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl Connection {
    pub fn new(
        peer_id: PeerId,
        link_id: u64,
        outbound: mpsc::Sender<PeerMessage>,
        piece_count: u32,
    ) -> Self {
        Self {
            peer_id,
            link_id,
            outbound,
            remote_pieces: Bitfield::new(piece_count),
            outstanding_requests: 0,
            failures: 0,
            last_active: Instant::now(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Queues a message without blocking the dispatcher.
    ///
    /// Returns false when the outbound queue is full or the link is closed;
    /// the caller drops the connection in either case (a peer that cannot
    /// drain its queue is treated the same as a disconnected one).
    pub fn try_send(&self, message: PeerMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Records link activity for idle eviction.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::swarm::PieceIndex;

    #[test]
    fn test_try_send_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(PeerId::generate(), 0, tx, 8);

        assert!(conn.try_send(PeerMessage::Have(PieceIndex::new(0))));
        // Queue of one is now full.
        assert!(!conn.try_send(PeerMessage::Have(PieceIndex::new(1))));
    }

    #[test]
    fn test_try_send_reports_closed_link() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let conn = Connection::new(PeerId::generate(), 0, tx, 8);

        assert!(!conn.try_send(PeerMessage::Have(PieceIndex::new(0))));
    }
}
