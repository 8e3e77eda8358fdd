//! Typed peer messages and the seam to the external wire codec.
//!
//! The handshake and message codec live outside this crate; they hand each
//! established connection to the scheduler as a [`PeerLink`]: a typed channel
//! pair. Outbound dials go through the [`Transport`] trait so tests can swap
//! in channel-backed fakes.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Bitfield, ContentDigest, PeerId, PieceIndex, SwarmError};

/// Messages exchanged between peers of one torrent.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Full advertisement of the sender's complete pieces.
    Bitfield(Bitfield),
    /// The sender completed one more piece.
    Have(PieceIndex),
    /// Ask the remote peer for a piece's data.
    Request(PieceIndex),
    /// Piece payload answering a request.
    Piece { index: PieceIndex, data: Bytes },
    /// The sender cannot serve the requested piece.
    Reject(PieceIndex),
}

/// Result of the external handshake: which torrent and which peer.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub digest: ContentDigest,
    pub peer_id: PeerId,
}

/// One established peer connection as seen by the dispatcher.
///
/// The wire codec pumps decoded inbound messages into `inbound` and drains
/// `outbound` onto the socket. Dropping `outbound` closes the connection;
/// the codec's own close is idempotent.
pub struct PeerLink {
    pub peer_id: PeerId,
    pub outbound: mpsc::Sender<PeerMessage>,
    pub inbound: mpsc::Receiver<PeerMessage>,
}

impl PeerLink {
    /// Creates a connected in-memory link pair, one end per peer.
    ///
    /// Messages sent on one end's `outbound` arrive on the other end's
    /// `inbound`. Used by in-process transports and tests.
    pub fn pair(local: PeerId, remote: PeerId, capacity: usize) -> (PeerLink, PeerLink) {
        let (to_remote, from_local) = mpsc::channel(capacity);
        let (to_local, from_remote) = mpsc::channel(capacity);
        (
            PeerLink {
                peer_id: remote,
                outbound: to_remote,
                inbound: from_remote,
            },
            PeerLink {
                peer_id: local,
                outbound: to_local,
                inbound: from_local,
            },
        )
    }
}

/// Outbound connection factory over the external transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials a peer and completes the handshake for a torrent.
    ///
    /// # Errors
    /// - `SwarmError::PeerProtocolViolation` - Handshake failed or the
    ///   remote peer does not carry the torrent
    async fn dial(&self, addr: SocketAddr, handshake: Handshake) -> Result<PeerLink, SwarmError>;
}
