//! Events consumed by a torrent dispatcher and the status it reports.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::protocol::{PeerLink, PeerMessage};
use super::{ContentDigest, PeerId, PieceIndex, SwarmError};
use crate::storage::StorageError;

/// Everything a dispatcher reacts to, from peers, workers, and the
/// scheduler. One queue per torrent; ordering within the queue is the only
/// ordering the dispatcher relies on.
pub enum DispatcherEvent {
    /// A handshaked connection is being handed to this torrent.
    Connected {
        link: PeerLink,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// A message arrived from a connected peer. `link_id` ties the message
    /// to the link that produced it, so traffic from a replaced link is
    /// discarded instead of being attributed to its replacement.
    PeerMessage {
        peer: PeerId,
        link_id: u64,
        message: PeerMessage,
    },
    /// A peer's inbound stream ended.
    PeerClosed { peer: PeerId, link_id: u64 },
    /// The tracker returned fresh peer addresses.
    PeersDiscovered { addrs: Vec<SocketAddr> },
    /// An outbound dial finished (successes arrive as `Connected`).
    DialFinished { addr: SocketAddr },
    /// A storage worker finished reading a piece for upload.
    PieceRead {
        peer: PeerId,
        index: PieceIndex,
        result: Result<Bytes, StorageError>,
    },
    /// A storage worker finished persisting a downloaded piece.
    PieceWritten {
        peer: PeerId,
        index: PieceIndex,
        result: Result<(), StorageError>,
    },
    /// Status snapshot request.
    Status {
        responder: oneshot::Sender<TorrentStatus>,
    },
    /// Graceful teardown request.
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Lifecycle phase of a torrent's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    /// Archive opened, first announce not yet answered.
    Initializing,
    /// Missing pieces, actively requesting.
    Downloading,
    /// All pieces complete, serving uploads only.
    Seeding,
    /// Dispatcher has exited.
    Closed,
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of one torrent's swarm activity.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub digest: ContentDigest,
    pub state: TorrentState,
    pub peer_count: usize,
    pub piece_count: u32,
    pub completed_pieces: u32,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}
