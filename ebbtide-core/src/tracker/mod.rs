//! Tracker boundary: announce and metainfo clients.
//!
//! The tracker tells peers about each other and serves piece layouts for
//! content no peer has described yet. Both clients are trait seams so the
//! scheduler can run against HTTP implementations in production and scripted
//! ones in tests; the origin role uses the disabled variants since origins
//! are always reachable and never fetch metainfo.

pub mod http;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

pub use http::{HttpAnnounceClient, HttpMetainfoClient};

use crate::storage::PieceLayout;
use crate::swarm::{ContentDigest, PeerId};

/// Identity and advertised address of the local peer, sent with announces.
#[derive(Debug, Clone, Copy)]
pub struct PeerContext {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl PeerContext {
    /// Creates a context with a freshly generated peer identity.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            peer_id: PeerId::generate(),
            addr,
        }
    }
}

/// Result of one announce: discovered peers and the tracker's suggested
/// re-announce interval.
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    pub interval: Option<Duration>,
}

/// Errors from tracker communication.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker connection failed: {url}")]
    ConnectionFailed { url: String },

    #[error("tracker request timed out: {url}")]
    Timeout { url: String },

    #[error("tracker returned status {status}: {url}")]
    ServerError { url: String, status: u16 },

    #[error("tracker does not know {digest}")]
    NotFound { digest: ContentDigest },

    #[error("invalid tracker response: {reason}")]
    InvalidResponse { reason: String },

    #[error("invalid tracker url: {url}")]
    InvalidUrl { url: String },
}

/// Announce RPC client contract.
#[async_trait]
pub trait AnnounceClient: Send + Sync {
    /// Announces the local peer for a torrent and returns discovered peers.
    ///
    /// `complete` reports whether the local store already has every piece,
    /// letting the tracker distinguish seeders from leechers.
    ///
    /// # Errors
    /// - `TrackerError::ConnectionFailed` / `Timeout` / `ServerError` -
    ///   Transport-level failures, retried with backoff by the caller
    /// - `TrackerError::NotFound` - Tracker does not track this digest
    async fn announce(
        &self,
        digest: ContentDigest,
        local: &PeerContext,
        complete: bool,
    ) -> Result<AnnounceResponse, TrackerError>;
}

/// Metainfo fetch client contract.
///
/// Used by the agent-role archive to learn a torrent's shape before any peer
/// has been contacted.
#[async_trait]
pub trait MetainfoClient: Send + Sync {
    /// Fetches the piece layout for a digest.
    ///
    /// # Errors
    /// - `TrackerError::NotFound` - Digest unknown to the tracker
    /// - `TrackerError::ConnectionFailed` / `Timeout` / `ServerError` -
    ///   Transport-level failures
    async fn fetch(&self, digest: ContentDigest) -> Result<PieceLayout, TrackerError>;
}

/// Announce client that never makes a network call.
///
/// Used by the origin role, which does not need peer discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAnnounceClient;

#[async_trait]
impl AnnounceClient for DisabledAnnounceClient {
    async fn announce(
        &self,
        _digest: ContentDigest,
        _local: &PeerContext,
        _complete: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        Ok(AnnounceResponse::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_announce_returns_empty() {
        let client = DisabledAnnounceClient;
        let local = PeerContext::new("127.0.0.1:7001".parse().unwrap());
        let digest = ContentDigest::from_blob(b"blob");

        let response = client.announce(digest, &local, true).await.unwrap();
        assert!(response.peers.is_empty());
        assert_eq!(response.interval, None);
    }
}
