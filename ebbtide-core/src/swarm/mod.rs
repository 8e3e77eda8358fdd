//! Swarm coordination engine: per-torrent dispatchers, peer bookkeeping,
//! announce scheduling, and the process-wide scheduler.

pub mod announce_queue;
pub mod bitfield;
mod connection;
pub mod dispatcher;
pub mod events;
mod peer_set;
pub mod protocol;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub use announce_queue::AnnounceQueue;
pub use bitfield::Bitfield;
pub use events::{TorrentState, TorrentStatus};
pub use protocol::{Handshake, PeerLink, PeerMessage, Transport};
pub use scheduler::{ReloadableScheduler, Scheduler};

use crate::storage::{ArchiveError, StorageError};
use crate::tracker::TrackerError;

/// SHA-256 digest identifying a unique piece of content.
///
/// Content is addressed by the hash of its bytes, so two torrents for the
/// same blob are the same torrent everywhere in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Creates ContentDigest from a 32-byte SHA-256 hash.
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Computes the digest of a blob's bytes.
    pub fn from_blob(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parses a digest from its 64-character hex form.
    ///
    /// # Errors
    /// - `SwarmError::InvalidDigest` - Input is not 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self, SwarmError> {
        let bytes = hex::decode(s).map_err(|_| SwarmError::InvalidDigest {
            reason: format!("not valid hex: {s:?}"),
        })?;
        let hash: [u8; 32] = bytes.try_into().map_err(|_| SwarmError::InvalidDigest {
            reason: "digest must be 32 bytes".to_string(),
        })?;
        Ok(Self(hash))
    }

    /// Returns reference to the underlying 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Content is divided into fixed-size pieces for exchange and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from a zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 20-byte identity of a peer within the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates PeerId from 20 raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh peer identity with the Ebbtide client prefix.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(b"-EB0001-");
        let suffix: [u8; 12] = rand::rng().random();
        bytes[8..].copy_from_slice(&suffix);
        Self(bytes)
    }

    /// Returns reference to the underlying 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

use rand::Rng as _;

/// Errors that can occur during swarm operations.
///
/// Per-connection and per-piece failures are absorbed inside the dispatcher;
/// only archive-open failures and explicit shutdown errors reach callers of
/// the public control surface.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("archive error for {digest}")]
    Archive {
        digest: ContentDigest,
        #[source]
        source: ArchiveError,
    },

    #[error("unknown torrent {digest}")]
    UnknownTorrent { digest: ContentDigest },

    #[error("swarm full for {digest}")]
    CapacityExceeded { digest: ContentDigest },

    #[error("piece {index} failed verification")]
    PieceVerificationFailed { index: PieceIndex },

    #[error("storage error")]
    Storage(#[from] StorageError),

    #[error("protocol violation from {peer}: {reason}")]
    PeerProtocolViolation { peer: PeerId, reason: String },

    #[error("announce failed")]
    Announce(#[from] TrackerError),

    #[error("invalid content digest: {reason}")]
    InvalidDigest { reason: String },

    #[error("scheduler is shut down")]
    SchedulerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_display_round_trip() {
        let digest = ContentDigest::from_blob(b"hello ebbtide");
        let parsed = ContentDigest::from_hex(&digest.to_string()).unwrap();
        assert_eq!(digest, parsed);
        assert_eq!(digest.to_string().len(), 64);
    }

    #[test]
    fn test_content_digest_rejects_bad_hex() {
        assert!(matches!(
            ContentDigest::from_hex("zz"),
            Err(SwarmError::InvalidDigest { .. })
        ));
        assert!(matches!(
            ContentDigest::from_hex("abcd"),
            Err(SwarmError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_content_digest_serde_as_hex() {
        let digest = ContentDigest::from_blob(b"serde");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn test_peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.as_bytes()[..8], b"-EB0001-");
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn test_piece_index_ordering() {
        assert!(PieceIndex::new(5) < PieceIndex::new(10));
        assert_eq!(PieceIndex::new(5).as_u32(), 5);
    }
}
