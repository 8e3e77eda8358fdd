//! Piece storage abstraction over the backing content stores.
//!
//! A [`Torrent`] is one blob's piece layout plus read/write access to its
//! backing store. A [`TorrentArchive`] opens torrents for a role: agents
//! create partially-downloaded torrents in a cache directory, origins expose
//! always-complete blobs from a content-addressable store.

pub mod agent;
pub mod memory;
pub mod origin;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

pub use agent::AgentArchive;
pub use memory::{MemoryArchive, MemoryTorrent};
pub use origin::OriginArchive;

use crate::swarm::{Bitfield, ContentDigest, PieceIndex};
use crate::tracker::TrackerError;

/// SHA-1 hash of one piece's bytes, used for download verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    /// Creates PieceHash from a 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Computes the hash of a piece's bytes.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Returns reference to the underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for PieceHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PieceHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("piece hash must be 20 bytes"))?;
        Ok(Self(hash))
    }
}

/// Shape of a torrent's content: piece size, total length, and per-piece
/// hashes.
///
/// Serialized as JSON for metainfo sidecar files and the tracker's metainfo
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceLayout {
    /// Size of every piece except possibly the last, in bytes
    pub piece_length: u32,
    /// Total content length in bytes
    pub total_length: u64,
    /// SHA-1 hash of each piece, indexed by piece
    pub piece_hashes: Vec<PieceHash>,
}

impl PieceLayout {
    /// Creates a layout, validating that the hash count matches the derived
    /// piece count.
    ///
    /// # Errors
    /// - `StorageError::CorruptLayout` - Zero piece length or hash count
    ///   mismatch
    pub fn new(
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<PieceHash>,
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(StorageError::CorruptLayout {
                reason: "piece length must be non-zero".to_string(),
            });
        }
        let expected = total_length.div_ceil(u64::from(piece_length));
        if expected != piece_hashes.len() as u64 {
            return Err(StorageError::CorruptLayout {
                reason: format!(
                    "expected {expected} piece hashes, got {}",
                    piece_hashes.len()
                ),
            });
        }
        Ok(Self {
            piece_length,
            total_length,
            piece_hashes,
        })
    }

    /// Derives a layout by hashing an in-memory blob.
    pub fn from_blob(data: &[u8], piece_length: u32) -> Self {
        let piece_hashes = data
            .chunks(piece_length.max(1) as usize)
            .map(PieceHash::of)
            .collect();
        Self {
            piece_length,
            total_length: data.len() as u64,
            piece_hashes,
        }
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte offset of a piece within the blob.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Size in bytes of a specific piece. The last piece may be short.
    ///
    /// # Errors
    /// - `StorageError::PieceOutOfBounds` - Index past the last piece
    pub fn piece_size(&self, index: PieceIndex) -> Result<u32, StorageError> {
        if index.as_u32() >= self.piece_count() {
            return Err(StorageError::PieceOutOfBounds {
                index,
                count: self.piece_count(),
            });
        }
        let offset = self.piece_offset(index);
        let remaining = self.total_length - offset;
        Ok(remaining.min(u64::from(self.piece_length)) as u32)
    }

    /// Checks piece data against the stored hash and expected size.
    pub fn verify(&self, index: PieceIndex, data: &[u8]) -> bool {
        let Some(expected) = self.piece_hashes.get(index.as_u32() as usize) else {
            return false;
        };
        match self.piece_size(index) {
            Ok(size) if size as usize == data.len() => PieceHash::of(data) == *expected,
            _ => false,
        }
    }
}

/// Errors from piece store access.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("piece {index} out of bounds for torrent with {count} pieces")]
    PieceOutOfBounds { index: PieceIndex, count: u32 },

    #[error("piece {index} not present in store")]
    PieceNotFound { index: PieceIndex },

    #[error("piece {index} has wrong length: expected {expected}, got {actual}")]
    BadPieceLength {
        index: PieceIndex,
        expected: u32,
        actual: usize,
    },

    #[error("corrupt piece layout: {reason}")]
    CorruptLayout { reason: String },

    #[error("store is read-only")]
    ReadOnly,
}

/// Errors from opening a torrent through an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("torrent {digest} not found in archive")]
    NotFound { digest: ContentDigest },

    #[error("metainfo fetch failed")]
    Metainfo(#[from] TrackerError),

    #[error("storage error")]
    Storage(#[from] StorageError),
}

/// One torrent's piece layout plus access to its backing store.
///
/// Reads and writes may touch disk and are dispatched to a bounded worker
/// pool by the caller; implementations must be safe for concurrent access.
/// `write_piece` is atomic: a crash mid-write never leaves the piece
/// reported complete.
#[async_trait]
pub trait Torrent: Send + Sync {
    /// Digest of the content this torrent carries.
    fn digest(&self) -> ContentDigest;

    /// Piece layout of the content.
    fn layout(&self) -> &PieceLayout;

    /// Snapshot of locally-complete pieces.
    fn bitfield(&self) -> Bitfield;

    /// Whether the piece is locally complete.
    fn has_piece(&self, index: PieceIndex) -> bool;

    /// Whether every piece is locally complete.
    fn is_complete(&self) -> bool;

    /// Reads a complete piece's bytes.
    ///
    /// # Errors
    /// - `StorageError::PieceNotFound` - Piece not locally complete
    /// - `StorageError::Io` - Backing store read failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError>;

    /// Persists a verified piece and marks it complete.
    ///
    /// Writing a piece that is already complete is a no-op.
    ///
    /// # Errors
    /// - `StorageError::BadPieceLength` - Data does not match the layout
    /// - `StorageError::ReadOnly` - Store cannot be written (origin role)
    /// - `StorageError::Io` - Backing store write failed
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;
}

/// Role-specific factory that opens a torrent's layout and backing store.
///
/// Injected into the scheduler so origin and agent share one dispatcher
/// implementation.
#[async_trait]
pub trait TorrentArchive: Send + Sync {
    /// Opens (or creates, agent role) the torrent for a digest.
    ///
    /// # Errors
    /// - `ArchiveError::NotFound` - Digest unknown to this archive
    /// - `ArchiveError::Metainfo` - Layout could not be fetched
    /// - `ArchiveError::Storage` - Backing store unavailable
    async fn open(&self, digest: ContentDigest) -> Result<Arc<dyn Torrent>, ArchiveError>;
}
