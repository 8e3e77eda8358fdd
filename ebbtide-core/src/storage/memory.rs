//! In-memory torrents and archive for simulation and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ArchiveError, PieceLayout, StorageError, Torrent, TorrentArchive};
use crate::swarm::{Bitfield, ContentDigest, PieceIndex};

/// Torrent backed by an in-memory piece table.
pub struct MemoryTorrent {
    digest: ContentDigest,
    layout: PieceLayout,
    pieces: Mutex<Vec<Option<Bytes>>>,
    fail_writes: AtomicU32,
}

impl MemoryTorrent {
    /// Creates a fully seeded torrent from a blob.
    pub fn seeded(data: &[u8], piece_length: u32) -> Arc<Self> {
        let layout = PieceLayout::from_blob(data, piece_length);
        let pieces = data
            .chunks(piece_length.max(1) as usize)
            .map(|chunk| Some(Bytes::copy_from_slice(chunk)))
            .collect();
        Arc::new(Self {
            digest: ContentDigest::from_blob(data),
            layout,
            pieces: Mutex::new(pieces),
            fail_writes: AtomicU32::new(0),
        })
    }

    /// Creates an empty shell awaiting download.
    pub fn shell(digest: ContentDigest, layout: PieceLayout) -> Arc<Self> {
        let pieces = vec![None; layout.piece_count() as usize];
        Arc::new(Self {
            digest,
            layout,
            pieces: Mutex::new(pieces),
            fail_writes: AtomicU32::new(0),
        })
    }

    /// Makes the next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Torrent for MemoryTorrent {
    fn digest(&self) -> ContentDigest {
        self.digest
    }

    fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    fn bitfield(&self) -> Bitfield {
        let pieces = self.pieces.lock();
        let mut field = Bitfield::new(self.layout.piece_count());
        for (index, piece) in pieces.iter().enumerate() {
            if piece.is_some() {
                field.set(index as u32);
            }
        }
        field
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces
            .lock()
            .get(index.as_u32() as usize)
            .is_some_and(Option::is_some)
    }

    fn is_complete(&self) -> bool {
        self.pieces.lock().iter().all(Option::is_some)
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.pieces
            .lock()
            .get(index.as_u32() as usize)
            .cloned()
            .flatten()
            .ok_or(StorageError::PieceNotFound { index })
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }

        let expected = self.layout.piece_size(index)?;
        if expected as usize != data.len() {
            return Err(StorageError::BadPieceLength {
                index,
                expected,
                actual: data.len(),
            });
        }

        let mut pieces = self.pieces.lock();
        let slot = pieces
            .get_mut(index.as_u32() as usize)
            .ok_or(StorageError::PieceOutOfBounds {
                index,
                count: self.layout.piece_count(),
            })?;
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(data));
        }
        Ok(())
    }
}

/// Archive over a set of in-memory torrents.
#[derive(Default)]
pub struct MemoryArchive {
    torrents: Mutex<HashMap<ContentDigest, Arc<MemoryTorrent>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fully seeded blob; returns its digest.
    pub fn insert_seed(&self, data: &[u8], piece_length: u32) -> ContentDigest {
        let torrent = MemoryTorrent::seeded(data, piece_length);
        let digest = torrent.digest();
        self.torrents.lock().insert(digest, torrent);
        digest
    }

    /// Registers an empty shell for a digest awaiting download.
    pub fn insert_shell(&self, digest: ContentDigest, layout: PieceLayout) -> Arc<MemoryTorrent> {
        let torrent = MemoryTorrent::shell(digest, layout);
        self.torrents.lock().insert(digest, torrent.clone());
        torrent
    }

    /// Looks up a registered torrent.
    pub fn get(&self, digest: ContentDigest) -> Option<Arc<MemoryTorrent>> {
        self.torrents.lock().get(&digest).cloned()
    }
}

#[async_trait]
impl TorrentArchive for MemoryArchive {
    async fn open(&self, digest: ContentDigest) -> Result<Arc<dyn Torrent>, ArchiveError> {
        self.get(digest)
            .map(|torrent| torrent as Arc<dyn Torrent>)
            .ok_or(ArchiveError::NotFound { digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_torrent_is_complete() {
        let torrent = MemoryTorrent::seeded(b"0123456789", 4);
        assert!(torrent.is_complete());
        assert_eq!(torrent.bitfield().count_set(), 3);
        assert_eq!(
            torrent.read_piece(PieceIndex::new(2)).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn test_shell_fills_in_and_rejects_bad_lengths() {
        let layout = PieceLayout::from_blob(b"0123456789", 4);
        let digest = ContentDigest::from_blob(b"0123456789");
        let torrent = MemoryTorrent::shell(digest, layout);

        assert!(!torrent.has_piece(PieceIndex::new(0)));
        assert!(matches!(
            torrent.read_piece(PieceIndex::new(0)).await,
            Err(StorageError::PieceNotFound { .. })
        ));

        torrent.write_piece(PieceIndex::new(0), b"0123").await.unwrap();
        assert!(torrent.has_piece(PieceIndex::new(0)));

        assert!(matches!(
            torrent.write_piece(PieceIndex::new(2), b"890").await,
            Err(StorageError::BadPieceLength { .. })
        ));

        torrent.write_piece(PieceIndex::new(1), b"4567").await.unwrap();
        torrent.write_piece(PieceIndex::new(2), b"89").await.unwrap();
        assert!(torrent.is_complete());
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let layout = PieceLayout::from_blob(b"abcd", 4);
        let torrent = MemoryTorrent::shell(ContentDigest::from_blob(b"abcd"), layout);
        torrent.fail_next_writes(2);

        assert!(torrent.write_piece(PieceIndex::new(0), b"abcd").await.is_err());
        assert!(torrent.write_piece(PieceIndex::new(0), b"abcd").await.is_err());
        assert!(torrent.write_piece(PieceIndex::new(0), b"abcd").await.is_ok());
    }

    #[tokio::test]
    async fn test_archive_open_unknown_digest() {
        let archive = MemoryArchive::new();
        let digest = ContentDigest::from_blob(b"missing");
        assert!(matches!(
            archive.open(digest).await,
            Err(ArchiveError::NotFound { .. })
        ));

        let known = archive.insert_seed(b"present", 4);
        assert!(archive.open(known).await.is_ok());
    }
}
