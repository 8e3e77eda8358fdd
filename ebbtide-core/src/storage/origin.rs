//! Read-only origin archive over a content-addressable blob directory.
//!
//! Origins always have the full content: each blob lives at `<root>/<digest>`
//! with its piece layout in a `<digest>.meta` JSON sidecar. Torrents opened
//! here report every piece complete and reject writes.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{ArchiveError, PieceLayout, StorageError, Torrent, TorrentArchive};
use crate::swarm::{Bitfield, ContentDigest, PieceIndex};

/// Origin-role archive rooted at a blob directory.
pub struct OriginArchive {
    root: PathBuf,
}

impl OriginArchive {
    /// Creates an archive over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, digest: ContentDigest) -> PathBuf {
        self.root.join(digest.to_string())
    }

    fn meta_path(&self, digest: ContentDigest) -> PathBuf {
        self.root.join(format!("{digest}.meta"))
    }

    /// Materializes a blob and its layout sidecar into the store.
    ///
    /// Both files are written through a temporary sibling and rename, so a
    /// partially-seeded blob is never visible under its digest.
    ///
    /// # Errors
    /// - `StorageError::Io` - Directory or file writes failed
    pub async fn seed_blob(
        &self,
        data: &[u8],
        piece_length: u32,
    ) -> Result<ContentDigest, StorageError> {
        fs::create_dir_all(&self.root).await?;

        let digest = ContentDigest::from_blob(data);
        let layout = PieceLayout::from_blob(data, piece_length);
        let meta = serde_json::to_vec(&layout).map_err(|e| StorageError::CorruptLayout {
            reason: format!("layout did not serialize: {e}"),
        })?;

        write_atomic(&self.blob_path(digest), data).await?;
        write_atomic(&self.meta_path(digest), &meta).await?;
        Ok(digest)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl TorrentArchive for OriginArchive {
    async fn open(&self, digest: ContentDigest) -> Result<Arc<dyn Torrent>, ArchiveError> {
        let meta = match fs::read(self.meta_path(digest)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound { digest });
            }
            Err(e) => return Err(StorageError::Io(e).into()),
        };

        let layout: PieceLayout =
            serde_json::from_slice(&meta).map_err(|e| StorageError::CorruptLayout {
                reason: format!("metainfo sidecar did not parse: {e}"),
            })?;

        let file = OpenOptions::new()
            .read(true)
            .open(self.blob_path(digest))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ArchiveError::NotFound { digest },
                _ => StorageError::Io(e).into(),
            })?;

        let len = file.metadata().await.map_err(StorageError::Io)?.len();
        if len != layout.total_length {
            return Err(StorageError::CorruptLayout {
                reason: format!(
                    "blob length {len} does not match layout length {}",
                    layout.total_length
                ),
            }
            .into());
        }

        Ok(Arc::new(OriginTorrent {
            digest,
            layout,
            file: tokio::sync::Mutex::new(file),
        }))
    }
}

/// Always-complete torrent served from the origin blob store.
pub struct OriginTorrent {
    digest: ContentDigest,
    layout: PieceLayout,
    file: tokio::sync::Mutex<File>,
}

#[async_trait]
impl Torrent for OriginTorrent {
    fn digest(&self) -> ContentDigest {
        self.digest
    }

    fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    fn bitfield(&self) -> Bitfield {
        Bitfield::full(self.layout.piece_count())
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        index.as_u32() < self.layout.piece_count()
    }

    fn is_complete(&self) -> bool {
        true
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        let size = self.layout.piece_size(index)?;
        let mut buf = vec![0u8; size as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_piece(&self, _index: PieceIndex, _data: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }
}

#[cfg(test)]
mod origin_archive_tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_and_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = OriginArchive::new(dir.path());

        let digest = archive.seed_blob(b"0123456789", 4).await.unwrap();
        assert_eq!(digest, ContentDigest::from_blob(b"0123456789"));

        let torrent = archive.open(digest).await.unwrap();
        assert!(torrent.is_complete());
        assert!(torrent.bitfield().is_all_set());
        assert_eq!(
            torrent.read_piece(PieceIndex::new(1)).await.unwrap(),
            Bytes::from_static(b"4567")
        );
        assert_eq!(
            torrent.read_piece(PieceIndex::new(2)).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn test_open_unknown_digest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = OriginArchive::new(dir.path());

        let digest = ContentDigest::from_blob(b"never seeded");
        assert!(matches!(
            archive.open(digest).await,
            Err(ArchiveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_origin_torrent_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = OriginArchive::new(dir.path());

        let digest = archive.seed_blob(b"readonly", 4).await.unwrap();
        let torrent = archive.open(digest).await.unwrap();

        assert!(matches!(
            torrent.write_piece(PieceIndex::new(0), b"read").await,
            Err(StorageError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_truncated_blob_detected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = OriginArchive::new(dir.path());

        let digest = archive.seed_blob(b"0123456789", 4).await.unwrap();
        fs::write(dir.path().join(digest.to_string()), b"0123")
            .await
            .unwrap();

        assert!(matches!(
            archive.open(digest).await,
            Err(ArchiveError::Storage(StorageError::CorruptLayout { .. }))
        ));
    }
}
