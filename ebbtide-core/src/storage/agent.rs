//! Disk-backed agent archive.
//!
//! Agents download content into a cache directory: one preallocated data
//! file per blob plus a JSON metainfo sidecar. Piece writes are flushed to
//! disk before the piece is reported complete, so a crash mid-write never
//! produces a falsely-complete piece. Reopening an existing data file
//! rebuilds the completion bitmap by re-hashing its contents.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{ArchiveError, PieceLayout, StorageError, Torrent, TorrentArchive};
use crate::swarm::{Bitfield, ContentDigest, PieceIndex};
use crate::tracker::{MetainfoClient, TrackerError};

/// Agent-role archive rooted at a cache directory.
///
/// Unknown digests are resolved by fetching their piece layout from the
/// metainfo client and creating an empty data file to download into.
pub struct AgentArchive {
    root: PathBuf,
    metainfo: Arc<dyn MetainfoClient>,
}

impl AgentArchive {
    /// Creates an archive over `root`, fetching unknown layouts via
    /// `metainfo`.
    pub fn new(root: impl Into<PathBuf>, metainfo: Arc<dyn MetainfoClient>) -> Self {
        Self {
            root: root.into(),
            metainfo,
        }
    }

    fn meta_path(&self, digest: ContentDigest) -> PathBuf {
        self.root.join(format!("{digest}.meta"))
    }

    fn data_path(&self, digest: ContentDigest) -> PathBuf {
        self.root.join(format!("{digest}.data"))
    }

    async fn load_or_fetch_layout(
        &self,
        digest: ContentDigest,
    ) -> Result<PieceLayout, ArchiveError> {
        let meta_path = self.meta_path(digest);
        if let Ok(bytes) = fs::read(&meta_path).await {
            let layout = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::CorruptLayout {
                    reason: format!("metainfo sidecar did not parse: {e}"),
                }
            })?;
            return Ok(layout);
        }

        let layout = self.metainfo.fetch(digest).await.map_err(|e| match e {
            TrackerError::NotFound { .. } => ArchiveError::NotFound { digest },
            other => ArchiveError::Metainfo(other),
        })?;

        write_atomic(&meta_path, &serde_json::to_vec(&layout).map_err(|e| {
            StorageError::CorruptLayout {
                reason: format!("metainfo did not serialize: {e}"),
            }
        })?)
        .await
        .map_err(StorageError::Io)?;

        Ok(layout)
    }
}

#[async_trait]
impl TorrentArchive for AgentArchive {
    async fn open(&self, digest: ContentDigest) -> Result<Arc<dyn Torrent>, ArchiveError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::Io)?;

        let layout = self.load_or_fetch_layout(digest).await?;
        let torrent = DiskTorrent::open(self.data_path(digest), digest, layout).await?;
        Ok(Arc::new(torrent))
    }
}

/// Writes a file through a temporary sibling and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

/// Torrent stored as one preallocated file on disk.
pub struct DiskTorrent {
    digest: ContentDigest,
    layout: PieceLayout,
    file: tokio::sync::Mutex<File>,
    completed: Mutex<Bitfield>,
}

impl DiskTorrent {
    /// Opens or creates the data file for a layout.
    ///
    /// A pre-existing file has its pieces re-hashed to rebuild the
    /// completion bitmap; pieces that no longer verify stay incomplete.
    pub async fn open(
        path: PathBuf,
        digest: ContentDigest,
        layout: PieceLayout,
    ) -> Result<Self, StorageError> {
        let existed = fs::metadata(&path).await.map(|m| m.len() > 0).unwrap_or(false);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        if file.metadata().await?.len() != layout.total_length {
            file.set_len(layout.total_length).await?;
        }

        let mut completed = Bitfield::new(layout.piece_count());
        if existed {
            for index in 0..layout.piece_count() {
                let index = PieceIndex::new(index);
                let data = read_piece_at(&mut file, &layout, index).await?;
                if layout.verify(index, &data) {
                    completed.set(index.as_u32());
                }
            }
        }

        Ok(Self {
            digest,
            layout,
            file: tokio::sync::Mutex::new(file),
            completed: Mutex::new(completed),
        })
    }
}

async fn read_piece_at(
    file: &mut File,
    layout: &PieceLayout,
    index: PieceIndex,
) -> Result<Vec<u8>, StorageError> {
    let size = layout.piece_size(index)?;
    let mut buf = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(layout.piece_offset(index))).await?;
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl Torrent for DiskTorrent {
    fn digest(&self) -> ContentDigest {
        self.digest
    }

    fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    fn bitfield(&self) -> Bitfield {
        self.completed.lock().clone()
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.completed.lock().has(index.as_u32())
    }

    fn is_complete(&self) -> bool {
        self.completed.lock().is_all_set()
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        if !self.has_piece(index) {
            return Err(StorageError::PieceNotFound { index });
        }
        let mut file = self.file.lock().await;
        let data = read_piece_at(&mut file, &self.layout, index).await?;
        Ok(Bytes::from(data))
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        if self.has_piece(index) {
            return Ok(());
        }
        let expected = self.layout.piece_size(index)?;
        if expected as usize != data.len() {
            return Err(StorageError::BadPieceLength {
                index,
                expected,
                actual: data.len(),
            });
        }

        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
                .await?;
            file.write_all(data).await?;
            file.sync_data().await?;
        }

        // Only after the bytes are durable does the piece become complete.
        self.completed.lock().set(index.as_u32());
        Ok(())
    }
}

#[cfg(test)]
mod disk_archive_tests {
    use super::*;
    use crate::swarm::SwarmError;

    struct StaticMetainfo {
        layout: PieceLayout,
        digest: ContentDigest,
    }

    #[async_trait]
    impl MetainfoClient for StaticMetainfo {
        async fn fetch(&self, digest: ContentDigest) -> Result<PieceLayout, TrackerError> {
            if digest == self.digest {
                Ok(self.layout.clone())
            } else {
                Err(TrackerError::NotFound { digest })
            }
        }
    }

    fn fixture(data: &[u8], piece_length: u32) -> (ContentDigest, Arc<dyn MetainfoClient>) {
        let digest = ContentDigest::from_blob(data);
        let client = StaticMetainfo {
            layout: PieceLayout::from_blob(data, piece_length),
            digest,
        };
        (digest, Arc::new(client))
    }

    #[tokio::test]
    async fn test_open_fetches_layout_and_creates_shell() {
        let dir = tempfile::tempdir().unwrap();
        let (digest, metainfo) = fixture(b"0123456789", 4);
        let archive = AgentArchive::new(dir.path(), metainfo);

        let torrent = archive.open(digest).await.unwrap();
        assert_eq!(torrent.digest(), digest);
        assert_eq!(torrent.layout().piece_count(), 3);
        assert!(!torrent.is_complete());

        // Sidecar was persisted, so a second open needs no metainfo fetch.
        assert!(dir.path().join(format!("{digest}.meta")).exists());
    }

    #[tokio::test]
    async fn test_unknown_digest_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = fixture(b"something", 4);
        let archive = AgentArchive::new(dir.path(), metainfo);

        let unknown = ContentDigest::from_blob(b"other");
        assert!(matches!(
            archive.open(unknown).await,
            Err(ArchiveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_written_pieces_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let (digest, metainfo) = fixture(data, 4);
        let archive = AgentArchive::new(dir.path(), metainfo);

        {
            let torrent = archive.open(digest).await.unwrap();
            torrent.write_piece(PieceIndex::new(0), b"0123").await.unwrap();
            torrent.write_piece(PieceIndex::new(2), b"89").await.unwrap();
        }

        let reopened = archive.open(digest).await.unwrap();
        assert!(reopened.has_piece(PieceIndex::new(0)));
        assert!(!reopened.has_piece(PieceIndex::new(1)));
        assert!(reopened.has_piece(PieceIndex::new(2)));
        assert_eq!(
            reopened.read_piece(PieceIndex::new(2)).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn test_write_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (digest, metainfo) = fixture(b"0123456789", 4);
        let archive = AgentArchive::new(dir.path(), metainfo);
        let torrent = archive.open(digest).await.unwrap();

        let result = torrent.write_piece(PieceIndex::new(0), b"012").await;
        assert!(matches!(result, Err(StorageError::BadPieceLength { .. })));
        assert!(!torrent.has_piece(PieceIndex::new(0)));

        // StorageError converts into the swarm taxonomy for callers.
        let _: SwarmError = result.unwrap_err().into();
    }
}
