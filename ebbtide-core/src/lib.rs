//! Ebbtide Core - Peer-to-peer content distribution for machine fleets
//!
//! This crate provides the swarm engine behind Ebbtide: per-torrent
//! dispatchers, tracker announce scheduling, the agent and origin archive
//! roles, and the configuration surface that ties a deployment together.

pub mod config;
pub mod storage;
pub mod swarm;
pub mod tracing_setup;
pub mod tracker;

// Re-export main types for convenient access
pub use config::EbbtideConfig;
pub use storage::{ArchiveError, StorageError, Torrent, TorrentArchive};
pub use swarm::{
    ContentDigest, PeerId, PieceIndex, ReloadableScheduler, Scheduler, SwarmError, TorrentState,
    TorrentStatus,
};
pub use tracker::{AnnounceClient, MetainfoClient, TrackerError};

pub type Result<T> = std::result::Result<T, SwarmError>;
