//! Shared fixtures for swarm tests: in-memory torrents wired to dispatchers
//! and a channel-backed transport with scriptable remote peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use super::announce_queue::{AnnounceQueue, BackoffPolicy};
use super::dispatcher::{DispatcherHandle, DispatcherParams, spawn_dispatcher};
use super::peer_set::ConnectionBudget;
use super::protocol::{Handshake, PeerLink, PeerMessage, Transport};
use super::{ContentDigest, PeerId, SwarmError};
use crate::config::EbbtideConfig;
use crate::storage::{MemoryTorrent, PieceLayout, Torrent};
use crate::tracker::{AnnounceClient, AnnounceResponse, PeerContext, TrackerError};

pub(crate) fn seeder_layout(data: &[u8], piece_length: u32) -> PieceLayout {
    PieceLayout::from_blob(data, piece_length)
}

/// Receives the next message on a link, failing the test on close or stall.
pub(crate) async fn recv_message(link: &mut PeerLink) -> PeerMessage {
    tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .expect("timed out waiting for peer message")
        .expect("link closed while waiting for peer message")
}

/// One in-memory torrent plus everything needed to spawn its dispatcher.
pub(crate) struct TestSwarm {
    pub digest: ContentDigest,
    pub torrent: Arc<MemoryTorrent>,
    pub config: EbbtideConfig,
    pub queue: Arc<AnnounceQueue>,
    pub transport: Arc<dyn Transport>,
    pub peer_id: PeerId,
    exited_tx: mpsc::UnboundedSender<ContentDigest>,
    exited_rx: Mutex<mpsc::UnboundedReceiver<ContentDigest>>,
    // Held so dispatcher config watches stay live for the test's duration.
    config_senders: Mutex<Vec<watch::Sender<EbbtideConfig>>>,
}

impl TestSwarm {
    pub fn seeded(data: &[u8], piece_length: u32) -> Self {
        Self::with_torrent(MemoryTorrent::seeded(data, piece_length))
    }

    pub fn shell(data: &[u8], piece_length: u32) -> Self {
        let digest = ContentDigest::from_blob(data);
        let layout = seeder_layout(data, piece_length);
        Self::with_torrent(MemoryTorrent::shell(digest, layout))
    }

    fn with_torrent(torrent: Arc<MemoryTorrent>) -> Self {
        let config = EbbtideConfig::for_testing();
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        Self {
            digest: torrent.digest(),
            torrent,
            queue: Arc::new(AnnounceQueue::new(BackoffPolicy {
                base: config.announce.backoff_base,
                max: config.announce.backoff_max,
                jitter: 0.0,
            })),
            config,
            transport: Arc::new(ChannelTransport::new()),
            peer_id: PeerId::generate(),
            exited_tx,
            exited_rx: Mutex::new(exited_rx),
            config_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn(&self) -> (DispatcherHandle, JoinHandle<()>) {
        let (config_tx, config_rx) = watch::channel(self.config.clone());
        self.config_senders.lock().push(config_tx);
        spawn_dispatcher(DispatcherParams {
            digest: self.digest,
            torrent: self.torrent.clone() as Arc<dyn Torrent>,
            config: config_rx,
            budget: ConnectionBudget::new(self.config.connection.max_open_connections),
            announce_queue: self.queue.clone(),
            transport: self.transport.clone(),
            io_permits: Arc::new(Semaphore::new(self.config.storage.io_workers)),
            peer_id: self.peer_id,
            exited: self.exited_tx.clone(),
        })
    }

    /// Connects a fake remote peer and returns its end of the link.
    pub async fn connect(&self, handle: &DispatcherHandle) -> Result<PeerLink, SwarmError> {
        let remote_id = PeerId::generate();
        let (dispatcher_end, remote_end) = PeerLink::pair(self.peer_id, remote_id, 64);
        handle.connect(dispatcher_end).await?;
        Ok(remote_end)
    }

    /// Digests reported through the exit channel so far.
    pub fn exited_digests(&self) -> Vec<ContentDigest> {
        let mut rx = self.exited_rx.lock();
        let mut digests = Vec::new();
        while let Ok(digest) = rx.try_recv() {
            digests.push(digest);
        }
        digests
    }
}

/// Transport over in-process channels.
///
/// Tests register listeners per address; dialing an unregistered address is
/// refused like a dead host would be.
pub(crate) struct ChannelTransport {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(Handshake, PeerLink)>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a listener; dials to `addr` arrive on the returned channel.
    pub fn listen(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<(Handshake, PeerLink)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(addr, tx);
        rx
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn dial(&self, addr: SocketAddr, handshake: Handshake) -> Result<PeerLink, SwarmError> {
        let listener = self.listeners.lock().get(&addr).cloned();
        let Some(listener) = listener else {
            return Err(SwarmError::PeerProtocolViolation {
                peer: handshake.peer_id,
                reason: format!("connection refused: {addr}"),
            });
        };
        let remote_id = PeerId::generate();
        let (dialer_end, listener_end) = PeerLink::pair(handshake.peer_id, remote_id, 64);
        listener
            .send((handshake, listener_end))
            .map_err(|_| SwarmError::PeerProtocolViolation {
                peer: handshake.peer_id,
                reason: format!("listener gone: {addr}"),
            })?;
        Ok(dialer_end)
    }
}

/// Announce client with a fixed peer list and optional injected failures.
pub(crate) struct ScriptedTracker {
    peers: Vec<SocketAddr>,
    failures_before_success: AtomicU32,
    pub announces: AtomicU32,
}

impl ScriptedTracker {
    pub fn quiet() -> Self {
        Self::with_peers(Vec::new())
    }

    pub fn with_peers(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            failures_before_success: AtomicU32::new(0),
            announces: AtomicU32::new(0),
        }
    }

    /// Fails the first `count` announces, then succeeds.
    pub fn failing(count: u32) -> Self {
        Self {
            peers: Vec::new(),
            failures_before_success: AtomicU32::new(count),
            announces: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AnnounceClient for ScriptedTracker {
    async fn announce(
        &self,
        _digest: ContentDigest,
        _local: &PeerContext,
        _complete: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.announces.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrackerError::ConnectionFailed {
                url: "scripted".to_string(),
            });
        }
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Some(Duration::from_millis(50)),
        })
    }
}

/// Runs a scripted seeder behind a transport listener.
///
/// Every accepted connection advertises the full bitfield and serves piece
/// requests from `data` until the dialer hangs up.
pub(crate) fn spawn_seeder(
    mut accepts: mpsc::UnboundedReceiver<(Handshake, PeerLink)>,
    data: Vec<u8>,
    piece_length: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((_handshake, link)) = accepts.recv().await {
            let data = data.clone();
            tokio::spawn(serve_peer(link, data, piece_length));
        }
    })
}

async fn serve_peer(mut link: PeerLink, data: Vec<u8>, piece_length: u32) {
    let layout = seeder_layout(&data, piece_length);
    if link
        .outbound
        .send(PeerMessage::Bitfield(super::Bitfield::full(
            layout.piece_count(),
        )))
        .await
        .is_err()
    {
        return;
    }
    while let Some(message) = link.inbound.recv().await {
        if let PeerMessage::Request(index) = message {
            let start = index.as_u32() as u64 * u64::from(piece_length);
            let size = match layout.piece_size(index) {
                Ok(size) => size,
                Err(_) => continue,
            };
            let end = start + u64::from(size);
            let payload = Bytes::copy_from_slice(&data[start as usize..end as usize]);
            if link
                .outbound
                .send(PeerMessage::Piece {
                    index,
                    data: payload,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
