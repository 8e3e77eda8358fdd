//! Per-torrent dispatcher actor.
//!
//! Each torrent gets one dispatcher task that owns every piece of mutable
//! swarm state for that torrent: the peer set, the in-flight request table,
//! upload queues, and penalties. All peer traffic, storage completions, and
//! control calls funnel through one event queue and are processed in order,
//! so there is no locking anywhere in the hot path. Storage I/O and outbound
//! dials run in spawned tasks and report back as events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::announce_queue::AnnounceQueue;
use super::connection::Connection;
use super::events::{DispatcherEvent, TorrentState, TorrentStatus};
use super::peer_set::{ConnectionBudget, PeerSet};
use super::protocol::{Handshake, PeerLink, PeerMessage, Transport};
use super::{ContentDigest, PeerId, PieceIndex, SwarmError};
use crate::config::EbbtideConfig;
use crate::storage::{StorageError, Torrent};

/// Everything a dispatcher needs at spawn time.
pub(crate) struct DispatcherParams {
    pub digest: ContentDigest,
    pub torrent: Arc<dyn Torrent>,
    pub config: watch::Receiver<EbbtideConfig>,
    pub budget: ConnectionBudget,
    pub announce_queue: Arc<AnnounceQueue>,
    pub transport: Arc<dyn Transport>,
    pub io_permits: Arc<Semaphore>,
    pub peer_id: PeerId,
    /// Reaper channel: the dispatcher reports its digest here on exit.
    pub exited: mpsc::UnboundedSender<ContentDigest>,
}

/// Spawns a dispatcher task for one torrent.
pub(crate) fn spawn_dispatcher(params: DispatcherParams) -> (DispatcherHandle, JoinHandle<()>) {
    let capacity = params.config.borrow().dispatch.event_queue_capacity;
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let handle = DispatcherHandle {
        digest: params.digest,
        events: events_tx.clone(),
    };

    let dispatcher = Dispatcher::new(params, events_tx);
    let join = tokio::spawn(async move {
        run_dispatcher_loop(dispatcher, events_rx).await;
    });

    (handle, join)
}

/// Handle for sending events to a torrent's dispatcher.
///
/// Cloneable; the dispatcher exits once every handle and pump task is gone
/// or a shutdown event arrives.
#[derive(Clone)]
pub struct DispatcherHandle {
    digest: ContentDigest,
    events: mpsc::Sender<DispatcherEvent>,
}

impl DispatcherHandle {
    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    /// Hands a handshaked connection to the dispatcher.
    ///
    /// # Errors
    /// - `SwarmError::CapacityExceeded` - Torrent or process connection
    ///   limit reached
    /// - `SwarmError::UnknownTorrent` - Dispatcher already exited
    pub async fn connect(&self, link: PeerLink) -> Result<(), SwarmError> {
        let (responder, rx) = oneshot::channel();
        self.events
            .send(DispatcherEvent::Connected { link, responder })
            .await
            .map_err(|_| SwarmError::UnknownTorrent {
                digest: self.digest,
            })?;
        rx.await.map_err(|_| SwarmError::UnknownTorrent {
            digest: self.digest,
        })?
    }

    /// Delivers tracker-discovered peer addresses.
    pub async fn notify_peers(&self, addrs: Vec<SocketAddr>) {
        let _ = self
            .events
            .send(DispatcherEvent::PeersDiscovered { addrs })
            .await;
    }

    /// Requests a status snapshot.
    ///
    /// # Errors
    /// - `SwarmError::UnknownTorrent` - Dispatcher already exited
    pub async fn status(&self) -> Result<TorrentStatus, SwarmError> {
        let (responder, rx) = oneshot::channel();
        self.events
            .send(DispatcherEvent::Status { responder })
            .await
            .map_err(|_| SwarmError::UnknownTorrent {
                digest: self.digest,
            })?;
        rx.await.map_err(|_| SwarmError::UnknownTorrent {
            digest: self.digest,
        })
    }

    /// True once the dispatcher's event queue is gone.
    ///
    /// The queue is closed before the exit report is sent, so a reaper that
    /// sees the report can trust this to identify the exited instance.
    pub(crate) fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Asks the dispatcher to tear down and waits for it to acknowledge.
    pub async fn shutdown(&self) {
        let (responder, rx) = oneshot::channel();
        if self
            .events
            .send(DispatcherEvent::Shutdown { responder })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// One outstanding piece request.
struct Inflight {
    peer: PeerId,
    deadline: Instant,
    /// Data received and handed to a storage worker; no longer retriable.
    writing: bool,
}

struct Dispatcher {
    digest: ContentDigest,
    torrent: Arc<dyn Torrent>,
    cfg: EbbtideConfig,
    config_rx: watch::Receiver<EbbtideConfig>,
    announce_queue: Arc<AnnounceQueue>,
    transport: Arc<dyn Transport>,
    io_permits: Arc<Semaphore>,
    peer_id: PeerId,
    events_tx: mpsc::Sender<DispatcherEvent>,
    exited: mpsc::UnboundedSender<ContentDigest>,

    state: TorrentState,
    peers: PeerSet,
    next_link_id: u64,
    local_pieces: super::Bitfield,
    inflight: HashMap<PieceIndex, Inflight>,
    penalties: HashMap<PeerId, Instant>,
    dialing: HashSet<SocketAddr>,
    upload_queues: HashMap<PeerId, VecDeque<PieceIndex>>,
    upload_order: VecDeque<PeerId>,
    active_uploads: usize,
    /// Set while seeding with no peers; drives the linger teardown.
    idle_since: Option<Instant>,
    total_downloaded: u64,
    total_uploaded: u64,
}

impl Dispatcher {
    fn new(params: DispatcherParams, events_tx: mpsc::Sender<DispatcherEvent>) -> Self {
        let cfg = params.config.borrow().clone();
        let local_pieces = params.torrent.bitfield();
        let state = if params.torrent.is_complete() {
            TorrentState::Seeding
        } else {
            TorrentState::Initializing
        };
        let peers = PeerSet::new(
            params.digest,
            cfg.connection.max_peers_per_torrent,
            params.budget,
        );

        Self {
            digest: params.digest,
            torrent: params.torrent,
            cfg,
            config_rx: params.config,
            announce_queue: params.announce_queue,
            transport: params.transport,
            io_permits: params.io_permits,
            peer_id: params.peer_id,
            events_tx,
            exited: params.exited,
            state,
            peers,
            next_link_id: 0,
            local_pieces,
            inflight: HashMap::new(),
            penalties: HashMap::new(),
            dialing: HashSet::new(),
            upload_queues: HashMap::new(),
            upload_order: VecDeque::new(),
            active_uploads: 0,
            idle_since: None,
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }
}

async fn run_dispatcher_loop(
    mut dispatcher: Dispatcher,
    mut events: mpsc::Receiver<DispatcherEvent>,
) {
    debug!(digest = %dispatcher.digest, state = %dispatcher.state, "dispatcher started");
    dispatcher
        .announce_queue
        .push(dispatcher.digest, Duration::ZERO);

    let mut tick = tokio::time::interval(dispatcher.cfg.dispatch.tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut config_live = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if !dispatcher.handle_event(event) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if !dispatcher.tick() {
                    break;
                }
            }
            changed = dispatcher.config_rx.changed(), if config_live => {
                match changed {
                    Ok(()) => dispatcher.apply_config(),
                    // Config source gone; keep running on the last snapshot.
                    Err(_) => config_live = false,
                }
            }
        }
    }

    // Close the event queue first so the exit report in teardown cannot be
    // observed while this instance's handles still look alive.
    drop(events);
    dispatcher.teardown();
}

impl Dispatcher {
    /// Processes one event. Returns false to exit the loop.
    fn handle_event(&mut self, event: DispatcherEvent) -> bool {
        match event {
            DispatcherEvent::Connected { link, responder } => {
                let result = self.admit(link);
                let _ = responder.send(result);
            }
            DispatcherEvent::PeerMessage {
                peer,
                link_id,
                message,
            } => {
                self.on_peer_message(peer, link_id, message);
            }
            DispatcherEvent::PeerClosed { peer, link_id } => {
                let current = self
                    .peers
                    .get_mut(peer)
                    .is_some_and(|conn| conn.link_id() == link_id);
                if current {
                    debug!(digest = %self.digest, %peer, "peer disconnected");
                    self.drop_peer(peer);
                    self.schedule_requests();
                }
            }
            DispatcherEvent::PeersDiscovered { addrs } => {
                self.on_peers_discovered(addrs);
            }
            DispatcherEvent::DialFinished { addr } => {
                self.dialing.remove(&addr);
            }
            DispatcherEvent::PieceRead {
                peer,
                index,
                result,
            } => {
                self.on_piece_read(peer, index, result);
            }
            DispatcherEvent::PieceWritten {
                peer,
                index,
                result,
            } => {
                self.on_piece_written(peer, index, result);
            }
            DispatcherEvent::Status { responder } => {
                let _ = responder.send(self.status());
            }
            DispatcherEvent::Shutdown { responder } => {
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    /// Admits a handshaked connection and starts pumping its inbound stream.
    fn admit(&mut self, link: PeerLink) -> Result<(), SwarmError> {
        let peer = link.peer_id;
        let piece_count = self.torrent.layout().piece_count();
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        self.peers
            .insert(Connection::new(peer, link_id, link.outbound, piece_count))?;
        debug!(digest = %self.digest, %peer, "peer connected");

        if self.state == TorrentState::Initializing {
            self.state = TorrentState::Downloading;
        }

        let advertised = self
            .peers
            .get_mut(peer)
            .is_some_and(|conn| conn.try_send(PeerMessage::Bitfield(self.local_pieces.clone())));
        if !advertised {
            // Admitted and immediately lost; the link closes on drop.
            self.drop_peer(peer);
            return Ok(());
        }

        let events = self.events_tx.clone();
        let mut inbound = link.inbound;
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if events
                    .send(DispatcherEvent::PeerMessage {
                        peer,
                        link_id,
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = events
                .send(DispatcherEvent::PeerClosed { peer, link_id })
                .await;
        });

        self.schedule_requests();
        Ok(())
    }

    fn on_peer_message(&mut self, peer: PeerId, link_id: u64, message: PeerMessage) {
        // Stale traffic from a dropped or replaced link.
        let current = self
            .peers
            .get_mut(peer)
            .is_some_and(|conn| conn.link_id() == link_id);
        if !current {
            return;
        }
        match message {
            PeerMessage::Bitfield(remote) => {
                if remote.len() != self.torrent.layout().piece_count() {
                    self.drop_violator(peer, "bitfield length does not match layout");
                    return;
                }
                if let Some(conn) = self.peers.get_mut(peer) {
                    conn.remote_pieces = remote;
                    conn.touch();
                }
                self.schedule_requests();
            }
            PeerMessage::Have(index) => {
                if index.as_u32() >= self.torrent.layout().piece_count() {
                    self.drop_violator(peer, "have index out of bounds");
                    return;
                }
                if let Some(conn) = self.peers.get_mut(peer) {
                    conn.remote_pieces.set(index.as_u32());
                    conn.touch();
                }
                self.schedule_requests();
            }
            PeerMessage::Request(index) => {
                self.on_request(peer, index);
            }
            PeerMessage::Piece { index, data } => {
                self.on_piece(peer, index, data);
            }
            PeerMessage::Reject(index) => {
                if let Some(conn) = self.peers.get_mut(peer) {
                    conn.touch();
                }
                let ours = self
                    .inflight
                    .get(&index)
                    .is_some_and(|f| f.peer == peer && !f.writing);
                if ours {
                    self.inflight.remove(&index);
                    if let Some(conn) = self.peers.get_mut(peer) {
                        conn.outstanding_requests = conn.outstanding_requests.saturating_sub(1);
                    }
                    self.schedule_requests();
                }
            }
        }
    }

    fn on_request(&mut self, peer: PeerId, index: PieceIndex) {
        if index.as_u32() >= self.torrent.layout().piece_count() {
            self.drop_violator(peer, "request index out of bounds");
            return;
        }
        let Some(conn) = self.peers.get_mut(peer) else {
            return;
        };
        conn.touch();

        if !self.local_pieces.has(index.as_u32()) {
            if !conn.try_send(PeerMessage::Reject(index)) {
                self.drop_peer(peer);
            }
            return;
        }

        // A peer only gets a bounded number of requests queued at once; the
        // rest bounce so a request flood cannot grow the queue without limit.
        let queued = self.upload_queues.get(&peer).map_or(0, VecDeque::len);
        if queued >= self.cfg.connection.max_requests_per_peer {
            if !conn.try_send(PeerMessage::Reject(index)) {
                self.drop_peer(peer);
            }
            return;
        }

        self.upload_queues.entry(peer).or_default().push_back(index);
        if !self.upload_order.contains(&peer) {
            self.upload_order.push_back(peer);
        }
        self.pump_uploads();
    }

    /// Starts queued piece reads, rotating between requesting peers so one
    /// greedy peer cannot monopolize the upload slots.
    fn pump_uploads(&mut self) {
        while self.active_uploads < self.cfg.connection.max_concurrent_uploads {
            let Some(peer) = self.upload_order.pop_front() else {
                return;
            };
            if !self.peers.contains(peer) {
                self.upload_queues.remove(&peer);
                continue;
            }
            let Some(queue) = self.upload_queues.get_mut(&peer) else {
                continue;
            };
            let Some(index) = queue.pop_front() else {
                self.upload_queues.remove(&peer);
                continue;
            };
            if queue.is_empty() {
                self.upload_queues.remove(&peer);
            } else {
                self.upload_order.push_back(peer);
            }

            self.active_uploads += 1;
            let torrent = self.torrent.clone();
            let permits = self.io_permits.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = torrent.read_piece(index).await;
                let _ = events
                    .send(DispatcherEvent::PieceRead {
                        peer,
                        index,
                        result,
                    })
                    .await;
            });
        }
    }

    fn on_piece_read(
        &mut self,
        peer: PeerId,
        index: PieceIndex,
        result: Result<Bytes, StorageError>,
    ) {
        self.active_uploads = self.active_uploads.saturating_sub(1);
        let mut lost_link = false;
        if let Some(conn) = self.peers.get_mut(peer) {
            match result {
                Ok(data) => {
                    let len = data.len() as u64;
                    if conn.try_send(PeerMessage::Piece { index, data }) {
                        conn.bytes_uploaded += len;
                        self.total_uploaded += len;
                    } else {
                        lost_link = true;
                    }
                }
                Err(error) => {
                    warn!(digest = %self.digest, %index, %error, "piece read failed, rejecting");
                    if !conn.try_send(PeerMessage::Reject(index)) {
                        lost_link = true;
                    }
                }
            }
        }
        if lost_link {
            self.drop_peer(peer);
        }
        self.pump_uploads();
    }

    fn on_piece(&mut self, peer: PeerId, index: PieceIndex, data: Bytes) {
        if let Some(conn) = self.peers.get_mut(peer) {
            conn.touch();
        }
        // Unsolicited, stale, or already persisting: ignore.
        let ours = self
            .inflight
            .get(&index)
            .is_some_and(|f| f.peer == peer && !f.writing);
        if !ours {
            return;
        }

        if !self.torrent.layout().verify(index, &data) {
            warn!(digest = %self.digest, %peer, %index, "piece failed verification");
            self.inflight.remove(&index);
            self.record_peer_failure(peer);
            self.schedule_requests();
            return;
        }

        if let Some(entry) = self.inflight.get_mut(&index) {
            entry.writing = true;
        }
        let torrent = self.torrent.clone();
        let permits = self.io_permits.clone();
        let events = self.events_tx.clone();
        let retries = self.cfg.storage.write_retries.max(1);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let mut result = torrent.write_piece(index, &data).await;
            let mut attempt = 1;
            while result.is_err() && attempt < retries {
                result = torrent.write_piece(index, &data).await;
                attempt += 1;
            }
            let _ = events
                .send(DispatcherEvent::PieceWritten {
                    peer,
                    index,
                    result,
                })
                .await;
        });
    }

    fn on_piece_written(
        &mut self,
        peer: PeerId,
        index: PieceIndex,
        result: Result<(), StorageError>,
    ) {
        self.inflight.remove(&index);
        if let Some(conn) = self.peers.get_mut(peer) {
            conn.outstanding_requests = conn.outstanding_requests.saturating_sub(1);
        }

        match result {
            Ok(()) => {
                let size = u64::from(self.torrent.layout().piece_size(index).unwrap_or(0));
                if let Some(conn) = self.peers.get_mut(peer) {
                    conn.bytes_downloaded += size;
                }
                if self.local_pieces.set(index.as_u32()) {
                    self.total_downloaded += size;
                    let removed = self.peers.broadcast(&PeerMessage::Have(index));
                    for peer in removed {
                        self.cleanup_after_peer(peer);
                    }
                    if self.local_pieces.is_all_set() {
                        info!(digest = %self.digest, "download complete, seeding");
                        self.state = TorrentState::Seeding;
                        // Report completion to the tracker right away.
                        self.announce_queue.push(self.digest, Duration::ZERO);
                    }
                }
            }
            Err(error) => {
                // The piece stays missing and gets re-requested.
                warn!(digest = %self.digest, %index, %error, "piece write failed");
            }
        }
        self.schedule_requests();
    }

    fn on_peers_discovered(&mut self, addrs: Vec<SocketAddr>) {
        if self.state == TorrentState::Initializing {
            self.state = TorrentState::Downloading;
        }
        let want = self
            .cfg
            .dispatch
            .peer_target
            .saturating_sub(self.peers.len() + self.dialing.len());
        for addr in addrs.into_iter().take(want) {
            if !self.dialing.insert(addr) {
                continue;
            }
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let handshake = Handshake {
                digest: self.digest,
                peer_id: self.peer_id,
            };
            tokio::spawn(async move {
                match transport.dial(addr, handshake).await {
                    Ok(link) => {
                        let (responder, rx) = oneshot::channel();
                        if events
                            .send(DispatcherEvent::Connected { link, responder })
                            .await
                            .is_ok()
                        {
                            if let Ok(Err(error)) = rx.await {
                                debug!(%addr, %error, "dialed peer not admitted");
                            }
                        }
                    }
                    Err(error) => {
                        debug!(%addr, %error, "dial failed");
                    }
                }
                let _ = events.send(DispatcherEvent::DialFinished { addr }).await;
            });
        }
    }

    /// Issues piece requests, rarest piece first.
    ///
    /// Availability counts how many connected peers advertise a piece; ties
    /// break toward the lower index. Penalized peers and peers at their
    /// request window are skipped.
    fn schedule_requests(&mut self) {
        if self.local_pieces.is_all_set() || self.peers.is_empty() {
            return;
        }
        let now = Instant::now();
        let max_per_peer = self.cfg.connection.max_requests_per_peer;

        let mut wanted: Vec<(usize, u32)> = self
            .local_pieces
            .missing()
            .filter(|index| !self.inflight.contains_key(&PieceIndex::new(*index)))
            .map(|index| (self.peers.peers_with_piece(index).len(), index))
            .filter(|(availability, _)| *availability > 0)
            .collect();
        wanted.sort_unstable();

        let mut lost_links = Vec::new();
        for (_, index) in wanted {
            let piece = PieceIndex::new(index);
            let holder = self.least_loaded_holder(index, max_per_peer, now);
            let Some(peer) = holder else { continue };

            let sent = self
                .peers
                .get_mut(peer)
                .is_some_and(|conn| conn.try_send(PeerMessage::Request(piece)));
            if sent {
                if let Some(conn) = self.peers.get_mut(peer) {
                    conn.outstanding_requests += 1;
                }
                self.inflight.insert(
                    piece,
                    Inflight {
                        peer,
                        deadline: now + self.cfg.connection.request_timeout,
                        writing: false,
                    },
                );
            } else {
                lost_links.push(peer);
            }
        }
        for peer in lost_links {
            self.drop_peer(peer);
        }
    }

    fn least_loaded_holder(&self, index: u32, max_per_peer: usize, now: Instant) -> Option<PeerId> {
        let mut best: Option<(usize, PeerId)> = None;
        for conn in self.peers.iter() {
            if !conn.remote_pieces.has(index) {
                continue;
            }
            if conn.outstanding_requests >= max_per_peer {
                continue;
            }
            let peer = conn.peer_id();
            if self.penalties.get(&peer).is_some_and(|until| *until > now) {
                continue;
            }
            let load = conn.outstanding_requests;
            if best.is_none_or(|(b, _)| load < b) {
                best = Some((load, peer));
            }
        }
        best.map(|(_, peer)| peer)
    }

    /// Counts a failure against a peer and starts its cooldown when it
    /// crosses the threshold.
    fn record_peer_failure(&mut self, peer: PeerId) {
        let threshold = self.cfg.connection.piece_failure_threshold;
        let cooldown = self.cfg.connection.peer_cooldown;
        if let Some(conn) = self.peers.get_mut(peer) {
            conn.outstanding_requests = conn.outstanding_requests.saturating_sub(1);
            conn.failures += 1;
            if conn.failures >= threshold {
                conn.failures = 0;
                warn!(digest = %self.digest, %peer, "peer penalized after repeated failures");
                self.penalties.insert(peer, Instant::now() + cooldown);
            }
        }
    }

    fn drop_violator(&mut self, peer: PeerId, reason: &str) {
        warn!(digest = %self.digest, %peer, reason, "protocol violation, dropping peer");
        self.drop_peer(peer);
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if self.peers.remove(peer).is_some() {
            self.cleanup_after_peer(peer);
        }
    }

    /// Releases state tied to a departed peer. Requests already handed to a
    /// storage worker keep their data and finish normally.
    fn cleanup_after_peer(&mut self, peer: PeerId) {
        self.inflight
            .retain(|_, entry| entry.writing || entry.peer != peer);
        self.upload_queues.remove(&peer);
        self.upload_order.retain(|p| *p != peer);
    }

    fn apply_config(&mut self) {
        self.cfg = self.config_rx.borrow_and_update().clone();
        self.peers
            .set_capacity(self.cfg.connection.max_peers_per_torrent);
        debug!(digest = %self.digest, "dispatcher config reloaded");
    }

    /// Periodic maintenance. Returns false when the seeder linger window
    /// expires and the dispatcher should tear down.
    fn tick(&mut self) -> bool {
        let now = Instant::now();

        let idle_timeout = self.cfg.connection.idle_timeout;
        let idle: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|conn| now.duration_since(conn.last_active) > idle_timeout)
            .map(Connection::peer_id)
            .collect();
        for peer in idle {
            debug!(digest = %self.digest, %peer, "evicting idle peer");
            self.drop_peer(peer);
        }

        let expired: Vec<(PieceIndex, PeerId)> = self
            .inflight
            .iter()
            .filter(|(_, entry)| !entry.writing && entry.deadline <= now)
            .map(|(index, entry)| (*index, entry.peer))
            .collect();
        for (index, peer) in expired {
            debug!(digest = %self.digest, %peer, %index, "request timed out");
            self.inflight.remove(&index);
            self.record_peer_failure(peer);
        }

        self.penalties.retain(|_, until| *until > now);

        let hungry = self.state == TorrentState::Downloading
            && self.peers.len() < self.cfg.dispatch.peer_target;
        if hungry && !self.announce_queue.contains(self.digest) {
            self.announce_queue.push(self.digest, Duration::ZERO);
        }

        if self.state == TorrentState::Seeding && self.peers.is_empty() {
            if let Some(linger) = self.cfg.dispatch.seeder_linger {
                match self.idle_since {
                    None => self.idle_since = Some(now),
                    Some(since) if now.duration_since(since) >= linger => {
                        info!(digest = %self.digest, "seeder idle, closing");
                        return false;
                    }
                    Some(_) => {}
                }
            }
        } else {
            self.idle_since = None;
        }

        self.schedule_requests();
        true
    }

    fn status(&self) -> TorrentStatus {
        let piece_count = self.torrent.layout().piece_count();
        TorrentStatus {
            digest: self.digest,
            state: self.state,
            peer_count: self.peers.len(),
            piece_count,
            completed_pieces: self.local_pieces.count_set(),
            progress: self.local_pieces.progress(),
            bytes_downloaded: self.total_downloaded,
            bytes_uploaded: self.total_uploaded,
        }
    }

    fn teardown(&mut self) {
        self.state = TorrentState::Closed;
        self.announce_queue.remove(self.digest);
        // Dropping the connections closes every link.
        self.peers.clear();
        let _ = self.exited.send(self.digest);
        debug!(digest = %self.digest, "dispatcher stopped");
    }
}
