//! Process-wide scheduler: dispatcher registry, announce workers, and the
//! agent/origin role constructors.
//!
//! The scheduler owns one dispatcher per active torrent plus a pool of
//! announce workers draining the shared [`AnnounceQueue`]. Configuration is
//! distributed through a watch channel so a running fleet can be retuned
//! without restarting; [`ReloadableScheduler`] exposes the reload surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::announce_queue::{AnnounceQueue, BackoffPolicy};
use super::dispatcher::{DispatcherHandle, DispatcherParams, spawn_dispatcher};
use super::events::{TorrentState, TorrentStatus};
use super::peer_set::ConnectionBudget;
use super::protocol::{PeerLink, Transport};
use super::{ContentDigest, SwarmError};
use crate::config::{AnnounceConfig, EbbtideConfig};
use crate::storage::{AgentArchive, ArchiveError, OriginArchive, TorrentArchive};
use crate::tracker::{
    AnnounceClient, DisabledAnnounceClient, HttpAnnounceClient, HttpMetainfoClient, PeerContext,
};

fn backoff_policy(config: &AnnounceConfig) -> BackoffPolicy {
    BackoffPolicy {
        base: config.backoff_base,
        max: config.backoff_max,
        jitter: config.backoff_jitter,
    }
}

struct DispatcherEntry {
    handle: DispatcherHandle,
    join: JoinHandle<()>,
}

/// Coordinates every active torrent in the process.
pub struct Scheduler {
    context: PeerContext,
    archive: Arc<dyn TorrentArchive>,
    announce_client: Arc<dyn AnnounceClient>,
    announce_queue: Arc<AnnounceQueue>,
    transport: Arc<dyn Transport>,
    config_tx: watch::Sender<EbbtideConfig>,
    budget: ConnectionBudget,
    io_permits: Arc<Semaphore>,
    registry: Mutex<HashMap<ContentDigest, DispatcherEntry>>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exited_tx: mpsc::UnboundedSender<ContentDigest>,
}

impl Scheduler {
    /// Creates a scheduler and starts its announce workers and reaper.
    pub fn new(
        config: EbbtideConfig,
        archive: Arc<dyn TorrentArchive>,
        announce_client: Arc<dyn AnnounceClient>,
        announce_queue: AnnounceQueue,
        transport: Arc<dyn Transport>,
        public_addr: SocketAddr,
    ) -> Arc<Self> {
        let budget = ConnectionBudget::new(config.connection.max_open_connections);
        let io_permits = Arc::new(Semaphore::new(config.storage.io_workers));
        let worker_count = config.announce.workers.max(1);
        let (config_tx, _) = watch::channel(config);
        let (shutdown_tx, _) = watch::channel(false);
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(Self {
            context: PeerContext::new(public_addr),
            archive,
            announce_client,
            announce_queue: Arc::new(announce_queue),
            transport,
            config_tx,
            budget,
            io_permits,
            registry: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            exited_tx,
        });

        {
            let mut workers = scheduler.workers.lock();
            for worker in 0..worker_count {
                let scheduler = scheduler.clone();
                workers.push(tokio::spawn(async move {
                    scheduler.run_announce_worker(worker).await;
                }));
            }
            let reaper = scheduler.clone();
            workers.push(tokio::spawn(async move {
                reaper.run_reaper(exited_rx).await;
            }));
        }

        scheduler
    }

    /// Builds the agent role: disk cache plus HTTP tracker clients.
    ///
    /// # Errors
    /// - `SwarmError::Announce` - Tracker base URL does not parse
    pub fn agent(
        config: EbbtideConfig,
        cache_root: impl Into<PathBuf>,
        tracker_url: &str,
        transport: Arc<dyn Transport>,
        public_addr: SocketAddr,
    ) -> Result<Arc<Self>, SwarmError> {
        let announce = Arc::new(HttpAnnounceClient::new(tracker_url, &config.announce)?);
        let metainfo = Arc::new(HttpMetainfoClient::new(tracker_url, &config.announce)?);
        let archive = Arc::new(AgentArchive::new(cache_root, metainfo));
        let queue = AnnounceQueue::new(backoff_policy(&config.announce));
        info!(tracker = tracker_url, "starting agent scheduler");
        Ok(Self::new(
            config,
            archive,
            announce,
            queue,
            transport,
            public_addr,
        ))
    }

    /// Builds the origin role: read-only blob store, no tracker.
    ///
    /// Origins seed forever, so the seeder linger is cleared and the
    /// announce queue is disabled.
    pub fn origin(
        mut config: EbbtideConfig,
        blob_root: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        public_addr: SocketAddr,
    ) -> Arc<Self> {
        config.dispatch.seeder_linger = None;
        let archive = Arc::new(OriginArchive::new(blob_root));
        info!("starting origin scheduler");
        Self::new(
            config,
            archive,
            Arc::new(DisabledAnnounceClient),
            AnnounceQueue::disabled(),
            transport,
            public_addr,
        )
    }

    /// Activates a torrent, opening its archive entry if needed, and
    /// returns its current status.
    ///
    /// # Errors
    /// - `SwarmError::Archive` - Archive could not provide the torrent
    /// - `SwarmError::SchedulerStopped` - Scheduler is shut down
    pub async fn add_torrent(&self, digest: ContentDigest) -> Result<TorrentStatus, SwarmError> {
        let handle = self.ensure_dispatcher(digest).await?;
        handle.status().await
    }

    /// Hands an inbound handshaked connection to its torrent's dispatcher,
    /// activating the torrent if the local archive has it.
    ///
    /// # Errors
    /// - `SwarmError::UnknownTorrent` - Local archive does not have the
    ///   requested content
    /// - `SwarmError::CapacityExceeded` - Torrent or process connection
    ///   limit reached
    /// - `SwarmError::SchedulerStopped` - Scheduler is shut down
    pub async fn accept_connection(
        &self,
        digest: ContentDigest,
        link: PeerLink,
    ) -> Result<(), SwarmError> {
        let handle = match self.ensure_dispatcher(digest).await {
            Ok(handle) => handle,
            Err(SwarmError::Archive {
                source: ArchiveError::NotFound { .. },
                ..
            }) => return Err(SwarmError::UnknownTorrent { digest }),
            Err(e) => return Err(e),
        };
        handle.connect(link).await
    }

    /// Status snapshot for one active torrent.
    ///
    /// # Errors
    /// - `SwarmError::UnknownTorrent` - Torrent is not active
    pub async fn status(&self, digest: ContentDigest) -> Result<TorrentStatus, SwarmError> {
        let Some(handle) = self.handle_for(digest) else {
            return Err(SwarmError::UnknownTorrent { digest });
        };
        handle.status().await
    }

    /// Status snapshots for every active torrent, in no particular order.
    pub async fn all_statuses(&self) -> Vec<TorrentStatus> {
        let handles: Vec<DispatcherHandle> = {
            let registry = self.registry.lock();
            registry.values().map(|entry| entry.handle.clone()).collect()
        };
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Stops a torrent's dispatcher and waits for it to exit.
    ///
    /// # Errors
    /// - `SwarmError::UnknownTorrent` - Torrent is not active
    pub async fn remove_torrent(&self, digest: ContentDigest) -> Result<(), SwarmError> {
        let entry = self.registry.lock().remove(&digest);
        let Some(entry) = entry else {
            return Err(SwarmError::UnknownTorrent { digest });
        };
        entry.handle.shutdown().await;
        let _ = entry.join.await;
        Ok(())
    }

    /// Number of torrents with a live dispatcher.
    pub fn torrent_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Open connections across all torrents.
    pub fn connection_count(&self) -> usize {
        self.budget.in_use()
    }

    /// Stops every dispatcher and worker. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        let entries: Vec<DispatcherEntry> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.handle.shutdown().await;
            let _ = entry.join.await;
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let _ = futures::future::join_all(workers).await;
        debug!("scheduler stopped");
    }

    fn handle_for(&self, digest: ContentDigest) -> Option<DispatcherHandle> {
        self.registry
            .lock()
            .get(&digest)
            .map(|entry| entry.handle.clone())
    }

    /// Returns the torrent's dispatcher handle, spawning one if needed.
    ///
    /// The archive open happens outside the registry lock; a concurrent
    /// caller that won the race is detected on re-check and its dispatcher
    /// wins.
    async fn ensure_dispatcher(
        &self,
        digest: ContentDigest,
    ) -> Result<DispatcherHandle, SwarmError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SwarmError::SchedulerStopped);
        }
        if let Some(handle) = self.handle_for(digest) {
            return Ok(handle);
        }

        let torrent = self
            .archive
            .open(digest)
            .await
            .map_err(|source| SwarmError::Archive { digest, source })?;

        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get(&digest) {
            return Ok(entry.handle.clone());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SwarmError::SchedulerStopped);
        }

        let (handle, join) = spawn_dispatcher(DispatcherParams {
            digest,
            torrent,
            config: self.config_tx.subscribe(),
            budget: self.budget.clone(),
            announce_queue: self.announce_queue.clone(),
            transport: self.transport.clone(),
            io_permits: self.io_permits.clone(),
            peer_id: self.context.peer_id,
            exited: self.exited_tx.clone(),
        });
        debug!(%digest, "dispatcher spawned");
        registry.insert(
            digest,
            DispatcherEntry {
                handle: handle.clone(),
                join,
            },
        );
        Ok(handle)
    }

    /// Drains the announce queue until shutdown.
    async fn run_announce_worker(&self, worker: usize) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        debug!(worker, "announce worker started");
        loop {
            // The stop signal may predate this task's first poll; a fresh
            // subscription marks the current value as seen, so check it
            // directly before waiting.
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                () = self.announce_queue.ready() => {
                    while let Some((digest, attempts)) = self.announce_queue.pop_ready() {
                        self.announce_once(digest, attempts).await;
                    }
                }
            }
        }
        debug!(worker, "announce worker stopped");
    }

    async fn announce_once(&self, digest: ContentDigest, attempts: u32) {
        // Dispatcher may have exited between scheduling and now.
        let Some(handle) = self.handle_for(digest) else {
            return;
        };
        let complete = match handle.status().await {
            Ok(status) => status.state == TorrentState::Seeding,
            Err(_) => return,
        };

        match self
            .announce_client
            .announce(digest, &self.context, complete)
            .await
        {
            Ok(response) => {
                let peers: Vec<SocketAddr> = response
                    .peers
                    .into_iter()
                    .filter(|addr| *addr != self.context.addr)
                    .collect();
                if !peers.is_empty() {
                    handle.notify_peers(peers).await;
                }
                let interval = response
                    .interval
                    .unwrap_or(self.config_tx.borrow().announce.interval);
                self.announce_queue.record_success(digest, interval);
            }
            Err(error) => {
                let delay = self.announce_queue.record_failure(digest, attempts);
                warn!(%digest, %error, retry_in = ?delay, "announce failed");
            }
        }
    }

    /// Removes registry entries for dispatchers that exited on their own.
    async fn run_reaper(&self, mut exited_rx: mpsc::UnboundedReceiver<ContentDigest>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                exited = exited_rx.recv() => {
                    let Some(digest) = exited else { break };
                    let mut registry = self.registry.lock();
                    // A dispatcher closes its event queue before reporting
                    // the exit, so a still-open handle belongs to some other
                    // live instance and must be kept.
                    if registry
                        .get(&digest)
                        .is_some_and(|entry| entry.handle.is_closed())
                    {
                        registry.remove(&digest);
                        debug!(%digest, "dispatcher reaped");
                    }
                }
            }
        }
    }
}

/// Scheduler wrapper exposing runtime config reload.
pub struct ReloadableScheduler {
    inner: Arc<Scheduler>,
}

impl ReloadableScheduler {
    pub fn new(inner: Arc<Scheduler>) -> Self {
        Self { inner }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner
    }

    /// Pushes a new configuration to every dispatcher.
    ///
    /// Limits and timers apply from each dispatcher's next tick; existing
    /// connections above a lowered cap are kept until they close naturally.
    pub fn reload(&self, config: EbbtideConfig) {
        info!("scheduler config reloaded");
        self.inner.config_tx.send_replace(config);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryArchive;
    use crate::swarm::test_support::{ChannelTransport, ScriptedTracker};

    fn test_scheduler(
        archive: Arc<dyn TorrentArchive>,
        tracker: Arc<ScriptedTracker>,
    ) -> Arc<Scheduler> {
        let config = EbbtideConfig::for_testing();
        let queue = AnnounceQueue::new(backoff_policy(&config.announce));
        Scheduler::new(
            config,
            archive,
            tracker,
            queue,
            Arc::new(ChannelTransport::new()),
            "127.0.0.1:7000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_add_torrent_spawns_one_dispatcher() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        let status = scheduler.add_torrent(digest).await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(scheduler.torrent_count(), 1);

        // Re-adding reuses the existing dispatcher.
        scheduler.add_torrent(digest).await.unwrap();
        assert_eq!(scheduler.torrent_count(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_unknown_torrent_is_archive_error() {
        let archive = Arc::new(MemoryArchive::new());
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        let digest = ContentDigest::from_blob(b"nowhere");
        assert!(matches!(
            scheduler.add_torrent(digest).await,
            Err(SwarmError::Archive {
                source: ArchiveError::NotFound { .. },
                ..
            })
        ));
        assert_eq!(scheduler.torrent_count(), 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_connection_for_unknown_content() {
        let archive = Arc::new(MemoryArchive::new());
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        let digest = ContentDigest::from_blob(b"not here");
        let local = crate::swarm::PeerId::generate();
        let remote = crate::swarm::PeerId::generate();
        let (link, _remote_end) = PeerLink::pair(local, remote, 8);

        assert!(matches!(
            scheduler.accept_connection(digest, link).await,
            Err(SwarmError::UnknownTorrent { .. })
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_announces_back_off_then_recover() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let tracker = Arc::new(ScriptedTracker::failing(2));
        let scheduler = test_scheduler(archive, tracker.clone());

        scheduler.add_torrent(digest).await.unwrap();

        // Two failures at 10ms and 20ms backoff, then a success.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tracker.announces.load(Ordering::SeqCst) >= 3);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry_and_connections() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        scheduler.add_torrent(digest).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.torrent_count(), 0);
        assert_eq!(scheduler.connection_count(), 0);
        assert!(matches!(
            scheduler.add_torrent(digest).await,
            Err(SwarmError::SchedulerStopped)
        ));

        // Shutdown is idempotent.
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes_before_workers_first_poll() {
        let archive = Arc::new(MemoryArchive::new());
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        // No intervening await: the worker tasks have not run yet, so the
        // stop signal is already set by the time they subscribe to it.
        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("shutdown must not hang on unstarted workers");
    }

    #[tokio::test]
    async fn test_lingered_dispatcher_is_reaped_and_digest_reusable() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        scheduler.add_torrent(digest).await.unwrap();
        // An idle seeder lingers out on its own; the reaper must clear the
        // registry slot rather than leave a dead handle behind.
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.torrent_count() != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("idle seeder should be reaped");

        let status = scheduler.add_torrent(digest).await.unwrap();
        assert_eq!(status.state, TorrentState::Seeding);
        assert_eq!(scheduler.torrent_count(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_torrent_stops_dispatcher() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));

        scheduler.add_torrent(digest).await.unwrap();
        scheduler.remove_torrent(digest).await.unwrap();
        assert_eq!(scheduler.torrent_count(), 0);
        assert!(matches!(
            scheduler.remove_torrent(digest).await,
            Err(SwarmError::UnknownTorrent { .. })
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_updates_dispatcher_config() {
        let archive = Arc::new(MemoryArchive::new());
        let digest = archive.insert_seed(b"0123456789", 4);
        let scheduler = test_scheduler(archive, Arc::new(ScriptedTracker::quiet()));
        let reloadable = ReloadableScheduler::new(scheduler);

        reloadable.scheduler().add_torrent(digest).await.unwrap();

        let mut config = EbbtideConfig::for_testing();
        config.connection.max_peers_per_torrent = 1;
        reloadable.reload(config);

        // The watch channel carries the new value immediately; dispatchers
        // pick it up on their next loop iteration.
        assert_eq!(
            reloadable
                .scheduler()
                .config_tx
                .borrow()
                .connection
                .max_peers_per_torrent,
            1
        );

        reloadable.scheduler().shutdown().await;
    }
}
