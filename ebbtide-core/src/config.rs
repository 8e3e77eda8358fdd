//! Centralized configuration for Ebbtide.
//!
//! All tunable parameters live here to avoid hard-coded values scattered
//! throughout the codebase. The scheduler distributes a config snapshot to
//! every dispatcher through a watch channel; updated values apply to
//! subsequent ticks and new connections only.

use std::time::Duration;

/// Central configuration for all Ebbtide components.
///
/// Groups related settings into logical sections. Supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct EbbtideConfig {
    pub connection: ConnectionConfig,
    pub dispatch: DispatchConfig,
    pub announce: AnnounceConfig,
    pub storage: StorageConfig,
}

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum open connections per torrent
    pub max_peers_per_torrent: usize,
    /// Maximum open connections process-wide, across all torrents
    pub max_open_connections: usize,
    /// Capacity of each connection's outbound message queue
    pub send_queue_capacity: usize,
    /// Connections with no message exchanged within this window are evicted
    pub idle_timeout: Duration,
    /// Deadline for an outstanding piece request before it is retried
    pub request_timeout: Duration,
    /// Maximum outstanding piece requests per peer, in both directions:
    /// our open request window to a peer, and the requests a peer may keep
    /// queued with us before further ones are rejected
    pub max_requests_per_peer: usize,
    /// Maximum concurrent piece uploads per torrent
    pub max_concurrent_uploads: usize,
    /// Piece hash failures from one peer before it is penalized
    pub piece_failure_threshold: u32,
    /// How long a penalized peer is excluded from piece selection
    pub peer_cooldown: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_peers_per_torrent: 20,
            max_open_connections: 200,
            send_queue_capacity: 64,
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            max_requests_per_peer: 8,
            max_concurrent_uploads: 8,
            piece_failure_threshold: 3,
            peer_cooldown: Duration::from_secs(300),
        }
    }
}

/// Dispatcher event-loop behavior.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between dispatcher ticks
    pub tick_interval: Duration,
    /// Re-announce when the connected peer count drops below this target
    pub peer_target: usize,
    /// How long a completed torrent keeps seeding with no peers before its
    /// dispatcher tears down. `None` means seed forever (origin role).
    pub seeder_linger: Option<Duration>,
    /// Capacity of each dispatcher's inbound event queue
    pub event_queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            peer_target: 10,
            seeder_linger: Some(Duration::from_secs(300)),
            event_queue_capacity: 256,
        }
    }
}

/// Tracker announce timing and retry policy.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// Default interval between announces for a healthy torrent
    pub interval: Duration,
    /// HTTP request timeout for tracker communication
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Number of announce worker tasks
    pub workers: usize,
    /// First retry delay after an announce failure
    pub backoff_base: Duration,
    /// Upper bound on the failure retry delay
    pub backoff_max: Duration,
    /// Fraction of the retry delay added as random jitter (0.0 disables)
    pub backoff_jitter: f64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            user_agent: "ebbtide/0.1.0",
            workers: 4,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(120),
            backoff_jitter: 0.2,
        }
    }
}

/// Piece store I/O behavior.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Size of the shared worker pool for piece reads and writes
    pub io_workers: usize,
    /// Attempts for a piece write before the download is treated as failed
    pub write_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            io_workers: num_cpus::get().clamp(2, 16),
            write_retries: 3,
        }
    }
}

impl EbbtideConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(max_peers) = std::env::var("EBBTIDE_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.connection.max_peers_per_torrent = count;
            }
        }

        if let Ok(max_open) = std::env::var("EBBTIDE_MAX_OPEN_CONNECTIONS") {
            if let Ok(count) = max_open.parse::<usize>() {
                config.connection.max_open_connections = count;
            }
        }

        if let Ok(interval) = std::env::var("EBBTIDE_ANNOUNCE_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.announce.interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("EBBTIDE_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.announce.timeout = Duration::from_secs(seconds);
            }
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    ///
    /// Jitter is zeroed so backoff schedules are exact, and the seeder
    /// linger window is short enough for teardown tests to observe.
    pub fn for_testing() -> Self {
        Self {
            connection: ConnectionConfig {
                idle_timeout: Duration::from_millis(500),
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            dispatch: DispatchConfig {
                tick_interval: Duration::from_millis(20),
                seeder_linger: Some(Duration::from_millis(100)),
                ..Default::default()
            },
            announce: AnnounceConfig {
                interval: Duration::from_millis(50),
                workers: 1,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(80),
                backoff_jitter: 0.0,
                ..Default::default()
            },
            storage: StorageConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = EbbtideConfig::default();

        assert_eq!(config.connection.max_peers_per_torrent, 20);
        assert_eq!(config.connection.max_open_connections, 200);
        assert_eq!(config.connection.piece_failure_threshold, 3);
        assert_eq!(config.dispatch.tick_interval, Duration::from_secs(1));
        assert_eq!(
            config.dispatch.seeder_linger,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.announce.interval, Duration::from_secs(30));
        assert!(config.storage.io_workers >= 2);
    }

    #[test]
    fn test_testing_preset_zeroes_jitter() {
        let config = EbbtideConfig::for_testing();

        assert_eq!(config.announce.backoff_jitter, 0.0);
        assert!(config.dispatch.tick_interval < Duration::from_millis(100));
        assert!(config.announce.backoff_max > config.announce.backoff_base);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("EBBTIDE_MAX_PEERS", "7");
            std::env::set_var("EBBTIDE_ANNOUNCE_INTERVAL", "90");
        }

        let config = EbbtideConfig::from_env();

        assert_eq!(config.connection.max_peers_per_torrent, 7);
        assert_eq!(config.announce.interval, Duration::from_secs(90));

        unsafe {
            std::env::remove_var("EBBTIDE_MAX_PEERS");
            std::env::remove_var("EBBTIDE_ANNOUNCE_INTERVAL");
        }
    }
}
