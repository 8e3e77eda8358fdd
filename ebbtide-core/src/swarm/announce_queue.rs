//! Shared queue of pending tracker announces.
//!
//! Dispatchers and the announce workers share one queue per scheduler. Each
//! torrent appears at most once; announcing again reschedules rather than
//! duplicates. A disabled queue (origin role) accepts pushes silently and
//! never yields work, so origins run with no tracker at all.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::ContentDigest;

/// Retry policy applied to failed announces.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added as random jitter. Zero makes the
    /// schedule exact.
    pub jitter: f64,
}

impl BackoffPolicy {
    fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let delay = self
            .base
            .saturating_mul(1 << exponent)
            .min(self.max);
        if self.jitter > 0.0 {
            let extra = delay.as_secs_f64() * self.jitter * rand::rng().random::<f64>();
            delay + Duration::from_secs_f64(extra)
        } else {
            delay
        }
    }
}

struct Entry {
    eligible_at: Instant,
    attempts: u32,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<(Instant, ContentDigest)>>,
    entries: HashMap<ContentDigest, Entry>,
}

impl QueueInner {
    /// Eligible time of the soonest live entry, discarding stale heap nodes.
    fn next_eligible(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, digest))) = self.heap.peek().copied() {
            match self.entries.get(&digest) {
                Some(entry) if entry.eligible_at == at => return Some(at),
                _ => {
                    // Superseded by a reschedule or removal.
                    self.heap.pop();
                }
            }
        }
        None
    }
}

/// Deadline-ordered announce queue shared across worker tasks.
pub struct AnnounceQueue {
    inner: Option<Mutex<QueueInner>>,
    policy: BackoffPolicy,
    notify: Notify,
}

impl AnnounceQueue {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            inner: Some(Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
            })),
            policy,
            notify: Notify::new(),
        }
    }

    /// Queue that accepts pushes but never yields work.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            policy: BackoffPolicy {
                base: Duration::ZERO,
                max: Duration::ZERO,
                jitter: 0.0,
            },
            notify: Notify::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_none()
    }

    /// Schedules an announce after `delay`.
    ///
    /// A torrent already queued keeps its earlier deadline; pushing never
    /// postpones. Retry attempt counts carry across pushes until a success
    /// resets them.
    pub fn push(&self, digest: ContentDigest, delay: Duration) {
        let Some(inner) = &self.inner else { return };
        let eligible_at = Instant::now() + delay;
        {
            let mut inner = inner.lock();
            let attempts = match inner.entries.get(&digest) {
                Some(entry) if entry.eligible_at <= eligible_at => return,
                Some(entry) => entry.attempts,
                None => 0,
            };
            inner.entries.insert(
                digest,
                Entry {
                    eligible_at,
                    attempts,
                },
            );
            inner.heap.push(Reverse((eligible_at, digest)));
        }
        self.notify.notify_waiters();
    }

    /// Schedules the next regular announce and clears the failure streak.
    pub fn record_success(&self, digest: ContentDigest, interval: Duration) {
        let Some(inner) = &self.inner else { return };
        let eligible_at = Instant::now() + interval;
        {
            let mut inner = inner.lock();
            inner.entries.insert(
                digest,
                Entry {
                    eligible_at,
                    attempts: 0,
                },
            );
            inner.heap.push(Reverse((eligible_at, digest)));
        }
        self.notify.notify_waiters();
    }

    /// Schedules a retry with exponential backoff and returns the delay.
    pub fn record_failure(&self, digest: ContentDigest, attempts_so_far: u32) -> Duration {
        let attempts = attempts_so_far + 1;
        let delay = self.policy.delay_for(attempts);
        let Some(inner) = &self.inner else {
            return delay;
        };
        let eligible_at = Instant::now() + delay;
        {
            let mut inner = inner.lock();
            inner.entries.insert(
                digest,
                Entry {
                    eligible_at,
                    attempts,
                },
            );
            inner.heap.push(Reverse((eligible_at, digest)));
        }
        self.notify.notify_waiters();
        delay
    }

    /// Drops a torrent from the queue. Idempotent.
    pub fn remove(&self, digest: ContentDigest) {
        let Some(inner) = &self.inner else { return };
        inner.lock().entries.remove(&digest);
        // The heap node goes stale and is discarded lazily.
    }

    /// Takes the next eligible torrent, with its failure streak so far.
    ///
    /// The entry leaves the queue; the worker re-queues it through
    /// `record_success` or `record_failure` once the announce settles.
    pub fn pop_ready(&self) -> Option<(ContentDigest, u32)> {
        let inner = self.inner.as_ref()?;
        let mut inner = inner.lock();
        let now = Instant::now();
        loop {
            let Reverse((at, digest)) = inner.heap.peek().copied()?;
            match inner.entries.get(&digest) {
                Some(entry) if entry.eligible_at == at => {
                    if at > now {
                        return None;
                    }
                    inner.heap.pop();
                    let entry = inner.entries.remove(&digest).unwrap();
                    return Some((digest, entry.attempts));
                }
                _ => {
                    inner.heap.pop();
                }
            }
        }
    }

    pub fn contains(&self, digest: ContentDigest) -> bool {
        match &self.inner {
            Some(inner) => inner.lock().entries.contains_key(&digest),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().entries.len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when some entry is eligible. A disabled queue never
    /// resolves. Resolution is a hint, not a claim: another worker may pop
    /// the entry first, so callers loop on [`AnnounceQueue::pop_ready`].
    pub async fn ready(&self) {
        let Some(inner) = &self.inner else {
            return std::future::pending().await;
        };
        loop {
            // Register before checking so a concurrent push is not missed.
            let notified = self.notify.notified();
            let next = inner.lock().next_eligible();
            match next {
                Some(at) if at <= Instant::now() => return,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(80),
            jitter: 0.0,
        }
    }

    fn digest(label: &str) -> ContentDigest {
        ContentDigest::from_blob(label.as_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_dedupes_and_keeps_earlier_deadline() {
        let queue = AnnounceQueue::new(exact_policy());
        let d = digest("dedupe");

        queue.push(d, Duration::from_millis(50));
        queue.push(d, Duration::from_millis(10));
        queue.push(d, Duration::from_millis(200));
        assert_eq!(queue.len(), 1);

        tokio::time::advance(Duration::from_millis(11)).await;
        assert_eq!(queue.pop_ready(), Some((d, 0)));
        assert_eq!(queue.pop_ready(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_orders_by_deadline() {
        let queue = AnnounceQueue::new(exact_policy());
        let late = digest("late");
        let early = digest("early");

        queue.push(late, Duration::from_millis(30));
        queue.push(early, Duration::from_millis(5));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(queue.pop_ready().unwrap().0, early);
        assert_eq!(queue.pop_ready().unwrap().0, late);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backoff_doubles_until_capped() {
        let queue = AnnounceQueue::new(exact_policy());
        let d = digest("flaky");

        assert_eq!(queue.record_failure(d, 0), Duration::from_millis(10));
        assert_eq!(queue.record_failure(d, 1), Duration::from_millis(20));
        assert_eq!(queue.record_failure(d, 2), Duration::from_millis(40));
        assert_eq!(queue.record_failure(d, 3), Duration::from_millis(80));
        // Capped.
        assert_eq!(queue.record_failure(d, 4), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_carry_until_success() {
        let queue = AnnounceQueue::new(exact_policy());
        let d = digest("streak");

        queue.record_failure(d, 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        let (_, attempts) = queue.pop_ready().unwrap();
        assert_eq!(attempts, 1);

        queue.record_success(d, Duration::from_millis(5));
        tokio::time::advance(Duration::from_millis(10)).await;
        let (_, attempts) = queue.pop_ready().unwrap();
        assert_eq!(attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_pending_entry() {
        let queue = AnnounceQueue::new(exact_policy());
        let d = digest("cancelled");

        queue.push(d, Duration::from_millis(5));
        queue.remove(d);
        assert!(!queue.contains(d));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(queue.pop_ready(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_resolves_when_entry_becomes_eligible() {
        let queue = std::sync::Arc::new(AnnounceQueue::new(exact_policy()));
        let d = digest("wakeup");

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.ready().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        queue.push(d, Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(11)).await;
        waiter.await.unwrap();
        assert_eq!(queue.pop_ready().unwrap().0, d);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_queue_never_yields() {
        let queue = std::sync::Arc::new(AnnounceQueue::disabled());
        let d = digest("origin");

        assert!(queue.is_disabled());
        queue.push(d, Duration::ZERO);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop_ready(), None);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.ready().await })
        };
        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }
}
