//! Keyed registry of periodic fetch operations
//!
//! Each key owns at most one live timer. Starting a key that is already
//! running replaces the old timer, so duplicate timers cannot accumulate.
//!
//! # Tick semantics
//!
//! - A tick only runs the operation while the shared [`ConnectionFlag`] is
//!   set. Ticks that fire while disconnected are skipped, never queued.
//! - A run is begun on the tick itself, before the flag is read, and the flag
//!   is read again when the run's task first executes.
//! - Every run is spawned as its own task and bounded by the fetch timeout.
//!   A slow run may overlap the next one. Ordering of results is enforced by
//!   the data stores, not here.
//! - A failing or timed-out run is logged and counted. The timer keeps
//!   going.
//! - Stopping a key cancels its timer, not a run that is already in flight.

use super::connection::ConnectionFlag;
use super::errors::{RealtimeError, RealtimeResult};
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// One run of a poll operation, awaited in its own task
pub type FetchRun = Pin<Box<dyn Future<Output = RealtimeResult<()>> + Send + 'static>>;

/// An operation run on every poll tick
pub trait FetchOp: Send + Sync + 'static {
    /// Begin one run
    ///
    /// Called synchronously on the tick. Anything the operation must capture
    /// at tick time (such as a store ticket) is taken here, not when the
    /// returned future is first polled.
    fn begin(&self) -> FetchRun;
}

/// Adapter turning a closure that returns a future into a [`FetchOp`]
pub struct FnFetch<F>(F);

impl<F, Fut> FetchOp for FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RealtimeResult<()>> + Send + 'static,
{
    fn begin(&self) -> FetchRun {
        Box::pin((self.0)())
    }
}

/// Wrap an async closure as a shareable fetch operation
pub fn fetch_fn<F, Fut>(f: F) -> Arc<dyn FetchOp>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RealtimeResult<()>> + Send + 'static,
{
    Arc::new(FnFetch(f))
}

struct PollEntry {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Registry of live poll timers, keyed by domain
pub struct PollIntervalRegistry {
    flag: ConnectionFlag,
    fetch_timeout: Duration,
    entries: Mutex<HashMap<String, PollEntry>>,
}

impl PollIntervalRegistry {
    /// Create an empty registry whose ticks are gated by `flag`
    pub fn new(flag: ConnectionFlag, fetch_timeout: Duration) -> Self {
        Self {
            flag,
            fetch_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` every `interval` under `key`, replacing any existing timer
    ///
    /// The first run happens one interval from now.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        key: impl Into<String>,
        interval: Duration,
        op: Arc<dyn FetchOp>,
    ) -> RealtimeResult<()> {
        self.schedule(key.into(), interval, op, false, false).map(|_| ())
    }

    /// Like [`start`](Self::start), but also runs `op` right away
    pub fn start_immediate(
        &self,
        key: impl Into<String>,
        interval: Duration,
        op: Arc<dyn FetchOp>,
    ) -> RealtimeResult<()> {
        self.schedule(key.into(), interval, op, true, false).map(|_| ())
    }

    /// Start a timer only while connected. Returns whether it was started.
    ///
    /// The flag is read under the registry lock. Since disconnecting clears
    /// the flag before [`stop_all`](Self::stop_all) takes that lock, a
    /// concurrent disconnect either drains the new timer or prevents it.
    pub fn start_if_connected(
        &self,
        key: impl Into<String>,
        interval: Duration,
        op: Arc<dyn FetchOp>,
        immediate: bool,
    ) -> RealtimeResult<bool> {
        self.schedule(key.into(), interval, op, immediate, true)
    }

    fn schedule(
        &self,
        key: String,
        interval: Duration,
        op: Arc<dyn FetchOp>,
        immediate: bool,
        require_connected: bool,
    ) -> RealtimeResult<bool> {
        if interval.is_zero() {
            return Err(RealtimeError::InvalidInterval { key });
        }

        let mut entries = self.entries();
        if require_connected && !self.flag.is_connected() {
            debug!(%key, "Not starting poll timer while disconnected");
            return Ok(false);
        }

        let ticker = TickLoop {
            key: Arc::from(key.as_str()),
            interval,
            op,
            flag: self.flag.clone(),
            fetch_timeout: self.fetch_timeout,
        };
        let handle = tokio::spawn(ticker.run(immediate));

        if let Some(previous) = entries.insert(key.clone(), PollEntry { interval, handle }) {
            previous.handle.abort();
            debug!(%key, ?interval, "Replaced poll timer");
        } else {
            debug!(%key, ?interval, "Started poll timer");
        }
        gauge!("chimera_poll_active").set(entries.len() as f64);
        Ok(true)
    }

    /// Cancel the timer for `key`. Returns whether one was running.
    pub fn stop(&self, key: &str) -> bool {
        let mut entries = self.entries();
        let removed = entries.remove(key);
        gauge!("chimera_poll_active").set(entries.len() as f64);
        drop(entries);

        match removed {
            Some(entry) => {
                entry.handle.abort();
                debug!(%key, "Stopped poll timer");
                true
            }
            None => false,
        }
    }

    /// Cancel every live timer
    pub fn stop_all(&self) {
        let drained: Vec<(String, PollEntry)> = self.entries().drain().collect();
        gauge!("chimera_poll_active").set(0.0);

        if drained.is_empty() {
            return;
        }
        for (_, entry) in &drained {
            entry.handle.abort();
        }
        debug!(count = drained.len(), "Stopped all poll timers");
    }

    /// Whether a timer is live for `key`
    pub fn is_active(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// Keys with a live timer, sorted
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cadence of the live timer for `key`
    pub fn interval_of(&self, key: &str) -> Option<Duration> {
        self.entries().get(key).map(|entry| entry.interval)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PollEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollIntervalRegistry {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}

struct TickLoop {
    key: Arc<str>,
    interval: Duration,
    op: Arc<dyn FetchOp>,
    flag: ConnectionFlag,
    fetch_timeout: Duration,
}

impl TickLoop {
    async fn run(self, immediate: bool) {
        if immediate {
            self.tick();
        }

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.tick();
        }
    }

    fn tick(&self) {
        let domain = domain_of(&self.key);
        // Begun before the flag is read: a reset that follows a connected
        // read is always newer than what the run captured.
        let run = self.op.begin();
        if !self.flag.is_connected() {
            trace!(key = %self.key, "Skipping poll tick while disconnected");
            counter!("chimera_poll_skipped_total", "domain" => domain).increment(1);
            return;
        }

        counter!("chimera_poll_ticks_total", "domain" => domain).increment(1);
        tokio::spawn(run_fetch(
            self.key.clone(),
            run,
            self.flag.clone(),
            self.fetch_timeout,
        ));
    }
}

async fn run_fetch(key: Arc<str>, run: FetchRun, flag: ConnectionFlag, fetch_timeout: Duration) {
    if !flag.is_connected() {
        trace!(%key, "Dropping poll run, disconnected before it started");
        counter!("chimera_poll_skipped_total", "domain" => domain_of(&key)).increment(1);
        return;
    }

    let started = Instant::now();
    let outcome = match time::timeout(fetch_timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::Timeout {
            key: key.to_string(),
            after: fetch_timeout,
        }),
    };

    match outcome {
        Ok(()) => {
            let elapsed = started.elapsed();
            histogram!("chimera_poll_fetch_duration_ms", "domain" => domain_of(&key))
                .record(elapsed.as_secs_f64() * 1000.0);
            trace!(%key, ?elapsed, "Poll fetch completed");
        }
        Err(e) => {
            warn!(%key, error = %e, "Poll fetch failed, retrying on next tick");
            counter!("chimera_poll_failures_total", "domain" => domain_of(&key)).increment(1);
        }
    }
}

/// Metric label for a poll key: the part before the first `:`
fn domain_of(key: &str) -> String {
    key.split(':').next().unwrap_or(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::advance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_op() -> (Arc<AtomicUsize>, Arc<dyn FetchOp>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let op = fetch_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (count, op)
    }

    fn connected_registry() -> PollIntervalRegistry {
        let flag = ConnectionFlag::new();
        flag.set(true);
        PollIntervalRegistry::new(flag, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_cadence() {
        let registry = connected_registry();
        let (count, op) = counting_op();

        registry.start("workspaces", Duration::from_secs(1), op).unwrap();
        advance(Duration::from_millis(3_050)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer() {
        let registry = connected_registry();
        let (first_count, first) = counting_op();
        let (second_count, second) = counting_op();

        registry.start("messages:c1", Duration::from_secs(1), first).unwrap();
        registry.start("messages:c1", Duration::from_secs(2), second).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.interval_of("messages:c1"), Some(Duration::from_secs(2)));

        advance(Duration::from_millis(4_050)).await;

        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_ticks_are_skipped_not_queued() {
        let flag = ConnectionFlag::new();
        let registry = PollIntervalRegistry::new(flag.clone(), Duration::from_secs(30));
        let (count, op) = counting_op();

        registry.start("invitations", Duration::from_secs(1), op).unwrap();
        advance(Duration::from_millis(3_050)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        flag.set(true);
        advance(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_polling() {
        let registry = connected_registry();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let op = fetch_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RealtimeError::Fetch("backend unreachable".to_string()))
            }
        });

        registry.start("memories:ws-1", Duration::from_secs(1), op).unwrap();
        advance(Duration::from_millis(3_050)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(registry.is_active("memories:ws-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out_and_timer_survives() {
        let flag = ConnectionFlag::new();
        flag.set(true);
        let registry = PollIntervalRegistry::new(flag, Duration::from_millis(500));
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (s, f) = (started.clone(), finished.clone());
        let op = fetch_fn(move || {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_secs(10)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        registry.start("team:ws-1", Duration::from_secs(1), op).unwrap();
        advance(Duration::from_millis(3_050)).await;

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(registry.is_active("team:ws-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_immediate_runs_once_up_front() {
        let registry = connected_registry();
        let (count, op) = counting_op();

        registry
            .start_immediate("workspace:ws-1", Duration::from_secs(3), op)
            .unwrap();
        advance(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_reports() {
        let registry = connected_registry();
        let (count, op) = counting_op();

        registry.start("conversations:ws-1", Duration::from_secs(1), op).unwrap();
        assert!(registry.stop("conversations:ws-1"));
        assert!(!registry.stop("conversations:ws-1"));
        assert!(!registry.stop("never-started"));

        advance(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_on_empty_registry() {
        let registry = connected_registry();
        registry.stop_all();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_rejected() {
        let registry = connected_registry();
        let (_, op) = counting_op();
        let err = registry.start("workspaces", Duration::ZERO, op).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidInterval { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_keys_sorted() {
        let registry = connected_registry();
        for key in ["team:ws-1", "invitations", "memories:ws-1"] {
            let (_, op) = counting_op();
            registry.start(key, Duration::from_secs(5), op).unwrap();
        }
        assert_eq!(
            registry.active_keys(),
            vec!["invitations", "memories:ws-1", "team:ws-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_if_connected_refuses_while_disconnected() {
        let flag = ConnectionFlag::new();
        let registry = PollIntervalRegistry::new(flag.clone(), Duration::from_secs(30));
        let (_, op) = counting_op();

        let started = registry
            .start_if_connected("memories:ws-1", Duration::from_secs(1), op.clone(), false)
            .unwrap();
        assert!(!started);
        assert!(registry.is_empty());

        flag.set(true);
        let started = registry
            .start_if_connected("memories:ws-1", Duration::from_secs(1), op, true)
            .unwrap();
        assert!(started);
        assert!(registry.is_active("memories:ws-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_begun_before_disconnect_does_not_execute() {
        let flag = ConnectionFlag::new();
        flag.set(true);
        let (executed, op) = counting_op();
        let run = op.begin();

        flag.set(false);
        run_fetch(Arc::from("invitations"), run, flag, Duration::from_secs(30)).await;

        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_begins_run_even_when_skipped() {
        let flag = ConnectionFlag::new();
        let registry = PollIntervalRegistry::new(flag, Duration::from_secs(30));
        let begun = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));
        let (b, e) = (begun.clone(), executed.clone());
        let op = fetch_fn(move || {
            b.fetch_add(1, Ordering::SeqCst);
            let e = e.clone();
            async move {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        registry.start("workspaces", Duration::from_secs(1), op).unwrap();
        advance(Duration::from_millis(2_050)).await;

        assert_eq!(begun.load(Ordering::SeqCst), 2);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_domain_label() {
        assert_eq!(domain_of("memories:ws-1"), "memories");
        assert_eq!(domain_of("invitations"), "invitations");
    }
}
