//! Background duration fetching coordinator.
//!
//! `DurationFetcher` owns the worker pool, the shared priority queue and the
//! persistent cache. Callers enqueue playlist items and consume results from the
//! `FetchEvent` broadcast bus; they never block on a fetch.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::duration_cache::DurationCache;
use crate::errors::FetchError;
use crate::fetch_queue::{FetchQueue, QueueFull};
use crate::fetch_request::FetchRequest;
use crate::fetch_worker::{FetchGate, FetchWorker, WorkerSlot};
use crate::fetchers::FetchBackends;
use crate::protocol::{
    EnqueueOutcome, FetchEvent, FetchPriority, FetchStatisticsSnapshot, FetchStats, PlaylistItem,
};
use crate::settings::DurationFetchSettings;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CACHE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const STATS_EVENTS_PER_SECOND: u32 = 10;

#[derive(Default)]
struct FetchCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
}

/// State shared between the coordinator, its workers and the cache flusher.
pub(crate) struct FetchShared {
    pub(crate) cache: DurationCache,
    pub(crate) queue: FetchQueue,
    settings: RwLock<DurationFetchSettings>,
    backends: RwLock<FetchBackends>,
    bus: broadcast::Sender<FetchEvent>,
    stats_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    counters: FetchCounters,
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    pub(crate) gate: FetchGate,
    stopping: AtomicBool,
}

impl FetchShared {
    pub(crate) fn new(
        config_dir: &Path,
        settings: DurationFetchSettings,
        bus: broadcast::Sender<FetchEvent>,
        backends: FetchBackends,
    ) -> Self {
        let settings = settings.sanitized();
        Self {
            cache: DurationCache::open(config_dir, &settings),
            queue: FetchQueue::new(settings.queue_capacity, settings.tie_break_policy()),
            backends: RwLock::new(backends),
            bus,
            stats_limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(STATS_EVENTS_PER_SECOND).expect("non-zero stats rate"),
            )),
            counters: FetchCounters::default(),
            slots: RwLock::new(Vec::new()),
            gate: FetchGate::new(settings.worker_thread_count),
            stopping: AtomicBool::new(false),
            settings: RwLock::new(settings),
        }
    }

    /// Set once by the fetcher's `stop`; cancels in-flight fetches in every pool.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns false when a stop was already under way.
    pub(crate) fn begin_stop(&self) -> bool {
        let first = !self.stopping.swap(true, Ordering::SeqCst);
        self.gate.wake_all();
        first
    }

    pub(crate) fn settings(&self) -> DurationFetchSettings {
        self.settings
            .read()
            .expect("fetch settings lock poisoned")
            .clone()
    }

    pub(crate) fn backends(&self) -> FetchBackends {
        self.backends
            .read()
            .expect("fetch backends lock poisoned")
            .clone()
    }

    fn emit(&self, event: FetchEvent) {
        // No receivers is not an error.
        let _ = self.bus.send(event);
    }

    /// Sends the terminal event before bumping its counter, so counters never run
    /// ahead of the bus.
    pub(crate) fn record_success(&self, playlist_index: usize, duration_secs: u64, source: &str) {
        self.emit(FetchEvent::DurationReady {
            playlist_index,
            duration_secs,
            source: source.to_string(),
        });
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        self.emit_progress();
        self.publish_stats(false);
    }

    pub(crate) fn record_failure(&self, playlist_index: usize, err: &FetchError, retry_count: u32) {
        self.emit(FetchEvent::FetchError {
            playlist_index,
            kind: err.kind(),
            message: err.to_string(),
            retry_count,
        });
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        self.emit_progress();
        self.publish_stats(false);
    }

    fn record_cache_hit(&self, playlist_index: usize, duration_secs: u64) {
        self.emit(FetchEvent::DurationReady {
            playlist_index,
            duration_secs,
            source: "cache".to_string(),
        });
        self.counters.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_progress(&self) {
        let stats = self.fetch_stats();
        self.emit(FetchEvent::FetchProgress {
            completed: stats.completed + stats.failed + stats.cache_hits,
            total: stats.queued + stats.cache_hits,
        });
    }

    /// Broadcasts a snapshot; unforced emissions are rate limited.
    fn publish_stats(&self, force: bool) {
        if !force && self.stats_limiter.check().is_err() {
            return;
        }
        self.emit(FetchEvent::StatsUpdated(Box::new(self.snapshot())));
    }

    pub(crate) fn fetch_stats(&self) -> FetchStats {
        FetchStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            cache_hits: self.counters.cache_hits.load(Ordering::SeqCst),
        }
    }

    fn snapshot(&self) -> FetchStatisticsSnapshot {
        let workers = self
            .slots
            .read()
            .expect("worker slots lock poisoned")
            .iter()
            .map(|slot| slot.status())
            .collect();
        FetchStatisticsSnapshot {
            cache: self.cache.stats(),
            queue_size: self.queue.len(),
            workers,
            fetch_stats: self.fetch_stats(),
        }
    }
}

struct WorkerPool {
    retire: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

enum PoolState {
    Idle,
    Running(WorkerPool),
    /// The old pool is being joined outside the lock; enqueue leaves spawning to the restart.
    Restarting,
}

struct CacheFlusher {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl CacheFlusher {
    fn start(shared: Arc<FetchShared>, interval: Duration) -> Option<Self> {
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("duration-cache-flush".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        debug!("DurationFetcher: periodic cache flush");
                        shared.cache.save();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        match spawned {
            Ok(handle) => Some(Self { shutdown, handle }),
            Err(err) => {
                warn!("DurationFetcher: Failed to start cache flusher: {}", err);
                None
            }
        }
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        if self.handle.join().is_err() {
            error!("DurationFetcher: cache flusher panicked");
        }
    }
}

/// Coordinates background duration lookups for playlist items.
pub struct DurationFetcher {
    config_dir: PathBuf,
    shared: Arc<FetchShared>,
    custom_backends: bool,
    pool: Mutex<PoolState>,
    flusher: Mutex<Option<CacheFlusher>>,
}

impl DurationFetcher {
    /// Creates a fetcher with the production engines.
    pub fn new(
        config_dir: impl Into<PathBuf>,
        settings: DurationFetchSettings,
        bus: broadcast::Sender<FetchEvent>,
    ) -> Self {
        let config_dir = config_dir.into();
        let backends = FetchBackends::from_settings(&settings, &config_dir);
        Self::build(config_dir, settings, bus, backends, false, CACHE_FLUSH_INTERVAL)
    }

    /// Creates a fetcher with caller-supplied engines.
    pub fn with_backends(
        config_dir: impl Into<PathBuf>,
        settings: DurationFetchSettings,
        bus: broadcast::Sender<FetchEvent>,
        backends: FetchBackends,
    ) -> Self {
        Self::build(
            config_dir.into(),
            settings,
            bus,
            backends,
            true,
            CACHE_FLUSH_INTERVAL,
        )
    }

    fn build(
        config_dir: PathBuf,
        settings: DurationFetchSettings,
        bus: broadcast::Sender<FetchEvent>,
        backends: FetchBackends,
        custom_backends: bool,
        flush_interval: Duration,
    ) -> Self {
        let shared = Arc::new(FetchShared::new(&config_dir, settings, bus, backends));
        let flusher = CacheFlusher::start(Arc::clone(&shared), flush_interval);
        debug!(
            "DurationFetcher: initialized with cache {}",
            shared.cache.cache_file().display()
        );
        Self {
            config_dir,
            shared,
            custom_backends,
            pool: Mutex::new(PoolState::Idle),
            flusher: Mutex::new(flusher),
        }
    }

    pub fn settings(&self) -> DurationFetchSettings {
        self.shared.settings()
    }

    pub fn cache(&self) -> &DurationCache {
        &self.shared.cache
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn is_running(&self) -> bool {
        !matches!(
            *self.pool.lock().expect("worker pool lock poisoned"),
            PoolState::Idle
        )
    }

    /// Queues duration lookups for `items`.
    ///
    /// Items that already carry a duration, have an unsupported type or an empty URL
    /// are skipped. Cached items are answered immediately with `source = "cache"`.
    /// Items whose index is in `visible` are promoted to at least `High` when
    /// `prioritize_visible` is set. A full queue truncates the rest of the batch.
    pub fn enqueue(
        &self,
        items: Vec<(usize, PlaylistItem)>,
        priority: FetchPriority,
        visible: Option<&[usize]>,
    ) -> EnqueueOutcome {
        self.enqueue_batch(items, priority, visible, 0)
    }

    /// Queues one item, typically with `FetchPriority::Urgent`.
    pub fn enqueue_single(
        &self,
        index: usize,
        item: PlaylistItem,
        priority: FetchPriority,
    ) -> EnqueueOutcome {
        self.enqueue_batch(vec![(index, item)], priority, None, 0)
    }

    /// Re-queues a failed item with the caller's retry count.
    ///
    /// Returns false when `retry_count` exceeds `max_retries` or nothing was queued.
    pub fn enqueue_retry(&self, index: usize, item: PlaylistItem, retry_count: u32) -> bool {
        let max_retries = self.shared.settings().max_retries;
        if retry_count > max_retries {
            debug!(
                "DurationFetcher: refusing retry {} for index {} (max {})",
                retry_count, index, max_retries
            );
            return false;
        }
        let outcome =
            self.enqueue_batch(vec![(index, item)], FetchPriority::Normal, None, retry_count);
        outcome.queued + outcome.cache_hits == 1
    }

    fn enqueue_batch(
        &self,
        items: Vec<(usize, PlaylistItem)>,
        priority: FetchPriority,
        visible: Option<&[usize]>,
        retry_count: u32,
    ) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();
        if self.shared.is_stopping() {
            warn!("DurationFetcher: enqueue after stop ignored");
            return outcome;
        }
        let settings = self.shared.settings();
        if !settings.auto_fetch_enabled {
            debug!("DurationFetcher: auto fetch disabled, ignoring enqueue");
            return outcome;
        }

        let visible: HashSet<usize> = if settings.prioritize_visible {
            visible.unwrap_or_default().iter().copied().collect()
        } else {
            HashSet::new()
        };

        let mut pending = items.into_iter();
        while let Some((index, item)) = pending.next() {
            if item.has_duration() {
                outcome.skipped += 1;
                continue;
            }
            let effective_priority = if visible.contains(&index) {
                priority.max(FetchPriority::High)
            } else {
                priority
            };
            let Some(request) = FetchRequest::new(index, item, effective_priority, retry_count)
            else {
                outcome.skipped += 1;
                continue;
            };
            if let Some(duration_secs) = self.shared.cache.get(request.url()) {
                self.shared.record_cache_hit(index, duration_secs);
                outcome.cache_hits += 1;
                continue;
            }
            match self.shared.queue.push(request) {
                Ok(()) => {
                    self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
                    outcome.queued += 1;
                }
                Err(QueueFull(rejected)) => {
                    outcome.truncated = 1 + pending.count();
                    warn!(
                        "DurationFetcher: queue full at index {}, dropped {} items from batch",
                        rejected.playlist_index, outcome.truncated
                    );
                    break;
                }
            }
        }

        if outcome.queued > 0 {
            self.ensure_workers_started();
        }
        if outcome.queued > 0 || outcome.cache_hits > 0 {
            self.shared.emit_progress();
            self.shared.publish_stats(false);
        }
        debug!(
            "DurationFetcher: enqueued {} (cache hits {}, skipped {}, truncated {})",
            outcome.queued, outcome.cache_hits, outcome.skipped, outcome.truncated
        );
        outcome
    }

    fn ensure_workers_started(&self) {
        let mut pool = self.pool.lock().expect("worker pool lock poisoned");
        if !matches!(*pool, PoolState::Idle) || self.shared.is_stopping() {
            return;
        }
        let worker_count = self.shared.settings().worker_thread_count;
        *pool = PoolState::Running(self.spawn_pool(worker_count));
    }

    fn spawn_pool(&self, worker_count: usize) -> WorkerPool {
        let retire = Arc::new(AtomicBool::new(false));
        let slots: Vec<Arc<WorkerSlot>> = (0..worker_count)
            .map(|worker_id| Arc::new(WorkerSlot::new(worker_id)))
            .collect();
        let mut handles = Vec::with_capacity(worker_count);
        for slot in &slots {
            let worker = FetchWorker::new(
                Arc::clone(&self.shared),
                Arc::clone(slot),
                Arc::clone(&retire),
            );
            let worker_id = slot.status().worker_id;
            let spawned = thread::Builder::new()
                .name(format!("duration-fetch-{worker_id}"))
                .spawn(move || {
                    let run_result =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker.run()));
                    if run_result.is_err() {
                        error!("FetchWorker[{}]: terminated due to panic", worker_id);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(
                    "DurationFetcher: Failed to spawn worker {}: {}",
                    worker_id, err
                ),
            }
        }
        *self.shared.slots.write().expect("worker slots lock poisoned") = slots;
        info!("DurationFetcher: started {} workers", handles.len());
        WorkerPool { retire, handles }
    }

    /// Retires a pool: one pill per worker, then a bounded join per worker.
    ///
    /// Abandoned workers keep their gate permit until their fetch ends, so a
    /// replacement pool never pushes concurrency past the configured count.
    fn shutdown_pool(&self, pool: WorkerPool) {
        pool.retire.store(true, Ordering::SeqCst);
        for _ in 0..pool.handles.len() {
            self.shared.queue.push_shutdown();
        }
        self.shared.gate.wake_all();
        for (worker_id, handle) in pool.handles.into_iter().enumerate() {
            let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("DurationFetcher: worker {} panicked", worker_id);
                }
            } else {
                warn!(
                    "DurationFetcher: worker {} did not stop within {:?}, abandoning it",
                    worker_id, WORKER_JOIN_TIMEOUT
                );
            }
        }
        self.shared.queue.discard_shutdowns();
        self.shared
            .slots
            .write()
            .expect("worker slots lock poisoned")
            .clear();
    }

    /// Cache, queue, worker and fetch counters right now.
    pub fn cache_statistics(&self) -> FetchStatisticsSnapshot {
        self.shared.snapshot()
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
        self.shared.publish_stats(true);
    }

    /// Applies new settings; a changed worker count restarts a running pool.
    pub fn update_settings(&self, settings: DurationFetchSettings) {
        let settings = settings.sanitized();
        let previous = std::mem::replace(
            &mut *self
                .shared
                .settings
                .write()
                .expect("fetch settings lock poisoned"),
            settings.clone(),
        );
        if previous == settings {
            return;
        }

        self.shared.cache.apply_settings(&settings);
        self.shared.queue.set_capacity(settings.queue_capacity);
        self.shared
            .queue
            .set_tie_break_policy(settings.tie_break_policy());

        if !self.custom_backends
            && (previous.ytdlp_path != settings.ytdlp_path
                || previous.cookies_file != settings.cookies_file)
        {
            *self
                .shared
                .backends
                .write()
                .expect("fetch backends lock poisoned") =
                FetchBackends::from_settings(&settings, &self.config_dir);
        }

        if previous.worker_thread_count != settings.worker_thread_count {
            self.shared.gate.set_limit(settings.worker_thread_count);
            if !self.shared.is_stopping() {
                self.restart_pool(previous.worker_thread_count);
            }
        }
        self.shared.publish_stats(true);
    }

    /// Swaps a running pool for one sized by the current settings.
    ///
    /// The old pool is joined without holding the pool lock so enqueue never waits
    /// on it. Requests queued meanwhile wait for the replacement pool.
    fn restart_pool(&self, previous_count: usize) {
        let running = {
            let mut pool = self.pool.lock().expect("worker pool lock poisoned");
            match std::mem::replace(&mut *pool, PoolState::Restarting) {
                PoolState::Running(running) => running,
                other => {
                    *pool = other;
                    return;
                }
            }
        };
        self.shutdown_pool(running);

        let mut pool = self.pool.lock().expect("worker pool lock poisoned");
        if self.shared.is_stopping() {
            *pool = PoolState::Idle;
            return;
        }
        let worker_count = self.shared.settings().worker_thread_count;
        info!(
            "DurationFetcher: restarting pool with {} workers (was {})",
            worker_count, previous_count
        );
        *pool = PoolState::Running(self.spawn_pool(worker_count));
    }

    /// Stops the workers, drops pending requests and saves the cache once.
    ///
    /// Blocks for at most `WORKER_JOIN_TIMEOUT` per worker. Idempotent.
    pub fn stop(&self) {
        if !self.shared.begin_stop() {
            return;
        }
        info!("DurationFetcher: stopping");
        let running = {
            let mut pool = self.pool.lock().expect("worker pool lock poisoned");
            match std::mem::replace(&mut *pool, PoolState::Idle) {
                PoolState::Running(running) => Some(running),
                // The restart in progress sees the stop and leaves the pool idle.
                PoolState::Restarting => {
                    *pool = PoolState::Restarting;
                    None
                }
                PoolState::Idle => None,
            }
        };
        if let Some(running) = running {
            self.shutdown_pool(running);
        }
        let flusher = self.flusher.lock().expect("cache flusher lock poisoned").take();
        if let Some(flusher) = flusher {
            flusher.stop();
        }
        let cancelled = self.shared.queue.clear();
        if cancelled > 0 {
            debug!("DurationFetcher: cancelled {} queued requests", cancelled);
        }
        self.shared.cache.save();
        self.shared.publish_stats(true);
        info!("DurationFetcher: stopped");
    }
}

impl Drop for DurationFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}
