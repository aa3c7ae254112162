//! Worker loop: pop, short-circuit through the cache, dispatch by media kind, report.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::duration_fetcher::FetchShared;
use crate::errors::FetchError;
use crate::fetch_queue::QueuePop;
use crate::fetch_request::FetchRequest;
use crate::fetchers::{FetchBackends, FetchedDuration};
use crate::protocol::{MediaSource, RemotePlatform, WorkerStatus};

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const THROTTLE_SLICE: Duration = Duration::from_millis(50);

/// Observable state of one worker.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    worker_id: usize,
    current_url: Mutex<Option<String>>,
}

impl WorkerSlot {
    pub(crate) fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            current_url: Mutex::new(None),
        }
    }

    fn set_current(&self, url: Option<&str>) {
        *self.current_url.lock().expect("worker slot lock poisoned") = url.map(str::to_string);
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        let current_url = self
            .current_url
            .lock()
            .expect("worker slot lock poisoned")
            .clone();
        WorkerStatus {
            worker_id: self.worker_id,
            active: current_url.is_some(),
            current_url,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    limit: usize,
    held: usize,
}

/// Caps in-flight requests across every pool generation, including workers
/// abandoned by a restart that are still finishing a fetch.
#[derive(Debug, Default)]
pub(crate) struct FetchGate {
    state: Mutex<GateState>,
    released: Condvar,
}

/// Held while a worker pops and handles one request.
pub(crate) struct FetchPermit<'a> {
    gate: &'a FetchGate,
}

impl FetchGate {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                limit: limit.max(1),
                held: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.state.lock().expect("fetch gate lock poisoned").limit = limit.max(1);
        self.released.notify_all();
    }

    /// Waits up to `timeout` for a free permit.
    pub(crate) fn acquire(&self, timeout: Duration) -> Option<FetchPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("fetch gate lock poisoned");
        loop {
            if state.held < state.limit {
                state.held += 1;
                return Some(FetchPermit { gate: self });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next_state, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .expect("fetch gate lock poisoned");
            state = next_state;
        }
    }

    /// Wakes every waiter so it can re-check its stop flags.
    pub(crate) fn wake_all(&self) {
        self.released.notify_all();
    }

    pub(crate) fn held(&self) -> usize {
        self.state.lock().expect("fetch gate lock poisoned").held
    }
}

impl Drop for FetchPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().expect("fetch gate lock poisoned");
        state.held = state.held.saturating_sub(1);
        drop(state);
        self.gate.released.notify_one();
    }
}

/// Everything a worker thread owns or shares.
///
/// `retire` is per pool: a retiring worker finishes what it already popped and
/// then exits. Only a fetcher-wide stop cancels or drops work.
pub(crate) struct FetchWorker {
    shared: Arc<FetchShared>,
    slot: Arc<WorkerSlot>,
    retire: Arc<AtomicBool>,
}

impl FetchWorker {
    pub(crate) fn new(shared: Arc<FetchShared>, slot: Arc<WorkerSlot>, retire: Arc<AtomicBool>) -> Self {
        Self {
            shared,
            slot,
            retire,
        }
    }

    fn retiring(&self) -> bool {
        self.retire.load(Ordering::SeqCst) || self.shared.is_stopping()
    }

    pub(crate) fn run(&self) {
        let worker_id = self.slot.worker_id;
        debug!("FetchWorker[{}]: started", worker_id);
        while !self.retiring() {
            let Some(permit) = self.shared.gate.acquire(POP_TIMEOUT) else {
                continue;
            };
            let request = match self.shared.queue.pop(POP_TIMEOUT) {
                QueuePop::Request(request) => request,
                QueuePop::TimedOut => continue,
                QueuePop::Shutdown => break,
            };
            if self.shared.is_stopping() {
                debug!(
                    "FetchWorker[{}]: dropping {} popped during shutdown",
                    worker_id,
                    request.url()
                );
                break;
            }
            self.slot.set_current(Some(request.url()));
            let fetched = self.handle_request(&request);
            self.slot.set_current(None);
            drop(permit);
            if fetched {
                self.throttle();
            }
        }
        debug!("FetchWorker[{}]: exiting", worker_id);
    }

    /// Returns true when an external fetch was attempted.
    fn handle_request(&self, request: &FetchRequest) -> bool {
        if let Some(duration_secs) = self.shared.cache.get(request.url()) {
            self.shared
                .record_success(request.playlist_index, duration_secs, "cache");
            return false;
        }

        let settings = self.shared.settings();
        let backends = self.shared.backends();
        let timeout = settings.fetch_timeout_duration();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.fetch_duration(&backends, &request.source, timeout)
        }))
        .unwrap_or_else(|payload| {
            Err(FetchError::Failed(format!(
                "Fetch panicked: {}",
                panic_payload_to_string(payload.as_ref())
            )))
        });

        match outcome {
            Ok(fetched) => {
                let duration_secs = fetched.whole_seconds();
                self.shared
                    .cache
                    .set(request.url(), duration_secs, &fetched.source);
                self.shared
                    .record_success(request.playlist_index, duration_secs, &fetched.source);
            }
            Err(FetchError::Cancelled) if self.shared.is_stopping() => {
                debug!(
                    "FetchWorker[{}]: cancelled {} during shutdown",
                    self.slot.worker_id,
                    request.url()
                );
            }
            Err(err) => {
                if matches!(err, FetchError::ToolUnavailable(_)) {
                    warn!("FetchWorker[{}]: {}", self.slot.worker_id, err);
                } else {
                    debug!(
                        "FetchWorker[{}]: {} failed: {}",
                        self.slot.worker_id,
                        request.url(),
                        err
                    );
                }
                self.shared
                    .record_failure(request.playlist_index, &err, request.retry_count);
            }
        }
        true
    }

    fn fetch_duration(
        &self,
        backends: &FetchBackends,
        source: &MediaSource,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError> {
        match source {
            MediaSource::Local { path } => self.probe_local(backends, path, timeout),
            MediaSource::Remote { platform, url } => {
                self.extract_remote(backends, *platform, url, timeout)
            }
        }
    }

    fn probe_local(
        &self,
        backends: &FetchBackends,
        path: &Path,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError> {
        if !path.exists() {
            return Err(FetchError::NotFound(path.display().to_string()));
        }
        let deadline = Instant::now() + timeout;
        let engine = &backends.playback;
        let mut session = engine.load(path)?;
        loop {
            if self.shared.is_stopping() {
                return Err(FetchError::Cancelled);
            }
            if let Some(seconds) = session.poll_duration()? {
                if seconds > 0.0 {
                    return Ok(FetchedDuration::new(seconds, engine.source_label()));
                }
            }
            if Instant::now() >= deadline {
                return Err(FetchError::Timeout(format!(
                    "{} reported no duration for {} within {}s",
                    engine.name(),
                    path.display(),
                    timeout.as_secs()
                )));
            }
            thread::sleep(PROBE_POLL_INTERVAL);
        }
    }

    fn extract_remote(
        &self,
        backends: &FetchBackends,
        platform: RemotePlatform,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError> {
        let deadline = Instant::now() + timeout;
        let mut last_error = None;
        for extractor in backends.extractors_for(platform) {
            if self.shared.is_stopping() {
                return Err(FetchError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last_error.unwrap_or_else(|| FetchError::Timeout(String::new())));
            }
            match extractor.extract(url, platform, remaining) {
                Ok(fetched) if fetched.seconds > 0.0 => return Ok(fetched),
                Ok(_) => last_error = Some(FetchError::NoDuration),
                Err(err) if err.is_conclusive() => return Err(err),
                Err(err) => {
                    debug!(
                        "FetchWorker[{}]: {} could not resolve {}: {}",
                        self.slot.worker_id,
                        extractor.name(),
                        url,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            FetchError::ToolUnavailable(format!("no extractor for {}", platform.label()))
        }))
    }

    fn throttle(&self) {
        let delay = self.shared.settings().delay_between_fetches();
        let deadline = Instant::now() + delay;
        while !self.retiring() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(THROTTLE_SLICE));
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchErrorKind;
    use crate::fetchers::{DurationExtractor, PlaybackEngine, ProbeSession};
    use crate::protocol::{FetchEvent, FetchPriority, PlaylistItem};
    use crate::settings::DurationFetchSettings;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::broadcast::{self, Receiver};

    fn unique_temp_dir(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "durafetch_worker_{}_{}_{}",
            test_name,
            std::process::id(),
            nanos
        ))
    }

    struct SlowEngine {
        polls_until_ready: usize,
    }

    struct SlowSession {
        remaining: usize,
    }

    impl ProbeSession for SlowSession {
        fn poll_duration(&mut self) -> Result<Option<f64>, FetchError> {
            if self.remaining == 0 {
                return Ok(Some(61.9));
            }
            self.remaining -= 1;
            Ok(None)
        }
    }

    impl PlaybackEngine for SlowEngine {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn load(&self, _path: &Path) -> Result<Box<dyn ProbeSession>, FetchError> {
            Ok(Box::new(SlowSession {
                remaining: self.polls_until_ready,
            }))
        }
    }

    struct PanickingEngine;

    impl PlaybackEngine for PanickingEngine {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn load(&self, _path: &Path) -> Result<Box<dyn ProbeSession>, FetchError> {
            panic!("decoder exploded");
        }
    }

    struct ScriptedExtractor {
        label: &'static str,
        result: Result<f64, FetchError>,
        calls: AtomicUsize,
    }

    impl ScriptedExtractor {
        fn new(label: &'static str, result: Result<f64, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                label,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl DurationExtractor for ScriptedExtractor {
        fn name(&self) -> &'static str {
            self.label
        }

        fn supports(&self, _platform: RemotePlatform) -> bool {
            true
        }

        fn extract(
            &self,
            _url: &str,
            _platform: RemotePlatform,
            _timeout: Duration,
        ) -> Result<FetchedDuration, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .map(|seconds| FetchedDuration::new(seconds, self.label))
        }
    }

    fn test_settings() -> DurationFetchSettings {
        DurationFetchSettings {
            delay_between_fetches_ms: 0,
            fetch_timeout: 2,
            ..DurationFetchSettings::default()
        }
    }

    fn worker_with(
        dir: &Path,
        backends: FetchBackends,
    ) -> (FetchWorker, Arc<FetchShared>, Receiver<FetchEvent>) {
        let (bus, receiver) = broadcast::channel(256);
        let shared = Arc::new(FetchShared::new(dir, test_settings(), bus, backends));
        let worker = FetchWorker::new(
            Arc::clone(&shared),
            Arc::new(WorkerSlot::new(0)),
            Arc::new(AtomicBool::new(false)),
        );
        (worker, shared, receiver)
    }

    fn request_for(item: PlaylistItem) -> FetchRequest {
        FetchRequest::new(7, item, FetchPriority::Normal, 1).expect("fetchable item")
    }

    fn terminal_events(receiver: &mut Receiver<FetchEvent>) -> Vec<FetchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if event.terminal_index().is_some() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_local_probe_polls_until_duration_and_caches() {
        let dir = unique_temp_dir("local");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let media = dir.join("track.mp3");
        std::fs::write(&media, b"fake").expect("media file");
        let backends = FetchBackends::new(Arc::new(SlowEngine { polls_until_ready: 2 }), Vec::new());
        let (worker, shared, mut receiver) = worker_with(&dir, backends);

        let request = request_for(PlaylistItem::local(media.to_string_lossy().to_string()));
        assert!(worker.handle_request(&request));
        assert_eq!(shared.cache.get(request.url()), Some(61));
        match terminal_events(&mut receiver).as_slice() {
            [FetchEvent::DurationReady {
                playlist_index,
                duration_secs,
                source,
            }] => {
                assert_eq!(*playlist_index, 7);
                assert_eq!(*duration_secs, 61);
                assert_eq!(source, "local-probe");
            }
            other => panic!("unexpected events: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_local_file_reports_not_found_with_retry_count() {
        let dir = unique_temp_dir("missing");
        let backends = FetchBackends::new(Arc::new(SlowEngine { polls_until_ready: 0 }), Vec::new());
        let (worker, shared, mut receiver) = worker_with(&dir, backends);

        let request = request_for(PlaylistItem::local("/definitely/not/here.flac"));
        worker.handle_request(&request);
        match terminal_events(&mut receiver).as_slice() {
            [FetchEvent::FetchError {
                playlist_index,
                kind,
                retry_count,
                ..
            }] => {
                assert_eq!(*playlist_index, 7);
                assert_eq!(*kind, FetchErrorKind::NotFound);
                assert_eq!(*retry_count, 1);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(shared.fetch_stats().failed, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_panicking_engine_becomes_failure() {
        let dir = unique_temp_dir("panic");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let media = dir.join("track.ogg");
        std::fs::write(&media, b"fake").expect("media file");
        let backends = FetchBackends::new(Arc::new(PanickingEngine), Vec::new());
        let (worker, _shared, mut receiver) = worker_with(&dir, backends);

        worker.handle_request(&request_for(PlaylistItem::local(
            media.to_string_lossy().to_string(),
        )));
        match terminal_events(&mut receiver).as_slice() {
            [FetchEvent::FetchError { kind, message, .. }] => {
                assert_eq!(*kind, FetchErrorKind::Failed);
                assert!(message.contains("decoder exploded"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_remote_falls_back_until_success_and_stops_on_conclusive() {
        let dir = unique_temp_dir("remote");
        let flaky = ScriptedExtractor::new("flaky", Err(FetchError::Failed("503".into())));
        let good = ScriptedExtractor::new("good", Ok(212.7));
        let backends = FetchBackends::new(
            Arc::new(SlowEngine { polls_until_ready: 0 }),
            vec![flaky.clone() as Arc<dyn DurationExtractor>, good.clone()],
        );
        let (worker, shared, mut receiver) = worker_with(&dir, backends);
        let request = request_for(PlaylistItem::youtube("https://youtu.be/abc"));
        worker.handle_request(&request);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            shared.cache.get("https://www.youtube.com/watch?v=abc"),
            Some(212)
        );
        assert!(matches!(
            terminal_events(&mut receiver).as_slice(),
            [FetchEvent::DurationReady { source, .. }] if source == "good"
        ));

        let private = ScriptedExtractor::new(
            "private",
            Err(FetchError::AccessDenied("Private video".into())),
        );
        let never = ScriptedExtractor::new("never", Ok(1.0));
        let backends = FetchBackends::new(
            Arc::new(SlowEngine { polls_until_ready: 0 }),
            vec![private.clone() as Arc<dyn DurationExtractor>, never.clone()],
        );
        let (worker, _shared, mut receiver) = worker_with(&dir, backends);
        worker.handle_request(&request_for(PlaylistItem::youtube("https://youtu.be/xyz")));
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            terminal_events(&mut receiver).as_slice(),
            [FetchEvent::FetchError { kind: FetchErrorKind::AccessDenied, .. }]
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_no_extractor_reports_tool_unavailable() {
        let dir = unique_temp_dir("no_tool");
        let backends = FetchBackends::new(Arc::new(SlowEngine { polls_until_ready: 0 }), Vec::new());
        let (worker, _shared, mut receiver) = worker_with(&dir, backends);
        worker.handle_request(&request_for(PlaylistItem::bilibili(
            "https://www.bilibili.com/video/BV1xx",
        )));
        assert!(matches!(
            terminal_events(&mut receiver).as_slice(),
            [FetchEvent::FetchError { kind: FetchErrorKind::ToolUnavailable, .. }]
        ));
    }

    #[test]
    fn test_cached_url_short_circuits_without_fetching() {
        let dir = unique_temp_dir("cached");
        let extractor = ScriptedExtractor::new("remote", Ok(99.0));
        let backends = FetchBackends::new(
            Arc::new(SlowEngine { polls_until_ready: 0 }),
            vec![extractor.clone() as Arc<dyn DurationExtractor>],
        );
        let (worker, shared, mut receiver) = worker_with(&dir, backends);
        shared.cache.set("https://youtu.be/cached", 300, "yt-dlp");

        let fetched = worker.handle_request(&request_for(PlaylistItem::youtube(
            "https://www.youtube.com/watch?v=cached",
        )));
        assert!(!fetched);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            terminal_events(&mut receiver).as_slice(),
            [FetchEvent::DurationReady { duration_secs: 300, source, .. }] if source == "cache"
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    fn spawn_worker_on(
        shared: &Arc<FetchShared>,
        worker_id: usize,
    ) -> (thread::JoinHandle<()>, Arc<WorkerSlot>, Arc<AtomicBool>) {
        let retire = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(WorkerSlot::new(worker_id));
        let worker = FetchWorker::new(Arc::clone(shared), Arc::clone(&slot), Arc::clone(&retire));
        (thread::spawn(move || worker.run()), slot, retire)
    }

    fn wait_until_active(slot: &WorkerSlot) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !slot.status().active && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(slot.status().active, "worker never picked up its request");
    }

    #[test]
    fn test_fetcher_stop_cancels_probe_and_exits_loop() {
        let dir = unique_temp_dir("cancel");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let media = dir.join("endless.wav");
        std::fs::write(&media, b"fake").expect("media file");
        let backends = FetchBackends::new(
            Arc::new(SlowEngine {
                polls_until_ready: usize::MAX,
            }),
            Vec::new(),
        );
        let (bus, mut receiver) = broadcast::channel(64);
        let settings = DurationFetchSettings {
            fetch_timeout: 60,
            ..test_settings()
        };
        let shared = Arc::new(FetchShared::new(&dir, settings, bus, backends));
        shared
            .queue
            .push(request_for(PlaylistItem::local(
                media.to_string_lossy().to_string(),
            )))
            .expect("push");

        let (handle, slot, _retire) = spawn_worker_on(&shared, 3);
        wait_until_active(&slot);
        assert_eq!(slot.status().worker_id, 3);

        assert!(shared.begin_stop());
        shared.queue.push_shutdown();
        let started = Instant::now();
        handle.join().expect("worker should exit");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!slot.status().active);
        assert!(terminal_events(&mut receiver).is_empty());
        assert_eq!(shared.gate.held(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_retired_worker_finishes_in_flight_request_and_pops_nothing_more() {
        let dir = unique_temp_dir("retire");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let media = dir.join("slow.flac");
        std::fs::write(&media, b"fake").expect("media file");
        let backends = FetchBackends::new(Arc::new(SlowEngine { polls_until_ready: 5 }), Vec::new());
        let (bus, mut receiver) = broadcast::channel(64);
        let shared = Arc::new(FetchShared::new(&dir, test_settings(), bus, backends));
        let local = PlaylistItem::local(media.to_string_lossy().to_string());
        shared.queue.push(request_for(local.clone())).expect("push");

        let (handle, slot, retire) = spawn_worker_on(&shared, 0);
        wait_until_active(&slot);
        retire.store(true, Ordering::SeqCst);
        shared.queue.push_shutdown();
        shared
            .queue
            .push(FetchRequest::new(8, local, FetchPriority::Normal, 0).expect("fetchable item"))
            .expect("push");
        handle.join().expect("worker should exit");

        match terminal_events(&mut receiver).as_slice() {
            [FetchEvent::DurationReady {
                playlist_index: 7,
                duration_secs: 61,
                ..
            }] => {}
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(shared.queue.len(), 1, "the next request stays queued");
        assert_eq!(shared.gate.held(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_gate_caps_concurrent_permits() {
        let gate = FetchGate::new(1);
        let first = gate.acquire(Duration::from_millis(10)).expect("free permit");
        assert!(gate.acquire(Duration::from_millis(20)).is_none());
        assert_eq!(gate.held(), 1);

        gate.set_limit(2);
        let second = gate.acquire(Duration::from_millis(10)).expect("raised limit");
        assert_eq!(gate.held(), 2);

        gate.set_limit(1);
        drop(first);
        assert!(gate.acquire(Duration::from_millis(20)).is_none());
        drop(second);
        assert!(gate.acquire(Duration::from_millis(10)).is_some());
        assert_eq!(gate.held(), 0);
    }

    #[test]
    fn test_gate_release_wakes_waiter() {
        let gate = Arc::new(FetchGate::new(1));
        let held = gate.acquire(Duration::from_millis(10)).expect("free permit");
        let waiter_gate = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let acquired = waiter_gate.acquire(Duration::from_secs(10)).is_some();
            (acquired, started.elapsed())
        });
        thread::sleep(Duration::from_millis(30));
        drop(held);
        let (acquired, waited) = waiter.join().expect("waiter should finish");
        assert!(acquired);
        assert!(waited < Duration::from_secs(5));
    }
}
