//! Persistent duration cache.
//!
//! Maps `sha256(normalize(url))` to a fetched duration. Entries expire after
//! `cache_max_age_days`, the map is capped at `cache_max_entries` (oldest
//! `cached_at` evicted first), and the JSON file is replaced atomically so a reader
//! never sees a partial write. Any I/O failure is logged and the cache keeps working
//! in memory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde_json::Value;

use crate::media_url;
use crate::settings::DurationFetchSettings;

pub const CACHE_FILE_NAME: &str = "duration_cache.json";
const CACHE_FORMAT_VERSION: &str = "1.0";

/// One cached duration. Replaced wholesale on re-fetch, never mutated in place.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheEntry {
    #[serde(rename = "duration", default)]
    pub duration_secs: u64,
    /// Unix epoch seconds.
    #[serde(rename = "timestamp", default)]
    pub cached_at: f64,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub retries: u32,
}

impl CacheEntry {
    pub fn new(duration_secs: u64, source: impl Into<String>) -> Self {
        Self {
            duration_secs,
            cached_at: now_unix_secs(),
            source: source.into(),
            retries: 0,
        }
    }
}

fn default_source() -> String {
    "unknown".to_string()
}

/// Lifetime counters, persisted alongside the entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CacheCounters {
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub expired: u64,
    #[serde(default)]
    pub evicted: u64,
}

/// Cache statistics with derived values.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub expired: u64,
    pub evicted: u64,
    pub cache_file_exists: bool,
    pub cache_file_size: u64,
    /// Persistence attempts since this cache was opened.
    pub saves: u64,
}

#[derive(Debug)]
pub enum CacheError {
    Io(std::io::Error),
    Serialize(serde_json::Error),
    Parse(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Serialize(err) => write!(f, "Serialization error: {}", err),
            Self::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err)
    }
}

#[derive(serde::Serialize)]
struct CacheFileOut<'a> {
    cache: &'a HashMap<String, CacheEntry>,
    stats: &'a CacheCounters,
    last_updated: f64,
    version: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CachePolicy {
    enabled: bool,
    max_age_secs: Option<f64>,
    max_entries: usize,
    save_every_writes: u32,
}

impl CachePolicy {
    fn from_settings(settings: &DurationFetchSettings) -> Self {
        Self {
            enabled: settings.cache_enabled,
            max_age_secs: settings.cache_max_age().map(|age| age.as_secs_f64()),
            max_entries: settings.cache_max_entries.max(1),
            save_every_writes: settings.cache_save_every_writes.max(1),
        }
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    counters: CacheCounters,
    policy: CachePolicy,
    writes_since_save: u32,
}

impl CacheState {
    fn is_expired(&self, entry: &CacheEntry, now: f64) -> bool {
        self.policy
            .max_age_secs
            .is_some_and(|max_age| now - entry.cached_at > max_age)
    }

    fn sweep_expired(&mut self, now: f64) -> usize {
        let Some(max_age) = self.policy.max_age_secs else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.cached_at <= max_age);
        let removed = before - self.entries.len();
        self.counters.expired += removed as u64;
        removed
    }

    fn enforce_size_limit(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.policy.max_entries);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(f64, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.cached_at, key.clone()))
            .collect();
        by_age.sort_by(|left, right| left.0.total_cmp(&right.0).then_with(|| left.1.cmp(&right.1)));
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        self.counters.evicted += excess as u64;
        excess
    }
}

/// Thread-safe persistent duration cache.
pub struct DurationCache {
    cache_file: PathBuf,
    state: Mutex<CacheState>,
    persist_lock: Mutex<()>,
    saves: AtomicU64,
}

impl DurationCache {
    /// Opens the cache stored in `config_dir`, loading and sweeping any existing file.
    pub fn open(config_dir: &Path, settings: &DurationFetchSettings) -> Self {
        let cache = Self {
            cache_file: config_dir.join(CACHE_FILE_NAME),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                counters: CacheCounters::default(),
                policy: CachePolicy::from_settings(settings),
                writes_since_save: 0,
            }),
            persist_lock: Mutex::new(()),
            saves: AtomicU64::new(0),
        };
        cache.load();
        cache
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// Applies new limits; shrinks immediately if the cap went down.
    pub fn apply_settings(&self, settings: &DurationFetchSettings) {
        let mut state = self.state.lock().expect("duration cache lock poisoned");
        state.policy = CachePolicy::from_settings(settings);
        if state.policy.enabled {
            let evicted = state.enforce_size_limit();
            if evicted > 0 {
                debug!("DurationCache: evicted {} entries after settings change", evicted);
            }
        }
    }

    /// Cached duration for `url`, or `None` on miss, expiry or disabled cache.
    pub fn get(&self, url: &str) -> Option<u64> {
        if url.is_empty() {
            return None;
        }
        let key = media_url::cache_key(url);
        let now = now_unix_secs();
        let mut state = self.state.lock().expect("duration cache lock poisoned");
        if !state.policy.enabled {
            return None;
        }
        let Some(entry) = state.entries.get(&key) else {
            state.counters.misses += 1;
            return None;
        };
        if state.is_expired(entry, now) {
            state.entries.remove(&key);
            state.counters.expired += 1;
            state.counters.misses += 1;
            return None;
        }
        let duration = entry.duration_secs;
        state.counters.hits += 1;
        Some(duration)
    }

    pub fn has(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    /// Stores a fresh entry for `url`.
    pub fn set(&self, url: &str, duration_secs: u64, source: &str) {
        self.insert_entry(url, CacheEntry::new(duration_secs, source));
    }

    /// Writes `entry` as-is, enforces the size cap and saves every Nth write.
    pub fn insert_entry(&self, url: &str, entry: CacheEntry) {
        if url.is_empty() {
            return;
        }
        let key = media_url::cache_key(url);
        let should_save = {
            let mut state = self.state.lock().expect("duration cache lock poisoned");
            if !state.policy.enabled {
                return;
            }
            state.entries.insert(key, entry);
            state.enforce_size_limit();
            state.writes_since_save += 1;
            if state.writes_since_save >= state.policy.save_every_writes {
                state.writes_since_save = 0;
                true
            } else {
                false
            }
        };
        if should_save {
            self.save();
        }
    }

    pub fn remove(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let key = media_url::cache_key(url);
        self.state
            .lock()
            .expect("duration cache lock poisoned")
            .entries
            .remove(&key)
            .is_some()
    }

    /// Empties entries and counters, then persists.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock().expect("duration cache lock poisoned");
            state.entries.clear();
            state.counters = CacheCounters::default();
            state.writes_since_save = 0;
        }
        info!("DurationCache: cleared");
        self.save();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("duration cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, counters) = {
            let state = self.state.lock().expect("duration cache lock poisoned");
            (state.entries.len(), state.counters)
        };
        let lookups = counters.hits + counters.misses;
        let hit_rate = if lookups > 0 {
            counters.hits as f64 / lookups as f64
        } else {
            0.0
        };
        let file_size = fs::metadata(&self.cache_file).ok().map(|meta| meta.len());
        CacheStats {
            entries,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate,
            expired: counters.expired,
            evicted: counters.evicted,
            cache_file_exists: file_size.is_some(),
            cache_file_size: file_size.unwrap_or(0),
            saves: self.saves.load(Ordering::Relaxed),
        }
    }

    /// Persists the cache; failures are logged and otherwise ignored.
    pub fn save(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.try_save() {
            warn!(
                "DurationCache: Failed saving cache {}: {}",
                self.cache_file.display(),
                err
            );
        }
    }

    fn try_save(&self) -> Result<(), CacheError> {
        let _persist_guard = self.persist_lock.lock().expect("cache persist lock poisoned");
        let serialized = {
            let state = self.state.lock().expect("duration cache lock poisoned");
            serde_json::to_string_pretty(&CacheFileOut {
                cache: &state.entries,
                stats: &state.counters,
                last_updated: now_unix_secs(),
                version: CACHE_FORMAT_VERSION,
            })?
        };
        if let Some(parent) = self.cache_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = temp_path_for(&self.cache_file);
        if let Err(err) = fs::write(&temp_path, serialized) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&temp_path, &self.cache_file) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn load(&self) {
        if !self.cache_file.exists() {
            return;
        }
        match read_cache_file(&self.cache_file) {
            Ok((entries, counters, skipped)) => {
                let mut state = self.state.lock().expect("duration cache lock poisoned");
                state.entries = entries;
                state.counters = counters;
                let expired = if state.policy.enabled {
                    state.sweep_expired(now_unix_secs())
                } else {
                    0
                };
                debug!(
                    "DurationCache: loaded {} entries ({} expired, {} corrupted skipped)",
                    state.entries.len(),
                    expired,
                    skipped
                );
            }
            Err(err) => {
                warn!(
                    "DurationCache: Failed loading cache {}: {}",
                    self.cache_file.display(),
                    err
                );
            }
        }
    }
}

fn read_cache_file(
    path: &Path,
) -> Result<(HashMap<String, CacheEntry>, CacheCounters, usize), CacheError> {
    let contents = fs::read_to_string(path)?;
    let root: Value =
        serde_json::from_str(&contents).map_err(|err| CacheError::Parse(err.to_string()))?;
    let Some(raw_entries) = root.get("cache").and_then(Value::as_object) else {
        return Err(CacheError::Parse("missing \"cache\" object".to_string()));
    };

    let mut entries = HashMap::with_capacity(raw_entries.len());
    let mut skipped = 0usize;
    for (key, raw_entry) in raw_entries {
        match serde_json::from_value::<CacheEntry>(raw_entry.clone()) {
            Ok(entry) => {
                entries.insert(key.clone(), entry);
            }
            Err(_) => skipped += 1,
        }
    }
    let counters = root
        .get("stats")
        .cloned()
        .and_then(|stats| serde_json::from_value::<CacheCounters>(stats).ok())
        .unwrap_or_default();
    Ok((entries, counters, skipped))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub(crate) fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
