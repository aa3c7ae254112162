//! Persistent duration-fetch configuration model and defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::fetch_request::TieBreakPolicy;

pub const SETTINGS_FILE_NAME: &str = "duration_fetch_settings.json";
pub const MIN_WORKER_THREADS: usize = 1;
pub const MAX_WORKER_THREADS: usize = 8;
const MAX_FETCH_TIMEOUT_SECS: u64 = 600;

/// Duration fetch configuration persisted to `duration_fetch_settings.json`.
///
/// Every field carries a serde default so files written by older builds (or edited
/// by hand) load without error.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DurationFetchSettings {
    #[serde(default = "default_true")]
    pub auto_fetch_enabled: bool,
    #[serde(default = "default_worker_thread_count")]
    pub worker_thread_count: usize,
    /// Per-fetch timeout, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Entries older than this are treated as misses. `0` disables expiry.
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: u32,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Number of cache writes between opportunistic saves.
    #[serde(default = "default_cache_save_every_writes")]
    pub cache_save_every_writes: u32,
    #[serde(default = "default_true")]
    pub prioritize_visible: bool,
    /// Newest-first tie-break within a priority band when set, FIFO otherwise.
    #[serde(default = "default_true")]
    pub prioritize_recent: bool,
    #[serde(default = "default_delay_between_fetches_ms")]
    pub delay_between_fetches_ms: u64,
    /// Highest retry count accepted for caller-driven re-enqueues.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pending request limit. `0` means unbounded.
    #[serde(default)]
    pub queue_capacity: usize,
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
}

impl Default for DurationFetchSettings {
    fn default() -> Self {
        Self {
            auto_fetch_enabled: true,
            worker_thread_count: default_worker_thread_count(),
            fetch_timeout: default_fetch_timeout(),
            cache_enabled: true,
            cache_max_age_days: default_cache_max_age_days(),
            cache_max_entries: default_cache_max_entries(),
            cache_save_every_writes: default_cache_save_every_writes(),
            prioritize_visible: true,
            prioritize_recent: true,
            delay_between_fetches_ms: default_delay_between_fetches_ms(),
            max_retries: default_max_retries(),
            queue_capacity: 0,
            ytdlp_path: default_ytdlp_path(),
            cookies_file: None,
        }
    }
}

impl DurationFetchSettings {
    /// Clamps values into the ranges the fetcher can honour.
    pub fn sanitized(self) -> Self {
        let ytdlp_path = if self.ytdlp_path.trim().is_empty() {
            default_ytdlp_path()
        } else {
            self.ytdlp_path.trim().to_string()
        };
        Self {
            worker_thread_count: self
                .worker_thread_count
                .clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS),
            fetch_timeout: self.fetch_timeout.clamp(1, MAX_FETCH_TIMEOUT_SECS),
            cache_max_entries: self.cache_max_entries.max(1),
            cache_save_every_writes: self.cache_save_every_writes.max(1),
            ytdlp_path,
            ..self
        }
    }

    pub fn fetch_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn delay_between_fetches(&self) -> Duration {
        Duration::from_millis(self.delay_between_fetches_ms)
    }

    pub fn cache_max_age(&self) -> Option<Duration> {
        (self.cache_max_age_days > 0)
            .then(|| Duration::from_secs(u64::from(self.cache_max_age_days) * 24 * 60 * 60))
    }

    pub fn tie_break_policy(&self) -> TieBreakPolicy {
        if self.prioritize_recent {
            TieBreakPolicy::NewestFirst
        } else {
            TieBreakPolicy::OldestFirst
        }
    }

    /// Resolves the cookies file: the configured one, else `cookies.txt` next to the settings.
    pub fn resolved_cookies_file(&self, config_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = self.cookies_file.as_ref() {
            return path.exists().then(|| path.clone());
        }
        let fallback = config_dir.join("cookies.txt");
        fallback.exists().then_some(fallback)
    }

    /// Loads settings from `path`, falling back to defaults when missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(
                    "Settings: No readable settings at {} ({}), using defaults",
                    path.display(),
                    err
                );
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&contents) {
            Ok(settings) => settings.sanitized(),
            Err(err) => {
                warn!(
                    "Settings: Failed parsing settings at {}: {}",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Writes settings atomically (temp file, then rename).
    pub fn persist(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                format!(
                    "Failed creating settings directory {}: {}",
                    parent.display(),
                    err
                )
            })?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|err| format!("Failed serializing settings: {err}"))?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serialized)
            .map_err(|err| format!("Failed writing {}: {}", temp_path.display(), err))?;
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            format!("Failed replacing {}: {}", path.display(), err)
        })
    }
}

/// Default directory for the settings, cache and cookies files.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("durafetch")
}

fn default_true() -> bool {
    true
}

fn default_worker_thread_count() -> usize {
    2
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_cache_max_age_days() -> u32 {
    30
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_save_every_writes() -> u32 {
    10
}

fn default_delay_between_fetches_ms() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "durafetch_settings_{}_{}_{}",
            test_name,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = DurationFetchSettings::default();
        assert_eq!(settings.worker_thread_count, 2);
        assert_eq!(settings.fetch_timeout, 30);
        assert_eq!(settings.cache_max_age_days, 30);
        assert_eq!(settings.cache_max_entries, 10_000);
        assert_eq!(settings.delay_between_fetches_ms, 300);
        assert_eq!(settings.tie_break_policy(), TieBreakPolicy::NewestFirst);
    }

    #[test]
    fn test_partial_file_fills_missing_fields_with_defaults() {
        let parsed: DurationFetchSettings =
            serde_json::from_str(r#"{"worker_thread_count": 4, "prioritize_recent": false}"#)
                .expect("partial settings should parse");
        assert_eq!(parsed.worker_thread_count, 4);
        assert_eq!(parsed.tie_break_policy(), TieBreakPolicy::OldestFirst);
        assert_eq!(parsed.fetch_timeout, 30);
        assert!(parsed.cache_enabled);
    }

    #[test]
    fn test_sanitized_clamps_worker_count_and_timeout() {
        let settings = DurationFetchSettings {
            worker_thread_count: 64,
            fetch_timeout: 0,
            cache_max_entries: 0,
            ytdlp_path: "   ".to_string(),
            ..DurationFetchSettings::default()
        }
        .sanitized();
        assert_eq!(settings.worker_thread_count, MAX_WORKER_THREADS);
        assert_eq!(settings.fetch_timeout, 1);
        assert_eq!(settings.cache_max_entries, 1);
        assert_eq!(settings.ytdlp_path, "yt-dlp");

        let zero_workers = DurationFetchSettings {
            worker_thread_count: 0,
            ..DurationFetchSettings::default()
        }
        .sanitized();
        assert_eq!(zero_workers.worker_thread_count, MIN_WORKER_THREADS);
    }

    #[test]
    fn test_zero_max_age_disables_expiry() {
        let settings = DurationFetchSettings {
            cache_max_age_days: 0,
            ..DurationFetchSettings::default()
        };
        assert!(settings.cache_max_age().is_none());
    }

    #[test]
    fn test_persist_then_load_roundtrip() {
        let dir = unique_temp_dir("roundtrip");
        let path = dir.join(SETTINGS_FILE_NAME);
        let settings = DurationFetchSettings {
            worker_thread_count: 3,
            queue_capacity: 50,
            ..DurationFetchSettings::default()
        };
        settings.persist(&path).expect("settings should persist");
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = DurationFetchSettings::load(&path);
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_loads_defaults() {
        let dir = unique_temp_dir("corrupt");
        fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join(SETTINGS_FILE_NAME);
        fs::write(&path, "{ not json").expect("temp file should be writable");
        assert_eq!(
            DurationFetchSettings::load(&path),
            DurationFetchSettings::default()
        );
        let _ = fs::remove_dir_all(dir);
    }
}
