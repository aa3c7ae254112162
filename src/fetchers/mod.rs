//! Duration fetch strategies.
//!
//! Local files go through a headless [`PlaybackEngine`] that is polled until it
//! reports a duration. Remote references go through an ordered list of
//! [`DurationExtractor`]s; the first one that succeeds wins.

pub mod bilibili_api;
pub mod local_probe;
pub mod ytdlp;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::FetchError;
use crate::protocol::RemotePlatform;
use crate::settings::DurationFetchSettings;

pub use bilibili_api::BilibiliApiExtractor;
pub use local_probe::SymphoniaProbeEngine;
pub use ytdlp::YtDlpExtractor;

/// Successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDuration {
    /// Fractional seconds as reported by the source.
    pub seconds: f64,
    pub source: String,
}

impl FetchedDuration {
    pub fn new(seconds: f64, source: impl Into<String>) -> Self {
        Self {
            seconds,
            source: source.into(),
        }
    }

    /// Whole seconds, truncated.
    pub fn whole_seconds(&self) -> u64 {
        self.seconds.max(0.0) as u64
    }
}

/// Headless media engine used to probe local files. It never produces output.
pub trait PlaybackEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Source label reported on success.
    fn source_label(&self) -> &'static str {
        "local-probe"
    }

    /// Opens `path`; the returned session is polled until it knows the duration.
    fn load(&self, path: &Path) -> Result<Box<dyn ProbeSession>, FetchError>;
}

/// One loaded file.
pub trait ProbeSession: Send {
    /// Advances the probe a bounded amount. `Ok(None)` means "not known yet".
    fn poll_duration(&mut self) -> Result<Option<f64>, FetchError>;
}

/// Remote metadata extractor.
pub trait DurationExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, platform: RemotePlatform) -> bool;

    fn extract(
        &self,
        url: &str,
        platform: RemotePlatform,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError>;
}

/// Engines handed to every worker.
#[derive(Clone)]
pub struct FetchBackends {
    pub playback: Arc<dyn PlaybackEngine>,
    /// Tried in order.
    pub remote: Vec<Arc<dyn DurationExtractor>>,
}

impl FetchBackends {
    pub fn new(playback: Arc<dyn PlaybackEngine>, remote: Vec<Arc<dyn DurationExtractor>>) -> Self {
        Self { playback, remote }
    }

    /// Production engines: symphonia/lofty locally, the Bilibili API then yt-dlp remotely.
    pub fn from_settings(settings: &DurationFetchSettings, config_dir: &Path) -> Self {
        Self {
            playback: Arc::new(SymphoniaProbeEngine::new()),
            remote: vec![
                Arc::new(BilibiliApiExtractor::new()) as Arc<dyn DurationExtractor>,
                Arc::new(YtDlpExtractor::new(
                    settings.ytdlp_path.clone(),
                    settings.resolved_cookies_file(config_dir),
                )),
            ],
        }
    }

    /// Extractors able to handle `platform`, in preference order.
    pub fn extractors_for(
        &self,
        platform: RemotePlatform,
    ) -> impl Iterator<Item = &Arc<dyn DurationExtractor>> + '_ {
        self.remote
            .iter()
            .filter(move |extractor| extractor.supports(platform))
    }
}
