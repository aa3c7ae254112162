//! Event-bus protocol shared by the fetcher and its collaborators.
//!
//! This module defines the playlist item descriptor handed in by callers, the
//! closed set of fetchable media sources, and every event payload broadcast back.

use std::path::PathBuf;

use crate::duration_cache::CacheStats;
use crate::errors::FetchErrorKind;
use crate::media_url::{self, KIND_BILIBILI, KIND_LOCAL, KIND_YOUTUBE};

/// Request priority. Higher variants are dispatched first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FetchPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

/// Playlist item as supplied by a collaborator.
///
/// `item_type` is kept as free-form text because playlists carry kinds this crate
/// does not fetch (streams, placeholders); [`PlaylistItem::media_source`] resolves
/// it into the closed [`MediaSource`] set.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaylistItem {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    /// Known duration in seconds, if the playlist already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PlaylistItem {
    pub fn new(url: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            item_type: item_type.into(),
            duration: None,
            title: None,
        }
    }

    pub fn local(url: impl Into<String>) -> Self {
        Self::new(url, KIND_LOCAL)
    }

    pub fn youtube(url: impl Into<String>) -> Self {
        Self::new(url, KIND_YOUTUBE)
    }

    pub fn bilibili(url: impl Into<String>) -> Self {
        Self::new(url, KIND_BILIBILI)
    }

    /// Builds an item from a bare reference, guessing its type from the shape.
    pub fn from_reference(reference: &str) -> Self {
        Self::new(reference, media_url::classify_reference(reference))
    }

    pub fn has_duration(&self) -> bool {
        self.duration.is_some_and(|seconds| seconds > 0)
    }

    /// Resolves the fetch strategy target, or `None` for unsupported kinds and empty URLs.
    pub fn media_source(&self) -> Option<MediaSource> {
        if self.url.is_empty() {
            return None;
        }
        match self.item_type.as_str() {
            KIND_LOCAL => Some(MediaSource::Local {
                path: media_url::reference_to_path(&self.url),
            }),
            KIND_YOUTUBE => Some(MediaSource::Remote {
                platform: RemotePlatform::YouTube,
                url: self.url.clone(),
            }),
            KIND_BILIBILI => Some(MediaSource::Remote {
                platform: RemotePlatform::Bilibili,
                url: self.url.clone(),
            }),
            _ => None,
        }
    }
}

/// Remote platforms with a dedicated extraction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePlatform {
    YouTube,
    Bilibili,
}

impl RemotePlatform {
    pub fn label(self) -> &'static str {
        match self {
            Self::YouTube => KIND_YOUTUBE,
            Self::Bilibili => KIND_BILIBILI,
        }
    }
}

/// Fetchable media, resolved once at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Local { path: PathBuf },
    Remote { platform: RemotePlatform, url: String },
}

/// Outcome of one `enqueue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EnqueueOutcome {
    /// Requests pushed onto the queue.
    pub queued: usize,
    /// Items answered immediately from the cache.
    pub cache_hits: usize,
    /// Items skipped (known duration, unsupported kind, empty URL).
    pub skipped: usize,
    /// Items dropped because the queue was full.
    pub truncated: usize,
}

/// Aggregate fetch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FetchStats {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cache_hits: u64,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub active: bool,
    pub current_url: Option<String>,
}

/// Combined cache, queue, worker and fetch statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FetchStatisticsSnapshot {
    pub cache: CacheStats,
    pub queue_size: usize,
    pub workers: Vec<WorkerStatus>,
    pub fetch_stats: FetchStats,
}

/// Events broadcast by the fetcher.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    DurationReady {
        playlist_index: usize,
        duration_secs: u64,
        source: String,
    },
    FetchProgress {
        completed: u64,
        total: u64,
    },
    FetchError {
        playlist_index: usize,
        kind: FetchErrorKind,
        message: String,
        retry_count: u32,
    },
    StatsUpdated(Box<FetchStatisticsSnapshot>),
}

impl FetchEvent {
    /// Playlist index for per-item terminal events.
    pub fn terminal_index(&self) -> Option<usize> {
        match self {
            Self::DurationReady { playlist_index, .. } | Self::FetchError { playlist_index, .. } => {
                Some(*playlist_index)
            }
            Self::FetchProgress { .. } | Self::StatsUpdated(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_is_ascending_by_urgency() {
        assert!(FetchPriority::Urgent > FetchPriority::High);
        assert!(FetchPriority::High > FetchPriority::Normal);
        assert!(FetchPriority::Normal > FetchPriority::Low);
    }

    #[test]
    fn test_media_source_resolution() {
        assert_eq!(
            PlaylistItem::local("file:///a.mp4").media_source(),
            Some(MediaSource::Local {
                path: PathBuf::from("/a.mp4")
            })
        );
        assert_eq!(
            PlaylistItem::bilibili("https://www.bilibili.com/video/BV1").media_source(),
            Some(MediaSource::Remote {
                platform: RemotePlatform::Bilibili,
                url: "https://www.bilibili.com/video/BV1".to_string(),
            })
        );
        assert_eq!(PlaylistItem::new("https://x/a", "stream").media_source(), None);
        assert_eq!(PlaylistItem::youtube("").media_source(), None);
    }

    #[test]
    fn test_playlist_item_deserializes_type_field() {
        let item: PlaylistItem =
            serde_json::from_str(r#"{"url": "https://youtu.be/x", "type": "youtube", "duration": 0}"#)
                .expect("item should parse");
        assert_eq!(item.item_type, "youtube");
        assert!(!item.has_duration());
    }
}
