//! Background media duration fetching: a prioritized worker pool in front of a
//! persistent, normalized, size- and age-bounded duration cache.

pub mod duration_cache;
pub mod duration_fetcher;
pub mod errors;
pub mod fetch_queue;
pub mod fetch_request;
mod fetch_worker;
pub mod fetchers;
pub mod media_url;
pub mod protocol;
pub mod settings;

pub use duration_cache::{CacheEntry, CacheError, CacheStats, DurationCache};
pub use duration_fetcher::DurationFetcher;
pub use errors::{FetchError, FetchErrorKind};
pub use fetch_queue::{FetchQueue, QueueFull, QueuePop};
pub use fetch_request::{FetchRequest, TieBreakPolicy};
pub use fetchers::{DurationExtractor, FetchBackends, FetchedDuration, PlaybackEngine, ProbeSession};
pub use protocol::{
    EnqueueOutcome, FetchEvent, FetchPriority, FetchStatisticsSnapshot, FetchStats, MediaSource,
    PlaylistItem, RemotePlatform, WorkerStatus,
};
pub use settings::DurationFetchSettings;
