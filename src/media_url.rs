//! Media reference helpers: classification, `file://` decoding and cache-key
//! normalization.
//!
//! Normalization maps every surface form of one media item onto a single canonical
//! string so equivalent references share a cache key:
//! - YouTube watch, short-link, shorts and embed URLs become
//!   `https://www.youtube.com/watch?v=<id>`.
//! - Bilibili video URLs become `https://www.bilibili.com/video/<BV…|av…>`.
//! - `file://` URLs and absolute paths become an absolute filesystem path.
//!
//! Unknown shapes pass through unchanged.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

pub const KIND_LOCAL: &str = "local";
pub const KIND_YOUTUBE: &str = "youtube";
pub const KIND_BILIBILI: &str = "bilibili";

const FILE_SCHEME_PREFIX: &str = "file://";

/// Guesses the playlist item type for a raw reference string.
pub fn classify_reference(reference: &str) -> &'static str {
    let lowered = reference.trim().to_ascii_lowercase();
    if is_youtube_reference(&lowered) {
        KIND_YOUTUBE
    } else if is_bilibili_reference(&lowered) {
        KIND_BILIBILI
    } else if lowered.starts_with(FILE_SCHEME_PREFIX) || !lowered.contains("://") {
        KIND_LOCAL
    } else {
        "unknown"
    }
}

fn is_youtube_reference(lowered: &str) -> bool {
    lowered.contains("youtube.com") || lowered.contains("youtu.be")
}

fn is_bilibili_reference(lowered: &str) -> bool {
    lowered.contains("bilibili.com")
}

/// Converts a stored local reference (`file://` URL or plain path) to a path.
pub fn reference_to_path(reference: &str) -> PathBuf {
    let Some(rest) = reference.strip_prefix(FILE_SCHEME_PREFIX) else {
        return PathBuf::from(reference);
    };
    // `file://localhost/a` and `file:///a` both address `/a`.
    let raw_path = rest.strip_prefix("localhost").unwrap_or(rest);
    let raw_path = raw_path.split(['?', '#']).next().unwrap_or(raw_path);
    let decoded = urlencoding::decode(raw_path)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());
    PathBuf::from(strip_windows_drive_slash(decoded))
}

#[cfg(windows)]
fn strip_windows_drive_slash(path: String) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[2] == b':' {
        path[1..].to_string()
    } else {
        path
    }
}

#[cfg(not(windows))]
fn strip_windows_drive_slash(path: String) -> String {
    path
}

/// Rewrites a media reference into its canonical form.
pub fn normalize_reference(reference: &str) -> String {
    if reference.is_empty() {
        return String::new();
    }
    let lowered = reference.to_ascii_lowercase();
    if is_youtube_reference(&lowered) {
        if let Some(video_id) = youtube_video_id(reference) {
            return format!("https://www.youtube.com/watch?v={video_id}");
        }
        return reference.to_string();
    }
    if is_bilibili_reference(&lowered) {
        if let Some(video_id) = bilibili_video_id(reference) {
            return format!("https://www.bilibili.com/video/{video_id}");
        }
        return reference.to_string();
    }
    if reference.starts_with(FILE_SCHEME_PREFIX) || reference.starts_with('/') {
        let path = reference_to_path(reference);
        return absolutize(&path).to_string_lossy().into_owned();
    }
    reference.to_string()
}

/// Hex SHA-256 of the normalized reference; the persistent cache key.
pub fn cache_key(reference: &str) -> String {
    let normalized = normalize_reference(reference);
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

fn parse_web_url(reference: &str) -> Option<Url> {
    Url::parse(reference)
        .ok()
        .or_else(|| Url::parse(&format!("https://{reference}")).ok())
}

/// Extracts the YouTube video id from watch, short-link, shorts and embed URLs.
pub fn youtube_video_id(reference: &str) -> Option<String> {
    let url = parse_web_url(reference)?;
    let host = url.host_str()?.to_ascii_lowercase();
    let mut segments = url
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter();

    let candidate = if host.ends_with("youtu.be") {
        segments.next().map(str::to_string)
    } else if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "v") {
        Some(value.into_owned())
    } else {
        match segments.next() {
            Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
            _ => None,
        }
    };
    candidate.filter(|id| !id.is_empty())
}

/// Extracts the `BV…` / `av…` identifier from a Bilibili video URL.
pub fn bilibili_video_id(reference: &str) -> Option<String> {
    let url = parse_web_url(reference)?;
    let segments = url.path_segments()?;
    for segment in segments {
        if segment.starts_with("BV") || segment.starts_with("av") {
            return Some(segment.to_string());
        }
    }
    None
}

/// Absolute form of `path`: canonical when it exists, lexically cleaned otherwise.
fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut cleaned = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
