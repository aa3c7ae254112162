//! Bilibili public `x/web-interface/view` API extractor.
//!
//! Cheaper than spawning yt-dlp and needs no cookies for public videos, so it is
//! tried first for Bilibili references.

use std::time::Duration;

use serde_json::Value;

use super::{DurationExtractor, FetchedDuration};
use crate::errors::FetchError;
use crate::media_url;
use crate::protocol::RemotePlatform;

const SOURCE_LABEL: &str = "bilibili-api";
const VIEW_ENDPOINT: &str = "https://api.bilibili.com/x/web-interface/view";
const USER_AGENT: &str = concat!("durafetch/", env!("CARGO_PKG_VERSION"));

pub struct BilibiliApiExtractor {
    http_client: ureq::Agent,
}

impl Default for BilibiliApiExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl BilibiliApiExtractor {
    pub fn new() -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(7))
            .timeout_write(Duration::from_secs(7))
            .build();
        Self { http_client }
    }
}

impl DurationExtractor for BilibiliApiExtractor {
    fn name(&self) -> &'static str {
        SOURCE_LABEL
    }

    fn supports(&self, platform: RemotePlatform) -> bool {
        platform == RemotePlatform::Bilibili
    }

    fn extract(
        &self,
        url: &str,
        _platform: RemotePlatform,
        timeout: Duration,
    ) -> Result<FetchedDuration, FetchError> {
        let video_id = media_url::bilibili_video_id(url)
            .ok_or_else(|| FetchError::Failed(format!("No Bilibili video id in {}", url)))?;
        let (param, value) = view_query(&video_id);

        let response = self
            .http_client
            .get(VIEW_ENDPOINT)
            .set("User-Agent", USER_AGENT)
            .set("Accept", "application/json")
            .set("Referer", "https://www.bilibili.com/")
            .query(param, &value)
            .timeout(timeout)
            .call()
            .map_err(|error| classify_ureq_failure(&error))?;
        let body = response
            .into_string()
            .map_err(|error| FetchError::Failed(format!("Failed to read response: {error}")))?;

        let seconds = parse_view_response(&body, page_number(url))?;
        Ok(FetchedDuration::new(seconds, SOURCE_LABEL))
    }
}

/// `bvid=BV...` or `aid=<digits>`.
fn view_query(video_id: &str) -> (&'static str, String) {
    match video_id.strip_prefix("av") {
        Some(aid) => ("aid", aid.to_string()),
        None => ("bvid", video_id.to_string()),
    }
}

/// 1-based `?p=` part selector of multi-part uploads.
fn page_number(url: &str) -> Option<usize> {
    let parsed = url::Url::parse(url).ok()?;
    let page = parsed
        .query_pairs()
        .find(|(key, _)| key == "p")
        .and_then(|(_, value)| value.parse::<usize>().ok())?;
    (page > 0).then_some(page)
}

fn parse_view_response(body: &str, page: Option<usize>) -> Result<f64, FetchError> {
    let root: Value = serde_json::from_str(body)
        .map_err(|err| FetchError::Failed(format!("Invalid Bilibili response: {}", err)))?;
    let code = root.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
        let message = root
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(match code {
            -404 => FetchError::NotFound(message),
            -403 | -101 => FetchError::AccessDenied(message),
            62002 | 62004 | 62012 => FetchError::Unavailable(message),
            _ => FetchError::Failed(format!("Bilibili API code {}: {}", code, message)),
        });
    }

    let data = root.get("data").ok_or(FetchError::NoDuration)?;
    let page_duration = page.and_then(|page| {
        data.get("pages")
            .and_then(Value::as_array)
            .and_then(|pages| pages.get(page - 1))
            .and_then(|entry| entry.get("duration"))
            .and_then(Value::as_f64)
    });
    match page_duration.or_else(|| data.get("duration").and_then(Value::as_f64)) {
        Some(seconds) if seconds > 0.0 => Ok(seconds),
        _ => Err(FetchError::NoDuration),
    }
}

fn classify_ureq_failure(error: &ureq::Error) -> FetchError {
    match error {
        ureq::Error::Status(code, _) => match code {
            404 => FetchError::NotFound(format!("HTTP {code}")),
            401 | 403 | 412 => FetchError::AccessDenied(format!("HTTP {code}")),
            408 | 504 => FetchError::Timeout(format!("HTTP {code}")),
            _ => FetchError::Failed(format!("Request failed: {error}")),
        },
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            if lowered.contains("timed out") || lowered.contains("timeout") {
                FetchError::Timeout(transport.to_string())
            } else {
                FetchError::Failed(format!("Request failed: {error}"))
            }
        }
    }
}
