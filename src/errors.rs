// Error types for duration fetch strategies

use std::fmt;

/// Coarse failure category carried on `FetchError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    NotFound,
    ToolUnavailable,
    Timeout,
    AccessDenied,
    Unavailable,
    NoDuration,
    Cancelled,
    Failed,
}

/// Per-item fetch failure. Never fatal to the worker that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Local file does not exist
    NotFound(String),

    /// Probe engine or extraction tool could not be loaded
    ToolUnavailable(String),

    /// Fetch exceeded the configured timeout
    Timeout(String),

    /// Private, members-only or sign-in gated content
    AccessDenied(String),

    /// Removed, blocked or otherwise unavailable content
    Unavailable(String),

    /// Source resolved but reported no positive duration
    NoDuration,

    /// Worker was asked to stop mid-fetch
    Cancelled,

    /// Anything else, with details
    Failed(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::NotFound(_) => FetchErrorKind::NotFound,
            Self::ToolUnavailable(_) => FetchErrorKind::ToolUnavailable,
            Self::Timeout(_) => FetchErrorKind::Timeout,
            Self::AccessDenied(_) => FetchErrorKind::AccessDenied,
            Self::Unavailable(_) => FetchErrorKind::Unavailable,
            Self::NoDuration => FetchErrorKind::NoDuration,
            Self::Cancelled => FetchErrorKind::Cancelled,
            Self::Failed(_) => FetchErrorKind::Failed,
        }
    }

    /// True when trying another extractor for the same item cannot help.
    pub fn is_conclusive(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AccessDenied(_) | Self::Unavailable(_) | Self::Cancelled
        )
    }

    /// Classifies free-form extractor output (stderr, API messages).
    pub fn from_extractor_message(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let summary = first_error_line(message);

        if lowered.contains("timed out") || lowered.contains("timeout") {
            return Self::Timeout(summary);
        }
        if lowered.contains("private")
            || lowered.contains("sign in")
            || lowered.contains("members-only")
            || lowered.contains("members only")
            || lowered.contains("login required")
        {
            return Self::AccessDenied(summary);
        }
        if lowered.contains("unavailable")
            || lowered.contains("has been removed")
            || lowered.contains("not available")
        {
            return Self::Unavailable(summary);
        }
        if lowered.contains("unsupported url") || lowered.contains("404") {
            return Self::NotFound(summary);
        }
        Self::Failed(summary)
    }
}

fn first_error_line(message: &str) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| message.lines().map(str::trim).find(|line| !line.is_empty()))
        .unwrap_or("");
    line.trim_start_matches("ERROR:").trim().to_string()
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::ToolUnavailable(tool) => write!(f, "Tool unavailable: {}", tool),
            Self::Timeout(detail) if detail.is_empty() => write!(f, "Timed out"),
            Self::Timeout(detail) => write!(f, "Timed out: {}", detail),
            Self::AccessDenied(detail) => write!(f, "Private or restricted content: {}", detail),
            Self::Unavailable(detail) => write!(f, "Content unavailable: {}", detail),
            Self::NoDuration => write!(f, "No duration found"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed(detail) => write!(f, "Fetch failed: {}", detail),
        }
    }
}

impl std::error::Error for FetchError {}
