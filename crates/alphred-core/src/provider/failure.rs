//! Typed provider failure taxonomy and classification.
//!
//! Terminal failures surfaced by an SDK (or by the adapter core itself)
//! are classified from three signal tiers: HTTP-ish status codes beat
//! explicit failure-code fields, which beat message-text matching.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a terminal provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthError,
    InvalidConfig,
    InvalidOptions,
    InvalidEvent,
    MissingResult,
    Timeout,
    RateLimited,
    TransportError,
    InternalError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AuthError => "auth_error",
            Self::InvalidConfig => "invalid_config",
            Self::InvalidOptions => "invalid_options",
            Self::InvalidEvent => "invalid_event",
            Self::MissingResult => "missing_result",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::TransportError => "transport_error",
            Self::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// A terminal provider failure with its classification evidence.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: FailureKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub failure_code: Option<String>,
}

impl ProviderError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            failure_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_code(mut self, failure_code: impl Into<String>) -> Self {
        self.failure_code = Some(failure_code.into());
        self
    }

    /// A provider invocation exceeded its configured timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("provider run exceeded timeout of {}ms", timeout.as_millis()),
        )
    }

    /// The stream carried an event the adapter cannot map.
    pub fn invalid_event(event_index: usize, field_path: &str) -> Self {
        Self::new(
            FailureKind::InvalidEvent,
            format!("unrecognised event at index {event_index}, field {field_path:?}"),
        )
    }

    /// The stream ended without a terminal `result` event.
    pub fn missing_result() -> Self {
        Self::new(
            FailureKind::MissingResult,
            "provider stream ended without a result event",
        )
    }

    /// Whether the executor may absorb this failure and reschedule the
    /// node. Timeouts, rate limits, and transport faults are transient;
    /// server-side errors only when the status says so; everything else
    /// is deterministic and never retried.
    pub fn retryable(&self) -> bool {
        match self.kind {
            FailureKind::Timeout | FailureKind::RateLimited | FailureKind::TransportError => true,
            FailureKind::InternalError => {
                matches!(self.status_code, Some(code) if (500..600).contains(&code))
            }
            FailureKind::AuthError
            | FailureKind::InvalidConfig
            | FailureKind::InvalidOptions
            | FailureKind::InvalidEvent
            | FailureKind::MissingResult => false,
        }
    }

    /// Classify a terminal failure from its raw evidence.
    pub fn classify(
        status_code: Option<u16>,
        failure_code: Option<&str>,
        message: &str,
    ) -> Self {
        let kind = classify_kind(status_code, failure_code, message);
        Self {
            kind,
            message: message.to_string(),
            status_code,
            failure_code: failure_code.map(str::to_owned),
        }
    }
}

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|throttl|quota|too many requests").expect("valid regex")
});
static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btime.?out\b|timed.?out|deadline exceeded").expect("valid regex")
});
static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)billing_error|authentication_failed|unauthori[sz]ed|invalid.?api.?key|permission.?denied")
        .expect("valid regex")
});
static TRANSPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection (reset|refused|closed)|socket hang.?up|dns failure|network (error|unreachable)")
        .expect("valid regex")
});

fn classify_kind(status_code: Option<u16>, failure_code: Option<&str>, message: &str) -> FailureKind {
    // Tier 1: status codes decide outright. Auth beats rate-limit here.
    match status_code {
        Some(401) | Some(403) => return FailureKind::AuthError,
        Some(429) => return FailureKind::RateLimited,
        Some(408) | Some(504) => return FailureKind::Timeout,
        Some(code) if (500..600).contains(&code) => return FailureKind::InternalError,
        _ => {}
    }

    // Tier 2: explicit failure-code fields.
    match failure_code {
        Some("ECONNRESET") | Some("ECONNREFUSED") | Some("EAI_AGAIN") => {
            return FailureKind::TransportError;
        }
        Some("ETIMEDOUT") => return FailureKind::Timeout,
        _ => {}
    }

    // Tier 3: message text. Rate-limit beats timeout when both apply.
    if RATE_LIMIT_RE.is_match(message) {
        return FailureKind::RateLimited;
    }
    if TIMEOUT_RE.is_match(message) {
        return FailureKind::Timeout;
    }
    if AUTH_RE.is_match(message) {
        return FailureKind::AuthError;
    }
    if TRANSPORT_RE.is_match(message) {
        return FailureKind::TransportError;
    }

    FailureKind::InternalError
}
