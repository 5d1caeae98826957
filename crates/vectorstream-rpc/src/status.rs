//! Status vocabulary shared by every response.

use serde::{Deserialize, Serialize};

/// Typed reason strings carried on failed responses.
pub mod reason {
    pub const SERVER_NOT_SERVING: &str = "serverNotServing";
    pub const SEGMENT_NOT_FOUND: &str = "segmentNotFound";
    pub const CHANNEL_NOT_WATCHED: &str = "channel-not-watched";
    pub const COMPACTION_DISABLED: &str = "compactionDisabled";
    pub const ALLOC_FAILED: &str = "allocFailed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    UnexpectedError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub error_code: ErrorCode,
    pub reason: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            error_code: ErrorCode::Success,
            reason: String::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error_code: ErrorCode::UnexpectedError,
            reason: reason.into(),
        }
    }

    pub fn not_serving() -> Self {
        Self::error(reason::SERVER_NOT_SERVING)
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }

    /// Whether a failed response is worth retrying: only coordinator
    /// unavailability is transient; typed rejections are final.
    pub fn is_retryable(&self) -> bool {
        self.error_code != ErrorCode::Success && self.reason == reason::SERVER_NOT_SERVING
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}
