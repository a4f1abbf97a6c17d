use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error taxonomy for the triage system
#[derive(Error, Debug)]
pub enum TriageError {
    /// No usable credential: missing, refresh failed, or explicitly errored
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Local call budget exhausted or provider quota exhausted
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    /// Provider denied access; requires re-consent
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Classifier returned nothing parseable
    #[error("Classification unavailable for message {0}")]
    ClassificationUnavailable(String),

    /// Any other provider failure
    #[error("Provider error (HTTP {status}): {message}")]
    Transient { status: u16, message: String },

    /// Connection-level failure before a status was received
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Provider payload could not be interpreted
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Key-value store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Encryption or integrity-check failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl TriageError {
    /// Map a non-success provider response to the error taxonomy.
    ///
    /// Quota exhaustion is reported by Gmail as either 429 or a 403 whose body
    /// names a rate-limit reason, so the body is checked before the status.
    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        let lower = body.to_lowercase();
        let quota_exhausted = lower.contains("ratelimitexceeded")
            || lower.contains("quota")
            || lower.contains("rate limit");

        if status == 429 || quota_exhausted {
            return TriageError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            };
        }

        match status {
            401 => TriageError::Unauthenticated(summarize(body)),
            403 => TriageError::Forbidden(summarize(body)),
            404 => TriageError::NotFound(summarize(body)),
            _ => TriageError::Transient {
                status,
                message: summarize(body),
            },
        }
    }

    /// Check if the caller may back off and try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriageError::RateLimited { .. }
                | TriageError::Transient { .. }
                | TriageError::NetworkError(_)
                | TriageError::Store(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Short machine-readable kind, used in JSON reports
    pub fn kind(&self) -> &'static str {
        match self {
            TriageError::Unauthenticated(_) => "unauthenticated",
            TriageError::RateLimited { .. } => "rate_limited",
            TriageError::Forbidden(_) => "forbidden",
            TriageError::ClassificationUnavailable(_) => "classification_unavailable",
            TriageError::Transient { .. } | TriageError::NetworkError(_) => "transient",
            TriageError::NotFound(_) => "not_found",
            TriageError::InvalidMessageFormat(_) => "invalid_message",
            TriageError::Store(_) => "store",
            TriageError::Crypto(_) => "crypto",
            TriageError::ConfigError(_) => "config",
            TriageError::IoError(_) => "io",
            TriageError::SerializationError(_) => "serialization",
        }
    }
}

const DEFAULT_RETRY_AFTER: u64 = 5;

/// Keep provider error bodies bounded in logs and reports
fn summarize(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(MAX).collect::<String>())
    }
}

/// Parse the Retry-After header value.
///
/// Accepts delay-seconds ("120") or an HTTP-date. Dates in the past and
/// unparseable values yield `None`.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    u64::try_from(delta.num_seconds()).ok().filter(|s| *s > 0)
}

impl From<reqwest::Error> for TriageError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TriageError::from_status(status.as_u16(), &error.to_string(), None),
            None if error.is_decode() => TriageError::InvalidMessageFormat(error.to_string()),
            None => TriageError::NetworkError(error.to_string()),
        }
    }
}

impl From<redis::RedisError> for TriageError {
    fn from(error: redis::RedisError) -> Self {
        TriageError::Store(error.to_string())
    }
}
