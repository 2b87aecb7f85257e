// Error types for enrichment backends

use thiserror::Error;

use super::diagnostics::diagnose_error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnrichError {
    /// Request did not complete within the configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection refused, reset, DNS failure, ...
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status that is not covered by a more specific variant
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The remote side is throttling us (429, captcha, consent wall)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Structured-API quota for the current period is used up
    #[error("Quota exhausted: {used}/{limit} units used")]
    QuotaExhausted { used: u64, limit: u64 },

    /// LLM spend for this run reached the configured ceiling
    #[error("Cost limit reached: ${spent:.4} of ${limit:.4}")]
    CostLimitReached { spent: f64, limit: f64 },

    /// Unparseable JSON, missing required fields, empty extraction
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Video deleted, private or otherwise not returned by the source
    #[error("Not found: {0}")]
    NotFound(String),

    /// No video identifier could be derived from a URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No backend is configured or available
    #[error("No enrichment backend is configured or available")]
    NoBackendAvailable,

    /// A pool was used after shutdown
    #[error("Pool closed: {0}")]
    PoolClosed(String),
}

impl EnrichError {
    /// Worth retrying within the same backend
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stops further calls to the backend for the rest of the run
    pub fn halts_backend(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::QuotaExhausted { .. } | Self::CostLimitReached { .. }
        )
    }

    /// Surfaces to the caller before any work starts
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::NoBackendAvailable)
    }
}

impl From<reqwest::Error> for EnrichError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if e.is_connect() || e.is_request() {
            return Self::Network(e.to_string());
        }
        if e.is_decode() || e.is_body() {
            return Self::MalformedResponse(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), &e.to_string());
        }
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for EnrichError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(format!("Invalid JSON: {}", e))
    }
}

impl EnrichError {
    /// Map a non-success HTTP status and its body to the closest variant.
    /// Bodies that name a throttling or permanent condition win over the
    /// bare status code.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(300).collect();
        match status {
            429 => return Self::RateLimited(message),
            404 => return Self::NotFound(message),
            _ => {}
        }

        match diagnose_error(body) {
            Some(reason) if reason.halts_backend() || reason.is_permanent() => {
                reason.into_error(&message)
            }
            _ => Self::Http { status, message },
        }
    }
}
