// Enrichment backend trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::context::RunContext;
use super::errors::EnrichError;
use super::models::{BackendKind, EnrichmentResult};

/// Why a backend stopped taking work for the rest of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HaltReason {
    QuotaExhausted,
    CostLimitReached,
    RateLimited,
}

impl HaltReason {
    pub fn from_error(error: &EnrichError) -> Option<Self> {
        if !error.halts_backend() {
            return None;
        }
        Some(match error {
            EnrichError::QuotaExhausted { .. } => Self::QuotaExhausted,
            EnrichError::CostLimitReached { .. } => Self::CostLimitReached,
            _ => Self::RateLimited,
        })
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted => write!(f, "quota exhausted"),
            Self::CostLimitReached => write!(f, "cost limit reached"),
            Self::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// What a backend returns for one chunk of identifiers.
///
/// `results` may hold fewer entries than the chunk when the backend halted
/// before starting some identifiers; the scheduler accounts for the rest.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<EnrichmentResult>,
    pub halt: Option<HaltReason>,
}

impl BatchOutcome {
    pub fn new(results: Vec<EnrichmentResult>) -> Self {
        Self { results, halt: None }
    }

    pub fn halted(results: Vec<EnrichmentResult>, reason: HaltReason) -> Self {
        Self {
            results,
            halt: Some(reason),
        }
    }
}

/// Trait for enrichment backend implementations
#[async_trait]
pub trait EnrichmentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Whether the backend has what it needs (credentials, enabled flag)
    fn is_available(&self) -> bool {
        true
    }

    /// Enrich a chunk of unique identifiers
    async fn enrich(&self, batch: &[String], run: &RunContext) -> BatchOutcome;
}
