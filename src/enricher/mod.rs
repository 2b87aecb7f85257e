// Enricher module - fills watch-history records with video metadata

pub mod backends;
pub mod cache;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parsers;
pub mod pool;
pub mod quota;
pub mod scheduler;
pub mod traits;
pub mod utils;
pub mod worker_pool;

pub use backends::{ApiBackend, LlmBackend, ScrapingBackend};
pub use cache::VideoCache;
pub use config::{ApiConfig, EnrichmentConfig, LlmConfig, NetworkConfig, ScrapingConfig};
pub use context::{PipelineContext, RunContext};
pub use errors::EnrichError;
pub use metrics::MetricsSnapshot;
pub use models::{BackendKind, ContentType, EnrichmentResult, ScrapedVideoData, VideoRecord};
pub use orchestrator::{EnrichmentPipeline, EnrichmentReport, FallbackState, IdentifierOutcome};
pub use quota::{ModelPricing, PricingTable};
pub use traits::{BatchOutcome, EnrichmentBackend, HaltReason};
