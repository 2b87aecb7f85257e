pub mod enricher;

pub use enricher::{
    BackendKind, EnrichError, EnrichmentConfig, EnrichmentPipeline, EnrichmentReport, VideoRecord,
};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr so stdout stays
/// free for the report; `RUST_LOG` overrides the default `info` level.
/// Calling it again is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
