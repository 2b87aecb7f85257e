// Pipeline configuration
//
// Sources, lowest to highest precedence: defaults, JSON file, environment,
// explicit builder calls (the CLI applies its flags last).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::errors::EnrichError;
use super::models::BackendKind;

/// Structured metadata API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Quota units charged per HTTP call
    pub units_per_request: u64,
    /// Identifiers per batched metadata call
    pub max_ids_per_request: usize,
    /// Resolve category ids to names (secondary lookup for unknown ids)
    pub resolve_categories: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            units_per_request: 1,
            max_ids_per_request: 50,
            resolve_categories: true,
        }
    }
}

/// Watch-page scraping settings (also used by the LLM backend to fetch pages)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapingConfig {
    pub enabled: bool,
    pub watch_base_url: String,
    /// Minimum spacing between page requests
    pub courtesy_delay_ms: u64,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_base_url: "https://www.youtube.com".to_string(),
            courtesy_delay_ms: 500,
        }
    }
}

/// Language-model extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    /// OpenAI-compatible endpoint root
    pub base_url: String,
    pub model: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_excerpt_chars: usize,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_attempts: 3,
            retry_base_delay_ms: 500,
            max_excerpt_chars: 12_000,
            max_tokens: 800,
        }
    }
}

/// Network configuration shared by all backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    /// SOCKS5/HTTP proxy URL (e.g., "socks5://127.0.0.1:1080")
    pub proxy: Option<String>,
    pub request_timeout_secs: u64,
    /// How long a request may queue for a pooled connection
    pub pool_acquire_timeout_secs: u64,
    pub max_connections_per_host: usize,
    /// Retries for transient failures within one backend
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Parser worker count; defaults to available parallelism
    pub parser_workers: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            request_timeout_secs: 30,
            pool_acquire_timeout_secs: 30,
            max_connections_per_host: 6,
            max_retries: 2,
            retry_base_delay_ms: 500,
            parser_workers: None,
        }
    }
}

/// Configuration for an enrichment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichmentConfig {
    pub preferred_backend: BackendKind,
    pub enable_fallback: bool,
    /// Maximum identifiers in flight at once
    pub max_concurrent_requests: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// USD per run for the LLM backend
    pub cost_limit: f64,
    /// Structured-API units per daily period
    pub quota_limit: u64,
    pub cache_ttl_seconds: u64,

    pub api: ApiConfig,
    pub scraping: ScrapingConfig,
    pub llm: LlmConfig,
    pub network: NetworkConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            preferred_backend: BackendKind::Llm,
            enable_fallback: true,
            max_concurrent_requests: 5,
            batch_size: 50,
            inter_batch_delay_ms: 1_000,
            cost_limit: 1.0,
            quota_limit: 10_000,
            cache_ttl_seconds: 86_400,
            api: ApiConfig::default(),
            scraping: ScrapingConfig::default(),
            llm: LlmConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl EnrichmentConfig {
    /// `<config dir>/youtube-enricher/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("youtube-enricher").join("config.json"))
    }

    /// Read a JSON config file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, EnrichError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EnrichError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            EnrichError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "[Config] Loaded configuration file");
        Ok(config)
    }

    /// Defaults, overlaid with the default config file when it exists
    pub fn load_default() -> Result<Self, EnrichError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Overlay settings from the process environment
    pub fn apply_env(self) -> Result<Self, EnrichError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay settings from an arbitrary variable source
    pub fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, EnrichError> {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("YOUTUBE_API_KEY") {
            self.api.api_key = Some(key);
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = non_empty("ENRICH_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = non_empty("ENRICH_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(backend) = non_empty("ENRICH_PREFERRED_BACKEND") {
            self.preferred_backend = backend.parse()?;
        }
        if let Some(proxy) = non_empty("ENRICH_PROXY") {
            self.network.proxy = Some(proxy);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), EnrichError> {
        if self.batch_size == 0 {
            return Err(EnrichError::Config("batchSize must be at least 1".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(EnrichError::Config(
                "maxConcurrentRequests must be at least 1".to_string(),
            ));
        }
        if !self.cost_limit.is_finite() || self.cost_limit < 0.0 {
            return Err(EnrichError::Config(
                "costLimit must be a non-negative number".to_string(),
            ));
        }
        if self.api.max_ids_per_request == 0 {
            return Err(EnrichError::Config(
                "api.maxIdsPerRequest must be at least 1".to_string(),
            ));
        }
        if self.network.max_connections_per_host == 0 {
            return Err(EnrichError::Config(
                "network.maxConnectionsPerHost must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_preferred_backend(mut self, backend: BackendKind) -> Self {
        self.preferred_backend = backend;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.enable_fallback = enabled;
        self
    }

    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_inter_batch_delay_ms(mut self, ms: u64) -> Self {
        self.inter_batch_delay_ms = ms;
        self
    }

    pub fn with_cost_limit(mut self, usd: f64) -> Self {
        self.cost_limit = usd;
        self
    }

    pub fn with_quota_limit(mut self, units: u64) -> Self {
        self.quota_limit = units;
        self
    }

    pub fn with_cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.cache_ttl_seconds = seconds;
        self
    }

    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    pub fn with_scraping(mut self, scraping: ScrapingConfig) -> Self {
        self.scraping = scraping;
        self
    }

    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EnrichmentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preferred_backend, BackendKind::Llm);
        assert!(config.enable_fallback);
    }

    #[test]
    fn test_parse_camel_case_options() {
        let json = r#"{
            "preferredBackend": "api",
            "enableFallback": false,
            "maxConcurrentRequests": 8,
            "batchSize": 25,
            "interBatchDelayMs": 250,
            "costLimit": 2.5,
            "quotaLimit": 500,
            "cacheTtlSeconds": 60,
            "llm": { "model": "gpt-4o" }
        }"#;
        let config: EnrichmentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.preferred_backend, BackendKind::Api);
        assert!(!config.enable_fallback);
        assert_eq!(config.max_concurrent_requests, 8);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.inter_batch_delay(), Duration::from_millis(250));
        assert_eq!(config.quota_limit, 500);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.max_attempts, 3);
        assert_eq!(config.api.max_ids_per_request, 50);
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = EnrichmentConfig::default().with_batch_size(0);
        assert!(matches!(config.validate(), Err(EnrichError::Config(_))));

        let config = EnrichmentConfig::default().with_cost_limit(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("YOUTUBE_API_KEY", "yt-key"),
            ("OPENAI_API_KEY", ""),
            ("ENRICH_PREFERRED_BACKEND", "scraping"),
            ("ENRICH_PROXY", "socks5://127.0.0.1:1080"),
        ]
        .into_iter()
        .collect();

        let config = EnrichmentConfig::default()
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api.api_key.as_deref(), Some("yt-key"));
        assert_eq!(config.llm.api_key, None);
        assert_eq!(config.preferred_backend, BackendKind::Scraping);
        assert_eq!(config.network.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
    }

    #[test]
    fn test_env_overlay_rejects_unknown_backend() {
        let result = EnrichmentConfig::default()
            .apply_vars(|k| (k == "ENRICH_PREFERRED_BACKEND").then(|| "carrier-pigeon".to_string()));
        assert!(result.is_err());
    }
}
