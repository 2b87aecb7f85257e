// Per-host connection pools
//
// One reqwest client per host, created on first use and kept for the
// process lifetime. A semaphore caps concurrent requests per host; callers
// queue for a permit up to the acquire timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::config::NetworkConfig;
use super::errors::EnrichError;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_connections_per_host: usize,
    pub request_timeout: Duration,
    pub acquire_timeout: Duration,
    pub proxy: Option<String>,
}

impl PoolSettings {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            max_connections_per_host: network.max_connections_per_host.max(1),
            request_timeout: Duration::from_secs(network.request_timeout_secs),
            acquire_timeout: Duration::from_secs(network.pool_acquire_timeout_secs),
            proxy: network.proxy.clone(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

/// Connection pool for a single host
pub struct HostPool {
    host: String,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl HostPool {
    fn build(host: &str, settings: &PoolSettings) -> Result<Self, EnrichError> {
        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(settings.max_connections_per_host);

        if let Some(proxy_url) = settings.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| EnrichError::Config(format!("Invalid proxy URL {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| EnrichError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            host: host.to_string(),
            client,
            permits: Arc::new(Semaphore::new(settings.max_connections_per_host)),
            acquire_timeout: settings.acquire_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Free connection slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a connection slot. Waiting longer than the acquire timeout
    /// is reported as a timeout.
    pub async fn acquire(&self) -> Result<PooledClient, EnrichError> {
        let permit = tokio::time::timeout(self.acquire_timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| {
                EnrichError::Timeout(format!(
                    "No connection to {} available within {}s",
                    self.host,
                    self.acquire_timeout.as_secs_f64()
                ))
            })?
            .map_err(|_| EnrichError::PoolClosed(self.host.clone()))?;

        Ok(PooledClient {
            client: self.client.clone(),
            _permit: permit,
        })
    }

    fn close(&self) {
        self.permits.close();
    }
}

/// A client checked out of a host pool; the slot is returned on drop
pub struct PooledClient {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

pub struct ConnectionPools {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, Arc<HostPool>>>,
    closed: AtomicBool,
}

impl ConnectionPools {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Pool for the host (and port) of `url`
    pub fn for_url(&self, url: &str) -> Result<Arc<HostPool>, EnrichError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| EnrichError::InvalidUrl(format!("{}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| EnrichError::InvalidUrl(format!("{}: no host", url)))?;
        let key = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        self.for_host(&key)
    }

    pub fn for_host(&self, host: &str) -> Result<Arc<HostPool>, EnrichError> {
        if self.is_closed() {
            return Err(EnrichError::PoolClosed(host.to_string()));
        }

        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(host) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(HostPool::build(host, &self.settings)?);
        debug!(
            host,
            max_connections = self.settings.max_connections_per_host,
            "[ConnectionPools] Created pool"
        );
        pools.insert(host.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn host_count(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every pool. Queued and later acquisitions fail with `PoolClosed`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        for pool in pools.values() {
            pool.close();
        }
        info!(hosts = pools.len(), "[ConnectionPools] Shut down");
        pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max: usize, acquire_ms: u64) -> PoolSettings {
        PoolSettings {
            max_connections_per_host: max,
            request_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_millis(acquire_ms),
            proxy: None,
        }
    }

    #[test]
    fn test_pools_are_per_host_and_reused() {
        let pools = ConnectionPools::new(settings(2, 100));
        let a = pools.for_url("https://www.youtube.com/watch?v=abc").unwrap();
        let b = pools.for_url("https://www.youtube.com/watch?v=xyz").unwrap();
        let c = pools.for_url("https://api.openai.com/v1/chat/completions").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pools.host_count(), 2);
        assert_eq!(a.host(), "www.youtube.com");
    }

    #[test]
    fn test_port_is_part_of_the_key() {
        let pools = ConnectionPools::new(settings(2, 100));
        let a = pools.for_url("http://127.0.0.1:8001/").unwrap();
        let b = pools.for_url("http://127.0.0.1:8002/").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_invalid_url() {
        let pools = ConnectionPools::new(settings(2, 100));
        assert!(matches!(pools.for_url("not a url"), Err(EnrichError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pools = ConnectionPools::new(settings(1, 20));
        let pool = pools.for_host("example.com").unwrap();

        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.acquire().await, Err(EnrichError::Timeout(_))));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_request_proceeds_when_slot_frees() {
        let pools = ConnectionPools::new(settings(1, 1_000));
        let pool = pools.for_host("example.com").unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_pools() {
        let pools = ConnectionPools::new(settings(1, 100));
        let pool = pools.for_host("example.com").unwrap();
        pools.shutdown();

        assert!(pools.is_closed());
        assert_eq!(pools.host_count(), 0);
        assert!(matches!(pool.acquire().await, Err(EnrichError::PoolClosed(_))));
        assert!(matches!(pools.for_host("example.com"), Err(EnrichError::PoolClosed(_))));
    }
}
