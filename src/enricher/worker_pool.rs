// Parser worker pool
//
// CPU-heavy parsing runs on tokio's blocking threads, bounded by a
// semaphore sized to the hardware parallelism. When the pool is closed or a
// worker dies, the same parse function runs inline on the calling task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Execution counters for the parser pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub offloaded: u64,
    pub inline: u64,
    pub empty: u64,
}

pub struct ParserPool {
    workers: usize,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    offloaded: AtomicU64,
    inline: AtomicU64,
    empty: AtomicU64,
}

impl ParserPool {
    /// `workers: None` sizes the pool to the available CPUs
    pub fn new(workers: Option<usize>) -> Self {
        let workers = workers.unwrap_or_else(num_cpus::get).max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            closed: AtomicBool::new(false),
            offloaded: AtomicU64::new(0),
            inline: AtomicU64::new(0),
            empty: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `parse` over `payload` on a worker thread, falling back to the
    /// calling task when no worker can take it. `label` names the payload
    /// in logs.
    pub async fn parse_with<T>(
        &self,
        label: &str,
        payload: Arc<str>,
        parse: fn(&str) -> Option<T>,
    ) -> Option<T>
    where
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!(label, "[ParserPool] Pool closed, parsing inline");
            return self.parse_inline(label, &payload, parse);
        }

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(label, "[ParserPool] Pool closed while waiting, parsing inline");
                return self.parse_inline(label, &payload, parse);
            }
        };

        let worker_payload = Arc::clone(&payload);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            parse(&worker_payload)
        });

        match handle.await {
            Ok(parsed) => {
                self.offloaded.fetch_add(1, Ordering::Relaxed);
                self.note_empty(label, parsed.is_none());
                parsed
            }
            Err(e) => {
                warn!(label, error = %e, "[ParserPool] Worker failed, parsing inline");
                self.parse_inline(label, &payload, parse)
            }
        }
    }

    /// Run `parse` on the calling thread
    pub fn parse_inline<T>(&self, label: &str, payload: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
        self.inline.fetch_add(1, Ordering::Relaxed);
        match catch_unwind(AssertUnwindSafe(|| parse(payload))) {
            Ok(parsed) => {
                self.note_empty(label, parsed.is_none());
                parsed
            }
            Err(_) => {
                warn!(label, bytes = payload.len(), "[ParserPool] Parser panicked, payload dropped");
                self.empty.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn note_empty(&self, label: &str, empty: bool) {
        if empty {
            self.empty.fetch_add(1, Ordering::Relaxed);
            debug!(label, "[ParserPool] Parser found no data");
        }
    }

    pub fn stats(&self) -> ParserStats {
        ParserStats {
            offloaded: self.offloaded.load(Ordering::Relaxed),
            inline: self.inline.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop offloading; later parses run inline
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }
}

impl Default for ParserPool {
    fn default() -> Self {
        Self::new(None)
    }
}
