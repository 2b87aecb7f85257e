// Time-bounded video cache with in-flight deduplication
//
// One mutex guards both the entries and the in-flight set so that
// "not cached and not in flight -> mark in flight" is a single step.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use super::models::{BackendKind, ScrapedVideoData};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub video_id: String,
    pub data: ScrapedVideoData,
    pub source: BackendKind,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashSet<String>,
}

pub struct VideoCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    settled: Notify,
}

impl VideoCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl,
            settled: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state stays consistent across a panic: every critical section is a
        // single map operation.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh entry for `video_id`; expired entries are dropped on the way
    pub fn lookup(&self, video_id: &str) -> Option<CacheEntry> {
        let mut state = self.lock();
        let expired = state.entries.get(video_id)?.is_expired_at(Instant::now());
        if expired {
            debug!(video_id, "[Cache] Entry expired");
            state.entries.remove(video_id);
            return None;
        }
        state.entries.get(video_id).cloned()
    }

    pub fn store(
        &self,
        video_id: &str,
        data: ScrapedVideoData,
        source: BackendKind,
        ttl: Option<Duration>,
    ) {
        let entry = CacheEntry {
            video_id: video_id.to_string(),
            data,
            source,
            inserted_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.lock().entries.insert(video_id.to_string(), entry);
    }

    /// Claim identifiers for processing. Returns, in input order and without
    /// duplicates, those neither cached (fresh) nor already in flight, and
    /// registers them as in flight.
    pub fn mark_in_flight(&self, ids: &[String]) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut claimed = Vec::new();

        for id in ids {
            let expired = state.entries.get(id).map(|entry| entry.is_expired_at(now));
            if expired == Some(true) {
                state.entries.remove(id);
            }
            let fresh = expired == Some(false);
            if fresh || state.in_flight.contains(id) {
                continue;
            }
            state.in_flight.insert(id.clone());
            claimed.push(id.clone());
        }

        claimed
    }

    /// Release identifiers after processing (success or failure)
    pub fn clear_in_flight(&self, ids: &[String]) {
        {
            let mut state = self.lock();
            for id in ids {
                state.in_flight.remove(id);
            }
        }
        self.settled.notify_waiters();
    }

    pub fn is_in_flight(&self, video_id: &str) -> bool {
        self.lock().in_flight.contains(video_id)
    }

    /// Wait until none of `ids` is in flight, or until `timeout` elapses.
    /// Returns whether all of them settled.
    pub async fn wait_until_settled(&self, ids: &[String], timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a clear between check and await is not missed
            notified.as_mut().enable();

            if !ids.iter().any(|id| self.is_in_flight(id)) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Drop every entry (in-flight claims are kept)
    pub fn flush(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases claimed identifiers when dropped, so an early return or a
/// cancelled run never leaves identifiers stuck in flight.
pub struct InFlightGuard<'a> {
    cache: &'a VideoCache,
    ids: Vec<String>,
}

impl<'a> InFlightGuard<'a> {
    pub fn claim(cache: &'a VideoCache, ids: &[String]) -> Self {
        let ids = cache.mark_in_flight(ids);
        Self { cache, ids }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.cache.clear_in_flight(&self.ids);
        }
    }
}
