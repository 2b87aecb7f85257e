// Quota and cost accounting
//
// QuotaTracker: process-wide daily budget of structured-API units.
// CostTracker: per-run monetary ceiling for the LLM backend.
// Both serialize check-then-increment behind a single lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::errors::EnrichError;
use super::models::ResourceUsage;

/// Snapshot of a backend's quota for the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub requests: u64,
    /// RFC 3339
    pub reset_at: String,
}

struct QuotaState {
    used: u64,
    requests: u64,
    reset_at: OffsetDateTime,
}

pub struct QuotaTracker {
    limit: u64,
    state: Mutex<QuotaState>,
}

/// Start of the next UTC day after `now`
fn next_reset_after(now: OffsetDateTime) -> OffsetDateTime {
    match now.date().next_day() {
        Some(day) => day.midnight().assume_utc(),
        None => now,
    }
}

impl QuotaTracker {
    pub fn new(limit: u64) -> Self {
        Self::starting_at(limit, OffsetDateTime::now_utc())
    }

    pub fn starting_at(limit: u64, now: OffsetDateTime) -> Self {
        Self {
            limit,
            state: Mutex::new(QuotaState {
                used: 0,
                requests: 0,
                reset_at: next_reset_after(now),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_if_due(&self, state: &mut QuotaState, now: OffsetDateTime) {
        if now >= state.reset_at {
            info!(
                used = state.used,
                limit = self.limit,
                "[Quota] Period ended, resetting quota"
            );
            state.used = 0;
            state.requests = 0;
            state.reset_at = next_reset_after(now);
        }
    }

    /// Reserve `units` before dispatching a call. Fails without side effects
    /// when the remaining budget is insufficient.
    pub fn try_consume(&self, units: u64) -> Result<QuotaUsage, EnrichError> {
        self.try_consume_at(units, OffsetDateTime::now_utc())
    }

    pub fn try_consume_at(&self, units: u64, now: OffsetDateTime) -> Result<QuotaUsage, EnrichError> {
        let mut state = self.lock();
        self.reset_if_due(&mut state, now);

        if state.used + units > self.limit {
            return Err(EnrichError::QuotaExhausted {
                used: state.used,
                limit: self.limit,
            });
        }

        state.used += units;
        state.requests += 1;
        Ok(self.usage_from(&state))
    }

    /// Whether `units` could be reserved right now
    pub fn can_afford(&self, units: u64) -> bool {
        let mut state = self.lock();
        self.reset_if_due(&mut state, OffsetDateTime::now_utc());
        state.used + units <= self.limit
    }

    /// Mark the period as used up, e.g. after the remote side reported
    /// quotaExceeded despite our own accounting
    pub fn exhaust(&self) {
        let mut state = self.lock();
        warn!(used = state.used, limit = self.limit, "[Quota] Remote reported quota exhausted");
        state.used = self.limit;
    }

    pub fn usage(&self) -> QuotaUsage {
        self.usage_at(OffsetDateTime::now_utc())
    }

    pub fn usage_at(&self, now: OffsetDateTime) -> QuotaUsage {
        let mut state = self.lock();
        self.reset_if_due(&mut state, now);
        self.usage_from(&state)
    }

    fn usage_from(&self, state: &QuotaState) -> QuotaUsage {
        QuotaUsage {
            limit: self.limit,
            used: state.used,
            remaining: self.limit.saturating_sub(state.used),
            requests: state.requests,
            reset_at: state.reset_at.format(&Rfc3339).unwrap_or_default(),
        }
    }
}

/// USD per one million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost in micro-dollars
    pub fn cost_micros(&self, usage: &ResourceUsage) -> u64 {
        let micros = usage.prompt_tokens as f64 * self.input_per_million
            + usage.completion_tokens as f64 * self.output_per_million;
        micros.round().max(0.0) as u64
    }
}

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Per-model pricing lookup
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let models = [
            ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
            ("gpt-4o", ModelPricing::new(2.50, 10.00)),
            ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60)),
            ("gpt-4.1-nano", ModelPricing::new(0.10, 0.40)),
            ("gpt-3.5-turbo", ModelPricing::new(0.50, 1.50)),
            ("claude-3-haiku", ModelPricing::new(0.25, 1.25)),
            ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00)),
        ]
        .into_iter()
        .map(|(name, pricing)| (name.to_string(), pricing))
        .collect();
        Self { models }
    }
}

impl PricingTable {
    pub fn with_model(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.models.insert(model.to_string(), pricing);
        self
    }

    /// Pricing for `model`. Dated variants (`gpt-4o-mini-2024-07-18`) match
    /// their longest known prefix; unknown models are priced like the default.
    pub fn lookup(&self, model: &str) -> ModelPricing {
        if let Some(pricing) = self.models.get(model) {
            return *pricing;
        }
        let prefix_match = self
            .models
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, pricing)| *pricing);

        prefix_match.unwrap_or_else(|| {
            warn!(model, "[Pricing] Unknown model, using {} pricing", DEFAULT_MODEL);
            self.models
                .get(DEFAULT_MODEL)
                .copied()
                .unwrap_or(ModelPricing::new(0.15, 0.60))
        })
    }
}

fn to_micros(usd: f64) -> u64 {
    (usd * 1_000_000.0).round().max(0.0) as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[derive(Default)]
struct CostState {
    spent_micros: u64,
    /// Estimated cost of calls currently in flight
    reserved_micros: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    calls: u64,
}

/// Spend of one pipeline run against its ceiling.
///
/// Calls reserve their estimated cost before they go out and settle it with
/// the real cost afterwards. A reservation that would push spend plus
/// outstanding reservations over the ceiling waits for in-flight calls to
/// settle; one that cannot fit even after they settle is refused.
pub struct CostTracker {
    limit_micros: u64,
    state: Mutex<CostState>,
    settled: watch::Sender<u64>,
}

impl CostTracker {
    pub fn new(limit_usd: f64) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            limit_micros: to_micros(limit_usd),
            state: Mutex::new(CostState::default()),
            settled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limit_error(&self, state: &CostState) -> EnrichError {
        EnrichError::CostLimitReached {
            spent: from_micros(state.spent_micros),
            limit: from_micros(self.limit_micros),
        }
    }

    /// Ok while spend is below the ceiling; checked before an item starts
    pub fn check(&self) -> Result<(), EnrichError> {
        let state = self.lock();
        if state.spent_micros >= self.limit_micros {
            return Err(self.limit_error(&state));
        }
        Ok(())
    }

    /// Reserve `estimate_micros` for one call
    pub async fn reserve(&self, estimate_micros: u64) -> Result<CostReservation<'_>, EnrichError> {
        let mut settled = self.settled.subscribe();
        loop {
            {
                let mut state = self.lock();
                if state.spent_micros >= self.limit_micros
                    || state.spent_micros + estimate_micros > self.limit_micros
                {
                    return Err(self.limit_error(&state));
                }
                if state.spent_micros + state.reserved_micros + estimate_micros <= self.limit_micros {
                    state.reserved_micros += estimate_micros;
                    return Ok(CostReservation {
                        tracker: self,
                        micros: estimate_micros,
                    });
                }
                debug!(
                    reserved = from_micros(state.reserved_micros),
                    "[CostTracker] Waiting for in-flight calls to settle"
                );
            }
            if settled.changed().await.is_err() {
                return Err(self.limit_error(&self.lock()));
            }
        }
    }

    fn release(&self, reserved_micros: u64, actual: Option<(u64, &ResourceUsage)>) {
        {
            let mut state = self.lock();
            state.reserved_micros = state.reserved_micros.saturating_sub(reserved_micros);
            if let Some((cost_micros, usage)) = actual {
                state.spent_micros += cost_micros;
                state.prompt_tokens += usage.prompt_tokens;
                state.completion_tokens += usage.completion_tokens;
                state.calls += 1;
            }
        }
        self.settled.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn spent(&self) -> f64 {
        from_micros(self.lock().spent_micros)
    }

    pub fn limit(&self) -> f64 {
        from_micros(self.limit_micros)
    }

    pub fn is_exhausted(&self) -> bool {
        self.check().is_err()
    }

    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    /// Total token usage recorded this run
    pub fn usage(&self) -> ResourceUsage {
        let state = self.lock();
        ResourceUsage::tokens(state.prompt_tokens, state.completion_tokens)
    }
}

/// Cost held for one in-flight call. Dropping it without settling (failed
/// or cancelled call) returns the reservation unspent.
pub struct CostReservation<'a> {
    tracker: &'a CostTracker,
    micros: u64,
}

impl CostReservation<'_> {
    /// Replace the reservation with the call's real cost, returned in USD
    pub fn settle(mut self, cost_micros: u64, usage: &ResourceUsage) -> f64 {
        let reserved = std::mem::take(&mut self.micros);
        self.tracker.release(reserved, Some((cost_micros, usage)));
        from_micros(cost_micros)
    }
}

impl Drop for CostReservation<'_> {
    fn drop(&mut self) {
        if self.micros > 0 {
            self.tracker.release(self.micros, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;

    #[test]
    fn test_second_call_rejected_before_reset() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let quota = QuotaTracker::starting_at(100, now);

        let usage = quota.try_consume_at(100, now).unwrap();
        assert_eq!(usage.used, 100);
        assert_eq!(usage.remaining, 0);

        let err = quota.try_consume_at(100, now).unwrap_err();
        assert_eq!(err, EnrichError::QuotaExhausted { used: 100, limit: 100 });
        assert_eq!(quota.usage_at(now).requests, 1);
    }

    #[test]
    fn test_used_plus_remaining_is_limit() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let quota = QuotaTracker::starting_at(50, now);
        for _ in 0..7 {
            let usage = quota.try_consume_at(3, now).unwrap();
            assert_eq!(usage.used + usage.remaining, 50);
        }
    }

    #[test]
    fn test_reset_at_next_utc_day() {
        let start = datetime!(2025-03-01 23:59 UTC);
        let quota = QuotaTracker::starting_at(10, start);
        quota.try_consume_at(10, start).unwrap();
        assert!(quota.try_consume_at(1, start).is_err());

        let next_day = datetime!(2025-03-02 00:00 UTC);
        let usage = quota.try_consume_at(4, next_day).unwrap();
        assert_eq!(usage.used, 4);
        assert_eq!(usage.remaining, 6);
        assert_eq!(usage.reset_at, "2025-03-03T00:00:00Z");
    }

    #[test]
    fn test_exhaust_blocks_further_calls() {
        let quota = QuotaTracker::new(1_000);
        quota.exhaust();
        assert!(!quota.can_afford(1));
        assert_eq!(quota.usage().remaining, 0);
    }

    #[tokio::test]
    async fn test_cost_limit_is_exact() {
        let tracker = CostTracker::new(1.00);
        let usage = ResourceUsage::tokens(1_000, 0);
        let pricing = ModelPricing::new(50.0, 0.0);
        let per_call = pricing.cost_micros(&usage);

        for _ in 0..20 {
            assert!(tracker.check().is_ok());
            let reservation = tracker.reserve(per_call).await.unwrap();
            let cost = reservation.settle(per_call, &usage);
            assert!((cost - 0.05).abs() < 1e-9);
        }

        assert!(matches!(tracker.check(), Err(EnrichError::CostLimitReached { .. })));
        assert!(tracker.reserve(per_call).await.is_err());
        assert_eq!(tracker.calls(), 20);
        assert!((tracker.spent() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reservations_cap_calls_in_flight() {
        let tracker = CostTracker::new(0.10);
        let first = tracker.reserve(50_000).await.unwrap();
        let second = tracker.reserve(50_000).await.unwrap();

        // a third call must wait for one of the two to settle
        let third = tokio::time::timeout(Duration::from_millis(50), tracker.reserve(50_000)).await;
        assert!(third.is_err());

        drop(second);
        let third = tokio::time::timeout(Duration::from_millis(50), tracker.reserve(50_000))
            .await
            .unwrap()
            .unwrap();

        first.settle(50_000, &ResourceUsage::tokens(1_000, 0));
        third.settle(50_000, &ResourceUsage::tokens(1_000, 0));
        assert!(tracker.reserve(1).await.is_err());
        assert_eq!(tracker.calls(), 2);
    }

    #[tokio::test]
    async fn test_waiting_reservation_refused_once_limit_spent() {
        let tracker = std::sync::Arc::new(CostTracker::new(0.05));
        let held = tracker.reserve(50_000).await.unwrap();

        let waiter = {
            let tracker = std::sync::Arc::clone(&tracker);
            tokio::spawn(async move { tracker.reserve(50_000).await.map(|r| r.settle(0, &ResourceUsage::default())) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.settle(50_000, &ResourceUsage::tokens(1_000, 0));

        let refused = waiter.await.unwrap();
        assert!(matches!(refused, Err(EnrichError::CostLimitReached { .. })));
    }

    #[test]
    fn test_pricing_prefix_match() {
        let table = PricingTable::default();
        assert_eq!(table.lookup("gpt-4o-mini-2024-07-18"), ModelPricing::new(0.15, 0.60));
        assert_eq!(table.lookup("gpt-4o-2024-08-06"), ModelPricing::new(2.50, 10.00));
        assert_eq!(table.lookup("mystery-model"), ModelPricing::new(0.15, 0.60));
    }

    #[test]
    fn test_cost_micros() {
        let pricing = ModelPricing::new(0.15, 0.60);
        let usage = ResourceUsage::tokens(2_000, 500);
        // 2000 * 0.15 + 500 * 0.60 = 600 micro-dollars
        assert_eq!(pricing.cost_micros(&usage), 600);
    }
}
