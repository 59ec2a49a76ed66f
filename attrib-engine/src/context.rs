//! Per-invocation run context
//!
//! Everything that lives for exactly one invocation: its id, wall-clock
//! budget, cancellation, the geolocation call allowance, and the in-process
//! geo memo. Nothing here outlives the run; resumable state goes to the
//! store instead.

use crate::models::{GeoLookup, StopReason};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct RunContext {
    run_id: Uuid,
    started: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    geo_call_budget: u32,
    geo_calls: AtomicU32,
    geo_memo: Mutex<HashMap<String, GeoLookup>>,
}

impl RunContext {
    /// `budget` of `None` means no wall-clock limit
    pub fn new(budget: Option<Duration>, geo_call_budget: u32) -> Self {
        let started = Instant::now();
        Self {
            run_id: Uuid::new_v4(),
            started,
            deadline: budget.map(|b| started + b),
            cancel: CancellationToken::new(),
            geo_call_budget,
            geo_calls: AtomicU32::new(0),
            geo_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Unbounded context for tests and one-off resolutions
    pub fn unbounded() -> Self {
        Self::new(None, u32::MAX)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Reason to stop now, if any
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StopReason::Budget)
        } else {
            None
        }
    }

    /// Take one external geolocation call from the allowance
    pub fn try_acquire_geo_call(&self) -> bool {
        self.geo_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.geo_call_budget).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn geo_calls_made(&self) -> u32 {
        self.geo_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn memo_get(&self, ip: &str) -> Option<GeoLookup> {
        self.geo_memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(ip)
            .cloned()
    }

    pub(crate) fn memo_put(&self, ip: &str, lookup: GeoLookup) {
        self.geo_memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ip.to_string(), lookup);
    }
}
