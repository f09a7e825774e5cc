// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-component recovery state and the fallback cache.
//!
//! Every wrapped call reports its outcome here. Consecutive failures walk a
//! component down the mode ladder (NORMAL → DEGRADED → EMERGENCY → OFFLINE)
//! and its health down to UNHEALTHY; recovery requires sustained success.
//! The fallback cache keeps recent successful results around so that
//! FALLBACK-strategy errors can be served stale data instead of nothing.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NodeError;

const FALLBACK_CACHE_SIZE: usize = 500;
const FALLBACK_CACHE_TTL: Duration = Duration::from_secs(300);

/// Operating mode of a component, selected from its failure history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Normal,
    Degraded,
    Emergency,
    /// No further recovery attempts are made.
    Offline,
}

/// Rolling health verdict for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Rolling per-component failure/recovery summary.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub component: String,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub recovery_attempts: u32,
    pub mode: RecoveryMode,
    pub health: HealthStatus,
    pub last_error: Option<String>,
    pub last_success_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

impl RecoveryState {
    fn new(component: String) -> Self {
        RecoveryState {
            component,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_failures: 0,
            total_recoveries: 0,
            recovery_attempts: 0,
            mode: RecoveryMode::Normal,
            health: HealthStatus::Healthy,
            last_error: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    /// Records a successful operation; health upgrades require a streak
    /// (3 successes UNHEALTHY→DEGRADED, 5 more DEGRADED→HEALTHY).
    pub fn record_success(&mut self) {
        self.last_success_at = Some(Instant::now());
        if self.consecutive_failures > 0 {
            self.total_recoveries += 1;
        }
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        match self.health {
            HealthStatus::Unhealthy | HealthStatus::Unknown => {
                if self.consecutive_successes >= 3 {
                    self.health = HealthStatus::Degraded;
                    self.consecutive_successes = 0;
                }
            }
            HealthStatus::Degraded => {
                if self.consecutive_successes >= 5 {
                    self.health = HealthStatus::Healthy;
                    self.mode = RecoveryMode::Normal;
                    self.recovery_attempts = 0;
                }
            }
            HealthStatus::Healthy => {}
        }
    }

    /// Records a failed operation and walks the mode/health ladder.
    pub fn record_failure(&mut self, error: &NodeError) {
        self.last_failure_at = Some(Instant::now());
        self.last_error = Some(error.to_string());
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        self.total_failures += 1;

        self.health = if self.consecutive_failures >= 3 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        self.mode = if self.consecutive_failures >= 10 {
            RecoveryMode::Offline
        } else if self.consecutive_failures >= 5 {
            RecoveryMode::Emergency
        } else if self.consecutive_failures >= 3 {
            RecoveryMode::Degraded
        } else {
            self.mode
        };
    }

    /// Whether a recovery attempt is currently allowed: OFFLINE components
    /// are abandoned, and attempts are rate limited to
    /// `min(60, 2^attempts)` seconds apart.
    pub fn should_attempt_recovery(&self) -> bool {
        if self.mode == RecoveryMode::Offline {
            return false;
        }
        match self.last_failure_at {
            Some(at) => {
                let min_interval =
                    Duration::from_secs_f64(60f64.min(2f64.powi(self.recovery_attempts as i32)));
                at.elapsed() >= min_interval
            }
            None => true,
        }
    }
}

#[derive(Clone)]
struct FallbackEntry {
    value: serde_json::Value,
    cached_at: Instant,
}

/// Bounded TTL cache of recent successful results, keyed by
/// `(operation, args)`.
pub struct FallbackCache {
    inner: Mutex<LruCache<String, FallbackEntry>>,
    ttl: Duration,
}

impl FallbackCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        FallbackCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero"),
            )),
            ttl,
        }
    }

    /// Builds a cache key from an operation name and its hashable arguments.
    pub fn key<A: Hash>(operation: &str, args: &A) -> String {
        let mut hasher = DefaultHasher::new();
        args.hash(&mut hasher);
        format!("{operation}:{:016x}", hasher.finish())
    }

    /// Stores a successful result for later fallback use.
    pub fn store<T: Serialize>(&self, key: String, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(err) => {
                debug!(%key, %err, "fallback result not serializable, skipping");
                return;
            }
        };
        let mut cache = self.inner.lock().expect("fallback cache lock poisoned");
        cache.put(
            key,
            FallbackEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Loads a cached result if present and fresh.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut cache = self.inner.lock().expect("fallback cache lock poisoned");
        let entry = cache.get(key)?;
        if entry.cached_at.elapsed() > self.ttl {
            cache.pop(key);
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("fallback cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks recovery state for every registered component and owns the
/// process-wide fallback cache.
pub struct RecoveryManager {
    states: Mutex<HashMap<String, RecoveryState>>,
    fallback: FallbackCache,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    pub fn new() -> Self {
        RecoveryManager {
            states: Mutex::new(HashMap::new()),
            fallback: FallbackCache::new(FALLBACK_CACHE_SIZE, FALLBACK_CACHE_TTL),
        }
    }

    pub fn fallback(&self) -> &FallbackCache {
        &self.fallback
    }

    pub fn record_success(&self, component: &str) {
        let mut states = self.states.lock().expect("recovery states lock poisoned");
        states
            .entry(component.to_owned())
            .or_insert_with(|| RecoveryState::new(component.to_owned()))
            .record_success();
    }

    pub fn record_failure(&self, component: &str, error: &NodeError) {
        let mut states = self.states.lock().expect("recovery states lock poisoned");
        let state = states
            .entry(component.to_owned())
            .or_insert_with(|| RecoveryState::new(component.to_owned()));
        state.record_failure(error);
        if state.mode != RecoveryMode::Normal {
            warn!(
                component,
                consecutive_failures = state.consecutive_failures,
                mode = ?state.mode,
                health = ?state.health,
                "component degraded"
            );
        }
    }

    /// Notes that a recovery attempt is starting, for rate limiting.
    pub fn note_recovery_attempt(&self, component: &str) {
        let mut states = self.states.lock().expect("recovery states lock poisoned");
        if let Some(state) = states.get_mut(component) {
            state.recovery_attempts += 1;
        }
    }

    pub fn state(&self, component: &str) -> Option<RecoveryState> {
        self.states
            .lock()
            .expect("recovery states lock poisoned")
            .get(component)
            .cloned()
    }

    pub fn unregister(&self, component: &str) {
        self.states
            .lock()
            .expect("recovery states lock poisoned")
            .remove(component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn err() -> NodeError {
        NodeError::new(ErrorKind::ServiceUnavailable("down".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn failure_ladder() {
        let mut state = RecoveryState::new("node_1".into());
        assert_eq!(state.mode, RecoveryMode::Normal);

        state.record_failure(&err());
        assert_eq!(state.health, HealthStatus::Degraded);
        assert_eq!(state.mode, RecoveryMode::Normal);

        for _ in 0..2 {
            state.record_failure(&err());
        }
        assert_eq!(state.health, HealthStatus::Unhealthy);
        assert_eq!(state.mode, RecoveryMode::Degraded);

        for _ in 0..2 {
            state.record_failure(&err());
        }
        assert_eq!(state.mode, RecoveryMode::Emergency);

        for _ in 0..5 {
            state.record_failure(&err());
        }
        assert_eq!(state.mode, RecoveryMode::Offline);
        assert!(!state.should_attempt_recovery());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_requires_success_streaks() {
        let mut state = RecoveryState::new("node_1".into());
        for _ in 0..4 {
            state.record_failure(&err());
        }
        assert_eq!(state.health, HealthStatus::Unhealthy);

        // Three successes lift UNHEALTHY to DEGRADED, five more to HEALTHY.
        for _ in 0..3 {
            assert_ne!(state.health, HealthStatus::Degraded);
            state.record_success();
        }
        assert_eq!(state.health, HealthStatus::Degraded);
        for _ in 0..5 {
            assert_ne!(state.health, HealthStatus::Healthy);
            state.record_success();
        }
        assert_eq!(state.health, HealthStatus::Healthy);
        assert_eq!(state.mode, RecoveryMode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_attempts_are_rate_limited() {
        let mut state = RecoveryState::new("node_1".into());
        state.record_failure(&err());
        state.recovery_attempts = 3;
        // 2^3 = 8 seconds between attempts.
        assert!(!state.should_attempt_recovery());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(state.should_attempt_recovery());

        // The interval caps at 60 seconds.
        state.recovery_attempts = 20;
        state.record_failure(&err());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(state.should_attempt_recovery());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_cache_round_trip_and_expiry() {
        let cache = FallbackCache::new(10, Duration::from_secs(300));
        let key = FallbackCache::key("fetch_users_stats", &42i64);
        cache.store(key.clone(), &vec![(1i64, 100u64)]);
        assert_eq!(
            cache.load::<Vec<(i64, u64)>>(&key),
            Some(vec![(1, 100)])
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.load::<Vec<(i64, u64)>>(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_cache_evicts_lru() {
        let cache = FallbackCache::new(2, Duration::from_secs(300));
        cache.store("a".into(), &1i32);
        cache.store("b".into(), &2i32);
        cache.store("c".into(), &3i32);
        assert_eq!(cache.load::<i32>("a"), None);
        assert_eq!(cache.load::<i32>("c"), Some(3));
    }
}
