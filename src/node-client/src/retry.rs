// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Retry with exponential backoff and jitter.
//!
//! The delay for attempt `n` (zero-based) is
//! `min(base · 2^n, max) · multiplier(category) · jitter(0.5–1.5)`, floored
//! at 100 ms. Non-retryable errors short-circuit immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};
use warden_service::types::NodeId;

use crate::error::{ErrorCategory, ErrorKind, NodeError};

/// Backoff configuration for one operation class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy for cheap idempotent reads: fewer, quicker attempts.
    pub fn fast() -> Self {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// Policy for operations with side effects where replays are unwelcome.
    pub fn single(base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries: 1,
            base_delay,
            ..Default::default()
        }
    }

    /// No retries: one attempt only.
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Computes the backoff delay before retrying after `attempt` failures.
    ///
    /// Network errors back off longer, timeouts a little shorter; the jitter
    /// spreads simultaneous retries apart.
    pub fn backoff_delay(&self, attempt: u32, kind: &ErrorKind) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let adjusted = match kind.category() {
            ErrorCategory::Network => capped * 1.5,
            ErrorCategory::Timeout => capped * 0.8,
            _ => capped,
        };
        let jitter = 0.5 + rand::random::<f64>();
        Duration::from_secs_f64((adjusted * jitter).max(0.1))
    }

    /// Runs `f` until it succeeds, the error is non-retryable, or the retry
    /// budget is exhausted. `f` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        node_id: NodeId,
        mut f: F,
    ) -> Result<T, NodeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt + 1).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            node_id,
                            operation,
                            attempt = attempt + 1,
                            "operation recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(mut err) => {
                    err.context.attempt = attempt + 1;
                    if !err.retryable() {
                        warn!(
                            node_id,
                            operation,
                            error = %err,
                            category = %err.category(),
                            "non-retryable failure"
                        );
                        return Err(err);
                    }
                    if attempt >= self.max_retries {
                        warn!(
                            node_id,
                            operation,
                            error = %err,
                            attempts = attempt + 1,
                            "retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt, &err.kind);
                    warn!(
                        node_id,
                        operation,
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    fn unavailable() -> NodeError {
        NodeError::new(ErrorKind::ServiceUnavailable("test".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result = policy
            .retry("op", 1, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(unavailable())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .retry("op", 1, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;
        assert!(result.is_err());
        // Initial call plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_short_circuits() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .retry("op", 1, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(NodeError::new(ErrorKind::InvalidCredentials(
                        "denied".into(),
                    )))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        // Delay for attempt n stays within the jittered envelope around
        // min(base·2^n, max), with the per-category multiplier applied.
        #[test]
        fn backoff_delay_is_bounded(attempt in 0u32..10) {
            let policy = RetryPolicy::default();
            let kind = ErrorKind::ServiceUnavailable("x".into());
            let raw = (policy.base_delay.as_secs_f64()
                * policy.backoff_multiplier.powi(attempt as i32))
                .min(policy.max_delay.as_secs_f64());
            for _ in 0..32 {
                let delay = policy.backoff_delay(attempt, &kind).as_secs_f64();
                prop_assert!(delay >= raw * 0.5 - f64::EPSILON);
                prop_assert!(delay <= raw * 1.5 + f64::EPSILON);
            }
        }

        #[test]
        fn network_errors_back_off_longer(attempt in 0u32..6) {
            let policy = RetryPolicy::default();
            let network = ErrorKind::Connection("x".into());
            let raw = (policy.base_delay.as_secs_f64()
                * policy.backoff_multiplier.powi(attempt as i32))
                .min(policy.max_delay.as_secs_f64());
            for _ in 0..32 {
                let delay = policy.backoff_delay(attempt, &network).as_secs_f64();
                prop_assert!(delay <= raw * 1.5 * 1.5 + f64::EPSILON);
                prop_assert!(delay >= raw * 1.5 * 0.5 - f64::EPSILON);
            }
        }
    }
}
