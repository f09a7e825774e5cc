// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Panel-side client for a single warden node.
//!
//! A [`NodeClient`](client::NodeClient) owns everything the panel needs to
//! talk to one node: a TLS-pinned [connection pool](pool), one
//! [circuit breaker](breaker) per operation class, the
//! [retry](retry)/[recovery](recovery) machinery, and the long-lived
//! user-update stream with its single-slot queue.
//!
//! Layering (outermost first) for every unary RPC:
//!
//! ```text
//! breaker.execute( retry( acquire connection → classified RPC ) )
//! ```
//!
//! with the recovery state updated from the outcome of the whole call.

pub mod breaker;
pub mod client;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod recovery;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use client::{NodeClient, NodeDirectory, OpClass};
pub use error::{ErrorCategory, ErrorKind, ErrorSeverity, NodeError, RecoveryStrategy};
pub use pool::{ConnectionPool, PoolConfig};
pub use recovery::{HealthStatus, RecoveryManager, RecoveryMode, RecoveryState};
pub use retry::RetryPolicy;
