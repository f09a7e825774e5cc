// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for panel→node clients.
//!
//! One [`ClientMetrics`] is registered per process; each node client binds
//! its `node_id` label once at construction via [`ClientMetrics::for_node`].

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use warden_service::types::NodeId;

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels)
        .expect("metric definition is well-formed");
    registry
        .register(Box::new(vec.clone()))
        .expect("metric is not registered twice");
    vec
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("metric definition is well-formed");
    registry
        .register(Box::new(vec.clone()))
        .expect("metric is not registered twice");
    vec
}

/// Process-wide metric families for all node clients.
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    pool_size: IntGaugeVec,
    pool_available: IntGaugeVec,
    pool_unhealthy: IntGaugeVec,
    pool_instability: IntGaugeVec,
    pool_connections_created: IntCounterVec,
    pool_connections_closed: IntCounterVec,
    pool_acquire_timeouts: IntCounterVec,
    pool_health_failures: IntCounterVec,
    breaker_state: IntGaugeVec,
    rpc_successes: IntCounterVec,
    rpc_failures: IntCounterVec,
    health_check_failures: IntCounterVec,
    user_updates_enqueued: IntCounterVec,
    peak_events_received: IntCounterVec,
}

impl ClientMetrics {
    /// Registers the node-client metric families into a `registry`.
    pub fn register_with(registry: &Registry) -> Self {
        ClientMetrics {
            pool_size: gauge_vec(
                registry,
                "warden_pool_size",
                "Connections currently held by the per-node pool.",
                &["node_id"],
            ),
            pool_available: gauge_vec(
                registry,
                "warden_pool_available",
                "Healthy idle connections in the per-node pool.",
                &["node_id"],
            ),
            pool_unhealthy: gauge_vec(
                registry,
                "warden_pool_unhealthy",
                "Connections marked unhealthy and pending removal.",
                &["node_id"],
            ),
            pool_instability: gauge_vec(
                registry,
                "warden_pool_network_instability",
                "Rolling network-instability count for the node.",
                &["node_id"],
            ),
            pool_connections_created: counter_vec(
                registry,
                "warden_pool_connections_created_total",
                "Connections the pool has established.",
                &["node_id"],
            ),
            pool_connections_closed: counter_vec(
                registry,
                "warden_pool_connections_closed_total",
                "Connections the pool has closed.",
                &["node_id"],
            ),
            pool_acquire_timeouts: counter_vec(
                registry,
                "warden_pool_acquire_timeouts_total",
                "Acquisitions that failed within the acquire timeout.",
                &["node_id"],
            ),
            pool_health_failures: counter_vec(
                registry,
                "warden_pool_health_check_failures_total",
                "Pool connection health probes that failed.",
                &["node_id"],
            ),
            breaker_state: gauge_vec(
                registry,
                "warden_circuit_breaker_state",
                "Circuit breaker state (0=CLOSED, 1=OPEN, 2=HALF_OPEN).",
                &["node_id", "class"],
            ),
            rpc_successes: counter_vec(
                registry,
                "warden_node_rpc_success_total",
                "Node RPCs that completed successfully.",
                &["node_id", "operation"],
            ),
            rpc_failures: counter_vec(
                registry,
                "warden_node_rpc_failure_total",
                "Node RPCs that failed, by error category and severity.",
                &["node_id", "operation", "category", "severity"],
            ),
            health_check_failures: counter_vec(
                registry,
                "warden_node_health_check_failures_total",
                "Client-level health checks that failed.",
                &["node_id"],
            ),
            user_updates_enqueued: counter_vec(
                registry,
                "warden_user_updates_enqueued_total",
                "User updates accepted into the per-node queue.",
                &["node_id"],
            ),
            peak_events_received: counter_vec(
                registry,
                "warden_peak_events_received_total",
                "Peak events received from the node.",
                &["node_id"],
            ),
        }
    }

    /// Binds all families to one node's label.
    pub fn for_node(&self, node_id: NodeId) -> NodeClientMetrics {
        let node = node_id.to_string();
        NodeClientMetrics {
            pool: PoolMetrics {
                size: self.pool_size.with_label_values(&[&node]),
                available: self.pool_available.with_label_values(&[&node]),
                unhealthy: self.pool_unhealthy.with_label_values(&[&node]),
                instability: self.pool_instability.with_label_values(&[&node]),
                connections_created: self.pool_connections_created.with_label_values(&[&node]),
                connections_closed: self.pool_connections_closed.with_label_values(&[&node]),
                acquire_timeouts: self.pool_acquire_timeouts.with_label_values(&[&node]),
                health_failures: self.pool_health_failures.with_label_values(&[&node]),
            },
            breaker_state: self.breaker_state.clone(),
            rpc_successes: self.rpc_successes.clone(),
            rpc_failures: self.rpc_failures.clone(),
            health_check_failures: self.health_check_failures.with_label_values(&[&node]),
            user_updates_enqueued: self.user_updates_enqueued.with_label_values(&[&node]),
            peak_events_received: self.peak_events_received.with_label_values(&[&node]),
            node,
        }
    }
}

/// Pool metric handles bound to one node.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub size: IntGauge,
    pub available: IntGauge,
    pub unhealthy: IntGauge,
    pub instability: IntGauge,
    pub connections_created: IntCounter,
    pub connections_closed: IntCounter,
    pub acquire_timeouts: IntCounter,
    pub health_failures: IntCounter,
}

impl PoolMetrics {
    /// Unregistered handles, for tests and tools that don't scrape.
    pub fn detached() -> Self {
        PoolMetrics {
            size: IntGauge::new("pool_size", "detached").expect("valid metric"),
            available: IntGauge::new("pool_available", "detached").expect("valid metric"),
            unhealthy: IntGauge::new("pool_unhealthy", "detached").expect("valid metric"),
            instability: IntGauge::new("pool_instability", "detached").expect("valid metric"),
            connections_created: IntCounter::new("pool_created", "detached")
                .expect("valid metric"),
            connections_closed: IntCounter::new("pool_closed", "detached").expect("valid metric"),
            acquire_timeouts: IntCounter::new("pool_acquire_timeouts", "detached")
                .expect("valid metric"),
            health_failures: IntCounter::new("pool_health_failures", "detached")
                .expect("valid metric"),
        }
    }
}

/// All metric handles a single node client needs.
#[derive(Debug, Clone)]
pub struct NodeClientMetrics {
    pub pool: PoolMetrics,
    node: String,
    breaker_state: IntGaugeVec,
    rpc_successes: IntCounterVec,
    rpc_failures: IntCounterVec,
    pub health_check_failures: IntCounter,
    pub user_updates_enqueued: IntCounter,
    pub peak_events_received: IntCounter,
}

impl NodeClientMetrics {
    /// Unregistered handles, for tests.
    pub fn detached() -> Self {
        let registry = Registry::new();
        ClientMetrics::register_with(&registry).for_node(0)
    }

    pub fn record_breaker_state(&self, class: &str, state: crate::breaker::BreakerState) {
        let value = match state {
            crate::breaker::BreakerState::Closed => 0,
            crate::breaker::BreakerState::Open => 1,
            crate::breaker::BreakerState::HalfOpen => 2,
        };
        self.breaker_state
            .with_label_values(&[&self.node, class])
            .set(value);
    }

    pub fn record_rpc_success(&self, operation: &str) {
        self.rpc_successes
            .with_label_values(&[&self.node, operation])
            .inc();
    }

    pub fn record_rpc_failure(&self, operation: &str, err: &crate::error::NodeError) {
        self.rpc_failures
            .with_label_values(&[
                &self.node,
                operation,
                err.category().as_str(),
                err.severity().as_str(),
            ])
            .inc();
    }
}
