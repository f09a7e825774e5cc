// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The per-node client façade.
//!
//! A [`NodeClient`] owns one connection pool, one circuit breaker per
//! operation class, the single-slot user-update queue with its streaming
//! worker, and the monitor and health-check loops. Every unary RPC runs as
//! `breaker.execute(retry(acquire → classified rpc))`, with the outcome fed
//! into the per-node recovery state.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::InterceptedService;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, info, warn};
use warden_proto::RustType;
use warden_service::auth::BearerInterceptor;
use warden_service::proto;
use warden_service::proto::node_service_client::NodeServiceClient;
use warden_service::tls::TlsMaterial;
use warden_service::types::{
    Backend, ConfigFormat, HostMetrics, NodeId, NodeStatus, PeakCategory, PeakEvent, UserUpdate,
};
use warden_service::MAX_GRPC_MESSAGE_SIZE;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{ErrorKind, NodeError, RecoveryStrategy};
use crate::metrics::NodeClientMetrics;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::recovery::{FallbackCache, RecoveryManager};
use crate::retry::RetryPolicy;

/// Deadline for fast operations: stats, status queries, config fetches.
pub const GRPC_FAST_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for slow operations: backend restart, container operations.
pub const GRPC_SLOW_TIMEOUT: Duration = Duration::from_secs(60);
/// Application-level inactivity window on streaming operations.
pub const GRPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for firewall mutations.
pub const GRPC_PORT_ACTION_TIMEOUT: Duration = Duration::from_secs(20);
/// Cadence of the client-level health check loop.
pub const CONNECTION_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(2);
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type Client = NodeServiceClient<InterceptedService<Channel, BearerInterceptor>>;

/// Operation classes, each isolated behind its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    UserStats,
    UserSync,
    BackendOperations,
    LogsStreaming,
    SystemMonitoring,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::UserStats => "user_stats",
            OpClass::UserSync => "user_sync",
            OpClass::BackendOperations => "backend_operations",
            OpClass::LogsStreaming => "logs_streaming",
            OpClass::SystemMonitoring => "system_monitoring",
        }
    }
}

struct Breakers {
    user_stats: CircuitBreaker,
    user_sync: CircuitBreaker,
    backend_operations: CircuitBreaker,
    logs_streaming: CircuitBreaker,
    system_monitoring: CircuitBreaker,
}

impl Breakers {
    fn new(node_id: NodeId) -> Self {
        let base = CircuitBreakerConfig::default();
        Breakers {
            user_stats: CircuitBreaker::new(format!("node_{node_id}_user_stats"), base),
            // Sync operations get extra slack before tripping.
            user_sync: CircuitBreaker::new(
                format!("node_{node_id}_user_sync"),
                CircuitBreakerConfig {
                    failure_threshold: base.failure_threshold + 2,
                    ..base
                },
            ),
            backend_operations: CircuitBreaker::new(format!("node_{node_id}_backend_ops"), base),
            // Logs are less critical and should recover faster.
            logs_streaming: CircuitBreaker::new(
                format!("node_{node_id}_logs"),
                CircuitBreakerConfig {
                    failure_threshold: base.failure_threshold + 1,
                    recovery_timeout: base.recovery_timeout / 2,
                    ..base
                },
            ),
            system_monitoring: CircuitBreaker::new(
                format!("node_{node_id}_system_monitor"),
                base,
            ),
        }
    }

    fn get(&self, class: OpClass) -> &CircuitBreaker {
        match class {
            OpClass::UserStats => &self.user_stats,
            OpClass::UserSync => &self.user_sync,
            OpClass::BackendOperations => &self.backend_operations,
            OpClass::LogsStreaming => &self.logs_streaming,
            OpClass::SystemMonitoring => &self.system_monitoring,
        }
    }

    fn all(&self) -> [(OpClass, &CircuitBreaker); 5] {
        [
            (OpClass::UserStats, &self.user_stats),
            (OpClass::UserSync, &self.user_sync),
            (OpClass::BackendOperations, &self.backend_operations),
            (OpClass::LogsStreaming, &self.logs_streaming),
            (OpClass::SystemMonitoring, &self.system_monitoring),
        ]
    }

    fn reset_all(&self) {
        for (_, breaker) in self.all() {
            breaker.reset();
        }
    }
}

/// Panel persistence as seen from a node client: the user set the node
/// should converge to, storage for reported backends, and the node status
/// row. Tests inject fakes.
#[async_trait]
pub trait NodeDirectory: Send + Sync + 'static {
    async fn list_users(&self, node_id: NodeId) -> anyhow::Result<Vec<UserUpdate>>;
    async fn store_backends(&self, node_id: NodeId, backends: Vec<Backend>) -> anyhow::Result<()>;
    async fn set_status(&self, node_id: NodeId, status: NodeStatus, message: Option<String>);
}

struct Tasks {
    monitor: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    streaming: Option<JoinHandle<()>>,
}

/// The panel's client for one node.
pub struct NodeClient {
    id: NodeId,
    address: String,
    domain: String,
    usage_coefficient: f64,
    bearer: BearerInterceptor,
    tls: Mutex<Option<TlsMaterial>>,
    pool: Mutex<Arc<ConnectionPool>>,
    pool_config: PoolConfig,
    breakers: Breakers,
    recovery: Arc<RecoveryManager>,
    directory: Arc<dyn NodeDirectory>,
    metrics: NodeClientMetrics,
    updates_tx: mpsc::Sender<UserUpdate>,
    updates_rx: Mutex<Option<mpsc::Receiver<UserUpdate>>>,
    synced: AtomicBool,
    health_failures: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl NodeClient {
    /// Creates a client for `node_id` at `address` (`host:port`). Does not
    /// connect; call [`NodeClient::start`]. `tls` of `None` means the
    /// deployment runs the node insecure (plaintext), which is only suitable
    /// for private networks and tests.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        address: String,
        usage_coefficient: f64,
        token: &str,
        tls: Option<TlsMaterial>,
        directory: Arc<dyn NodeDirectory>,
        recovery: Arc<RecoveryManager>,
        metrics: NodeClientMetrics,
        pool_config: PoolConfig,
    ) -> Result<Arc<Self>, NodeError> {
        let bearer = BearerInterceptor::new(token).map_err(|_| {
            NodeError::new(ErrorKind::InvalidCredentials(
                "node auth token is malformed".into(),
            ))
            .for_node(id)
        })?;
        let domain = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address.as_str())
            .to_owned();
        let pool = ConnectionPool::new(
            id,
            address.clone(),
            domain.clone(),
            tls.clone(),
            bearer.clone(),
            pool_config,
            metrics.pool.clone(),
        );
        let (updates_tx, updates_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(NodeClient {
            id,
            address,
            domain,
            usage_coefficient,
            bearer,
            tls: Mutex::new(tls),
            pool: Mutex::new(pool),
            pool_config,
            breakers: Breakers::new(id),
            recovery,
            directory,
            metrics,
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            synced: AtomicBool::new(false),
            health_failures: AtomicU32::new(0),
            shutdown_tx,
            tasks: Mutex::new(Tasks {
                monitor: None,
                health: None,
                streaming: None,
            }),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Multiplier applied to traffic this node reports.
    pub fn usage_coefficient(&self) -> f64 {
        self.usage_coefficient
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn component(&self) -> String {
        format!("node_{}", self.id)
    }

    fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool.lock().expect("pool slot lock poisoned"))
    }

    fn client_for(&self, channel: Channel) -> Client {
        NodeServiceClient::with_interceptor(channel, self.bearer.clone())
            .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE)
    }

    async fn set_status(&self, status: NodeStatus, message: Option<String>) {
        debug!(node_id = self.id, status = %status, message = message.as_deref().unwrap_or(""), "node status change");
        self.directory.set_status(self.id, status, message).await;
    }

    /// Brings the pool up, verifies reachability with an authenticated
    /// probe, marks the node healthy, and launches the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.pool().start().await;
        self.probe().await?;
        self.set_status(NodeStatus::Healthy, None).await;

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.monitor = Some(tokio::spawn(Arc::clone(self).run_monitor()));
        tasks.health = Some(tokio::spawn(Arc::clone(self).run_health()));
        tasks.streaming = Some(tokio::spawn(Arc::clone(self).run_streaming()));
        info!(node_id = self.id, address = %self.address, "node client started");
        Ok(())
    }

    /// One authenticated `FetchBackends` with a short deadline, bypassing
    /// breakers and retries. Used for reachability and recovery probes.
    async fn probe(&self) -> Result<(), NodeError> {
        let pool = self.pool();
        let conn = pool.acquire().await?;
        let mut client = self.client_for(conn.channel());
        let mut request = Request::new(proto::Empty {});
        request.set_timeout(GRPC_FAST_TIMEOUT);
        client
            .fetch_backends(request)
            .await
            .map_err(|s| NodeError::from_status(&s).for_node(self.id))?;
        Ok(())
    }

    // --- background tasks -------------------------------------------------

    async fn run_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            let snapshot = self.pool().snapshot();
            let mut critical_open_too_long = false;
            for (class, breaker) in self.breakers.all() {
                let b = breaker.snapshot();
                self.metrics.record_breaker_state(class.as_str(), b.state);
                if matches!(class, OpClass::UserSync | OpClass::BackendOperations)
                    && b.state == crate::breaker::BreakerState::Open
                    && b.time_in_state > CircuitBreakerConfig::default().monitoring_window
                {
                    critical_open_too_long = true;
                }
            }

            if critical_open_too_long {
                warn!(node_id = self.id, "critical circuit breaker open beyond window");
                self.set_status(
                    NodeStatus::Unhealthy,
                    Some("critical operations circuit broken".into()),
                )
                .await;
                continue;
            }

            if snapshot.available > 0 || snapshot.size > 0 {
                if !self.is_synced() {
                    match self.sync().await {
                        Ok(()) => {
                            self.set_status(NodeStatus::Healthy, None).await;
                            info!(node_id = self.id, "node synced and ready");
                        }
                        Err(err) => {
                            warn!(node_id = self.id, error = %err, "node sync failed");
                            self.set_status(NodeStatus::Unhealthy, Some("sync failed".into()))
                                .await;
                        }
                    }
                }
            } else {
                debug!(node_id = self.id, "no pool connections available");
                self.synced.store(false, Ordering::SeqCst);
                self.set_status(
                    NodeStatus::Unhealthy,
                    Some("no available connections".into()),
                )
                .await;
            }
        }
    }

    async fn run_health(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(CONNECTION_HEALTH_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            if self.health_check().await {
                self.health_failures.store(0, Ordering::SeqCst);
                self.recovery.record_success(&self.component());
                continue;
            }

            let failures = self.health_failures.fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.health_check_failures.inc();
            warn!(
                node_id = self.id,
                consecutive_failures = failures,
                "health check failed"
            );
            // Progressive escalation: log, refresh the pool, full recovery,
            // then declare the node unhealthy.
            match failures {
                1 => {}
                2..=3 => self.pool().sweep().await,
                4..=5 => {
                    if let Err(err) = self.recover_connection().await {
                        warn!(node_id = self.id, error = %err, "connection recovery failed");
                    }
                }
                _ => {
                    self.synced.store(false, Ordering::SeqCst);
                    self.set_status(
                        NodeStatus::Unhealthy,
                        Some("repeated health check failures".into()),
                    )
                    .await;
                    self.recovery.record_failure(
                        &self.component(),
                        &NodeError::new(ErrorKind::HealthCheckTimeout(format!(
                            "{failures} consecutive health check failures"
                        )))
                        .for_node(self.id),
                    );
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        let snapshot = self.pool().snapshot();
        if snapshot.size == 0 && snapshot.available == 0 {
            return false;
        }
        let critical_open = [OpClass::UserSync, OpClass::BackendOperations]
            .iter()
            .filter(|class| self.breakers.get(**class).is_open())
            .count();
        if critical_open > 1 {
            return false;
        }
        self.probe().await.is_ok()
    }

    /// Full connection recovery: rebuild the TLS-backed pool from scratch
    /// (picking up rotated certificate material) and verify connectivity.
    pub async fn recover_connection(&self) -> Result<(), NodeError> {
        let component = self.component();
        if let Some(state) = self.recovery.state(&component) {
            if !state.should_attempt_recovery() {
                return Err(NodeError::new(ErrorKind::ServiceDegraded(
                    "recovery attempts rate limited".into(),
                ))
                .for_node(self.id));
            }
        }
        self.recovery.note_recovery_attempt(&component);
        info!(node_id = self.id, "recovering node connection");

        let old_pool = self.pool();
        old_pool.stop().await;

        let tls = self.tls.lock().expect("tls lock poisoned").clone();
        let new_pool = ConnectionPool::new(
            self.id,
            self.address.clone(),
            self.domain.clone(),
            tls,
            self.bearer.clone(),
            self.pool_config,
            self.metrics.pool.clone(),
        );
        new_pool.start().await;
        *self.pool.lock().expect("pool slot lock poisoned") = new_pool;

        self.probe().await?;
        self.health_failures.store(0, Ordering::SeqCst);
        self.set_status(NodeStatus::Healthy, None).await;
        info!(node_id = self.id, "node connection recovered");
        Ok(())
    }

    async fn run_streaming(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut updates_rx = match self
            .updates_rx
            .lock()
            .expect("updates receiver lock poisoned")
            .take()
        {
            Some(rx) => rx,
            None => return,
        };

        'stream: loop {
            if *shutdown.borrow() {
                return;
            }
            let conn = match self.pool().acquire().await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(node_id = self.id, error = %err, "stream waiting for a connection");
                    tokio::select! {
                        _ = tokio::time::sleep(STREAM_RETRY_DELAY) => continue 'stream,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            let (tx, rx) = mpsc::channel::<proto::UserData>(1);
            let mut client = self.client_for(conn.channel());
            let mut call = Box::pin(client.sync_users(Request::new(ReceiverStream::new(rx))));
            debug!(node_id = self.id, "user update stream opened");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    result = &mut call => {
                        match result {
                            Ok(_) => debug!(node_id = self.id, "user update stream closed by node"),
                            Err(status) => {
                                let err = NodeError::from_status(&status).for_node(self.id);
                                warn!(node_id = self.id, error = %err, "user update stream detached");
                                self.breakers.get(OpClass::UserSync).on_failure(&err);
                            }
                        }
                        self.synced.store(false, Ordering::SeqCst);
                        break;
                    }
                    update = updates_rx.recv() => {
                        let Some(update) = update else { return };
                        let message = update.into_proto();
                        // The send must race the call future: the request
                        // stream is only pumped while the call is polled.
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            sent = tx.send(message) => {
                                if sent.is_err() {
                                    // Stream went away mid-handoff. The update
                                    // is lost (at-most-once); repopulation
                                    // after re-sync supersedes it.
                                    self.synced.store(false, Ordering::SeqCst);
                                    break;
                                }
                                debug!(node_id = self.id, "user update sent");
                            }
                            result = &mut call => {
                                if let Err(status) = result {
                                    let err = NodeError::from_status(&status).for_node(self.id);
                                    warn!(node_id = self.id, error = %err, "user update stream detached");
                                    self.breakers.get(OpClass::UserSync).on_failure(&err);
                                }
                                self.synced.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
            }

            drop(call);
            drop(conn);
            tokio::select! {
                _ = tokio::time::sleep(STREAM_RETRY_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    // --- operator-facing operations ---------------------------------------

    /// Enqueues a user update for the streaming worker. The queue holds a
    /// single update; when the node is slow, callers are naturally
    /// backpressured here.
    pub async fn update_user(&self, update: UserUpdate) -> Result<(), NodeError> {
        self.metrics.user_updates_enqueued.inc();
        self.updates_tx.send(update).await.map_err(|_| {
            NodeError::new(ErrorKind::ServiceUnavailable(
                "node client is stopped".into(),
            ))
            .for_node(self.id)
        })
    }

    /// Full reconciliation: fetch and persist the node's backends, then push
    /// the authoritative user list.
    pub async fn sync(&self) -> Result<(), NodeError> {
        let backends = self.fetch_backends().await?;
        self.directory
            .store_backends(self.id, backends)
            .await
            .map_err(|e| {
                NodeError::new(ErrorKind::Backend(format!("storing backends failed: {e:#}")))
                    .for_node(self.id)
            })?;
        let users = self.directory.list_users(self.id).await.map_err(|e| {
            NodeError::new(ErrorKind::Backend(format!("listing users failed: {e:#}")))
                .for_node(self.id)
        })?;
        self.repopulate_users(users).await?;
        self.synced.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute<T, F, Fut>(
        &self,
        class: OpClass,
        operation: &'static str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T, NodeError>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let breaker = self.breakers.get(class);
        let result = breaker
            .execute(|| async {
                policy
                    .retry(operation, self.id, |_attempt| async {
                        let pool = self.pool();
                        let conn = pool.acquire().await?;
                        let out = f(self.client_for(conn.channel())).await;
                        if let Err(err) = &out {
                            pool.note_failure(err);
                        }
                        out
                    })
                    .await
            })
            .await;

        let component = self.component();
        match &result {
            Ok(_) => {
                self.recovery.record_success(&component);
                self.metrics.record_rpc_success(operation);
            }
            Err(err) => {
                self.recovery.record_failure(&component, err);
                self.metrics.record_rpc_failure(operation, err);
            }
        }
        result.map_err(|e| e.for_node(self.id).during(operation))
    }

    /// Like [`Self::execute`], but keeps the last successful result in the
    /// fallback cache and serves it (stale) when a failure's recovery
    /// strategies include FALLBACK.
    async fn execute_cached<T, F, Fut>(
        &self,
        class: OpClass,
        operation: &'static str,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T, NodeError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let key = FallbackCache::key(operation, &self.id);
        match self.execute(class, operation, policy, f).await {
            Ok(value) => {
                self.recovery.fallback().store(key, &value);
                Ok(value)
            }
            Err(err) if err.supports(RecoveryStrategy::Fallback) => {
                match self.recovery.fallback().load::<T>(&key) {
                    Some(value) => {
                        info!(
                            node_id = self.id,
                            operation, "serving cached fallback data after failure"
                        );
                        Ok(value)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    // --- unary RPCs --------------------------------------------------------

    /// Fetches the backends (and their inbounds) the node reports.
    pub async fn fetch_backends(&self) -> Result<Vec<Backend>, NodeError> {
        self.execute(
            OpClass::BackendOperations,
            "fetch_backends",
            RetryPolicy::default(),
            |mut client| async move {
                let mut request = Request::new(proto::Empty {});
                request.set_timeout(GRPC_FAST_TIMEOUT);
                let response = client
                    .fetch_backends(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                Vec::<Backend>::from_proto(response.into_inner().backends)
                    .map_err(NodeError::from_decode)
            },
        )
        .await
    }

    /// Pushes the authoritative user list; the node removes users absent
    /// from it.
    pub async fn repopulate_users(&self, users: Vec<UserUpdate>) -> Result<(), NodeError> {
        let payload = proto::UsersData {
            users_data: users.into_proto(),
        };
        self.execute(
            OpClass::UserSync,
            "repopulate_users",
            RetryPolicy::default(),
            move |mut client| {
                let payload = payload.clone();
                async move {
                    let mut request = Request::new(payload);
                    request.set_timeout(GRPC_SLOW_TIMEOUT);
                    client
                        .repopulate_users(request)
                        .await
                        .map_err(|s| NodeError::from_status(&s))?;
                    Ok(())
                }
            },
        )
        .await
    }

    /// Per-user traffic counters, in bytes, summed across backends.
    pub async fn fetch_users_stats(&self) -> Result<Vec<(i64, u64)>, NodeError> {
        self.execute_cached(
            OpClass::UserStats,
            "fetch_users_stats",
            RetryPolicy::fast(),
            |mut client| async move {
                let mut request = Request::new(proto::Empty {});
                request.set_timeout(GRPC_FAST_TIMEOUT);
                let response = client
                    .fetch_users_stats(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                Ok(response
                    .into_inner()
                    .users_stats
                    .into_iter()
                    .map(|s| (s.uid, s.usage))
                    .collect())
            },
        )
        .await
    }

    pub async fn get_backend_config(
        &self,
        name: &str,
    ) -> Result<(String, ConfigFormat), NodeError> {
        let name = name.to_owned();
        self.execute(
            OpClass::BackendOperations,
            "get_backend_config",
            RetryPolicy::fast(),
            move |mut client| {
                let name = name.clone();
                async move {
                    let mut request = Request::new(proto::Backend {
                        name,
                        ..Default::default()
                    });
                    request.set_timeout(GRPC_FAST_TIMEOUT);
                    let response = client
                        .fetch_backend_config(request)
                        .await
                        .map_err(|s| NodeError::from_status(&s))?
                        .into_inner();
                    let format = ConfigFormat::from_proto(response.config_format)
                        .map_err(NodeError::from_decode)?;
                    Ok((response.configuration, format))
                }
            },
        )
        .await
    }

    /// Pushes a new configuration and restarts the backend, then re-syncs
    /// (a restart may change the inbound set).
    pub async fn restart_backend(
        &self,
        name: &str,
        config: &str,
        format: ConfigFormat,
    ) -> Result<(), NodeError> {
        let name = name.to_owned();
        let config = config.to_owned();
        let result = self
            .execute(
                OpClass::BackendOperations,
                "restart_backend",
                RetryPolicy::none(),
                move |mut client| {
                    let name = name.clone();
                    let config = config.clone();
                    async move {
                        let mut request = Request::new(proto::RestartBackendRequest {
                            backend_name: name,
                            config: Some(proto::BackendConfig {
                                configuration: config,
                                config_format: format.into_proto(),
                            }),
                        });
                        request.set_timeout(GRPC_SLOW_TIMEOUT);
                        client
                            .restart_backend(request)
                            .await
                            .map_err(|s| NodeError::from_status(&s))?;
                        Ok(())
                    }
                },
            )
            .await;

        match result {
            Ok(()) => {
                if let Err(err) = self.sync().await {
                    warn!(node_id = self.id, error = %err, "sync after backend restart failed");
                    self.set_status(NodeStatus::Unhealthy, Some("sync failed".into()))
                        .await;
                    return Err(err);
                }
                self.set_status(NodeStatus::Healthy, None).await;
                Ok(())
            }
            Err(err) => {
                self.synced.store(false, Ordering::SeqCst);
                self.set_status(NodeStatus::Unhealthy, None).await;
                Err(err)
            }
        }
    }

    pub async fn get_backend_stats(&self, name: &str) -> Result<bool, NodeError> {
        let name = name.to_owned();
        self.execute(
            OpClass::BackendOperations,
            "get_backend_stats",
            RetryPolicy::fast(),
            move |mut client| {
                let name = name.clone();
                async move {
                    let mut request = Request::new(proto::Backend {
                        name,
                        ..Default::default()
                    });
                    request.set_timeout(GRPC_FAST_TIMEOUT);
                    let response = client
                        .get_backend_stats(request)
                        .await
                        .map_err(|s| NodeError::from_status(&s))?;
                    Ok(response.into_inner().running)
                }
            },
        )
        .await
    }

    /// Liveness of every backend in one round trip.
    pub async fn get_all_backends_stats(&self) -> Result<BTreeMap<String, bool>, NodeError> {
        self.execute_cached(
            OpClass::BackendOperations,
            "get_all_backends_stats",
            RetryPolicy::fast(),
            |mut client| async move {
                let mut request = Request::new(proto::Empty {});
                request.set_timeout(GRPC_FAST_TIMEOUT);
                let response = client
                    .get_all_backends_stats(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                Ok(response
                    .into_inner()
                    .backend_stats
                    .into_iter()
                    .map(|(name, stats)| (name, stats.running))
                    .collect())
            },
        )
        .await
    }

    pub async fn get_host_system_metrics(&self) -> Result<HostMetrics, NodeError> {
        self.execute_cached(
            OpClass::SystemMonitoring,
            "get_host_system_metrics",
            RetryPolicy::fast(),
            |mut client| async move {
                let mut request = Request::new(proto::Empty {});
                request.set_timeout(GRPC_FAST_TIMEOUT);
                let response = client
                    .get_host_system_metrics(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                HostMetrics::from_proto(response.into_inner()).map_err(NodeError::from_decode)
            },
        )
        .await
    }

    pub async fn open_host_port(&self, port: u16, protocol: &str) -> Result<bool, NodeError> {
        self.host_port_action("open_host_port", port, protocol).await
    }

    pub async fn close_host_port(&self, port: u16, protocol: &str) -> Result<bool, NodeError> {
        self.host_port_action("close_host_port", port, protocol)
            .await
    }

    async fn host_port_action(
        &self,
        operation: &'static str,
        port: u16,
        protocol: &str,
    ) -> Result<bool, NodeError> {
        let protocol = protocol.to_owned();
        // Firewall mutations are not idempotent enough for eager replays.
        self.execute(
            OpClass::SystemMonitoring,
            operation,
            RetryPolicy::single(Duration::from_secs(1)),
            move |mut client| {
                let protocol = protocol.clone();
                async move {
                    let mut request = Request::new(proto::PortActionRequest {
                        port: u32::from(port),
                        protocol,
                    });
                    request.set_timeout(GRPC_PORT_ACTION_TIMEOUT);
                    let response = match operation {
                        "open_host_port" => client.open_host_port(request).await,
                        _ => client.close_host_port(request).await,
                    }
                    .map_err(|s| NodeError::from_status(&s))?
                    .into_inner();
                    if !response.success {
                        debug!(port, message = %response.message, "port action refused");
                    }
                    Ok(response.success)
                }
            },
        )
        .await
    }

    pub async fn get_container_logs(&self, tail: u32) -> Result<Vec<String>, NodeError> {
        self.execute(
            OpClass::LogsStreaming,
            "get_container_logs",
            RetryPolicy::fast(),
            move |mut client| async move {
                let mut request = Request::new(proto::ContainerLogsRequest { tail });
                request.set_timeout(GRPC_SLOW_TIMEOUT);
                let response = client
                    .get_container_logs(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                Ok(response.into_inner().logs)
            },
        )
        .await
    }

    pub async fn get_container_files(
        &self,
        path: &str,
    ) -> Result<Vec<proto::FileInfo>, NodeError> {
        let path = path.to_owned();
        self.execute(
            OpClass::BackendOperations,
            "get_container_files",
            RetryPolicy::fast(),
            move |mut client| {
                let path = path.clone();
                async move {
                    let mut request = Request::new(proto::ContainerFilesRequest { path });
                    request.set_timeout(GRPC_SLOW_TIMEOUT);
                    let response = client
                        .get_container_files(request)
                        .await
                        .map_err(|s| NodeError::from_status(&s))?;
                    Ok(response.into_inner().files)
                }
            },
        )
        .await
    }

    pub async fn restart_container(&self) -> Result<bool, NodeError> {
        self.execute(
            OpClass::BackendOperations,
            "restart_container",
            RetryPolicy::single(Duration::from_secs(2)),
            |mut client| async move {
                let mut request = Request::new(proto::Empty {});
                request.set_timeout(GRPC_SLOW_TIMEOUT);
                let response = client
                    .restart_container(request)
                    .await
                    .map_err(|s| NodeError::from_status(&s))?;
                Ok(response.into_inner().success)
            },
        )
        .await
    }

    // --- streaming RPCs ----------------------------------------------------

    /// Tails a backend's logs. Buffered lines come first when
    /// `include_buffer` is set; the stream then follows live output until
    /// dropped.
    pub fn stream_logs(
        self: &Arc<Self>,
        name: String,
        include_buffer: bool,
    ) -> impl Stream<Item = Result<String, NodeError>> {
        let this = Arc::clone(self);
        async_stream::stream! {
            let breaker = this.breakers.get(OpClass::LogsStreaming);
            if let Err(err) = breaker.try_acquire() {
                yield Err(err.for_node(this.id).during("stream_logs"));
                return;
            }
            let pool = this.pool();
            let conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(err) => {
                    breaker.on_failure(&err);
                    yield Err(err.during("stream_logs"));
                    return;
                }
            };
            let mut client = this.client_for(conn.channel());
            let request = Request::new(proto::BackendLogsRequest {
                backend_name: name,
                include_buffer,
            });
            let mut stream = match client.stream_backend_logs(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    let err = NodeError::from_status(&status).for_node(this.id);
                    breaker.on_failure(&err);
                    yield Err(err.during("stream_logs"));
                    return;
                }
            };
            loop {
                match tokio::time::timeout(GRPC_STREAM_TIMEOUT, stream.message()).await {
                    // Quiet tail; the transport keepalive owns liveness.
                    Err(_) => continue,
                    Ok(Ok(Some(line))) => {
                        breaker.on_success();
                        yield Ok(line.line);
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(status)) => {
                        let err = NodeError::from_status(&status).for_node(this.id);
                        breaker.on_failure(&err);
                        yield Err(err.during("stream_logs"));
                        break;
                    }
                }
            }
        }
    }

    /// Live peak events from the node. The stream stays open across quiet
    /// periods; it ends only on error or client drop.
    pub fn stream_peak_events(
        self: &Arc<Self>,
    ) -> impl Stream<Item = Result<PeakEvent, NodeError>> {
        let this = Arc::clone(self);
        async_stream::stream! {
            let pool = this.pool();
            let conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(err) => {
                    yield Err(err.during("stream_peak_events"));
                    return;
                }
            };
            let mut client = this.client_for(conn.channel());
            let mut stream = match client.stream_peak_events(Request::new(proto::Empty {})).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    let err = NodeError::from_status(&status).for_node(this.id);
                    yield Err(err.during("stream_peak_events"));
                    return;
                }
            };
            loop {
                match tokio::time::timeout(GRPC_STREAM_TIMEOUT, stream.message()).await {
                    Err(_) => continue,
                    Ok(Ok(Some(event))) => {
                        match PeakEvent::from_proto(event) {
                            Ok(event) => {
                                this.metrics.peak_events_received.inc();
                                yield Ok(event);
                            }
                            Err(err) => yield Err(NodeError::from_decode(err).for_node(this.id)),
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(status)) => {
                        let err = NodeError::from_status(&status).for_node(this.id);
                        this.synced.store(false, Ordering::SeqCst);
                        yield Err(err.during("stream_peak_events"));
                        break;
                    }
                }
            }
        }
    }

    /// Replays retained peak events, oldest first.
    pub fn fetch_peak_events(
        self: &Arc<Self>,
        since_ms: i64,
        category: Option<PeakCategory>,
    ) -> impl Stream<Item = Result<PeakEvent, NodeError>> {
        let this = Arc::clone(self);
        async_stream::stream! {
            let pool = this.pool();
            let conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(err) => {
                    yield Err(err.during("fetch_peak_events"));
                    return;
                }
            };
            let mut client = this.client_for(conn.channel());
            let query = proto::PeakQuery {
                since_ms,
                category: category.map(|c| c.into_proto()),
            };
            let mut request = Request::new(query);
            request.set_timeout(GRPC_STREAM_TIMEOUT);
            let mut stream = match client.fetch_peak_events(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    let err = NodeError::from_status(&status).for_node(this.id);
                    yield Err(err.during("fetch_peak_events"));
                    return;
                }
            };
            loop {
                match stream.message().await {
                    Ok(Some(event)) => match PeakEvent::from_proto(event) {
                        Ok(event) => yield Ok(event),
                        Err(err) => yield Err(NodeError::from_decode(err).for_node(this.id)),
                    },
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(NodeError::from_status(&status).for_node(this.id));
                        break;
                    }
                }
            }
        }
    }

    // --- shutdown ----------------------------------------------------------

    /// Graceful stop: cancels the health, monitor, and streaming tasks in
    /// that order (bounded waits), resets the breakers, drains and stops the
    /// pool, drops certificate material, and records the node unhealthy.
    pub async fn stop(&self) {
        info!(node_id = self.id, "stopping node client");
        let _ = self.shutdown_tx.send(true);

        let (health, monitor, streaming) = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            (
                tasks.health.take(),
                tasks.monitor.take(),
                tasks.streaming.take(),
            )
        };
        for (name, task) in [
            ("health", health),
            ("monitor", monitor),
            ("streaming", streaming),
        ] {
            let Some(mut task) = task else { continue };
            match tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await {
                Ok(_) => debug!(node_id = self.id, task = name, "task stopped"),
                Err(_) => {
                    warn!(node_id = self.id, task = name, "task did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        self.breakers.reset_all();
        self.pool().stop().await;
        *self.tls.lock().expect("tls lock poisoned") = None;
        self.recovery.unregister(&self.component());
        self.synced.store(false, Ordering::SeqCst);
        self.set_status(NodeStatus::Unhealthy, Some("shutdown".into()))
            .await;
        info!(node_id = self.id, "node client stopped");
    }

    /// Monitoring view over the pool and breakers.
    pub fn breaker_snapshots(&self) -> Vec<crate::breaker::BreakerSnapshot> {
        self.breakers.all().iter().map(|(_, b)| b.snapshot()).collect()
    }

    pub fn pool_snapshot(&self) -> crate::pool::PoolSnapshot {
        self.pool().snapshot()
    }
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("synced", &self.is_synced())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use warden_service::types::User;

    use super::*;

    struct NullDirectory;

    #[async_trait]
    impl NodeDirectory for NullDirectory {
        async fn list_users(&self, _node_id: NodeId) -> anyhow::Result<Vec<UserUpdate>> {
            Ok(Vec::new())
        }

        async fn store_backends(
            &self,
            _node_id: NodeId,
            _backends: Vec<Backend>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn set_status(
            &self,
            _node_id: NodeId,
            _status: NodeStatus,
            _message: Option<String>,
        ) {
        }
    }

    fn test_client() -> Arc<NodeClient> {
        NodeClient::new(
            1,
            "127.0.0.1:62050".into(),
            1.0,
            "wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g",
            None,
            Arc::new(NullDirectory),
            Arc::new(RecoveryManager::new()),
            NodeClientMetrics::detached(),
            PoolConfig::default(),
        )
        .expect("client construction succeeds")
    }

    fn update(id: i64) -> UserUpdate {
        UserUpdate {
            user: User {
                id,
                username: format!("user{id}"),
                key: "00112233445566778899aabbccddeeff".into(),
            },
            inbounds: BTreeSet::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn update_queue_backpressures_when_worker_is_paused() {
        // The client is never started, so no streaming worker drains the
        // queue: the first update occupies the slot, the second must wait.
        let client = test_client();
        client.update_user(update(1)).await.unwrap();

        let second = client.update_user(update(2));
        tokio::pin!(second);
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), second.as_mut()).await;
        assert!(outcome.is_err(), "second update must block on the full slot");
    }

    #[tokio::test(start_paused = true)]
    async fn updates_drain_in_order_without_loss() {
        let client = test_client();
        // Take the worker's receiver the way the streaming task would.
        let mut rx = client
            .updates_rx
            .lock()
            .unwrap()
            .take()
            .expect("receiver available");

        let sender = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                for id in 1..=3 {
                    client.update_user(update(id)).await.unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.expect("update delivered").user.id);
        }
        sender.await.unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_at_construction() {
        let result = NodeClient::new(
            1,
            "127.0.0.1:62050".into(),
            1.0,
            "bad token",
            None,
            Arc::new(NullDirectory),
            Arc::new(RecoveryManager::new()),
            NodeClientMetrics::detached(),
            PoolConfig::default(),
        );
        assert!(result.is_err());
    }
}
