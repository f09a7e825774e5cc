// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-node pool of gRPC channels over mutual TLS.
//!
//! The pool keeps between `min_size` and `max_size` connections alive,
//! health-checks idle ones with an authenticated probe, retires expired and
//! idle connections, and adapts to unstable networks by shrinking its target
//! size and rebuilding itself when failure text suggests the node's
//! container restarted.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, info, warn};
use warden_service::auth::BearerInterceptor;
use warden_service::proto;
use warden_service::proto::node_service_client::NodeServiceClient;
use warden_service::tls::TlsMaterial;
use warden_service::types::NodeId;

use crate::error::{container_restart_suspected, ErrorCategory, ErrorKind, NodeError};
use crate::metrics::PoolMetrics;

/// Pool tuning. Defaults mirror the production deployment profile.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub connection_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    pub connect_timeout: Duration,
    /// Delay before rebuilding the pool after a suspected container restart.
    pub rebuild_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 5,
            max_size: 10,
            connection_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            rebuild_delay: Duration::from_secs(2),
        }
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ACQUIRE_POLL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
struct PooledConn {
    id: u64,
    channel: Channel,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    healthy: bool,
    use_count: u64,
}

impl PooledConn {
    fn is_expired(&self, lifetime: Duration) -> bool {
        self.created_at.elapsed() > lifetime
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        !self.in_use && self.last_used.elapsed() > idle_timeout
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    conns: Vec<PooledConn>,
    shutdown: bool,
    instability: u32,
    rebuild_pending: bool,
    next_id: u64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub unhealthy: usize,
    pub instability: u32,
}

/// A multiplexed, health-checked channel pool for one node.
pub struct ConnectionPool {
    node_id: NodeId,
    address: String,
    domain: String,
    /// `None` runs plaintext; only for private networks and tests.
    tls: Option<TlsMaterial>,
    bearer: BearerInterceptor,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: PoolMetrics,
}

/// An acquired connection. Dropping it returns the connection to the pool.
#[derive(Debug)]
pub struct PooledConnection {
    channel: Channel,
    id: u64,
    pool: Weak<ConnectionPool>,
}

impl PooledConnection {
    /// The underlying channel. Channels are cheap to clone; the pooled entry
    /// stays reserved until this guard drops.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id);
        }
    }
}

impl ConnectionPool {
    pub fn new(
        node_id: NodeId,
        address: String,
        domain: String,
        tls: Option<TlsMaterial>,
        bearer: BearerInterceptor,
        config: PoolConfig,
        metrics: PoolMetrics,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(ConnectionPool {
            node_id,
            address,
            domain,
            tls,
            bearer,
            config,
            inner: Mutex::new(PoolInner::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            metrics,
        })
    }

    /// Pre-populates the pool and starts the health and cleanup loops.
    /// Connection failures here are tolerated; callers verify reachability
    /// with their own probe.
    pub async fn start(self: &Arc<Self>) {
        self.ensure_min().await;

        let health = {
            let pool = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.config.health_check_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => pool.sweep().await,
                        _ = shutdown.changed() => return,
                    }
                }
            })
        };
        let cleanup = {
            let pool = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.config.idle_timeout / 2);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            pool.cleanup();
                            pool.ensure_min().await;
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            })
        };
        self.tasks
            .lock()
            .expect("pool tasks lock poisoned")
            .extend([health, cleanup]);
        info!(node_id = self.node_id, address = %self.address, "connection pool started");
    }

    /// Acquires a connection, preferring healthy idle unexpired entries and
    /// creating new ones up to `max_size`. Fails with a timeout error when
    /// nothing can be produced within `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, NodeError> {
        enum Plan {
            Reuse(u64, Channel),
            Create,
            Wait,
        }

        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let plan = {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                if inner.shutdown {
                    return Err(NodeError::new(ErrorKind::ServiceUnavailable(
                        "connection pool is shut down".into(),
                    ))
                    .for_node(self.node_id));
                }
                let lifetime = self.config.connection_lifetime;
                if let Some(conn) = inner
                    .conns
                    .iter_mut()
                    .find(|c| !c.in_use && c.healthy && !c.is_expired(lifetime))
                {
                    conn.in_use = true;
                    conn.last_used = Instant::now();
                    conn.use_count += 1;
                    Plan::Reuse(conn.id, conn.channel.clone())
                } else if inner.conns.len() < self.config.max_size {
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(id, channel) => {
                    self.publish_snapshot();
                    return Ok(PooledConnection {
                        channel,
                        id,
                        pool: Arc::downgrade(self),
                    });
                }
                Plan::Create => match self.connect().await {
                    Ok(channel) => {
                        let mut inner = self.inner.lock().expect("pool lock poisoned");
                        if !inner.shutdown && inner.conns.len() < self.config.max_size {
                            let id = inner.next_id;
                            inner.next_id += 1;
                            inner.conns.push(PooledConn {
                                id,
                                channel: channel.clone(),
                                created_at: Instant::now(),
                                last_used: Instant::now(),
                                in_use: true,
                                healthy: true,
                                use_count: 1,
                            });
                            drop(inner);
                            self.metrics.connections_created.inc();
                            self.publish_snapshot();
                            return Ok(PooledConnection {
                                channel,
                                id,
                                pool: Arc::downgrade(self),
                            });
                        }
                        // Raced past max size; fall through and wait.
                    }
                    Err(err) => {
                        debug!(node_id = self.node_id, error = %err, "connection attempt failed");
                        self.note_failure(&err);
                    }
                },
                Plan::Wait => {}
            }

            if Instant::now() >= deadline {
                self.metrics.acquire_timeouts.inc();
                return Err(NodeError::new(ErrorKind::OperationTimeout(format!(
                    "failed to acquire connection within {:?}",
                    self.config.acquire_timeout
                )))
                .for_node(self.node_id)
                .at(self.address.as_str()));
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    fn release(&self, id: u64) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        match inner.conns.iter_mut().find(|c| c.id == id) {
            Some(conn) => {
                conn.in_use = false;
                conn.last_used = Instant::now();
            }
            // The connection was retired (health check, rebuild) while it
            // was checked out.
            None => debug!(node_id = self.node_id, id, "released connection is gone"),
        }
    }

    async fn connect(&self) -> Result<Channel, NodeError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.address))
            .map_err(|e| {
                NodeError::new(ErrorKind::InvalidConfiguration(format!(
                    "bad node address {}: {e}",
                    self.address
                )))
            })?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.client_config(&self.domain))
                .map_err(|e| NodeError::new(ErrorKind::Ssl(e.to_string())))?;
        }

        let channel = endpoint.connect().await.map_err(|e| {
            NodeError::from_transport(&e)
                .for_node(self.node_id)
                .at(self.address.as_str())
        })?;
        self.probe(channel.clone()).await?;
        Ok(channel)
    }

    /// Lightweight authenticated liveness probe over a channel.
    async fn probe(&self, channel: Channel) -> Result<(), NodeError> {
        let mut client = NodeServiceClient::with_interceptor(channel, self.bearer.clone());
        let mut request = Request::new(proto::Empty {});
        request.set_timeout(PROBE_TIMEOUT);
        client
            .fetch_backends(request)
            .await
            .map_err(|s| NodeError::from_status(&s).for_node(self.node_id))?;
        Ok(())
    }

    /// Health-checks idle connections, retires the unhealthy, and refills to
    /// the target size.
    pub async fn sweep(self: &Arc<Self>) {
        let targets: Vec<(u64, Channel)> = {
            let inner = self.inner.lock().expect("pool lock poisoned");
            if inner.shutdown {
                return;
            }
            inner
                .conns
                .iter()
                .filter(|c| !c.in_use && c.healthy)
                .map(|c| (c.id, c.channel.clone()))
                .collect()
        };

        let mut failures = 0u32;
        for (id, channel) in targets {
            if let Err(err) = self.probe(channel).await {
                failures += 1;
                self.metrics.health_failures.inc();
                warn!(node_id = self.node_id, id, error = %err, "pool connection failed health check");
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                if let Some(conn) = inner.conns.iter_mut().find(|c| c.id == id) {
                    conn.healthy = false;
                }
                drop(inner);
                self.note_failure(&err);
            }
        }

        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let before = inner.conns.len();
            inner.conns.retain(|c| c.healthy || c.in_use);
            let removed = before - inner.conns.len();
            if removed > 0 {
                self.metrics.connections_closed.inc_by(removed as u64);
            }
            // A clean sweep slowly walks the instability count back down.
            if failures == 0 && inner.instability > 0 {
                inner.instability -= 1;
            }
        }

        self.ensure_min().await;
        self.publish_snapshot();
    }

    /// Closes expired and excess-idle connections, never dropping below the
    /// current target size.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.shutdown {
            return;
        }
        let target = self.target_size(&inner);
        let lifetime = self.config.connection_lifetime;
        let idle_timeout = self.config.idle_timeout;

        let before = inner.conns.len();
        inner.conns.retain(|c| c.in_use || !c.is_expired(lifetime));

        while inner.conns.len() > target {
            match inner
                .conns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_idle(idle_timeout))
                .min_by_key(|(_, c)| c.last_used)
                .map(|(i, _)| i)
            {
                Some(i) => {
                    inner.conns.remove(i);
                }
                None => break,
            }
        }
        let removed = before - inner.conns.len();
        if removed > 0 {
            self.metrics.connections_closed.inc_by(removed as u64);
            debug!(node_id = self.node_id, removed, "cleaned up pool connections");
        }
    }

    async fn ensure_min(self: &Arc<Self>) {
        loop {
            let needed = {
                let inner = self.inner.lock().expect("pool lock poisoned");
                if inner.shutdown {
                    return;
                }
                inner.conns.len() < self.target_size(&inner)
            };
            if !needed {
                return;
            }
            match self.connect().await {
                Ok(channel) => {
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    if inner.shutdown {
                        return;
                    }
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.conns.push(PooledConn {
                        id,
                        channel,
                        created_at: Instant::now(),
                        last_used: Instant::now(),
                        in_use: false,
                        healthy: true,
                        use_count: 0,
                    });
                    drop(inner);
                    self.metrics.connections_created.inc();
                }
                Err(err) => {
                    debug!(node_id = self.node_id, error = %err, "pool refill attempt failed");
                    self.note_failure(&err);
                    return;
                }
            }
        }
    }

    /// Effective minimum size: shrinks under sustained network instability.
    fn target_size(&self, inner: &PoolInner) -> usize {
        if inner.instability > 3 {
            self.config
                .min_size
                .saturating_sub(inner.instability as usize / 2)
                .max(1)
        } else {
            self.config.min_size
        }
    }

    /// Feeds a failure into the instability tracker. Failure text matching a
    /// container-restart pattern schedules a delayed drain-and-rebuild.
    pub fn note_failure(self: &Arc<Self>, err: &NodeError) {
        let text = err.to_string();
        let restart = container_restart_suspected(&text);
        let spawn_rebuild = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if err.category() == ErrorCategory::Network || restart {
                inner.instability += 1;
                self.metrics.instability.set(inner.instability as i64);
            }
            if restart && !inner.rebuild_pending && !inner.shutdown {
                inner.rebuild_pending = true;
                true
            } else {
                false
            }
        };

        if spawn_rebuild {
            warn!(
                node_id = self.node_id,
                "container restart suspected, scheduling pool rebuild"
            );
            let pool = Arc::clone(self);
            // Detached: the task observes the shutdown flag itself.
            tokio::spawn(async move {
                tokio::time::sleep(pool.config.rebuild_delay).await;
                {
                    let mut inner = pool.inner.lock().expect("pool lock poisoned");
                    inner.rebuild_pending = false;
                    if inner.shutdown {
                        return;
                    }
                    let before = inner.conns.len();
                    inner.conns.retain(|c| c.in_use);
                    let removed = before - inner.conns.len();
                    if removed > 0 {
                        pool.metrics.connections_closed.inc_by(removed as u64);
                    }
                }
                pool.ensure_min().await;
                info!(node_id = pool.node_id, "pool rebuilt after suspected restart");
            });
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().expect("pool lock poisoned");
        PoolSnapshot {
            size: inner.conns.len(),
            available: inner
                .conns
                .iter()
                .filter(|c| !c.in_use && c.healthy)
                .count(),
            in_use: inner.conns.iter().filter(|c| c.in_use).count(),
            unhealthy: inner.conns.iter().filter(|c| !c.healthy).count(),
            instability: inner.instability,
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        self.metrics.size.set(snapshot.size as i64);
        self.metrics.available.set(snapshot.available as i64);
        self.metrics.unhealthy.set(snapshot.unhealthy as i64);
        self.metrics.instability.set(snapshot.instability as i64);
    }

    /// Stops background loops, waits (bounded) for in-use connections to
    /// drain, and closes everything.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.shutdown = true;
        }
        let handles = std::mem::take(&mut *self.tasks.lock().expect("pool tasks lock poisoned"));
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let busy = {
                let inner = self.inner.lock().expect("pool lock poisoned");
                inner.conns.iter().any(|c| c.in_use)
            };
            if !busy {
                break;
            }
            if Instant::now() >= deadline {
                warn!(node_id = self.node_id, "pool drain timed out, closing in-use connections");
                break;
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let closed = inner.conns.len();
        inner.conns.clear();
        drop(inner);
        if closed > 0 {
            self.metrics.connections_closed.inc_by(closed as u64);
        }
        info!(node_id = self.node_id, "connection pool stopped");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}
