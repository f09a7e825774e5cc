// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The process-wide node registry and fan-out operations.
//!
//! The registry maps node ids to running [`NodeClient`]s and is owned by
//! the composition root, not by module globals. Operator mutations fan out
//! through it fire-and-forget: per-node user updates are computed, recorded
//! in the user index, and pushed onto a per-node forwarder queue — a slow
//! or broken node never blocks or fails the operator's request. Each node's
//! forwarder task alone feeds the client's single-slot queue, so per-node
//! delivery order still follows the caller's order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_node_client::error::{ErrorKind, NodeError};
use warden_node_client::metrics::ClientMetrics;
use warden_node_client::pool::PoolConfig;
use warden_node_client::recovery::RecoveryManager;
use warden_node_client::{NodeClient, NodeDirectory};
use warden_service::tls::TlsMaterial;
use warden_service::types::{Node, NodeId, NodeStatus, User, UserUpdate};

use crate::store::UserIndex;
use crate::tokens::NodeTokenManager;

/// Panel-side TLS material for one node.
#[derive(Clone)]
pub struct NodeCertificate {
    /// Client certificate the panel presents.
    pub certificate: String,
    /// Private key for the client certificate.
    pub key: String,
    /// Trust root for the node's server certificate.
    pub ca_bundle: String,
    /// Exact server certificate expected from the node, if pinned.
    pub pinned_server_cert: Option<String>,
}

/// Registry tuning.
#[derive(Clone)]
pub struct RegistryConfig {
    pub pool: PoolConfig,
    /// Permit nodes without certificate material (plaintext transport).
    /// Intended for private networks and tests only.
    pub allow_insecure: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            pool: PoolConfig::default(),
            allow_insecure: false,
        }
    }
}

/// One registered node: the client plus the forwarder that drains the
/// registry's fan-out queue into the client's single-slot update queue.
struct NodeEntry {
    client: Arc<NodeClient>,
    updates_tx: mpsc::UnboundedSender<UserUpdate>,
    forwarder: JoinHandle<()>,
}

/// Process-wide mapping of node ids to their clients.
pub struct NodeRegistry {
    clients: Mutex<HashMap<NodeId, NodeEntry>>,
    directory: Arc<dyn NodeDirectory>,
    index: Arc<dyn UserIndex>,
    tokens: Arc<NodeTokenManager>,
    recovery: Arc<RecoveryManager>,
    metrics: ClientMetrics,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        index: Arc<dyn UserIndex>,
        tokens: Arc<NodeTokenManager>,
        recovery: Arc<RecoveryManager>,
        metrics: ClientMetrics,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(NodeRegistry {
            clients: Mutex::new(HashMap::new()),
            directory,
            index,
            tokens,
            recovery,
            metrics,
            config,
        })
    }

    /// Registers a node: replaces any existing client, issues a fresh auth
    /// token, constructs and starts the client, and probes it. A failed
    /// probe downgrades the node but keeps the client registered — the
    /// client's own recovery machinery takes it from there.
    pub async fn add_node(
        &self,
        node: &Node,
        certificate: Option<NodeCertificate>,
    ) -> Result<Arc<NodeClient>, NodeError> {
        self.remove_node(node.id).await;

        let tls = match certificate {
            Some(cert) => Some(TlsMaterial {
                client_cert_pem: cert.certificate,
                client_key_pem: cert.key,
                ca_cert_pem: cert.ca_bundle,
                pinned_server_cert_pem: cert.pinned_server_cert,
            }),
            None if self.config.allow_insecure => None,
            None => {
                return Err(NodeError::new(ErrorKind::MissingConfiguration(
                    "certificate material is required".into(),
                ))
                .for_node(node.id))
            }
        };

        let token = self.tokens.generate(node.id).await.map_err(|err| {
            NodeError::new(ErrorKind::InvalidConfiguration(format!(
                "token issuance failed: {err:#}"
            )))
            .for_node(node.id)
        })?;

        let client = NodeClient::new(
            node.id,
            format!("{}:{}", node.address, node.port),
            node.usage_coefficient,
            &token,
            tls,
            Arc::clone(&self.directory),
            Arc::clone(&self.recovery),
            self.metrics.for_node(node.id),
            self.config.pool,
        )?;

        match client.start().await {
            Ok(()) => info!(node_id = node.id, address = %client.address(), "node added"),
            Err(err) => {
                // The node may simply be down right now; keep the client and
                // let its monitor/health loops bring it up.
                warn!(node_id = node.id, error = %err, "node added but initial probe failed");
                self.directory
                    .set_status(
                        node.id,
                        NodeStatus::Unhealthy,
                        Some("connection test failed".into()),
                    )
                    .await;
            }
        }

        let (updates_tx, forwarder) = Self::spawn_forwarder(&client, &self.recovery);
        let client_ref = Arc::clone(&client);
        self.clients.lock().expect("registry lock poisoned").insert(
            node.id,
            NodeEntry {
                client,
                updates_tx,
                forwarder,
            },
        );
        Ok(client_ref)
    }

    /// The per-node forwarder: the only task that awaits the client's
    /// single-slot queue. Operator calls hand items to it via an unbounded
    /// in-process queue and return immediately.
    fn spawn_forwarder(
        client: &Arc<NodeClient>,
        recovery: &Arc<RecoveryManager>,
    ) -> (mpsc::UnboundedSender<UserUpdate>, JoinHandle<()>) {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<UserUpdate>();
        let client = Arc::clone(client);
        let recovery = Arc::clone(recovery);
        let forwarder = tokio::spawn(async move {
            while let Some(update) = updates_rx.recv().await {
                if let Err(err) = client.update_user(update).await {
                    warn!(node_id = client.id(), error = %err, "user update enqueue failed");
                    recovery.record_failure(&format!("node_{}", client.id()), &err);
                }
            }
        });
        (updates_tx, forwarder)
    }

    /// Stops and forgets a node's client. Idempotent.
    pub async fn remove_node(&self, node_id: NodeId) {
        let entry = self
            .clients
            .lock()
            .expect("registry lock poisoned")
            .remove(&node_id);
        if let Some(NodeEntry {
            client,
            updates_tx,
            forwarder,
        }) = entry
        {
            info!(node_id, "removing node");
            // Close the fan-out queue first; anything still in flight is
            // superseded by the next repopulation.
            drop(updates_tx);
            client.stop().await;
            forwarder.abort();
            let _ = forwarder.await;
        }
    }

    /// Tears down and re-creates the client with fresh certificate
    /// material.
    pub async fn reconnect_node(
        &self,
        node: &Node,
        certificate: Option<NodeCertificate>,
    ) -> Result<Arc<NodeClient>, NodeError> {
        self.remove_node(node.id).await;
        self.add_node(node, certificate).await
    }

    pub fn client(&self, node_id: NodeId) -> Option<Arc<NodeClient>> {
        self.clients
            .lock()
            .expect("registry lock poisoned")
            .get(&node_id)
            .map(|entry| Arc::clone(&entry.client))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.clients
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn clients(&self) -> Vec<Arc<NodeClient>> {
        self.clients
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|entry| Arc::clone(&entry.client))
            .collect()
    }

    /// Fans a user mutation out to every affected node.
    ///
    /// `new_inbounds` is the user's effective `(node, tag)` set after the
    /// mutation; `old_inbounds` the snapshot from before it. Nodes present
    /// only in the old set receive an empty tag set (removal).
    ///
    /// Fire-and-forget for the caller: the user index is updated
    /// synchronously and each affected node's item goes onto that node's
    /// forwarder queue; the forwarder alone awaits the client's single-slot
    /// queue, so a slow or wedged node never blocks this call. Per-node
    /// delivery order still follows the caller's order. Failures are logged
    /// and recorded, never surfaced: convergence is restored by the next
    /// `RepopulateUsers`.
    pub fn update_user(
        &self,
        user: User,
        new_inbounds: &[(NodeId, String)],
        old_inbounds: &[(NodeId, String)],
    ) {
        let mut per_node: BTreeMap<NodeId, BTreeSet<String>> = BTreeMap::new();
        for (node_id, tag) in new_inbounds {
            per_node.entry(*node_id).or_default().insert(tag.clone());
        }
        for (node_id, _) in old_inbounds {
            per_node.entry(*node_id).or_default();
        }

        for (node_id, tags) in per_node {
            self.index.assign(node_id, &user, &tags);
            let sender = self
                .clients
                .lock()
                .expect("registry lock poisoned")
                .get(&node_id)
                .map(|entry| entry.updates_tx.clone());
            let Some(sender) = sender else {
                continue;
            };
            let update = UserUpdate {
                user: user.clone(),
                inbounds: tags,
            };
            if sender.send(update).is_err() {
                debug!(node_id, "fan-out skipped: node is being removed");
            }
        }
    }

    /// Removes a user from every node that currently has it.
    pub fn remove_user(&self, user: User) {
        let nodes = self.index.nodes_for_user(user.id);
        let old: Vec<(NodeId, String)> = nodes
            .into_iter()
            .map(|node_id| (node_id, String::new()))
            .collect();
        self.update_user(user, &[], &old);
    }

    /// Stops every client. Used by the composition root on shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut guard = self.clients.lock().expect("registry lock poisoned");
            guard.drain().collect()
        };
        for (_, entry) in entries {
            drop(entry.updates_tx);
            entry.client.stop().await;
            entry.forwarder.abort();
            let _ = entry.forwarder.await;
        }
    }
}
