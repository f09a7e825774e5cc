// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The warden panel daemon.
//!
//! Composition root: constructs the stores, the token manager, the node
//! registry, and the background pollers, then runs until interrupted. The
//! operator HTTP API lives in front of this process and is not part of the
//! core; everything here is reachable programmatically.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_controller::store::PeakEventStore;
use warden_controller::tokens::TokenManagerConfig;
use warden_controller::{
    peaks::PeakCollector, MemoryStore, NodeCertificate, NodeRegistry, NodeTokenManager,
    RegistryConfig,
};
use warden_node_client::metrics::ClientMetrics;
use warden_node_client::recovery::RecoveryManager;
use warden_service::types::{Node, NodeStatus, UserKeyAlgorithm};

const TOKEN_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Warden panel daemon.
#[derive(Debug, Parser)]
#[command(name = "wardend", about = "Warden panel daemon.", version)]
struct PanelConfig {
    /// JSON file describing the node fleet to connect at startup.
    #[arg(long, env = "NODES_FILE")]
    nodes_file: Option<PathBuf>,

    /// Client certificate presented to nodes.
    #[arg(long, env = "SSL_CLIENT_CERT_FILE")]
    client_cert_file: Option<PathBuf>,

    /// Private key for the client certificate.
    #[arg(long, env = "SSL_CLIENT_KEY_FILE")]
    client_key_file: Option<PathBuf>,

    /// CA bundle node server certificates must chain to.
    #[arg(long, env = "SSL_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Talk to nodes over plaintext. Only for private networks.
    #[arg(long, env = "INSECURE", default_value_t = false)]
    insecure: bool,

    /// Derivation applied to user secrets before they reach nodes.
    #[arg(long, env = "AUTH_GENERATION_ALGORITHM", default_value = "xxh128")]
    auth_generation_algorithm: String,

    /// Disable the periodic `FetchUsersStats` poll.
    #[arg(long, env = "DISABLE_RECORDING_NODE_USAGE", default_value_t = false)]
    disable_recording_node_usage: bool,

    /// Seconds between traffic-recording polls.
    #[arg(long, env = "TASKS_RECORD_USER_USAGES_INTERVAL", default_value_t = 30)]
    record_user_usages_interval: u64,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

/// One node row in the `--nodes-file` bootstrap document.
#[derive(Debug, Deserialize)]
struct NodeSpec {
    id: i64,
    name: String,
    address: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_coefficient")]
    usage_coefficient: f64,
    /// Pinned server certificate for this node, if any.
    #[serde(default)]
    pinned_cert_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    warden_service::DEFAULT_NODE_PORT
}

fn default_coefficient() -> f64 {
    1.0
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PanelConfig::parse();
    init_tracing(config.log_json);

    let key_algorithm = UserKeyAlgorithm::from_str(&config.auth_generation_algorithm)
        .map_err(|err| anyhow::anyhow!(err))?;
    info!(algorithm = ?key_algorithm, "user key derivation configured");

    let registry_metrics = prometheus::Registry::new();
    let client_metrics = ClientMetrics::register_with(&registry_metrics);

    let store = Arc::new(MemoryStore::new());
    let recovery = Arc::new(RecoveryManager::new());
    let tokens = NodeTokenManager::new(Arc::clone(&store) as _, TokenManagerConfig::default());
    tokens.start();

    let registry = NodeRegistry::new(
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
        Arc::clone(&tokens),
        Arc::clone(&recovery),
        client_metrics,
        RegistryConfig {
            allow_insecure: config.insecure,
            ..Default::default()
        },
    );
    let peaks = PeakCollector::new(Arc::clone(&store) as Arc<dyn PeakEventStore>);

    let mut watcher_tasks = Vec::new();
    for spec in load_nodes(&config).await? {
        let node = Node {
            id: spec.id,
            name: spec.name.clone(),
            address: spec.address.clone(),
            port: spec.port,
            usage_coefficient: spec.usage_coefficient,
            status: NodeStatus::Unhealthy,
            message: None,
        };
        store.upsert_node(node.clone());
        let certificate = load_certificate(&config, &spec).await?;
        match registry.add_node(&node, certificate).await {
            Ok(client) => watcher_tasks.push(peaks.watch_node(client)),
            Err(err) => warn!(node_id = node.id, error = %err, "failed to add node"),
        }
    }

    let usage_task = if config.disable_recording_node_usage {
        None
    } else {
        let registry = Arc::clone(&registry);
        let store = Arc::clone(&store);
        let interval = Duration::from_secs(config.record_user_usages_interval.max(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for client in registry.clients() {
                    match client.fetch_users_stats().await {
                        Ok(stats) => {
                            let coefficient = client.usage_coefficient();
                            let adjusted = stats
                                .into_iter()
                                .map(|(uid, bytes)| {
                                    (uid, (bytes as f64 * coefficient) as u64)
                                })
                                .collect();
                            store.record_node_usage(client.id(), adjusted);
                        }
                        Err(err) => {
                            warn!(node_id = client.id(), error = %err, "usage poll failed")
                        }
                    }
                }
            }
        }))
    };

    let cleanup_task = {
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOKEN_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tokens.cleanup_expired().await;
            }
        })
    };

    info!(nodes = registry.node_ids().len(), "wardend running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    if let Some(task) = usage_task {
        task.abort();
    }
    cleanup_task.abort();
    for task in watcher_tasks {
        task.abort();
    }
    registry.shutdown().await;
    tokens.stop().await;
    Ok(())
}

async fn load_nodes(config: &PanelConfig) -> anyhow::Result<Vec<NodeSpec>> {
    let Some(path) = &config.nodes_file else {
        info!("no nodes file configured; starting with an empty fleet");
        return Ok(Vec::new());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

async fn load_certificate(
    config: &PanelConfig,
    spec: &NodeSpec,
) -> anyhow::Result<Option<NodeCertificate>> {
    if config.insecure {
        return Ok(None);
    }
    let (Some(cert), Some(key), Some(ca)) = (
        &config.client_cert_file,
        &config.client_key_file,
        &config.ca_file,
    ) else {
        anyhow::bail!(
            "SSL_CLIENT_CERT_FILE, SSL_CLIENT_KEY_FILE, and SSL_CA_FILE are required unless INSECURE is set"
        );
    };
    let certificate = tokio::fs::read_to_string(cert)
        .await
        .with_context(|| format!("reading {}", cert.display()))?;
    let key = tokio::fs::read_to_string(key)
        .await
        .with_context(|| format!("reading {}", key.display()))?;
    let ca_bundle = tokio::fs::read_to_string(ca)
        .await
        .with_context(|| format!("reading {}", ca.display()))?;
    let pinned_server_cert = match &spec.pinned_cert_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };
    Ok(Some(NodeCertificate {
        certificate,
        key,
        ca_bundle,
        pinned_server_cert,
    }))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
