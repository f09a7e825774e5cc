// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Entry point for the warden node agent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tonic::codegen::InterceptedService;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_node::auth::{AuthInterceptor, TokenValidator};
use warden_node::backends::{hysteria, singbox, xray, ProcessBackend, VpnBackend};
use warden_node::config::NodeConfig;
use warden_node::monitor::{seq::SeqFile, ContextProvider, PeakMonitor, ThresholdConfig};
use warden_node::service::WardenNode;
use warden_node::storage::{MemoryStorage, UserStorage};
use warden_service::proto::node_service_server::NodeServiceServer;
use warden_service::tls::server_tls_config;
use warden_service::MAX_GRPC_MESSAGE_SIZE;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::parse();
    init_tracing(config.log_json);

    let mut backends: BTreeMap<String, Arc<dyn VpnBackend>> = BTreeMap::new();
    let specs = [
        (
            "xray",
            config.xray_enabled,
            xray::spec(
                config.xray_executable_path.clone(),
                config.xray_config_path.clone(),
            ),
        ),
        (
            "hysteria",
            config.hysteria_enabled,
            hysteria::spec(
                config.hysteria_executable_path.clone(),
                config.hysteria_config_path.clone(),
            ),
        ),
        (
            "sing-box",
            config.sing_box_enabled,
            singbox::spec(
                config.sing_box_executable_path.clone(),
                config.sing_box_config_path.clone(),
            ),
        ),
    ];
    for (name, enabled, spec) in specs {
        if !enabled {
            continue;
        }
        match ProcessBackend::launch(name, spec).await {
            Ok(backend) => {
                backends.insert(name.to_owned(), backend);
            }
            // A broken backend must not keep the node service down; the
            // panel sees it missing from FetchBackends.
            Err(err) => warn!(backend = name, error = %format!("{err:#}"), "backend failed to launch"),
        }
    }

    let storage = Arc::new(MemoryStorage::new());
    for backend in backends.values() {
        storage.register_inbounds(backend.list_inbounds());
    }

    let thresholds = ThresholdConfig {
        cpu_warning: config.peak_cpu_warning,
        cpu_critical: config.peak_cpu_critical,
        memory_warning: config.peak_memory_warning,
        memory_critical: config.peak_memory_critical,
        ..Default::default()
    };
    let seq = SeqFile::load(&config.peak_seq_file)
        .with_context(|| format!("loading {}", config.peak_seq_file.display()))?;
    let context_provider: ContextProvider = {
        let backend_names: Vec<String> = backends.keys().cloned().collect();
        Arc::new(move || {
            serde_json::json!({
                "backends": backend_names,
                "backend_count": backend_names.len(),
            })
        })
    };
    let monitor = PeakMonitor::new(config.node_id, thresholds, seq, Some(context_provider));
    monitor.start();

    let validator = TokenValidator::new(config.node_id, config.auth_token_hash.clone());
    let service = WardenNode::new(
        config.node_id,
        Arc::clone(&storage) as Arc<dyn UserStorage>,
        backends.clone(),
        Arc::clone(&monitor),
    );
    let server = NodeServiceServer::new(service)
        .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE);
    let service = InterceptedService::new(server, AuthInterceptor::new(validator));

    let addr = format!("{}:{}", config.service_address, config.service_port)
        .parse()
        .context("invalid listen address")?;

    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)));
    if !config.insecure {
        let cert = tokio::fs::read_to_string(&config.ssl_cert_file)
            .await
            .with_context(|| format!("reading {}", config.ssl_cert_file.display()))?;
        let key = tokio::fs::read_to_string(&config.ssl_key_file)
            .await
            .with_context(|| format!("reading {}", config.ssl_key_file.display()))?;
        let client_ca_path = config
            .ssl_client_cert_file
            .as_ref()
            .context("SSL_CLIENT_CERT_FILE is required unless INSECURE is set")?;
        let client_ca = tokio::fs::read_to_string(client_ca_path)
            .await
            .with_context(|| format!("reading {}", client_ca_path.display()))?;
        builder = builder
            .tls_config(server_tls_config(&cert, &key, &client_ca))
            .context("invalid TLS configuration")?;
    } else {
        warn!("serving without TLS; do not expose this listener publicly");
    }

    info!(node_id = config.node_id, %addr, "warden node listening");
    builder
        .add_service(service)
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("gRPC server failed")?;

    monitor.stop().await;
    for backend in backends.values() {
        backend.stop().await;
    }
    Ok(())
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
