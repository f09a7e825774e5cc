// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Node agent configuration, loaded from flags and environment.

use std::path::PathBuf;

use clap::Parser;

/// Warden node agent.
#[derive(Debug, Parser)]
#[command(name = "warden-node", about = "Warden node agent.", version)]
pub struct NodeConfig {
    /// Address the gRPC service binds to.
    #[arg(long, env = "SERVICE_ADDRESS", default_value = "0.0.0.0")]
    pub service_address: String,

    /// Port the gRPC service listens on.
    #[arg(long, env = "NODE_GRPC_PORT", default_value_t = warden_service::DEFAULT_NODE_PORT)]
    pub service_port: u16,

    /// This node's panel-assigned id.
    #[arg(long, env = "NODE_ID", default_value_t = 1)]
    pub node_id: i64,

    /// Serve plaintext instead of mutual TLS. Only for private networks.
    #[arg(long, env = "INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// Server certificate presented to the panel.
    #[arg(long, env = "SSL_CERT_FILE", default_value = "./ssl_cert.pem")]
    pub ssl_cert_file: PathBuf,

    /// Private key for the server certificate.
    #[arg(long, env = "SSL_KEY_FILE", default_value = "./ssl_key.pem")]
    pub ssl_key_file: PathBuf,

    /// CA certificate the panel's client certificate must chain to.
    #[arg(long, env = "SSL_CLIENT_CERT_FILE")]
    pub ssl_client_cert_file: Option<PathBuf>,

    /// Hex sha256 of the panel-issued auth token. Unset accepts any
    /// well-formed token.
    #[arg(long, env = "NODE_AUTH_TOKEN_HASH")]
    pub auth_token_hash: Option<String>,

    #[arg(long, env = "XRAY_ENABLED", default_value_t = true)]
    pub xray_enabled: bool,

    #[arg(long, env = "XRAY_EXECUTABLE_PATH", default_value = "/usr/bin/xray")]
    pub xray_executable_path: PathBuf,

    #[arg(long, env = "XRAY_CONFIG_PATH", default_value = "/etc/xray/config.json")]
    pub xray_config_path: PathBuf,

    #[arg(long, env = "HYSTERIA_ENABLED", default_value_t = false)]
    pub hysteria_enabled: bool,

    #[arg(long, env = "HYSTERIA_EXECUTABLE_PATH", default_value = "/usr/bin/hysteria")]
    pub hysteria_executable_path: PathBuf,

    #[arg(long, env = "HYSTERIA_CONFIG_PATH", default_value = "/etc/hysteria/config.yaml")]
    pub hysteria_config_path: PathBuf,

    #[arg(long, env = "SING_BOX_ENABLED", default_value_t = false)]
    pub sing_box_enabled: bool,

    #[arg(long, env = "SING_BOX_EXECUTABLE_PATH", default_value = "/usr/bin/sing-box")]
    pub sing_box_executable_path: PathBuf,

    #[arg(long, env = "SING_BOX_CONFIG_PATH", default_value = "/etc/sing-box/config.json")]
    pub sing_box_config_path: PathBuf,

    /// File backing the monotonic peak-event sequence counter.
    #[arg(long, env = "PEAK_SEQ_FILE", default_value = "/var/lib/warden/peak_seq")]
    pub peak_seq_file: PathBuf,

    #[arg(long, env = "PEAK_CPU_WARNING", default_value_t = 75.0)]
    pub peak_cpu_warning: f64,

    #[arg(long, env = "PEAK_CPU_CRITICAL", default_value_t = 90.0)]
    pub peak_cpu_critical: f64,

    #[arg(long, env = "PEAK_MEMORY_WARNING", default_value_t = 80.0)]
    pub peak_memory_warning: f64,

    #[arg(long, env = "PEAK_MEMORY_CRITICAL", default_value_t = 95.0)]
    pub peak_memory_critical: f64,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = NodeConfig::parse_from(["warden-node"]);
        assert_eq!(config.service_port, 62050);
        assert!(config.xray_enabled);
        assert!(!config.insecure);
        assert_eq!(config.peak_cpu_critical, 90.0);
    }

    #[test]
    fn flags_override_defaults() {
        let config = NodeConfig::parse_from([
            "warden-node",
            "--service-port",
            "7443",
            "--insecure",
            "--hysteria-enabled",
        ]);
        assert_eq!(config.service_port, 7443);
        assert!(config.insecure);
        assert!(config.hysteria_enabled);
    }
}
