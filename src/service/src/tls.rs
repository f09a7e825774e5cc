// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! TLS material handling for the mutually-authenticated panel↔node channel.
//!
//! The panel always presents a client identity and verifies the node against
//! an explicit trust root; when a server certificate is pinned for a node,
//! that certificate *is* the trust root, so a node presenting anything else
//! fails the handshake. Connections require TLS ≥ 1.2 (the rustls baseline)
//! with hostname verification; plaintext fallback does not exist.

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Certificate material a panel-side client holds for one node.
#[derive(Clone)]
pub struct TlsMaterial {
    /// PEM of the panel's client certificate presented to the node.
    pub client_cert_pem: String,
    /// PEM of the client certificate's private key.
    pub client_key_pem: String,
    /// PEM bundle the node's server certificate must chain to.
    pub ca_cert_pem: String,
    /// Exact server certificate expected from the node, if pinned.
    pub pinned_server_cert_pem: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("TlsMaterial")
            .field("pinned", &self.pinned_server_cert_pem.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Builds the strict client-side TLS configuration for dialing a node.
    pub fn client_config(&self, domain: &str) -> ClientTlsConfig {
        let trust_root = match &self.pinned_server_cert_pem {
            // The pinned certificate is the only acceptable peer.
            Some(pinned) => normalize_pem(pinned),
            None => self.ca_cert_pem.clone(),
        };
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(trust_root))
            .identity(Identity::from_pem(
                &self.client_cert_pem,
                &self.client_key_pem,
            ))
    }

    /// Whether a certificate presented by the node matches the configured
    /// pin, byte-for-byte after PEM normalization. Returns `true` when no
    /// pin is configured.
    pub fn matches_pin(&self, presented_pem: &str) -> bool {
        match &self.pinned_server_cert_pem {
            Some(pinned) => normalize_pem(pinned) == normalize_pem(presented_pem),
            None => true,
        }
    }
}

/// Builds the node-side server TLS configuration: present the node identity,
/// require client certificates signed by the panel CA.
pub fn server_tls_config(
    cert_pem: &str,
    key_pem: &str,
    client_ca_pem: &str,
) -> ServerTlsConfig {
    ServerTlsConfig::new()
        .identity(Identity::from_pem(cert_pem, key_pem))
        .client_ca_root(Certificate::from_pem(client_ca_pem))
}

/// Normalizes a PEM blob for comparison: CRLF to LF, surrounding whitespace
/// stripped per line, blank lines dropped.
pub fn normalize_pem(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
