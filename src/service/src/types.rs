// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Domain types shared by the panel and the node agent, and their
//! conversions to the wire representation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use warden_proto::{RustType, TryFromProtoError};

use crate::proto;

/// Stable identifier of a node row.
pub type NodeId = i64;

/// Administrative status of a node as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Unhealthy => "unhealthy",
            NodeStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node row as the panel stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Multiplier applied to traffic the node reports.
    pub usage_coefficient: f64,
    pub status: NodeStatus,
    pub message: Option<String>,
}

/// Algorithm used to derive the per-user key pushed to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserKeyAlgorithm {
    Plain,
    #[default]
    Xxh128,
}

impl FromStr for UserKeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(UserKeyAlgorithm::Plain),
            "xxh128" => Ok(UserKeyAlgorithm::Xxh128),
            other => Err(format!("unknown user key algorithm: {other}")),
        }
    }
}

/// Derives the opaque 128-bit key a node sees for a user from the user's
/// stable secret. The derivation is deterministic so that re-provisioning a
/// node converges on identical keys, and one-way (for `xxh128`) so that nodes
/// never see the raw secret.
pub fn derive_user_key(algorithm: UserKeyAlgorithm, secret: &str) -> String {
    match algorithm {
        UserKeyAlgorithm::Plain => secret.to_owned(),
        UserKeyAlgorithm::Xxh128 => {
            format!("{:032x}", twox_hash::xxh3::hash128(secret.as_bytes()))
        }
    }
}

/// A user as pushed to nodes: identity plus derived key only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub key: String,
}

impl RustType<proto::User> for User {
    fn into_proto(&self) -> proto::User {
        proto::User {
            id: self.id,
            username: self.username.clone(),
            key: self.key.clone(),
        }
    }

    fn from_proto(proto: proto::User) -> Result<Self, TryFromProtoError> {
        Ok(User {
            id: proto.id,
            username: proto.username,
            key: proto.key,
        })
    }
}

/// A configured listener on a backend, identified by tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    /// Backend-specific configuration blob, JSON encoded.
    pub config: String,
}

impl RustType<proto::Inbound> for Inbound {
    fn into_proto(&self) -> proto::Inbound {
        proto::Inbound {
            tag: self.tag.clone(),
            config: self.config.clone(),
        }
    }

    fn from_proto(proto: proto::Inbound) -> Result<Self, TryFromProtoError> {
        Ok(Inbound {
            tag: proto.tag,
            config: proto.config,
        })
    }
}

/// A per-node intent for one user: the exact set of inbound tags the user
/// should have on the receiving node. An empty set means "remove the user".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpdate {
    pub user: User,
    pub inbounds: BTreeSet<String>,
}

impl UserUpdate {
    /// Whether this update removes the user from the node.
    pub fn is_removal(&self) -> bool {
        self.inbounds.is_empty()
    }
}

impl RustType<proto::UserData> for UserUpdate {
    fn into_proto(&self) -> proto::UserData {
        proto::UserData {
            user: Some(self.user.into_proto()),
            inbounds: self
                .inbounds
                .iter()
                .map(|tag| proto::Inbound {
                    tag: tag.clone(),
                    config: String::new(),
                })
                .collect(),
        }
    }

    fn from_proto(proto: proto::UserData) -> Result<Self, TryFromProtoError> {
        let user = proto
            .user
            .ok_or_else(|| TryFromProtoError::missing_field("UserData::user"))?;
        Ok(UserUpdate {
            user: User::from_proto(user)?,
            inbounds: proto.inbounds.into_iter().map(|i| i.tag).collect(),
        })
    }
}

/// The closed set of proxy back-end flavors a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Xray,
    Hysteria,
    SingBox,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Xray => "xray",
            BackendType::Hysteria => "hysteria",
            BackendType::SingBox => "sing-box",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proxy instance a node reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub backend_type: String,
    pub version: Option<String>,
    pub running: bool,
    pub inbounds: Vec<Inbound>,
}

impl RustType<proto::Backend> for Backend {
    fn into_proto(&self) -> proto::Backend {
        proto::Backend {
            name: self.name.clone(),
            r#type: self.backend_type.clone(),
            version: self.version.clone().unwrap_or_default(),
            inbounds: self.inbounds.into_proto(),
            running: self.running,
        }
    }

    fn from_proto(proto: proto::Backend) -> Result<Self, TryFromProtoError> {
        Ok(Backend {
            name: proto.name,
            backend_type: proto.r#type,
            version: (!proto.version.is_empty()).then_some(proto.version),
            running: proto.running,
            inbounds: Vec::from_proto(proto.inbounds)?,
        })
    }
}

/// Serialization format of a backend configuration blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Plain,
    Json,
    Yaml,
}

impl RustType<i32> for ConfigFormat {
    fn into_proto(&self) -> i32 {
        match self {
            ConfigFormat::Plain => proto::ConfigFormat::Plain,
            ConfigFormat::Json => proto::ConfigFormat::Json,
            ConfigFormat::Yaml => proto::ConfigFormat::Yaml,
        }
        .into()
    }

    fn from_proto(proto_value: i32) -> Result<Self, TryFromProtoError> {
        match proto::ConfigFormat::try_from(proto_value) {
            Ok(proto::ConfigFormat::Plain) => Ok(ConfigFormat::Plain),
            Ok(proto::ConfigFormat::Json) => Ok(ConfigFormat::Json),
            Ok(proto::ConfigFormat::Yaml) => Ok(ConfigFormat::Yaml),
            Err(_) => Err(TryFromProtoError::unknown_enum_variant("ConfigFormat")),
        }
    }
}

/// Category of the metric a peak event was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeakCategory {
    Cpu,
    Memory,
    Disk,
    Network,
    Backend,
}

impl PeakCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeakCategory::Cpu => "CPU",
            PeakCategory::Memory => "MEMORY",
            PeakCategory::Disk => "DISK",
            PeakCategory::Network => "NETWORK",
            PeakCategory::Backend => "BACKEND",
        }
    }
}

impl fmt::Display for PeakCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RustType<i32> for PeakCategory {
    fn into_proto(&self) -> i32 {
        match self {
            PeakCategory::Cpu => proto::PeakCategory::Cpu,
            PeakCategory::Memory => proto::PeakCategory::Memory,
            PeakCategory::Disk => proto::PeakCategory::Disk,
            PeakCategory::Network => proto::PeakCategory::Network,
            PeakCategory::Backend => proto::PeakCategory::Backend,
        }
        .into()
    }

    fn from_proto(proto_value: i32) -> Result<Self, TryFromProtoError> {
        match proto::PeakCategory::try_from(proto_value) {
            Ok(proto::PeakCategory::Cpu) => Ok(PeakCategory::Cpu),
            Ok(proto::PeakCategory::Memory) => Ok(PeakCategory::Memory),
            Ok(proto::PeakCategory::Disk) => Ok(PeakCategory::Disk),
            Ok(proto::PeakCategory::Network) => Ok(PeakCategory::Network),
            Ok(proto::PeakCategory::Backend) => Ok(PeakCategory::Backend),
            Err(_) => Err(TryFromProtoError::unknown_enum_variant("PeakCategory")),
        }
    }
}

/// Severity of an open peak. May upgrade while a peak is open, never
/// downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeakLevel {
    Warning,
    Critical,
}

impl PeakLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeakLevel::Warning => "WARNING",
            PeakLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for PeakLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RustType<i32> for PeakLevel {
    fn into_proto(&self) -> i32 {
        match self {
            PeakLevel::Warning => proto::PeakLevel::Warning,
            PeakLevel::Critical => proto::PeakLevel::Critical,
        }
        .into()
    }

    fn from_proto(proto_value: i32) -> Result<Self, TryFromProtoError> {
        match proto::PeakLevel::try_from(proto_value) {
            Ok(proto::PeakLevel::Warning) => Ok(PeakLevel::Warning),
            Ok(proto::PeakLevel::Critical) => Ok(PeakLevel::Critical),
            Err(_) => Err(TryFromProtoError::unknown_enum_variant("PeakLevel")),
        }
    }
}

/// A threshold-crossing observation streamed from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakEvent {
    pub node_id: NodeId,
    pub category: PeakCategory,
    pub metric: String,
    pub level: PeakLevel,
    pub value: f64,
    pub threshold: f64,
    pub dedupe_key: String,
    pub context_json: String,
    pub started_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    pub seq: u64,
}

impl PeakEvent {
    /// Whether the peak this event belongs to is still open.
    pub fn is_open(&self) -> bool {
        self.resolved_at_ms.is_none()
    }
}

impl RustType<proto::PeakEvent> for PeakEvent {
    fn into_proto(&self) -> proto::PeakEvent {
        proto::PeakEvent {
            node_id: self.node_id,
            category: self.category.into_proto(),
            metric: self.metric.clone(),
            level: self.level.into_proto(),
            value: self.value,
            threshold: self.threshold,
            dedupe_key: self.dedupe_key.clone(),
            context_json: self.context_json.clone(),
            started_at_ms: self.started_at_ms,
            resolved_at_ms: self.resolved_at_ms,
            seq: self.seq,
        }
    }

    fn from_proto(proto: proto::PeakEvent) -> Result<Self, TryFromProtoError> {
        Ok(PeakEvent {
            node_id: proto.node_id,
            category: PeakCategory::from_proto(proto.category)?,
            metric: proto.metric,
            level: PeakLevel::from_proto(proto.level)?,
            value: proto.value,
            threshold: proto.threshold,
            dedupe_key: proto.dedupe_key,
            context_json: proto.context_json,
            started_at_ms: proto.started_at_ms,
            resolved_at_ms: proto.resolved_at_ms,
            seq: proto.seq,
        })
    }
}

/// Computes the deduplication key correlating the start and resolve events of
/// one peak: the first 16 hex characters of `md5("<node>:<category>:<metric>")`.
pub fn peak_dedupe_key(node_id: NodeId, category: PeakCategory, metric: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{node_id}:{category}:{metric}"));
    let digest = hasher.finalize();
    let mut key = hex::encode(digest);
    key.truncate(16);
    key
}

/// Per-NIC counters in a host metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceMetrics {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl RustType<proto::NetworkInterface> for NetworkInterfaceMetrics {
    fn into_proto(&self) -> proto::NetworkInterface {
        proto::NetworkInterface {
            name: self.name.clone(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
        }
    }

    fn from_proto(proto: proto::NetworkInterface) -> Result<Self, TryFromProtoError> {
        Ok(NetworkInterfaceMetrics {
            name: proto.name,
            bytes_sent: proto.bytes_sent,
            bytes_received: proto.bytes_received,
            packets_sent: proto.packets_sent,
            packets_received: proto.packets_received,
        })
    }
}

/// A point-in-time snapshot of a node host's resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub memory_total_gb: f64,
    pub disk_usage: f64,
    pub disk_total_gb: f64,
    pub network_interfaces: Vec<NetworkInterfaceMetrics>,
    pub uptime_seconds: i64,
    pub load_average: [f64; 3],
}

impl RustType<proto::HostSystemMetrics> for HostMetrics {
    fn into_proto(&self) -> proto::HostSystemMetrics {
        proto::HostSystemMetrics {
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            memory_total_gb: self.memory_total_gb,
            disk_usage: self.disk_usage,
            disk_total_gb: self.disk_total_gb,
            network_interfaces: self.network_interfaces.into_proto(),
            uptime_seconds: self.uptime_seconds,
            load_average_1m: self.load_average[0],
            load_average_5m: self.load_average[1],
            load_average_15m: self.load_average[2],
        }
    }

    fn from_proto(proto: proto::HostSystemMetrics) -> Result<Self, TryFromProtoError> {
        Ok(HostMetrics {
            cpu_usage: proto.cpu_usage,
            memory_usage: proto.memory_usage,
            memory_total_gb: proto.memory_total_gb,
            disk_usage: proto.disk_usage,
            disk_total_gb: proto.disk_total_gb,
            network_interfaces: Vec::from_proto(proto.network_interfaces)?,
            uptime_seconds: proto.uptime_seconds,
            load_average: [
                proto.load_average_1m,
                proto.load_average_5m,
                proto.load_average_15m,
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::ProtoType;

    #[test]
    fn user_key_derivation_is_deterministic_and_opaque() {
        let key = derive_user_key(UserKeyAlgorithm::Xxh128, "user-secret-1");
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, derive_user_key(UserKeyAlgorithm::Xxh128, "user-secret-1"));
        assert_ne!(key, derive_user_key(UserKeyAlgorithm::Xxh128, "user-secret-2"));
        // The raw secret must not leak through the derivation.
        assert_ne!(key, "user-secret-1");

        assert_eq!(derive_user_key(UserKeyAlgorithm::Plain, "abcd"), "abcd");
    }

    #[test]
    fn user_update_round_trips_and_preserves_removal() {
        let update = UserUpdate {
            user: User {
                id: 7,
                username: "alice".into(),
                key: "00112233445566778899aabbccddeeff".into(),
            },
            inbounds: ["vless-tcp".to_string(), "vmess-ws".to_string()]
                .into_iter()
                .collect(),
        };
        let roundtripped: UserUpdate = update.into_proto().into_rust().unwrap();
        assert_eq!(roundtripped, update);
        assert!(!roundtripped.is_removal());

        let removal = UserUpdate {
            user: update.user.clone(),
            inbounds: BTreeSet::new(),
        };
        let roundtripped: UserUpdate = removal.into_proto().into_rust().unwrap();
        assert!(roundtripped.is_removal());
    }

    #[test]
    fn user_update_requires_user() {
        let data = proto::UserData {
            user: None,
            inbounds: vec![],
        };
        assert!(UserUpdate::from_proto(data).is_err());
    }

    #[test]
    fn dedupe_key_is_stable_and_short() {
        let a = peak_dedupe_key(1, PeakCategory::Cpu, "cpu_usage");
        let b = peak_dedupe_key(1, PeakCategory::Cpu, "cpu_usage");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, peak_dedupe_key(2, PeakCategory::Cpu, "cpu_usage"));
        assert_ne!(a, peak_dedupe_key(1, PeakCategory::Memory, "cpu_usage"));
    }
}
