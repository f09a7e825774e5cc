// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Proxy back-end management.
//!
//! The set of back-end flavors is closed (Xray, Hysteria, sing-box); all of
//! them are supervised external processes differing in launch arguments,
//! configuration format, and how inbound tags are read out of their config.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};
use warden_service::types::{BackendType, ConfigFormat, Inbound, User};

pub mod hysteria;
pub mod process;
pub mod singbox;
pub mod xray;

use process::{LogBuffer, ProcessSupervisor};

/// Everything needed to launch and understand one back-end flavor.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub backend_type: BackendType,
    pub config_format: ConfigFormat,
    pub executable: PathBuf,
    pub config_path: PathBuf,
    pub launch_args: Vec<String>,
    pub version_args: Vec<String>,
}

/// The node-side surface of a proxy back-end.
#[async_trait]
pub trait VpnBackend: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn backend_type(&self) -> BackendType;
    fn version(&self) -> Option<String>;
    fn config_format(&self) -> ConfigFormat;
    fn list_inbounds(&self) -> Vec<Inbound>;
    fn contains_tag(&self, tag: &str) -> bool;
    fn log_buffer(&self) -> Arc<LogBuffer>;

    async fn running(&self) -> bool;
    async fn config(&self) -> String;
    async fn add_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()>;
    async fn remove_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()>;
    /// Per-user transferred bytes. Counters are monotonic for the lifetime
    /// of the backend process.
    async fn usages(&self) -> HashMap<i64, u64>;
    async fn restart(&self, config: &str) -> anyhow::Result<()>;
    async fn stop(&self);
}

#[derive(Debug, Default)]
struct UserSlot {
    key: String,
    tags: BTreeSet<String>,
    usage_bytes: u64,
}

/// A supervised external back-end process. One implementation serves all
/// three flavors; the differences live in [`BackendSpec`] and the per-flavor
/// inbound parsers.
pub struct ProcessBackend {
    name: String,
    spec: BackendSpec,
    version: Option<String>,
    supervisor: ProcessSupervisor,
    inbounds: RwLock<Vec<Inbound>>,
    users: Mutex<HashMap<i64, UserSlot>>,
}

impl ProcessBackend {
    /// Reads the on-disk configuration, starts the process, and constructs
    /// the backend handle.
    pub async fn launch(name: impl Into<String>, spec: BackendSpec) -> anyhow::Result<Arc<Self>> {
        let name = name.into();
        let config = tokio::fs::read_to_string(&spec.config_path)
            .await
            .unwrap_or_else(|err| {
                debug!(backend = %name, config = %spec.config_path.display(), %err,
                    "backend config unreadable, starting with empty config");
                String::new()
            });
        let inbounds = parse_inbounds(spec.backend_type, &config);
        let version_args: Vec<&str> = spec.version_args.iter().map(String::as_str).collect();
        let version = ProcessSupervisor::detect_version(&spec.executable, &version_args).await;
        let supervisor = ProcessSupervisor::new(spec.executable.clone(), spec.launch_args.clone());
        supervisor.start().await?;
        info!(backend = %name, backend_type = %spec.backend_type, inbounds = inbounds.len(),
            "backend launched");
        Ok(Arc::new(ProcessBackend {
            name,
            spec,
            version,
            supervisor,
            inbounds: RwLock::new(inbounds),
            users: Mutex::new(HashMap::new()),
        }))
    }
}

#[async_trait]
impl VpnBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        self.spec.backend_type
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn config_format(&self) -> ConfigFormat {
        self.spec.config_format
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.inbounds
            .read()
            .expect("inbounds lock poisoned")
            .clone()
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.inbounds
            .read()
            .expect("inbounds lock poisoned")
            .iter()
            .any(|i| i.tag == tag)
    }

    fn log_buffer(&self) -> Arc<LogBuffer> {
        self.supervisor.logs()
    }

    async fn running(&self) -> bool {
        self.supervisor.running().await
    }

    async fn config(&self) -> String {
        tokio::fs::read_to_string(&self.spec.config_path)
            .await
            .unwrap_or_default()
    }

    async fn add_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.contains_tag(&inbound.tag),
            "inbound {} does not belong to backend {}",
            inbound.tag,
            self.name
        );
        let mut users = self.users.lock().expect("users lock poisoned");
        let slot = users.entry(user.id).or_default();
        slot.key = user.key.clone();
        slot.tags.insert(inbound.tag.clone());
        debug!(backend = %self.name, user = %user.username, inbound = %inbound.tag, "user added");
        Ok(())
    }

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()> {
        let mut users = self.users.lock().expect("users lock poisoned");
        if let Some(slot) = users.get_mut(&user.id) {
            slot.tags.remove(&inbound.tag);
            if slot.tags.is_empty() {
                users.remove(&user.id);
            }
        }
        debug!(backend = %self.name, user = %user.username, inbound = %inbound.tag, "user removed");
        Ok(())
    }

    async fn usages(&self) -> HashMap<i64, u64> {
        self.users
            .lock()
            .expect("users lock poisoned")
            .iter()
            .map(|(id, slot)| (*id, slot.usage_bytes))
            .collect()
    }

    async fn restart(&self, config: &str) -> anyhow::Result<()> {
        tokio::fs::write(&self.spec.config_path, config).await?;
        self.supervisor.restart().await?;
        let inbounds = parse_inbounds(self.spec.backend_type, config);
        *self.inbounds.write().expect("inbounds lock poisoned") = inbounds;
        Ok(())
    }

    async fn stop(&self) {
        self.supervisor.stop().await;
    }
}

/// Reads the inbound tags out of a back-end configuration blob.
pub fn parse_inbounds(backend_type: BackendType, config: &str) -> Vec<Inbound> {
    match backend_type {
        BackendType::Xray => xray::parse_inbounds(config),
        BackendType::SingBox => singbox::parse_inbounds(config),
        BackendType::Hysteria => hysteria::parse_inbounds(config),
    }
}
