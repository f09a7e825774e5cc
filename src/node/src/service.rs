// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The node's gRPC service.
//!
//! Implements the generated `NodeService` trait over the node-local user
//! storage, the supervised backends, and the peak monitor. Handlers map
//! failures onto the documented status codes (`NOT_FOUND`,
//! `INVALID_ARGUMENT`, `DEADLINE_EXCEEDED`, `UNAVAILABLE`, `INTERNAL`);
//! internal detail goes to the log, not to the peer.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};
use warden_proto::RustType;
use warden_service::proto;
use warden_service::proto::node_service_server::NodeService;
use warden_service::types::{Inbound, NodeId, PeakCategory, PeakEvent, User, UserUpdate};

use crate::backends::VpnBackend;
use crate::monitor::{collect_host_metrics, PeakMonitor};
use crate::storage::UserStorage;

const PEAK_STREAM_POLL: Duration = Duration::from_secs(30);
const DEFAULT_CONTAINER_LOG_TAIL: u32 = 100;

/// The node service state shared by all handlers.
pub struct WardenNode {
    node_id: NodeId,
    storage: Arc<dyn UserStorage>,
    backends: BTreeMap<String, Arc<dyn VpnBackend>>,
    monitor: Arc<PeakMonitor>,
}

impl WardenNode {
    pub fn new(
        node_id: NodeId,
        storage: Arc<dyn UserStorage>,
        backends: BTreeMap<String, Arc<dyn VpnBackend>>,
        monitor: Arc<PeakMonitor>,
    ) -> Self {
        WardenNode {
            node_id,
            storage,
            backends,
            monitor,
        }
    }

    fn backend(&self, name: &str) -> Result<&Arc<dyn VpnBackend>, Status> {
        self.backends
            .get(name)
            .ok_or_else(|| Status::not_found("backend not found"))
    }

    fn resolve_tag(&self, tag: &str) -> Result<&Arc<dyn VpnBackend>, Status> {
        self.backends
            .values()
            .find(|b| b.contains_tag(tag))
            .ok_or_else(|| {
                Status::not_found(format!("backend not found for inbound tag: {tag}"))
            })
    }

    async fn add_user_to(&self, user: &User, inbounds: &[Inbound]) -> Result<(), Status> {
        for inbound in inbounds {
            let backend = self.resolve_tag(&inbound.tag)?;
            debug!(user = %user.username, inbound = %inbound.tag, "adding user to inbound");
            backend
                .add_user(user, inbound)
                .await
                .map_err(|err| internal(&err))?;
        }
        Ok(())
    }

    async fn remove_user_from(&self, user: &User, inbounds: &[Inbound]) -> Result<(), Status> {
        for inbound in inbounds {
            let backend = self.resolve_tag(&inbound.tag)?;
            debug!(user = %user.username, inbound = %inbound.tag, "removing user from inbound");
            backend
                .remove_user(user, inbound)
                .await
                .map_err(|err| internal(&err))?;
        }
        Ok(())
    }

    /// Drives storage and backends toward one user's target inbound set.
    /// Applying the same update twice is a no-op the second time.
    pub(crate) async fn apply_update(&self, update: UserUpdate) -> Result<(), Status> {
        let UserUpdate {
            user,
            inbounds: target,
        } = update;

        match self.storage.get_user(user.id) {
            None if !target.is_empty() => {
                let additions = self.storage.list_inbounds(&target);
                self.add_user_to(&user, &additions).await?;
                let tags = additions.into_iter().map(|i| i.tag).collect();
                self.storage.update_user_inbounds(user, tags);
            }
            Some(existing) if target.is_empty() => {
                let removals = self.storage.list_inbounds(&existing.inbounds);
                self.remove_user_from(&existing.user, &removals).await?;
                self.storage.remove_user(existing.user.id);
            }
            // Removal of a user this node never had.
            None => {}
            Some(existing) => {
                let added: BTreeSet<String> =
                    target.difference(&existing.inbounds).cloned().collect();
                let removed: BTreeSet<String> =
                    existing.inbounds.difference(&target).cloned().collect();
                self.remove_user_from(&existing.user, &self.storage.list_inbounds(&removed))
                    .await?;
                self.add_user_to(&user, &self.storage.list_inbounds(&added))
                    .await?;
                let known = self
                    .storage
                    .list_inbounds(&target)
                    .into_iter()
                    .map(|i| i.tag)
                    .collect();
                self.storage.update_user_inbounds(user, known);
            }
        }
        Ok(())
    }
}

fn internal(err: &anyhow::Error) -> Status {
    error!(error = %format!("{err:#}"), "handler failure");
    Status::internal("internal server error")
}

type BoxedEventStream = Pin<Box<dyn Stream<Item = Result<proto::PeakEvent, Status>> + Send>>;

/// Hands the peak-event receiver back to the monitor when a stream ends, so
/// a reconnecting panel can subscribe again.
struct ReceiverReclaim {
    monitor: Arc<PeakMonitor>,
    rx: Option<mpsc::Receiver<PeakEvent>>,
}

impl Drop for ReceiverReclaim {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.monitor.return_receiver(rx);
        }
    }
}

#[tonic::async_trait]
impl NodeService for WardenNode {
    async fn sync_users(
        &self,
        request: Request<Streaming<proto::UserData>>,
    ) -> Result<Response<proto::Empty>, Status> {
        let mut stream = request.into_inner();
        while let Some(user_data) = stream.message().await? {
            let update = UserUpdate::from_proto(user_data)
                .map_err(|err| Status::invalid_argument(err.to_string()))?;
            self.apply_update(update).await?;
        }
        Ok(Response::new(proto::Empty {}))
    }

    async fn repopulate_users(
        &self,
        request: Request<proto::UsersData>,
    ) -> Result<Response<proto::Empty>, Status> {
        let message = request.into_inner();
        let mut seen = BTreeSet::new();
        for user_data in message.users_data {
            let update = UserUpdate::from_proto(user_data)
                .map_err(|err| Status::invalid_argument(err.to_string()))?;
            seen.insert(update.user.id);
            self.apply_update(update).await?;
        }
        // Full reconcile: whatever the panel did not mention is gone.
        for stored in self.storage.list_users() {
            if !seen.contains(&stored.user.id) {
                self.apply_update(UserUpdate {
                    user: stored.user,
                    inbounds: BTreeSet::new(),
                })
                .await?;
            }
        }
        info!(node_id = self.node_id, users = seen.len(), "user table repopulated");
        Ok(Response::new(proto::Empty {}))
    }

    async fn fetch_backends(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::BackendsResponse>, Status> {
        let mut backends = Vec::with_capacity(self.backends.len());
        for (name, backend) in &self.backends {
            backends.push(proto::Backend {
                name: name.clone(),
                r#type: backend.backend_type().to_string(),
                version: backend.version().unwrap_or_default(),
                inbounds: backend.list_inbounds().into_proto(),
                running: backend.running().await,
            });
        }
        Ok(Response::new(proto::BackendsResponse { backends }))
    }

    async fn fetch_users_stats(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::UsersStats>, Status> {
        let mut totals: BTreeMap<i64, u64> = BTreeMap::new();
        for backend in self.backends.values() {
            for (uid, usage) in backend.usages().await {
                *totals.entry(uid).or_default() += usage;
            }
        }
        let users_stats = totals
            .into_iter()
            .map(|(uid, usage)| proto::users_stats::UserStats { uid, usage })
            .collect();
        Ok(Response::new(proto::UsersStats { users_stats }))
    }

    async fn fetch_backend_config(
        &self,
        request: Request<proto::Backend>,
    ) -> Result<Response<proto::BackendConfig>, Status> {
        let backend = self.backend(&request.into_inner().name)?;
        Ok(Response::new(proto::BackendConfig {
            configuration: backend.config().await,
            config_format: backend.config_format().into_proto(),
        }))
    }

    async fn restart_backend(
        &self,
        request: Request<proto::RestartBackendRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let message = request.into_inner();
        let backend = self.backend(&message.backend_name)?;
        let config = message
            .config
            .filter(|c| !c.configuration.is_empty())
            .ok_or_else(|| Status::invalid_argument("config required"))?;
        info!(backend = %message.backend_name, "restarting backend with new config");
        backend
            .restart(&config.configuration)
            .await
            .map_err(|err| internal(&err))?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn get_backend_stats(
        &self,
        request: Request<proto::Backend>,
    ) -> Result<Response<proto::BackendStats>, Status> {
        let backend = self.backend(&request.into_inner().name)?;
        Ok(Response::new(proto::BackendStats {
            running: backend.running().await,
        }))
    }

    async fn get_all_backends_stats(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::AllBackendsStatsResponse>, Status> {
        let mut backend_stats = std::collections::HashMap::new();
        for (name, backend) in &self.backends {
            backend_stats.insert(
                name.clone(),
                proto::BackendStats {
                    running: backend.running().await,
                },
            );
        }
        Ok(Response::new(proto::AllBackendsStatsResponse {
            backend_stats,
        }))
    }

    type StreamBackendLogsStream =
        Pin<Box<dyn Stream<Item = Result<proto::LogLine, Status>> + Send>>;

    async fn stream_backend_logs(
        &self,
        request: Request<proto::BackendLogsRequest>,
    ) -> Result<Response<Self::StreamBackendLogsStream>, Status> {
        let message = request.into_inner();
        let backend = self.backend(&message.backend_name)?;
        let buffer = backend.log_buffer();
        let stream = async_stream::stream! {
            let mut live = buffer.subscribe();
            if message.include_buffer {
                for line in buffer.snapshot() {
                    yield Ok(proto::LogLine { line });
                }
            }
            loop {
                match live.recv().await {
                    Ok(line) => yield Ok(proto::LogLine { line }),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "log tail lagged, lines skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_host_system_metrics(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::HostSystemMetrics>, Status> {
        let metrics = tokio::task::spawn_blocking(collect_host_metrics)
            .await
            .map_err(|err| internal(&anyhow::anyhow!(err)))?;
        Ok(Response::new(metrics.into_proto()))
    }

    async fn open_host_port(
        &self,
        request: Request<proto::PortActionRequest>,
    ) -> Result<Response<proto::PortActionResponse>, Status> {
        let message = request.into_inner();
        Ok(Response::new(
            port_action(PortAction::Open, message.port, &message.protocol).await,
        ))
    }

    async fn close_host_port(
        &self,
        request: Request<proto::PortActionRequest>,
    ) -> Result<Response<proto::PortActionResponse>, Status> {
        let message = request.into_inner();
        Ok(Response::new(
            port_action(PortAction::Close, message.port, &message.protocol).await,
        ))
    }

    async fn get_container_logs(
        &self,
        request: Request<proto::ContainerLogsRequest>,
    ) -> Result<Response<proto::ContainerLogsResponse>, Status> {
        let tail = match request.into_inner().tail {
            0 => DEFAULT_CONTAINER_LOG_TAIL,
            n => n,
        };
        let logs = match container_logs(tail).await {
            Some(lines) => lines,
            // Not running under docker (or the CLI is unavailable): fall
            // back to the backends' captured output.
            None => {
                let mut lines = Vec::new();
                for backend in self.backends.values() {
                    lines.extend(backend.log_buffer().snapshot());
                }
                let skip = lines.len().saturating_sub(tail as usize);
                lines.split_off(skip)
            }
        };
        Ok(Response::new(proto::ContainerLogsResponse { logs }))
    }

    async fn get_container_files(
        &self,
        request: Request<proto::ContainerFilesRequest>,
    ) -> Result<Response<proto::ContainerFilesResponse>, Status> {
        let path = request.into_inner().path;
        let mut files = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&path).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                let modified_time = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                files.push(proto::FileInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path().to_string_lossy().into_owned(),
                    is_directory: metadata.is_dir(),
                    size: if metadata.is_file() { metadata.len() } else { 0 },
                    modified_time,
                });
            }
        }
        Ok(Response::new(proto::ContainerFilesResponse { files }))
    }

    async fn restart_container(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ContainerRestartResponse>, Status> {
        info!(node_id = self.node_id, "container restart requested");
        // Deliver the ack first, then terminate; the orchestrator restarts
        // the container.
        let pid = std::process::id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        });
        Ok(Response::new(proto::ContainerRestartResponse {
            success: true,
            message: "container restart signal sent".to_owned(),
        }))
    }

    type StreamPeakEventsStream = BoxedEventStream;

    async fn stream_peak_events(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<Self::StreamPeakEventsStream>, Status> {
        let rx = self
            .monitor
            .take_receiver()
            .ok_or_else(|| Status::resource_exhausted("peak event stream already active"))?;
        let monitor = Arc::clone(&self.monitor);
        let stream = async_stream::stream! {
            let mut guard = ReceiverReclaim {
                monitor,
                rx: Some(rx),
            };
            loop {
                let Some(rx) = guard.rx.as_mut() else { break };
                match tokio::time::timeout(PEAK_STREAM_POLL, rx.recv()).await {
                    // Quiet window: nothing to send, the transport keepalive
                    // holds the channel open.
                    Err(_) => continue,
                    Ok(Some(event)) => yield Ok(event.into_proto()),
                    Ok(None) => break,
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    type FetchPeakEventsStream = BoxedEventStream;

    async fn fetch_peak_events(
        &self,
        request: Request<proto::PeakQuery>,
    ) -> Result<Response<Self::FetchPeakEventsStream>, Status> {
        let query = request.into_inner();
        let category = query
            .category
            .map(PeakCategory::from_proto)
            .transpose()
            .map_err(|_| Status::invalid_argument("unknown peak category"))?;
        let events = self.monitor.retained_since(query.since_ms, category);
        let stream = tokio_stream::iter(events.into_iter().map(|e| Ok(e.into_proto())));
        Ok(Response::new(Box::pin(stream)))
    }
}

enum PortAction {
    Open,
    Close,
}

async fn port_action(action: PortAction, port: u32, protocol: &str) -> proto::PortActionResponse {
    if port == 0 || port > u32::from(u16::MAX) || !matches!(protocol, "tcp" | "udp") {
        return proto::PortActionResponse {
            success: false,
            message: "invalid request".to_owned(),
        };
    }
    let (flag, verb) = match action {
        PortAction::Open => ("-A", "opened"),
        PortAction::Close => ("-D", "closed"),
    };
    let port = port.to_string();
    let args = [
        flag, "INPUT", "-p", protocol, "--dport", &port, "-j", "ACCEPT",
    ];
    match Command::new("iptables").args(args).output().await {
        Ok(output) if output.status.success() => proto::PortActionResponse {
            success: true,
            message: format!("port {port}/{protocol} {verb} successfully"),
        },
        Ok(output) => proto::PortActionResponse {
            success: false,
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Err(err) => proto::PortActionResponse {
            success: false,
            message: err.to_string(),
        },
    }
}

async fn container_logs(tail: u32) -> Option<Vec<String>> {
    let host = std::env::var("HOSTNAME").ok()?;
    let output = Command::new("docker")
        .args(["logs", "--tail", &tail.to_string(), &host])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use warden_service::types::{BackendType, ConfigFormat};

    use super::*;
    use crate::backends::process::LogBuffer;
    use crate::monitor::{seq::SeqFile, PeakMonitor, ThresholdConfig};
    use crate::storage::{MemoryStorage, UserStorage};

    struct MockBackend {
        name: String,
        tags: Vec<String>,
        users: Mutex<HashMap<i64, BTreeSet<String>>>,
        usage: Mutex<HashMap<i64, u64>>,
        logs: Arc<LogBuffer>,
    }

    impl MockBackend {
        fn new(name: &str, tags: &[&str]) -> Arc<Self> {
            Arc::new(MockBackend {
                name: name.to_owned(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                users: Mutex::new(HashMap::new()),
                usage: Mutex::new(HashMap::new()),
                logs: Arc::new(LogBuffer::new()),
            })
        }

        fn user_tags(&self, id: i64) -> Option<BTreeSet<String>> {
            self.users.lock().unwrap().get(&id).cloned()
        }
    }

    #[async_trait]
    impl VpnBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn backend_type(&self) -> BackendType {
            BackendType::Xray
        }

        fn version(&self) -> Option<String> {
            Some("1.8.0".into())
        }

        fn config_format(&self) -> ConfigFormat {
            ConfigFormat::Json
        }

        fn list_inbounds(&self) -> Vec<Inbound> {
            self.tags
                .iter()
                .map(|tag| Inbound {
                    tag: tag.clone(),
                    config: "{}".into(),
                })
                .collect()
        }

        fn contains_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t == tag)
        }

        fn log_buffer(&self) -> Arc<LogBuffer> {
            Arc::clone(&self.logs)
        }

        async fn running(&self) -> bool {
            true
        }

        async fn config(&self) -> String {
            "{}".into()
        }

        async fn add_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()> {
            self.users
                .lock()
                .unwrap()
                .entry(user.id)
                .or_default()
                .insert(inbound.tag.clone());
            self.usage.lock().unwrap().entry(user.id).or_insert(0);
            Ok(())
        }

        async fn remove_user(&self, user: &User, inbound: &Inbound) -> anyhow::Result<()> {
            let mut users = self.users.lock().unwrap();
            if let Some(tags) = users.get_mut(&user.id) {
                tags.remove(&inbound.tag);
                if tags.is_empty() {
                    users.remove(&user.id);
                    self.usage.lock().unwrap().remove(&user.id);
                }
            }
            Ok(())
        }

        async fn usages(&self) -> HashMap<i64, u64> {
            self.usage.lock().unwrap().clone()
        }

        async fn restart(&self, _config: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn node_with(backend: Arc<MockBackend>) -> (WardenNode, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.register_inbounds(backend.list_inbounds());
        let monitor = PeakMonitor::new(
            1,
            ThresholdConfig::default(),
            SeqFile::load(dir.path().join("seq")).unwrap(),
            None,
        );
        let mut backends: BTreeMap<String, Arc<dyn VpnBackend>> = BTreeMap::new();
        backends.insert(backend.name.clone(), backend);
        (WardenNode::new(1, storage, backends, monitor), dir)
    }

    fn user(id: i64) -> User {
        User {
            id,
            username: format!("u{id}"),
            key: "00112233445566778899aabbccddeeff".into(),
        }
    }

    fn update(id: i64, tags: &[&str]) -> UserUpdate {
        UserUpdate {
            user: user(id),
            inbounds: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn apply_update_is_idempotent() {
        let backend = MockBackend::new("xray", &["vless", "vmess"]);
        let (node, _dir) = node_with(Arc::clone(&backend));

        node.apply_update(update(1, &["vless"])).await.unwrap();
        let after_first = (
            node.storage.get_user(1),
            backend.user_tags(1),
        );
        node.apply_update(update(1, &["vless"])).await.unwrap();
        let after_second = (
            node.storage.get_user(1),
            backend.user_tags(1),
        );
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn apply_update_diffs_tag_sets() {
        let backend = MockBackend::new("xray", &["a", "b", "c"]);
        let (node, _dir) = node_with(Arc::clone(&backend));

        node.apply_update(update(1, &["a", "b"])).await.unwrap();
        node.apply_update(update(1, &["b", "c"])).await.unwrap();

        let tags = backend.user_tags(1).unwrap();
        assert_eq!(
            tags,
            ["b".to_string(), "c".to_string()].into_iter().collect()
        );
        assert_eq!(
            node.storage.get_user(1).unwrap().inbounds,
            ["b".to_string(), "c".to_string()].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn empty_tag_set_removes_user() {
        let backend = MockBackend::new("xray", &["a"]);
        let (node, _dir) = node_with(Arc::clone(&backend));

        node.apply_update(update(1, &["a"])).await.unwrap();
        assert!(node.storage.get_user(1).is_some());

        node.apply_update(update(1, &[])).await.unwrap();
        assert!(node.storage.get_user(1).is_none());
        assert!(backend.user_tags(1).is_none());

        // Removing an unknown user is fine.
        node.apply_update(update(99, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn repopulate_converges_to_the_received_list() {
        let backend = MockBackend::new("xray", &["a", "b"]);
        let (node, _dir) = node_with(Arc::clone(&backend));

        // Preexisting local state: users 1 and 2.
        node.apply_update(update(1, &["a"])).await.unwrap();
        node.apply_update(update(2, &["b"])).await.unwrap();

        // The authoritative list names users 2 and 3 only.
        let message = proto::UsersData {
            users_data: vec![
                update(2, &["a"]).into_proto(),
                update(3, &["b"]).into_proto(),
            ],
        };
        node.repopulate_users(Request::new(message)).await.unwrap();

        let ids: Vec<i64> = node.storage.list_users().iter().map(|u| u.user.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(backend.user_tags(1).is_none());
        assert_eq!(
            node.storage.get_user(2).unwrap().inbounds,
            ["a".to_string()].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn users_stats_cover_known_users_and_forget_removed_ones() {
        let backend = MockBackend::new("xray", &["a"]);
        let (node, _dir) = node_with(Arc::clone(&backend));

        node.apply_update(update(1, &["a"])).await.unwrap();
        let stats = node
            .fetch_users_stats(Request::new(proto::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.users_stats.len(), 1);
        assert_eq!(stats.users_stats[0].uid, 1);
        assert_eq!(stats.users_stats[0].usage, 0);

        node.apply_update(update(1, &[])).await.unwrap();
        let stats = node
            .fetch_users_stats(Request::new(proto::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(stats.users_stats.is_empty());
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let backend = MockBackend::new("xray", &["a"]);
        let (node, _dir) = node_with(backend);

        let status = node
            .get_backend_stats(Request::new(proto::Backend {
                name: "ghost".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = node
            .restart_backend(Request::new(proto::RestartBackendRequest {
                backend_name: "ghost".into(),
                config: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn restart_requires_config() {
        let backend = MockBackend::new("xray", &["a"]);
        let (node, _dir) = node_with(backend);

        let status = node
            .restart_backend(Request::new(proto::RestartBackendRequest {
                backend_name: "xray".into(),
                config: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn fetch_backends_reports_inbounds() {
        let backend = MockBackend::new("xray", &["a", "b"]);
        let (node, _dir) = node_with(backend);

        let response = node
            .fetch_backends(Request::new(proto::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.backends.len(), 1);
        let reported = &response.backends[0];
        assert_eq!(reported.name, "xray");
        assert_eq!(reported.r#type, "xray");
        assert!(reported.running);
        let tags: Vec<_> = reported.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }
}
