// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Pool and client behavior against an in-process node service.
//!
//! The stub service answers just enough of the surface for the pool's
//! authenticated probes and the client's sync path; everything else returns
//! `UNIMPLEMENTED`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use warden_node_client::error::ErrorKind;
use warden_node_client::metrics::{NodeClientMetrics, PoolMetrics};
use warden_node_client::pool::{ConnectionPool, PoolConfig};
use warden_node_client::recovery::RecoveryManager;
use warden_node_client::{NodeClient, NodeDirectory};
use warden_service::auth::BearerInterceptor;
use warden_service::proto;
use warden_service::proto::node_service_server::{NodeService, NodeServiceServer};
use warden_service::types::{Backend, NodeId, NodeStatus, UserUpdate};

const TOKEN: &str = "wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g";

struct StubNode;

type BoxedStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl NodeService for StubNode {
    async fn sync_users(
        &self,
        request: Request<Streaming<proto::UserData>>,
    ) -> Result<Response<proto::Empty>, Status> {
        let mut stream = request.into_inner();
        while stream.message().await?.is_some() {}
        Ok(Response::new(proto::Empty {}))
    }

    async fn repopulate_users(
        &self,
        _request: Request<proto::UsersData>,
    ) -> Result<Response<proto::Empty>, Status> {
        Ok(Response::new(proto::Empty {}))
    }

    async fn fetch_backends(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::BackendsResponse>, Status> {
        Ok(Response::new(proto::BackendsResponse {
            backends: vec![proto::Backend {
                name: "xray".into(),
                r#type: "xray".into(),
                version: "1.8.4".into(),
                inbounds: vec![],
                running: true,
            }],
        }))
    }

    async fn fetch_users_stats(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::UsersStats>, Status> {
        Ok(Response::new(proto::UsersStats { users_stats: vec![] }))
    }

    async fn fetch_backend_config(
        &self,
        _request: Request<proto::Backend>,
    ) -> Result<Response<proto::BackendConfig>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn restart_backend(
        &self,
        _request: Request<proto::RestartBackendRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn get_backend_stats(
        &self,
        _request: Request<proto::Backend>,
    ) -> Result<Response<proto::BackendStats>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn get_all_backends_stats(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::AllBackendsStatsResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    type StreamBackendLogsStream = BoxedStream<proto::LogLine>;

    async fn stream_backend_logs(
        &self,
        _request: Request<proto::BackendLogsRequest>,
    ) -> Result<Response<Self::StreamBackendLogsStream>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn get_host_system_metrics(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::HostSystemMetrics>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn open_host_port(
        &self,
        _request: Request<proto::PortActionRequest>,
    ) -> Result<Response<proto::PortActionResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn close_host_port(
        &self,
        _request: Request<proto::PortActionRequest>,
    ) -> Result<Response<proto::PortActionResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn get_container_logs(
        &self,
        _request: Request<proto::ContainerLogsRequest>,
    ) -> Result<Response<proto::ContainerLogsResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn get_container_files(
        &self,
        _request: Request<proto::ContainerFilesRequest>,
    ) -> Result<Response<proto::ContainerFilesResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    async fn restart_container(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ContainerRestartResponse>, Status> {
        Err(Status::unimplemented("not in stub"))
    }

    type StreamPeakEventsStream = BoxedStream<proto::PeakEvent>;

    async fn stream_peak_events(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<Self::StreamPeakEventsStream>, Status> {
        // An empty stream that stays open until the client goes away.
        let stream = futures::stream::pending();
        Ok(Response::new(Box::pin(stream)))
    }

    type FetchPeakEventsStream = BoxedStream<proto::PeakEvent>;

    async fn fetch_peak_events(
        &self,
        _request: Request<proto::PeakQuery>,
    ) -> Result<Response<Self::FetchPeakEventsStream>, Status> {
        let stream = futures::stream::iter(Vec::new());
        Ok(Response::new(Box::pin(stream)))
    }
}

async fn spawn_stub() -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(NodeServiceServer::new(StubNode))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    (addr, handle)
}

fn pool_for(addr: &str, config: PoolConfig) -> Arc<ConnectionPool> {
    ConnectionPool::new(
        1,
        addr.to_owned(),
        "localhost".into(),
        None,
        BearerInterceptor::new(TOKEN).unwrap(),
        config,
        PoolMetrics::detached(),
    )
}

#[tokio::test]
async fn pool_bounds_and_acquire_timeout() {
    let (addr, _server) = spawn_stub().await;
    let pool = pool_for(
        &addr,
        PoolConfig {
            min_size: 2,
            max_size: 3,
            acquire_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );
    pool.start().await;

    let snapshot = pool.snapshot();
    assert!(snapshot.size >= 2, "pool pre-populates to min size");
    assert!(snapshot.size <= 3);

    // Check out every slot; the pool may grow to max but not beyond.
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.in_use, 3);
    assert_eq!(snapshot.size, 3);

    // Nothing left: acquisition must fail within the acquire timeout.
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::OperationTimeout(_)));

    // Releasing one slot makes acquisition work again.
    drop(a);
    let d = pool.acquire().await.unwrap();
    drop(b);
    drop(c);
    drop(d);
    assert_eq!(pool.snapshot().in_use, 0);

    pool.stop().await;
    assert!(pool.acquire().await.is_err());
}

#[tokio::test]
async fn acquire_fails_fast_when_node_is_down() {
    // Nothing listens on port 1; connection attempts are refused.
    let pool = pool_for(
        "127.0.0.1:1",
        PoolConfig {
            min_size: 1,
            max_size: 2,
            acquire_timeout: Duration::from_millis(400),
            ..Default::default()
        },
    );
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::OperationTimeout(_)));
    // Refused connections feed the instability tracker.
    assert!(pool.snapshot().instability > 0);
    pool.stop().await;
}

struct SilentDirectory;

#[async_trait]
impl NodeDirectory for SilentDirectory {
    async fn list_users(&self, _node_id: NodeId) -> anyhow::Result<Vec<UserUpdate>> {
        Ok(Vec::new())
    }

    async fn store_backends(&self, _node_id: NodeId, _backends: Vec<Backend>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_status(&self, _node_id: NodeId, _status: NodeStatus, _message: Option<String>) {}
}

#[tokio::test]
async fn client_starts_syncs_and_stops() {
    let (addr, _server) = spawn_stub().await;
    let client = NodeClient::new(
        1,
        addr,
        1.0,
        TOKEN,
        None,
        Arc::new(SilentDirectory),
        Arc::new(RecoveryManager::new()),
        NodeClientMetrics::detached(),
        PoolConfig {
            min_size: 1,
            max_size: 3,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .unwrap();

    client.start().await.expect("start succeeds");

    // The monitor loop performs the initial sync against the stub.
    for _ in 0..100 {
        if client.is_synced() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(client.is_synced(), "client reaches synced state");

    let backends = client.fetch_backends().await.unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].name, "xray");
    assert_eq!(backends[0].version.as_deref(), Some("1.8.4"));

    let stats = client.fetch_users_stats().await.unwrap();
    assert!(stats.is_empty());

    client.stop().await;
    // After stop, the queue is gone and updates are refused.
    let update = UserUpdate {
        user: warden_service::types::User {
            id: 1,
            username: "u".into(),
            key: "k".repeat(32),
        },
        inbounds: Default::default(),
    };
    assert!(client.update_user(update).await.is_err());
}

#[tokio::test]
async fn unimplemented_surfaces_as_classified_error() {
    let (addr, _server) = spawn_stub().await;
    let client = NodeClient::new(
        1,
        addr,
        1.0,
        TOKEN,
        None,
        Arc::new(SilentDirectory),
        Arc::new(RecoveryManager::new()),
        NodeClientMetrics::detached(),
        PoolConfig {
            min_size: 1,
            max_size: 2,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .unwrap();
    client.start().await.unwrap();

    // UNIMPLEMENTED maps to the generic protocol error and is retried, so
    // this also exercises the retry path end to end.
    let err = client.get_backend_stats("xray").await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Grpc(_)));
    client.stop().await;
}
