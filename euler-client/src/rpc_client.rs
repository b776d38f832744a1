//! Retry-aware RPC client for one shard: draws channels from the pool,
//! quarantines hosts on transient failure, and gives up with `RpcError`
//! after `num_retries` attempts.

use std::future::Future;
use std::sync::Arc;

use euler_types::errors::{ErrorKind, Status};
use euler_types::grpc::euler_service_client::EulerServiceClient;
use euler_types::grpc::{ExecuteReply, ExecuteRequest, PingReply, PingRequest};
use euler_types::models::ClientOptions;
use euler_types::tonic;
use euler_types::tracing::warn;

use crate::errors::ClientError;
use crate::rpc_manager::{Channel, RpcManager};
use crate::server_monitor::ServerMonitor;

/// A tagged tonic channel to one replica. Connection is lazy; transport
/// failures surface per call.
#[derive(Clone)]
pub struct GrpcChannel {
    host_port: String,
    channel: tonic::transport::Channel,
}

impl GrpcChannel {
    fn new(host_port: &str, _tag: usize) -> Self {
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{host_port}"))
            .unwrap_or_else(|_| {
                tonic::transport::Endpoint::from_static("http://invalid.invalid:1")
            });
        Self {
            host_port: host_port.to_string(),
            channel: endpoint.connect_lazy(),
        }
    }

    pub fn transport(&self) -> tonic::transport::Channel {
        self.channel.clone()
    }
}

impl Channel for GrpcChannel {
    fn host_port(&self) -> &str {
        &self.host_port
    }
}

/// Decode failures are permanent; transport-level failures are worth a
/// retry against another replica.
pub fn is_transient(status: &Status) -> bool {
    !matches!(
        status.kind,
        ErrorKind::ProtoError
            | ErrorKind::InvalidArgument
            | ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::Unimplemented
            | ErrorKind::PermissionDenied
            | ErrorKind::Unauthenticated
    )
}

/// The shared retry loop: pick a channel, call, quarantine on transient
/// failure, reissue until `num_retries` attempts are exhausted.
pub async fn issue_with_retries<C, R, F, Fut>(
    manager: &RpcManager<C>,
    num_retries: u32,
    mut call: F,
) -> Result<R, Status>
where
    C: Channel,
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<R, Status>>,
{
    let mut failures = 0;
    loop {
        let channel = manager.channel_async().await;
        match call(channel.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(status) if !is_transient(&status) => return Err(status),
            Err(status) => {
                warn!(host = channel.host_port(), error = %status, "rpc attempt failed");
                manager.move_to_bad(channel.host_port());
                failures += 1;
                if failures >= num_retries.max(1) {
                    return Err(Status::new(
                        ErrorKind::RpcError,
                        format!("{failures} attempts failed, last: {status}"),
                    ));
                }
            }
        }
    }
}

/// One shard's client: pool plus retry policy.
pub struct RpcClient {
    manager: RpcManager<GrpcChannel>,
    num_retries: u32,
}

impl RpcClient {
    pub fn connect(
        monitor: Arc<dyn ServerMonitor>,
        shard_index: usize,
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let manager = RpcManager::connect(monitor, shard_index, options, GrpcChannel::new)
            .ok_or(ClientError::MonitorSubscription(shard_index))?;
        Ok(Self {
            manager,
            num_retries: options.num_retries,
        })
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteReply, Status> {
        issue_with_retries(&self.manager, self.num_retries, |channel| {
            let request = request.clone();
            async move {
                let mut client = EulerServiceClient::new(channel.transport());
                client
                    .execute(tonic::Request::new(request))
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(Status::from)
            }
        })
        .await
    }

    pub async fn ping(&self, content: &str) -> Result<PingReply, Status> {
        let request = PingRequest {
            content: content.to_string(),
        };
        issue_with_retries(&self.manager, self.num_retries, |channel| {
            let request = request.clone();
            async move {
                let mut client = EulerServiceClient::new(channel.transport());
                client
                    .ping(tonic::Request::new(request))
                    .await
                    .map(tonic::Response::into_inner)
                    .map_err(Status::from)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_monitor::{Meta, ServerRegister, SimpleServerMonitor};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct MockChannel {
        host_port: String,
    }

    impl Channel for MockChannel {
        fn host_port(&self) -> &str {
            &self.host_port
        }
    }

    fn pool(replicas: usize) -> (Arc<SimpleServerMonitor>, RpcManager<MockChannel>) {
        let monitor = SimpleServerMonitor::new();
        let dyn_monitor: Arc<dyn ServerMonitor> = monitor.clone();
        let manager = RpcManager::connect(
            dyn_monitor,
            0,
            &ClientOptions::default(),
            |host, _| MockChannel {
                host_port: host.to_string(),
            },
        )
        .unwrap();
        for i in 0..replicas {
            monitor.register_shard(0, &i.to_string(), Meta::new(), Meta::new());
        }
        (monitor, manager)
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let (_monitor, manager) = pool(3);
        let attempts = AtomicU32::new(0);
        let result = issue_with_retries(&manager, 3, |_channel| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Status::new(ErrorKind::Unavailable, "boom"))
                } else {
                    Ok("pong")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "pong");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_rpc_error() {
        let (_monitor, manager) = pool(3);
        let attempts = AtomicU32::new(0);
        let result: Result<(), Status> = issue_with_retries(&manager, 3, |_channel| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(Status::new(ErrorKind::Unavailable, "boom")) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RpcError);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn proto_errors_do_not_retry() {
        let (_monitor, manager) = pool(3);
        let attempts = AtomicU32::new(0);
        let result: Result<(), Status> = issue_with_retries(&manager, 5, |_channel| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(Status::new(ErrorKind::ProtoError, "bad bytes")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ProtoError);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_hosts_are_quarantined_during_retries() {
        let (_monitor, manager) = pool(3);
        let result: Result<(), Status> = issue_with_retries(&manager, 2, |channel| {
            let host = channel.host_port.clone();
            async move { Err(Status::new(ErrorKind::Unavailable, format!("{host} down"))) }
        })
        .await;
        assert!(result.is_err());
        // Two attempts quarantined two distinct hosts.
        assert_eq!(manager.num_live_channels(), 1);
    }
}
