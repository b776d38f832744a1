//! Server assembly: load the graph, build the compute runtime, serve the
//! worker service, and advertise this shard to the membership registry.

use std::net::SocketAddr;
use std::sync::Arc;

use euler_client::{Meta, ServerRegister};
use euler_core::graph::{GraphStore, MemGraph};
use euler_core::RuntimeEnv;
use euler_types::errors::{ErrorKind, Status};
use euler_types::grpc::euler_service_server::EulerServiceServer;
use euler_types::models::ServerOptions;
use euler_types::tonic;
use euler_types::tracing::info;

use crate::service::WorkerService;

fn comma_joined(values: &[f32]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// The metadata this shard advertises on registration.
pub fn shard_meta(graph: &dyn GraphStore, index_info: &str) -> Meta {
    Meta::from([
        ("graph_meta".to_string(), "v1".to_string()),
        ("graph_label".to_string(), graph.labels().join(",")),
        (
            "node_sum_weight".to_string(),
            comma_joined(&graph.node_sum_weights()),
        ),
        (
            "edge_sum_weight".to_string(),
            comma_joined(&graph.edge_sum_weights()),
        ),
        ("index_info".to_string(), index_info.to_string()),
    ])
}

/// The kernel pool: a dedicated runtime in standalone servers, the
/// caller's runtime for in-process shards.
enum ComputeRuntime {
    Owned(tokio::runtime::Runtime),
    Shared(tokio::runtime::Handle),
}

impl ComputeRuntime {
    fn handle(&self) -> tokio::runtime::Handle {
        match self {
            ComputeRuntime::Owned(runtime) => runtime.handle().clone(),
            ComputeRuntime::Shared(handle) => handle.clone(),
        }
    }
}

pub struct EulerServer {
    options: ServerOptions,
    graph: Arc<dyn GraphStore>,
    index_info: String,
    compute: ComputeRuntime,
}

impl EulerServer {
    /// A standalone server with its own compute pool, sized by
    /// `num_threads` (default: available parallelism).
    pub fn new(
        options: ServerOptions,
        graph: Arc<dyn GraphStore>,
        index_info: &str,
    ) -> Result<Self, Status> {
        let workers = options
            .num_threads
            .or_else(|| std::thread::available_parallelism().map(usize::from).ok())
            .unwrap_or(4);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("euler-compute")
            .enable_all()
            .build()
            .map_err(|err| Status::internal(format!("build compute runtime: {err}")))?;
        Ok(Self {
            options,
            graph,
            index_info: index_info.to_string(),
            compute: ComputeRuntime::Owned(runtime),
        })
    }

    /// A server scheduling kernels on an existing runtime; used for
    /// in-process clusters.
    pub fn with_handle(
        options: ServerOptions,
        graph: Arc<dyn GraphStore>,
        index_info: &str,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            options,
            graph,
            index_info: index_info.to_string(),
            compute: ComputeRuntime::Shared(handle),
        }
    }

    pub fn from_data_path(options: ServerOptions, index_info: &str) -> Result<Self, Status> {
        let path = options
            .data_path
            .clone()
            .ok_or_else(|| Status::invalid_argument("server options carry no data_path"))?;
        let text = std::fs::read_to_string(&path)
            .map_err(|err| Status::new(ErrorKind::NotFound, format!("read {path}: {err}")))?;
        let graph = MemGraph::from_json(&text)
            .map_err(|err| Status::new(ErrorKind::DataLoss, format!("parse {path}: {err}")))?;
        info!(
            nodes = graph.num_nodes(),
            edges = graph.num_edges(),
            "graph loaded"
        );
        Self::new(options, Arc::new(graph), index_info)
    }

    pub fn runtime_env(&self) -> Arc<RuntimeEnv> {
        RuntimeEnv::builder(self.compute.handle())
            .graph(self.graph.clone())
            .build()
    }

    /// Binds the worker service, registers the shard, and serves until the
    /// process ends. The advertised endpoint honours the `server` override.
    pub async fn serve(
        &self,
        registry: Arc<dyn ServerRegister>,
        global_meta: Meta,
    ) -> Result<(), Status> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.options.port)
            .parse()
            .map_err(|err| Status::invalid_argument(format!("bad listen address: {err}")))?;
        let advertised = self
            .options
            .server
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.options.port));

        let service = WorkerService::new(self.runtime_env());
        registry.register_shard(
            self.options.shard_idx,
            &advertised,
            global_meta,
            shard_meta(self.graph.as_ref(), &self.index_info),
        );
        info!(shard = self.options.shard_idx, %advertised, "shard registered, serving");

        tonic::transport::Server::builder()
            .add_service(EulerServiceServer::new(service))
            .serve(addr)
            .await
            .map_err(|err| Status::new(ErrorKind::Unavailable, format!("serve failed: {err}")))
    }
}

/// Serves one shard on an OS-assigned port using the current runtime for
/// both I/O and kernels; the bound endpoint is registered and returned.
pub async fn spawn_local_shard(
    options: ServerOptions,
    graph: Arc<dyn GraphStore>,
    index_info: &str,
    registry: Arc<dyn ServerRegister>,
    global_meta: Meta,
) -> Result<String, Status> {
    let server = EulerServer::with_handle(
        options.clone(),
        graph.clone(),
        index_info,
        tokio::runtime::Handle::current(),
    );
    let service = WorkerService::new(server.runtime_env());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| Status::new(ErrorKind::Unavailable, format!("bind: {err}")))?;
    let addr = listener
        .local_addr()
        .map_err(|err| Status::internal(err.to_string()))?;
    let endpoint = addr.to_string();

    tokio::spawn(async move {
        let incoming = tonic::transport::server::TcpIncoming::from_listener(listener, true, None)
            .expect("listener into incoming");
        let _ = tonic::transport::Server::builder()
            .add_service(EulerServiceServer::new(service))
            .serve_with_incoming(incoming)
            .await;
    });

    registry.register_shard(
        options.shard_idx,
        &endpoint,
        global_meta,
        shard_meta(graph.as_ref(), index_info),
    );
    info!(shard = options.shard_idx, %endpoint, "local shard registered");
    Ok(endpoint)
}
