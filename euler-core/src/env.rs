//! Explicit runtime services handed to kernels, replacing process-wide
//! singletons: the compute runtime, the graph store (server side) and the
//! shard clients (client side).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use euler_types::errors::Status;
use euler_types::grpc::{ExecuteReply, ExecuteRequest};
use euler_types::tonic;

use crate::errors::ExecutionError;
use crate::graph::GraphStore;

/// Access to the shard fleet. Implemented by the client crate; kernels see
/// only this seam.
#[tonic::async_trait]
pub trait ShardClients: Send + Sync {
    fn num_shards(&self) -> usize;

    async fn execute(&self, shard: usize, request: ExecuteRequest)
        -> Result<ExecuteReply, Status>;
}

/// Per-type, per-shard weight table with a totals column per type and a
/// totals row across types, used by the weighted split kernels.
#[derive(Debug, Clone, Default)]
pub struct ShardWeights {
    pub node: Vec<Vec<f32>>,
    pub edge: Vec<Vec<f32>>,
}

pub struct RuntimeEnv {
    compute: tokio::runtime::Handle,
    graph: Option<Arc<dyn GraphStore>>,
    clients: Option<Arc<dyn ShardClients>>,
    shard_weights: ShardWeights,
}

impl RuntimeEnv {
    pub fn builder(compute: tokio::runtime::Handle) -> RuntimeEnvBuilder {
        RuntimeEnvBuilder {
            compute,
            graph: None,
            clients: None,
            shard_weights: ShardWeights::default(),
        }
    }

    pub fn compute(&self) -> &tokio::runtime::Handle {
        &self.compute
    }

    pub fn graph(&self) -> Result<&Arc<dyn GraphStore>, ExecutionError> {
        self.graph.as_ref().ok_or(ExecutionError::NoGraphStore)
    }

    pub fn clients(&self) -> Result<&Arc<dyn ShardClients>, ExecutionError> {
        self.clients.as_ref().ok_or(ExecutionError::NoShardClients)
    }

    pub fn shard_weights(&self) -> &ShardWeights {
        &self.shard_weights
    }
}

pub struct RuntimeEnvBuilder {
    compute: tokio::runtime::Handle,
    graph: Option<Arc<dyn GraphStore>>,
    clients: Option<Arc<dyn ShardClients>>,
    shard_weights: ShardWeights,
}

impl RuntimeEnvBuilder {
    pub fn graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ShardClients>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn shard_weights(mut self, weights: ShardWeights) -> Self {
        self.shard_weights = weights;
        self
    }

    pub fn build(self) -> Arc<RuntimeEnv> {
        Arc::new(RuntimeEnv {
            compute: self.compute,
            graph: self.graph,
            clients: self.clients,
            shard_weights: self.shard_weights,
        })
    }
}

/// Per-query deadline and cancel flag. The executor checks it before every
/// node fires; remote calls inherit the remaining budget.
#[derive(Debug, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
}

impl QueryContext {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ExecutionError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
