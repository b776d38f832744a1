//! The query facade: compile a traversal, execute it against the cluster
//! (or a local graph), and hand back the aliased result tensors.

use std::collections::HashMap;
use std::sync::Arc;

use euler_core::graph::GraphStore;
use euler_core::{output_name, Executor, OpKernelContext, QueryContext, RuntimeEnv};
use euler_parser::{Compiler, Mode};
use euler_types::models::{ClientOptions, RunMode};
use euler_types::tensor::Tensor;

use crate::client_manager::ClientManager;
use crate::errors::ClientError;
use crate::server_monitor::ServerMonitor;

/// Named result tensors, keyed by AS alias.
#[derive(Debug, Default)]
pub struct QueryResult {
    tensors: HashMap<String, Vec<Arc<Tensor>>>,
}

impl QueryResult {
    pub fn get(&self, alias: &str, slot: usize) -> Option<&Arc<Tensor>> {
        self.tensors.get(alias).and_then(|slots| slots.get(slot))
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.tensors.keys().map(String::as_str).collect()
    }
}

pub struct Graph {
    compiler: Arc<Compiler>,
    env: Arc<RuntimeEnv>,
}

fn mode_of(options: &ClientOptions) -> Mode {
    match options.mode {
        RunMode::Local => Mode::Local,
        RunMode::Remote => Mode::Distribute,
        RunMode::GraphPartition => Mode::GraphPartition,
    }
}

impl Graph {
    /// A client of a sharded cluster. Blocks until the cluster's metadata
    /// is available.
    pub fn connect(
        monitor: Arc<dyn ServerMonitor>,
        options: &ClientOptions,
        compute: tokio::runtime::Handle,
    ) -> Result<Self, ClientError> {
        let manager = Arc::new(ClientManager::new(monitor, options)?);
        let compiler = Arc::new(Compiler::new(
            options.shard_num.max(1) as i32,
            mode_of(options),
            manager.index_info(),
        ));
        let env = RuntimeEnv::builder(compute)
            .clients(manager.clone())
            .shard_weights(manager.shard_weights().clone())
            .build();
        Ok(Self { compiler, env })
    }

    /// An in-process graph, no cluster involved.
    pub fn local(
        graph: Arc<dyn GraphStore>,
        index_info: &str,
        compute: tokio::runtime::Handle,
    ) -> Self {
        let compiler = Arc::new(Compiler::new(1, Mode::Local, index_info));
        let env = RuntimeEnv::builder(compute).graph(graph).build();
        Self { compiler, env }
    }

    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.compiler
    }

    pub fn env(&self) -> &Arc<RuntimeEnv> {
        &self.env
    }

    /// Compiles (with cache) and runs one traversal. `inputs` installs the
    /// external tensors the query references.
    pub async fn run(
        &self,
        query: &str,
        inputs: Vec<(String, Tensor)>,
    ) -> Result<QueryResult, ClientError> {
        self.run_with_query_context(query, inputs, Arc::new(QueryContext::unbounded()))
            .await
    }

    pub async fn run_with_query_context(
        &self,
        query: &str,
        inputs: Vec<(String, Tensor)>,
        query_ctx: Arc<QueryContext>,
    ) -> Result<QueryResult, ClientError> {
        let dag = self.compiler.compile(query)?;
        let ctx = Arc::new(OpKernelContext::new());
        for (name, tensor) in inputs {
            ctx.put(name, tensor)?;
        }
        let executor = Executor::with_query(dag.clone(), ctx.clone(), self.env.clone(), query_ctx);
        executor.run().await?;

        let mut tensors = HashMap::new();
        for index in dag.node_indexes() {
            let node = dag.node(index);
            if node.op != "AS" || node.op_alias.is_empty() {
                continue;
            }
            let mut slots = Vec::with_capacity(node.output_num.max(0) as usize);
            for slot in 0..node.output_num.max(0) as usize {
                if let Some(tensor) = ctx.try_get(&output_name(node, slot)) {
                    slots.push(tensor);
                }
            }
            tensors.insert(node.op_alias.clone(), slots);
        }
        Ok(QueryResult { tensors })
    }
}
