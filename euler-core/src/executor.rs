//! Reference-counted dataflow executor.
//!
//! Every node starts with a pending counter equal to its in-degree; nodes
//! at zero are spawned onto the compute runtime. Completion decrements each
//! successor, and a successor reaching zero is spawned in turn. The first
//! kernel error is kept, its transitive dependents are skipped (they still
//! complete so the run terminates), and the run resolves to that error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use daggy::NodeIndex;
use euler_types::parking_lot::Mutex;
use euler_types::tracing::debug;

use crate::dag::Dag;
use crate::env::{QueryContext, RuntimeEnv};
use crate::errors::ExecutionError;
use crate::op_kernel::{registry, OpKernelContext};

pub struct Executor {
    dag: Arc<Dag>,
    ctx: Arc<OpKernelContext>,
    env: Arc<RuntimeEnv>,
    query: Arc<QueryContext>,
}

struct RunState {
    dag: Arc<Dag>,
    ctx: Arc<OpKernelContext>,
    env: Arc<RuntimeEnv>,
    query: Arc<QueryContext>,
    pending: Vec<AtomicUsize>,
    skip: Vec<AtomicBool>,
    remaining: AtomicUsize,
    first_error: Mutex<Option<ExecutionError>>,
    done: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl RunState {
    fn record_error(&self, index: NodeIndex, error: ExecutionError) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        for dependent in self.dag.descendants(index) {
            self.skip[dependent.index()].store(true, Ordering::Release);
        }
    }

    fn finish_node(self: &Arc<Self>, index: NodeIndex) {
        for successor in self.dag.successors(index) {
            if self.pending[successor.index()].fetch_sub(1, Ordering::AcqRel) == 1 {
                spawn_node(self.clone(), successor);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(done) = self.done.lock().take() {
                let _ = done.send(());
            }
        }
    }
}

fn spawn_node(state: Arc<RunState>, index: NodeIndex) {
    let handle = state.env.compute().clone();
    handle.spawn(async move {
        run_node(&state, index).await;
        state.finish_node(index);
    });
}

async fn run_node(state: &Arc<RunState>, index: NodeIndex) {
    if state.skip[index.index()].load(Ordering::Acquire) {
        return;
    }
    if let Err(error) = state.query.check() {
        state.record_error(index, error);
        return;
    }
    let node = state.dag.node(index);
    let Some(kernel) = registry::lookup(&node.op) else {
        state.record_error(index, ExecutionError::KernelNotFound(node.op.clone()));
        return;
    };
    debug!(op = %node.op, node = %node.name, "running kernel");
    if let Err(error) = kernel.run(node, &state.ctx, &state.env).await {
        state.record_error(
            index,
            ExecutionError::KernelFailed {
                op: node.op.clone(),
                source: Box::new(error),
            },
        );
    }
}

impl Executor {
    pub fn new(dag: Arc<Dag>, ctx: Arc<OpKernelContext>, env: Arc<RuntimeEnv>) -> Self {
        Self {
            dag,
            ctx,
            env,
            query: Arc::new(QueryContext::unbounded()),
        }
    }

    pub fn with_query(
        dag: Arc<Dag>,
        ctx: Arc<OpKernelContext>,
        env: Arc<RuntimeEnv>,
        query: Arc<QueryContext>,
    ) -> Self {
        Self {
            dag,
            ctx,
            env,
            query,
        }
    }

    pub fn context(&self) -> &Arc<OpKernelContext> {
        &self.ctx
    }

    /// Runs the whole DAG; resolves when every node has completed or been
    /// skipped.
    pub async fn run(&self) -> Result<(), ExecutionError> {
        let num_nodes = self.dag.num_nodes();
        if num_nodes == 0 {
            return Ok(());
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let state = Arc::new(RunState {
            dag: self.dag.clone(),
            ctx: self.ctx.clone(),
            env: self.env.clone(),
            query: self.query.clone(),
            pending: (0..num_nodes).map(|_| AtomicUsize::new(0)).collect(),
            skip: (0..num_nodes).map(|_| AtomicBool::new(false)).collect(),
            remaining: AtomicUsize::new(num_nodes),
            first_error: Mutex::new(None),
            done: Mutex::new(Some(tx)),
        });

        let mut frontier = Vec::new();
        for index in self.dag.node_indexes() {
            let degree = self.dag.in_degree(index);
            state.pending[index.index()].store(degree, Ordering::Release);
            if degree == 0 {
                frontier.push(index);
            }
        }
        for index in frontier {
            spawn_node(state.clone(), index);
        }

        let _ = rx.await;
        let error = state.first_error.lock().take();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Blocking form: parks the calling thread until the query completes.
    /// Must not be called from a compute-pool thread.
    pub fn run_blocking(&self) -> Result<(), ExecutionError> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.run_with(move |result| {
            let _ = tx.send(result);
        });
        rx.recv()
            .unwrap_or_else(|_| Err(ExecutionError::Internal("executor dropped".to_string())))
    }

    /// Callback form: returns immediately, invokes `callback` once when all
    /// nodes complete.
    pub fn run_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), ExecutionError>) + Send + 'static,
    {
        let dag = self.dag.clone();
        let ctx = self.ctx.clone();
        let env = self.env.clone();
        let query = self.query.clone();
        self.env.compute().spawn(async move {
            let executor = Executor::with_query(dag, ctx, env, query);
            callback(executor.run().await);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use euler_types::grpc::{DagNodeProto, DagProto};
    use euler_types::tensor::Tensor;

    fn as_node(name: &str, inputs: &[&str]) -> DagNodeProto {
        DagNodeProto {
            name: name.to_string(),
            op: "AS".to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output_num: 1,
            ..Default::default()
        }
    }

    fn env() -> Arc<RuntimeEnv> {
        RuntimeEnv::builder(tokio::runtime::Handle::current()).build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_in_dependency_order() {
        kernels::register_builtin();
        let proto = DagProto {
            nodes: vec![
                as_node("AS,0", &["seed"]),
                as_node("AS,1", &["AS,0:0"]),
                as_node("AS,2", &["AS,1:0"]),
            ],
            ..Default::default()
        };
        let dag = Arc::new(Dag::from_proto(&proto).unwrap());
        let ctx = Arc::new(OpKernelContext::new());
        ctx.put("seed", Tensor::from_vec(vec![3], vec![1i64, 2, 3]))
            .unwrap();
        let executor = Executor::new(dag, ctx.clone(), env());
        executor.run().await.unwrap();
        let out = ctx.get("AS,2:0").unwrap();
        assert_eq!(out.values::<i64>().unwrap(), &[1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_error_short_circuits_dependents() {
        kernels::register_builtin();
        // AS,1 will fail: its input tensor is never installed.
        let proto = DagProto {
            nodes: vec![
                as_node("AS,0", &["seed"]),
                as_node("AS,1", &["missing"]),
                as_node("AS,2", &["AS,1:0"]),
            ],
            ..Default::default()
        };
        let dag = Arc::new(Dag::from_proto(&proto).unwrap());
        let ctx = Arc::new(OpKernelContext::new());
        ctx.put("seed", Tensor::from_vec(vec![1], vec![1i64]))
            .unwrap();
        let executor = Executor::new(dag, ctx.clone(), env());
        let err = executor.run().await.unwrap_err();
        assert!(matches!(err, ExecutionError::KernelFailed { .. }));
        // The healthy branch still ran; the dependent of the failure did not.
        assert!(ctx.contains("AS,0:0"));
        assert!(!ctx.contains("AS,2:0"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_query_aborts() {
        kernels::register_builtin();
        let proto = DagProto {
            nodes: vec![as_node("AS,0", &["seed"])],
            ..Default::default()
        };
        let dag = Arc::new(Dag::from_proto(&proto).unwrap());
        let ctx = Arc::new(OpKernelContext::new());
        ctx.put("seed", Tensor::from_vec(vec![1], vec![1i64]))
            .unwrap();
        let query = Arc::new(QueryContext::unbounded());
        query.cancel();
        let executor = Executor::with_query(dag, ctx, env(), query);
        assert!(matches!(
            executor.run().await,
            Err(ExecutionError::Cancelled)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_kernels_complete_through_their_own_future() {
        use crate::op_kernel::{output_name, registry, AsyncOpKernel};
        use euler_types::tonic;

        struct SlowEcho;

        #[tonic::async_trait]
        impl AsyncOpKernel for SlowEcho {
            async fn compute_async(
                &self,
                node: &euler_types::grpc::DagNodeProto,
                ctx: &OpKernelContext,
                _env: &RuntimeEnv,
            ) -> Result<(), ExecutionError> {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let input = ctx.get(&node.inputs[0]).map_err(ExecutionError::Type)?;
                ctx.put_arc(output_name(node, 0), input)
                    .map_err(ExecutionError::Type)?;
                Ok(())
            }
        }

        kernels::register_builtin();
        registry::register_async("SLOW_ECHO", Arc::new(SlowEcho));

        // The alias node downstream only fires once the async op is done.
        let proto = DagProto {
            nodes: vec![
                DagNodeProto {
                    name: "SLOW_ECHO,0".to_string(),
                    op: "SLOW_ECHO".to_string(),
                    inputs: vec!["seed".to_string()],
                    output_num: 1,
                    ..Default::default()
                },
                as_node("AS,1", &["SLOW_ECHO,0:0"]),
            ],
            ..Default::default()
        };
        let dag = Arc::new(Dag::from_proto(&proto).unwrap());
        let ctx = Arc::new(OpKernelContext::new());
        ctx.put("seed", Tensor::from_vec(vec![2], vec![5i64, 6]))
            .unwrap();
        Executor::new(dag, ctx.clone(), env()).run().await.unwrap();
        assert_eq!(
            ctx.get("AS,1:0").unwrap().values::<i64>().unwrap(),
            &[5, 6]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_run_completes_off_runtime() {
        kernels::register_builtin();
        let proto = DagProto {
            nodes: vec![as_node("AS,0", &["seed"])],
            ..Default::default()
        };
        let dag = Arc::new(Dag::from_proto(&proto).unwrap());
        let ctx = Arc::new(OpKernelContext::new());
        ctx.put("seed", Tensor::from_vec(vec![1], vec![9i64]))
            .unwrap();
        let executor = Executor::new(dag, ctx.clone(), env());
        let handle = std::thread::spawn(move || executor.run_blocking());
        handle.join().unwrap().unwrap();
        assert!(ctx.contains("AS,0:0"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_dag_completes() {
        kernels::register_builtin();
        let dag = Arc::new(Dag::from_proto(&DagProto::default()).unwrap());
        let executor = Executor::new(dag, Arc::new(OpKernelContext::new()), env());
        executor.run().await.unwrap();
    }
}
