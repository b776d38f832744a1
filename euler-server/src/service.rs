//! The worker surface: receive an execution DAG plus input tensors from a
//! peer, run it on the compute runtime, stream back the requested outputs.

use std::sync::Arc;

use euler_core::{Dag, Executor, OpKernelContext, RuntimeEnv};
use euler_types::grpc::euler_service_server::EulerService;
use euler_types::grpc::{ExecuteReply, ExecuteRequest, PingReply, PingRequest};
use euler_types::tonic::{self, Request, Response};
use euler_types::tracing::{debug, warn};

pub struct WorkerService {
    env: Arc<RuntimeEnv>,
}

impl WorkerService {
    pub fn new(env: Arc<RuntimeEnv>) -> Self {
        euler_core::kernels::register_builtin();
        Self { env }
    }

    /// The whole execute path, also callable in-process by tests.
    pub async fn execute_request(
        env: Arc<RuntimeEnv>,
        request: ExecuteRequest,
    ) -> Result<ExecuteReply, tonic::Status> {
        euler_core::kernels::register_builtin();
        let ctx = Arc::new(OpKernelContext::new());
        for input in &request.inputs {
            ctx.decode(input).map_err(|err| {
                tonic::Status::internal(format!(
                    "allocate input tensor '{}' failed: {err}",
                    input.name
                ))
            })?;
        }

        let graph = request
            .graph
            .as_ref()
            .ok_or_else(|| tonic::Status::invalid_argument("request carries no graph"))?;
        let dag = Dag::from_proto(graph)
            .map_err(|err| tonic::Status::internal(format!("materialise graph failed: {err}")))?;

        let executor = Executor::new(Arc::new(dag), ctx.clone(), env);
        if let Err(err) = executor.run().await {
            // Per-operator failures surface as missing or empty outputs;
            // callers detect by size.
            warn!(error = %err, "operator failed while executing remote graph");
        }

        let mut reply = ExecuteReply::default();
        for output in &request.outputs {
            let tensor = ctx.try_get(output).ok_or_else(|| {
                tonic::Status::internal(format!("no output tensor '{output}'"))
            })?;
            reply.outputs.push(tensor.encode(output));
        }
        Ok(reply)
    }
}

#[tonic::async_trait]
impl EulerService for WorkerService {
    async fn ping(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<PingReply>, tonic::Status> {
        debug!(content = %request.get_ref().content, "ping");
        Ok(Response::new(PingReply {
            content: "Pong".to_string(),
        }))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteReply>, tonic::Status> {
        let env = self.env.clone();
        let request = request.into_inner();
        // Run on the compute runtime so long queries never tie up the
        // network threads.
        let handle = env.compute().clone();
        let result = handle
            .spawn(async move { Self::execute_request(env, request).await })
            .await
            .map_err(|err| tonic::Status::internal(format!("compute task failed: {err}")))??;
        Ok(Response::new(result))
    }
}
