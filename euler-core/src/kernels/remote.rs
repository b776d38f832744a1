//! The REMOTE operator: ships its inner sub-DAG plus the tensors it needs
//! to the target shard and installs the reply under local names.

use std::collections::{HashMap, HashSet};

use euler_types::grpc::{DagNodeProto, DagProto, ExecuteRequest};
use euler_types::tonic;
use euler_types::tracing::warn;

use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::op_kernel::{AsyncOpKernel, OpKernelContext};

/// If `input` is a `REMOTE,<id>:<slot>` reference, the slot indexes the
/// remote node's own input list.
fn remote_input_slot(input: &str) -> Option<usize> {
    let (name, slot) = input.rsplit_once(':')?;
    let (op, _) = name.split_once(',')?;
    if op == crate::dag_def::REMOTE_OP {
        slot.parse().ok()
    } else {
        None
    }
}

pub struct Remote;

struct RequestBuilder<'a> {
    ctx: &'a OpKernelContext,
    request: ExecuteRequest,
    packed: HashSet<String>,
}

impl<'a> RequestBuilder<'a> {
    fn try_pack(&mut self, wire_name: &str, local_name: &str) {
        if self.packed.contains(wire_name) {
            return;
        }
        if let Some(tensor) = self.ctx.try_get(local_name) {
            self.request.inputs.push(tensor.encode(wire_name));
            self.packed.insert(wire_name.to_string());
        }
    }
}

#[tonic::async_trait]
impl AsyncOpKernel for Remote {
    async fn compute_async(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shard = node.shard_idx.max(0) as usize;
        let mut builder = RequestBuilder {
            ctx,
            request: ExecuteRequest::default(),
            packed: HashSet::new(),
        };

        // Pack everything the inner nodes reference from this side: the
        // outer inputs behind REMOTE references, UDF parameter tensors and
        // DNF value tensors.
        for inner in &node.inner_nodes {
            for input in &inner.inputs {
                match remote_input_slot(input) {
                    Some(slot) => {
                        if let Some(outer_name) = node.inputs.get(slot) {
                            builder.try_pack(input, outer_name);
                        }
                    }
                    None => builder.try_pack(input, input),
                }
            }
            for param in inner.udf_str_params.iter().chain(&inner.udf_num_params) {
                builder.try_pack(param, param);
            }
            for conjunction in &inner.dnf {
                for term in conjunction.split(',') {
                    if let Some(value) = term.split_whitespace().nth(2) {
                        builder.try_pack(value, value);
                    }
                }
            }
        }

        builder.request.graph = Some(DagProto {
            name: String::new(),
            nodes: node.inner_nodes.clone(),
        });

        let mut local_names: HashMap<&str, &str> = HashMap::new();
        for (inner_name, local_name) in node.output_list.iter().zip(&node.remote_output_list) {
            builder.request.outputs.push(inner_name.clone());
            local_names.insert(inner_name.as_str(), local_name.as_str());
        }

        let reply = env
            .clients()?
            .execute(shard, builder.request)
            .await
            .map_err(|status| {
                warn!(shard, error = %status, "remote execute failed");
                ExecutionError::Rpc(status)
            })?;

        for tensor in &reply.outputs {
            let local = local_names.get(tensor.name.as_str()).ok_or_else(|| {
                ExecutionError::Internal(format!("unexpected reply tensor '{}'", tensor.name))
            })?;
            ctx.decode_named(*local, tensor)
                .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}
