//! AS and POST_PROCESS, the alias and post-transform ops every compiled
//! query carries.

use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;

use super::util::{ids_of, input_tensor};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

/// Forwards every input to the matching output slot. Its only purpose is
/// giving aliased results a stable name for SELECT clauses and callers.
pub struct As;

impl OpKernel for As {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        for slot in 0..node.inputs.len() {
            let tensor = input_tensor(node, ctx, slot)?;
            ctx.put_arc(output_name(node, slot), tensor)
                .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortKey {
    Id,
    Weight,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    OrderBy { key: SortKey, ascending: bool },
    Limit(usize),
}

fn parse_command(raw: &str) -> Result<Command, ExecutionError> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    match parts.as_slice() {
        ["order_by", key, rest @ ..] => {
            let key = match *key {
                "id" => SortKey::Id,
                "weight" => SortKey::Weight,
                _ => return Err(ExecutionError::InvalidPostProcess(raw.to_string())),
            };
            let ascending = !matches!(rest.first(), Some(&"desc"));
            Ok(Command::OrderBy { key, ascending })
        }
        ["limit", count] => count
            .parse::<usize>()
            .map(Command::Limit)
            .map_err(|_| ExecutionError::InvalidPostProcess(raw.to_string())),
        _ => Err(ExecutionError::InvalidPostProcess(raw.to_string())),
    }
}

/// Applies ordered `order_by` / `limit` commands to its producer's outputs.
/// Input 0 must be the id vector; input 1, when present, its weights.
pub struct PostProcess;

impl OpKernel for PostProcess {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let ids_tensor = input_tensor(node, ctx, 0)?;
        let ids = ids_of(&ids_tensor)?;
        let weights = if node.inputs.len() > 1 {
            let tensor = input_tensor(node, ctx, 1)?;
            Some(tensor.values::<f32>().map(<[f32]>::to_vec).unwrap_or_default())
        } else {
            None
        };

        let mut order: Vec<usize> = (0..ids.len()).collect();
        let mut limit = ids.len();
        for raw in &node.post_process {
            match parse_command(raw)? {
                Command::OrderBy { key, ascending } => {
                    match key {
                        SortKey::Id => order.sort_by_key(|&i| ids[i]),
                        SortKey::Weight => {
                            let weights = weights.as_ref().ok_or_else(|| {
                                ExecutionError::InvalidPostProcess(
                                    "order_by weight without a weight input".to_string(),
                                )
                            })?;
                            order.sort_by(|&a, &b| {
                                weights[a]
                                    .partial_cmp(&weights[b])
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            });
                        }
                    }
                    if !ascending {
                        order.reverse();
                    }
                }
                Command::Limit(count) => limit = limit.min(count),
            }
        }
        order.truncate(limit);

        let picked_ids: Vec<u64> = order.iter().map(|&i| ids[i]).collect();
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![picked_ids.len()], picked_ids),
        )
        .map_err(ExecutionError::Type)?;
        if let Some(weights) = weights {
            let picked: Vec<f32> = order.iter().map(|&i| weights[i]).collect();
            ctx.put(
                output_name(node, 1),
                Tensor::from_vec(vec![picked.len()], picked),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}
