//! Layered random-walk sampler ops. A sampleLNB step expands into the
//! subgraph root-weights → root-sample → layer-sample →
//! sparse-adjacency → gather; these kernels provide each stage.

use std::collections::HashSet;

use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;
use rand::Rng;

use super::util::{i32s_of, ids_of, input_tensor, param_i32, param_i32_list, segments_of, segments_tensor};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::graph::Neighbor;
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

/// API_RESHAPE: a shape-only view; the data flows through unchanged.
pub struct Reshape;

impl OpKernel for Reshape {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let input = input_tensor(node, ctx, 0)?;
        ctx.put_arc(output_name(node, 0), input)
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_EDGE_SUM_WEIGHT: per id, the summed weight of its outgoing
/// edges of the requested types. Output 0 re-emits the ids.
pub struct EdgeSumWeight;

impl OpKernel for EdgeSumWeight {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let edge_types = if node.inputs.len() > 1 {
            param_i32_list(node, ctx, 1).unwrap_or_default()
        } else {
            Vec::new()
        };
        let sums: Vec<f32> = ids
            .iter()
            .map(|id| {
                graph
                    .neighbors(*id, &edge_types)
                    .iter()
                    .map(|n| n.weight)
                    .sum()
            })
            .collect();
        ctx.put(output_name(node, 0), Tensor::from_vec(vec![ids.len()], ids))
            .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 1),
            Tensor::from_vec(vec![sums.len()], sums),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_SAMPLE_ROOT: draws `n` root ids weighted by the summed edge
/// weights; an empty candidate set falls back to the default node.
pub struct SampleRoot;

impl OpKernel for SampleRoot {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let weights_tensor = input_tensor(node, ctx, 1)?;
        let weights = weights_tensor
            .values::<f32>()
            .map_err(ExecutionError::Type)?;
        let n = param_i32(node, ctx, 2)?.max(0) as usize;
        let default_node = if node.inputs.len() > 4 {
            param_i32(node, ctx, 4).unwrap_or(0) as u64
        } else {
            0
        };

        let mut rng = rand::thread_rng();
        let total: f32 = weights.iter().map(|w| w.max(0.0)).sum();
        let mut roots = Vec::with_capacity(n);
        for _ in 0..n {
            if ids.is_empty() {
                roots.push(default_node);
            } else if total <= 0.0 {
                roots.push(ids[rng.gen_range(0..ids.len())]);
            } else {
                let mut target = rng.gen::<f32>() * total;
                let mut chosen = ids[ids.len() - 1];
                for (id, weight) in ids.iter().zip(weights) {
                    target -= weight.max(0.0);
                    if target <= 0.0 {
                        chosen = *id;
                        break;
                    }
                }
                roots.push(chosen);
            }
        }
        ctx.put(output_name(node, 0), Tensor::from_vec(vec![n], roots))
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// Layer ops emit the layer ids first: slot 0 ids, slot 1 segments,
/// slot 2 weights. Downstream sparse ops chain from slot 0.
fn adjacency_outputs(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    rows: Vec<Vec<Neighbor>>,
) -> Result<(), ExecutionError> {
    let mut segments = Vec::with_capacity(rows.len());
    let mut ids = Vec::new();
    let mut weights = Vec::new();
    let mut offset = 0usize;
    for row in &rows {
        segments.push((offset, offset + row.len()));
        offset += row.len();
        for n in row {
            ids.push(n.id);
            weights.push(n.weight);
        }
    }
    ctx.put(output_name(node, 0), Tensor::from_vec(vec![ids.len()], ids))
        .map_err(ExecutionError::Type)?;
    ctx.put(output_name(node, 1), segments_tensor(&segments))
        .map_err(ExecutionError::Type)?;
    ctx.put(
        output_name(node, 2),
        Tensor::from_vec(vec![weights.len()], weights),
    )
    .map_err(ExecutionError::Type)?;
    Ok(())
}

/// API_SAMPLE_L: the full typed neighbourhood of every root, the layer the
/// sparse ops slice adjacency out of.
pub struct SampleLayer;

impl OpKernel for SampleLayer {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let roots = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let edge_types = if node.inputs.len() > 1 {
            param_i32_list(node, ctx, 1).unwrap_or_default()
        } else {
            Vec::new()
        };
        let rows: Vec<Vec<Neighbor>> = roots
            .iter()
            .map(|id| graph.neighbors(*id, &edge_types))
            .collect();
        adjacency_outputs(node, ctx, rows)
    }
}

fn apply_weight_func(weight: f32, func: &str) -> f32 {
    match func {
        "sqrt" => weight.max(0.0).sqrt(),
        "log" => (weight.max(0.0) + 1.0).ln(),
        _ => weight,
    }
}

/// API_LOCAL_SAMPLE_L: weighted draw of `m` neighbours per adjacency row,
/// with an optional reweighting function.
pub struct LocalSampleLayer;

impl OpKernel for LocalSampleLayer {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let segments = segments_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let nb_ids = ids_of(input_tensor(node, ctx, 1)?.as_ref())?;
        let weights_tensor = input_tensor(node, ctx, 2)?;
        let weights = weights_tensor
            .values::<f32>()
            .map_err(ExecutionError::Type)?;
        let types = i32s_of(input_tensor(node, ctx, 3)?.as_ref())?;
        // Inputs 4..: n, m, weight_func, default_node parameters.
        let m = if node.inputs.len() > 5 {
            param_i32(node, ctx, 5)?.max(0) as usize
        } else {
            1
        };
        let weight_func = if node.inputs.len() > 6 {
            super::api::param_string(node, ctx, 6)
        } else {
            String::new()
        };
        let default_node = if node.inputs.len() > 7 {
            param_i32(node, ctx, 7).unwrap_or(0) as u64
        } else {
            0
        };

        let mut rng = rand::thread_rng();
        let mut rows = Vec::with_capacity(segments.len());
        for (begin, end) in segments {
            let candidates: Vec<Neighbor> = (begin..end.min(nb_ids.len()))
                .map(|i| Neighbor {
                    id: nb_ids[i],
                    weight: apply_weight_func(weights.get(i).copied().unwrap_or(0.0), &weight_func),
                    edge_type: types.get(i).copied().unwrap_or(-1),
                })
                .collect();
            let mut row = Vec::with_capacity(m);
            if candidates.is_empty() {
                row.resize(
                    m,
                    Neighbor {
                        id: default_node,
                        weight: 0.0,
                        edge_type: -1,
                    },
                );
            } else {
                let total: f32 = candidates.iter().map(|n| n.weight.max(0.0)).sum();
                for _ in 0..m {
                    let pick = if total <= 0.0 {
                        candidates[rng.gen_range(0..candidates.len())]
                    } else {
                        let mut target = rng.gen::<f32>() * total;
                        let mut chosen = candidates[candidates.len() - 1];
                        for n in &candidates {
                            target -= n.weight.max(0.0);
                            if target <= 0.0 {
                                chosen = *n;
                                break;
                            }
                        }
                        chosen
                    };
                    row.push(pick);
                }
            }
            rows.push(row);
        }
        adjacency_outputs(node, ctx, rows)
    }
}

/// API_SPARSE_GEN_ADJ: batches roots against the sampled layer. Output 0
/// re-emits the roots, output 1 the layer ids.
pub struct SparseGenAdj;

impl OpKernel for SparseGenAdj {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let roots = input_tensor(node, ctx, 0)?;
        let layer = input_tensor(node, ctx, 1)?;
        ctx.put_arc(output_name(node, 0), roots)
            .map_err(ExecutionError::Type)?;
        ctx.put_arc(output_name(node, 1), layer)
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_SPARSE_GET_ADJ: adjacency restricted to the sampled layer — per
/// root, its neighbours that are also layer members, capped at `m`.
pub struct SparseGetAdj;

impl OpKernel for SparseGetAdj {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let roots = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let layer: HashSet<u64> = ids_of(input_tensor(node, ctx, 1)?.as_ref())?.into_iter().collect();
        let edge_types = if node.inputs.len() > 2 {
            param_i32_list(node, ctx, 2).unwrap_or_default()
        } else {
            Vec::new()
        };
        let m = if node.inputs.len() > 3 {
            param_i32(node, ctx, 3)?.max(0) as usize
        } else {
            usize::MAX
        };

        let mut segments = Vec::with_capacity(roots.len());
        let mut adj = Vec::new();
        let mut offset = 0usize;
        for root in &roots {
            let picked: Vec<u64> = graph
                .neighbors(*root, &edge_types)
                .into_iter()
                .filter(|n| layer.contains(&n.id))
                .take(m)
                .map(|n| n.id)
                .collect();
            segments.push((offset, offset + picked.len()));
            offset += picked.len();
            adj.extend(picked);
        }
        ctx.put(output_name(node, 0), segments_tensor(&segments))
            .map_err(ExecutionError::Type)?;
        ctx.put(output_name(node, 1), Tensor::from_vec(vec![adj.len()], adj))
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GATHER_RESULT: assembles the layer-sampler result block. Slots:
/// adjacency segments, adjacency ids, weights, types, and the layer ids
/// follow-up steps chain from.
pub struct GatherResult;

impl OpKernel for GatherResult {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let adj_idx = input_tensor(node, ctx, 0)?;
        let adj_ids = input_tensor(node, ctx, 1)?;
        let layer = input_tensor(node, ctx, 2)?;
        let count = adj_ids.num_elements();
        ctx.put_arc(output_name(node, 0), adj_idx)
            .map_err(ExecutionError::Type)?;
        ctx.put_arc(output_name(node, 1), adj_ids)
            .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 2),
            Tensor::from_vec(vec![count], vec![1.0f32; count]),
        )
        .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 3),
            Tensor::from_vec(vec![count], vec![0i32; count]),
        )
        .map_err(ExecutionError::Type)?;
        ctx.put_arc(output_name(node, 4), layer)
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}
