//! Split ops inserted in front of sharded remotes. Every split publishes,
//! for each shard `s`, its payload at slot `2s` and an i32 merge-index
//! tensor at slot `2s + 1` mapping the shipped rows back to original row
//! positions.

use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;

use super::util::{ids_of, input_tensor, row_count, scalar_i32};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

fn num_shards(node: &DagNodeProto) -> usize {
    (node.output_num.max(0) as usize) / 2
}

/// Ships the full input to every shard; the merge index is the identity.
pub struct BroadcastSplit;

impl OpKernel for BroadcastSplit {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let input = input_tensor(node, ctx, 0)?;
        let rows = row_count(&input);
        let identity: Vec<i32> = (0..rows as i32).collect();
        for shard in 0..num_shards(node) {
            ctx.put_arc(output_name(node, 2 * shard), input.clone())
                .map_err(ExecutionError::Type)?;
            ctx.put(
                output_name(node, 2 * shard + 1),
                Tensor::from_vec(vec![rows], identity.clone()),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

/// Splits a global sample count across shards, proportionally to the
/// per-shard weight totals when known, evenly otherwise. Inputs: count,
/// then the type vector whose weights apply.
pub struct SampleCountSplit {
    pub edges: bool,
}

impl SampleCountSplit {
    fn shard_share(&self, env: &RuntimeEnv, shards: usize) -> Option<Vec<f32>> {
        let weights = env.shard_weights();
        let table = if self.edges { &weights.edge } else { &weights.node };
        // The totals row across types carries one column per shard plus the
        // grand total.
        let totals = table.last()?;
        if totals.len() < shards + 1 || totals[shards] <= 0.0 {
            return None;
        }
        Some(totals[..shards].to_vec())
    }
}

impl OpKernel for SampleCountSplit {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let count = scalar_i32(input_tensor(node, ctx, 0)?.as_ref())?.max(0) as usize;
        let shards = num_shards(node);
        let mut per_shard = vec![0usize; shards];
        match self.shard_share(env, shards) {
            Some(share) => {
                let total: f32 = share.iter().sum();
                let mut assigned = 0;
                for (s, weight) in share.iter().enumerate() {
                    per_shard[s] = ((count as f32) * weight / total).floor() as usize;
                    assigned += per_shard[s];
                }
                // Leftovers go to the front shards.
                for s in 0..count.saturating_sub(assigned) {
                    per_shard[s % shards] += 1;
                }
            }
            None => {
                for (s, slot) in per_shard.iter_mut().enumerate() {
                    *slot = count / shards + usize::from(s < count % shards);
                }
            }
        }
        for (shard, share) in per_shard.iter().enumerate() {
            ctx.put(
                output_name(node, 2 * shard),
                Tensor::scalar(*share as i32),
            )
            .map_err(ExecutionError::Type)?;
            ctx.put(
                output_name(node, 2 * shard + 1),
                Tensor::from_vec(vec![0], Vec::<i32>::new()),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

/// Partitions an id vector by owning shard (`id % num_shards`).
pub struct IdSplit;

impl OpKernel for IdSplit {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let input = input_tensor(node, ctx, 0)?;
        let ids = ids_of(&input)?;
        let shards = num_shards(node);
        let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); shards];
        let mut positions: Vec<Vec<i32>> = vec![Vec::new(); shards];
        for (row, id) in ids.iter().enumerate() {
            let shard = (*id % shards as u64) as usize;
            buckets[shard].push(*id);
            positions[shard].push(row as i32);
        }
        for shard in 0..shards {
            let bucket = std::mem::take(&mut buckets[shard]);
            let position = std::mem::take(&mut positions[shard]);
            ctx.put(
                output_name(node, 2 * shard),
                Tensor::from_vec(vec![bucket.len()], bucket),
            )
            .map_err(ExecutionError::Type)?;
            ctx.put(
                output_name(node, 2 * shard + 1),
                Tensor::from_vec(vec![position.len()], position),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn split_node(op: &str, shards: i32, inputs: &[&str]) -> DagNodeProto {
        DagNodeProto {
            name: format!("{op},7"),
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output_num: 2 * shards,
            ..Default::default()
        }
    }

    fn env() -> Arc<RuntimeEnv> {
        RuntimeEnv::builder(tokio::runtime::Handle::current()).build()
    }

    #[tokio::test]
    async fn broadcast_clones_to_every_shard() {
        let ctx = OpKernelContext::new();
        ctx.put("ids", Tensor::from_vec(vec![3], vec![5u64, 6, 7]))
            .unwrap();
        let node = split_node("BROAD_CAST_SPLIT", 2, &["ids"]);
        BroadcastSplit.compute(&node, &ctx, &env()).unwrap();
        for shard in 0..2 {
            let data = ctx.get(&format!("BROAD_CAST_SPLIT,7:{}", 2 * shard)).unwrap();
            assert_eq!(data.values::<u64>().unwrap(), &[5, 6, 7]);
            let idx = ctx
                .get(&format!("BROAD_CAST_SPLIT,7:{}", 2 * shard + 1))
                .unwrap();
            assert_eq!(idx.values::<i32>().unwrap(), &[0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn id_split_partitions_by_modulo() {
        let ctx = OpKernelContext::new();
        ctx.put("ids", Tensor::from_vec(vec![4], vec![4u64, 5, 6, 7]))
            .unwrap();
        let node = split_node("ID_SPLIT", 2, &["ids"]);
        IdSplit.compute(&node, &ctx, &env()).unwrap();
        let shard0 = ctx.get("ID_SPLIT,7:0").unwrap();
        assert_eq!(shard0.values::<u64>().unwrap(), &[4, 6]);
        let idx0 = ctx.get("ID_SPLIT,7:1").unwrap();
        assert_eq!(idx0.values::<i32>().unwrap(), &[0, 2]);
        let shard1 = ctx.get("ID_SPLIT,7:2").unwrap();
        assert_eq!(shard1.values::<u64>().unwrap(), &[5, 7]);
    }

    #[tokio::test]
    async fn count_split_is_even_without_weights() {
        let ctx = OpKernelContext::new();
        ctx.put("count", Tensor::scalar(7i32)).unwrap();
        ctx.put("types", Tensor::from_vec(vec![1], vec![0i32]))
            .unwrap();
        let node = split_node("SAMPLE_NODE_SPLIT", 3, &["count", "types"]);
        SampleCountSplit { edges: false }
            .compute(&node, &ctx, &env())
            .unwrap();
        let counts: Vec<i32> = (0..3)
            .map(|s| {
                scalar_i32(
                    &ctx.get(&format!("SAMPLE_NODE_SPLIT,7:{}", 2 * s))
                        .unwrap(),
                )
                .unwrap()
            })
            .collect();
        assert_eq!(counts.iter().sum::<i32>(), 7);
        assert!(counts.iter().all(|c| *c >= 2));
    }
}
