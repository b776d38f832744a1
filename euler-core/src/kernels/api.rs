//! Graph-read kernels backed by the `GraphStore` collaborator. The slot
//! contracts (adjacency segments, value/index pairing) are load-bearing;
//! the per-kernel algorithms stay deliberately simple.

use std::collections::HashSet;

use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;
use rand::Rng;

use super::util::{
    i32s_of, ids_of, input_tensor, scalar_i32, scalar_string, segments_of, segments_tensor,
};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::graph::{GraphStore, Neighbor};
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone)]
struct Term {
    field: String,
    op: CmpOp,
    value: String,
}

/// DNF filter parsed from the wire node: OR over conjunctions of terms.
#[derive(Debug, Clone, Default)]
struct Filter {
    conjunctions: Vec<Vec<Term>>,
}

impl Filter {
    fn parse(node: &DagNodeProto) -> Result<Self, ExecutionError> {
        let mut conjunctions = Vec::with_capacity(node.dnf.len());
        for raw in &node.dnf {
            let mut terms = Vec::new();
            for term in raw.split(',') {
                let parts: Vec<&str> = term.split_whitespace().collect();
                let [field, op, value] = parts.as_slice() else {
                    return Err(ExecutionError::InvalidFilterTerm(term.to_string()));
                };
                let op = match *op {
                    "eq" | "==" => CmpOp::Eq,
                    "ne" | "!=" => CmpOp::Ne,
                    "gt" | ">" => CmpOp::Gt,
                    "ge" | ">=" => CmpOp::Ge,
                    "lt" | "<" => CmpOp::Lt,
                    "le" | "<=" => CmpOp::Le,
                    other => return Err(ExecutionError::InvalidFilterTerm(other.to_string())),
                };
                terms.push(Term {
                    field: field.to_string(),
                    op,
                    value: value.to_string(),
                });
            }
            conjunctions.push(terms);
        }
        Ok(Self { conjunctions })
    }

    fn is_empty(&self) -> bool {
        self.conjunctions.is_empty()
    }

    fn resolve_value(&self, term: &Term, ctx: &OpKernelContext) -> Option<f32> {
        if let Ok(v) = term.value.parse::<f32>() {
            return Some(v);
        }
        let tensor = ctx.try_get(&term.value)?;
        super::util::scalar_f32(&tensor).ok()
    }

    fn field_value(graph: &dyn GraphStore, id: u64, field: &str) -> Option<f32> {
        match field {
            "id" => Some(id as f32),
            "type" | "label" => graph.node_type(id).map(|t| t as f32),
            "weight" => graph.node_weight(id),
            name => graph.feature(id, name).first().copied(),
        }
    }

    fn matches(&self, graph: &dyn GraphStore, ctx: &OpKernelContext, id: u64) -> bool {
        if self.is_empty() {
            return true;
        }
        self.conjunctions.iter().any(|conjunction| {
            conjunction.iter().all(|term| {
                let Some(actual) = Self::field_value(graph, id, &term.field) else {
                    return false;
                };
                let Some(expected) = self.resolve_value(term, ctx) else {
                    return false;
                };
                match term.op {
                    CmpOp::Eq => actual == expected,
                    CmpOp::Ne => actual != expected,
                    CmpOp::Gt => actual > expected,
                    CmpOp::Ge => actual >= expected,
                    CmpOp::Lt => actual < expected,
                    CmpOp::Le => actual <= expected,
                }
            })
        })
    }
}

/// Resolves a parameter input: the named tensor when installed, otherwise
/// the bare name (lets callers pass literals for string parameters).
pub(crate) fn param_string(node: &DagNodeProto, ctx: &OpKernelContext, index: usize) -> String {
    let name = node.inputs.get(index).cloned().unwrap_or_default();
    match ctx.try_get(&name) {
        Some(tensor) => scalar_string(&tensor).unwrap_or(name),
        None => name,
    }
}

fn param_i32s(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    index: usize,
) -> Result<Vec<i32>, ExecutionError> {
    super::util::param_i32_list(node, ctx, index)
}

fn put_adjacency(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    neighbors_per_row: Vec<Vec<Neighbor>>,
) -> Result<(), ExecutionError> {
    let mut segments = Vec::with_capacity(neighbors_per_row.len());
    let mut ids = Vec::new();
    let mut weights = Vec::new();
    let mut types = Vec::new();
    let mut offset = 0usize;
    for row in &neighbors_per_row {
        segments.push((offset, offset + row.len()));
        offset += row.len();
        for n in row {
            ids.push(n.id);
            weights.push(n.weight);
            types.push(n.edge_type);
        }
    }
    ctx.put(output_name(node, 0), segments_tensor(&segments))
        .map_err(ExecutionError::Type)?;
    ctx.put(output_name(node, 1), Tensor::from_vec(vec![ids.len()], ids))
        .map_err(ExecutionError::Type)?;
    ctx.put(
        output_name(node, 2),
        Tensor::from_vec(vec![weights.len()], weights),
    )
    .map_err(ExecutionError::Type)?;
    ctx.put(
        output_name(node, 3),
        Tensor::from_vec(vec![types.len()], types),
    )
    .map_err(ExecutionError::Type)?;
    Ok(())
}

/// API_SAMPLE_NODE: weighted sample of `count` node ids of the requested
/// types. Inputs: types, count.
pub struct SampleNode;

impl OpKernel for SampleNode {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let types = param_i32s(node, ctx, 0)?;
        let count = super::util::param_i32(node, ctx, 1)?.max(0) as usize;
        let sampled = graph.sample_nodes(&types, count);
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![sampled.len()], sampled),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_SAMPLE_EDGE: weighted sample of `count` `(src, dst, type)` rows.
pub struct SampleEdge;

impl OpKernel for SampleEdge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let types = param_i32s(node, ctx, 0)?;
        let count = super::util::param_i32(node, ctx, 1)?.max(0) as usize;
        let sampled = graph.sample_edges(&types, count);
        let mut rows = Vec::with_capacity(sampled.len() * 3);
        for edge in &sampled {
            rows.push(edge.src);
            rows.push(edge.dst);
            rows.push(edge.edge_type.max(0) as u64);
        }
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![sampled.len(), 3], rows),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_NODE: keeps the ids that exist locally and satisfy the DNF.
pub struct GetNode;

impl OpKernel for GetNode {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let filter = Filter::parse(node)?;
        let kept: Vec<u64> = ids
            .into_iter()
            .filter(|id| graph.contains_node(*id) && filter.matches(graph.as_ref(), ctx, *id))
            .collect();
        ctx.put(output_name(node, 0), Tensor::from_vec(vec![kept.len()], kept))
            .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_EDGE: keeps `(src, dst, type)` rows whose src exists locally
/// and whose src satisfies the DNF.
pub struct GetEdge;

impl OpKernel for GetEdge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let rows = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let filter = Filter::parse(node)?;
        let mut kept = Vec::new();
        for row in rows.chunks_exact(3) {
            if graph.contains_node(row[0]) && filter.matches(graph.as_ref(), ctx, row[0]) {
                kept.extend_from_slice(row);
            }
        }
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![kept.len() / 3, 3], kept),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_NODE_T: node types, -1 for ids this store does not hold.
pub struct GetNodeType;

impl OpKernel for GetNodeType {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let types: Vec<i32> = ids
            .iter()
            .map(|id| graph.node_type(*id).unwrap_or(-1))
            .collect();
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![types.len()], types),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_P: per requested feature, an index/value pair — segments at the
/// even slot, flattened float values at the odd slot.
pub struct GetFeature;

impl OpKernel for GetFeature {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        for (feature_index, input_index) in (1..node.inputs.len()).enumerate() {
            let feature_name = param_string(node, ctx, input_index);
            let mut segments = Vec::with_capacity(ids.len());
            let mut values = Vec::new();
            let mut offset = 0usize;
            for id in &ids {
                let feature = graph.feature(*id, &feature_name);
                segments.push((offset, offset + feature.len()));
                offset += feature.len();
                values.extend(feature);
            }
            ctx.put(output_name(node, 2 * feature_index), segments_tensor(&segments))
                .map_err(ExecutionError::Type)?;
            ctx.put(
                output_name(node, 2 * feature_index + 1),
                Tensor::from_vec(vec![values.len()], values),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

/// API_GET_NB_NODE / API_GET_RNB_NODE: full adjacency of each id, with an
/// optional DNF over neighbour attributes.
pub struct GetNeighbors {
    pub reverse: bool,
}

impl OpKernel for GetNeighbors {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let edge_types = if node.inputs.len() > 1 {
            param_i32s(node, ctx, 1).unwrap_or_default()
        } else {
            Vec::new()
        };
        let filter = Filter::parse(node)?;
        let rows: Vec<Vec<Neighbor>> = ids
            .iter()
            .map(|id| {
                let all = if self.reverse {
                    graph.reverse_neighbors(*id, &edge_types)
                } else {
                    graph.neighbors(*id, &edge_types)
                };
                all.into_iter()
                    .filter(|n| filter.matches(graph.as_ref(), ctx, n.id))
                    .collect()
            })
            .collect();
        put_adjacency(node, ctx, rows)
    }
}

/// API_SAMPLE_NB: per id, `count` weighted neighbour draws (with
/// replacement); ids without neighbours fall back to the default node.
pub struct SampleNeighbors;

impl OpKernel for SampleNeighbors {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let edge_types = param_i32s(node, ctx, 1)?;
        let count = super::util::param_i32(node, ctx, 2)?.max(0) as usize;
        let default_node = if node.inputs.len() > 3 {
            super::util::param_i32(node, ctx, 3).unwrap_or(0) as i64
        } else {
            0
        };

        let mut rng = rand::thread_rng();
        let mut rows = Vec::with_capacity(ids.len());
        for id in &ids {
            let neighbors = graph.neighbors(*id, &edge_types);
            let mut row = Vec::with_capacity(count);
            if neighbors.is_empty() {
                row.resize(
                    count,
                    Neighbor {
                        id: default_node.max(0) as u64,
                        weight: 0.0,
                        edge_type: -1,
                    },
                );
            } else {
                let total: f32 = neighbors.iter().map(|n| n.weight.max(0.0)).sum();
                for _ in 0..count {
                    let pick = if total <= 0.0 {
                        neighbors[rng.gen_range(0..neighbors.len())]
                    } else {
                        let mut target = rng.gen::<f32>() * total;
                        let mut chosen = neighbors[neighbors.len() - 1];
                        for n in &neighbors {
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
        put_adjacency(node, ctx, rows)
    }
}

/// API_GET_NB_EDGE: adjacency as full `(src, dst, type)` edge rows plus
/// weights.
pub struct GetNeighborEdges;

impl OpKernel for GetNeighborEdges {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let graph = env.graph()?;
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let edge_types = if node.inputs.len() > 1 {
            param_i32s(node, ctx, 1).unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut segments = Vec::with_capacity(ids.len());
        let mut edges = Vec::new();
        let mut weights = Vec::new();
        let mut offset = 0usize;
        for id in &ids {
            let neighbors = graph.neighbors(*id, &edge_types);
            segments.push((offset, offset + neighbors.len()));
            offset += neighbors.len();
            for n in neighbors {
                edges.push(*id);
                edges.push(n.id);
                edges.push(n.edge_type.max(0) as u64);
                weights.push(n.weight);
            }
        }
        ctx.put(output_name(node, 0), segments_tensor(&segments))
            .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 1),
            Tensor::from_vec(vec![edges.len() / 3, 3], edges),
        )
        .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 2),
            Tensor::from_vec(vec![weights.len()], weights),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

/// API_GET_NB_FILTER: restricts a previously-fetched adjacency to the ids
/// that survived a global-index filter, then applies per-row post-process.
pub struct NeighborFilter;

impl OpKernel for NeighborFilter {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let segments = segments_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let nb_ids = ids_of(input_tensor(node, ctx, 1)?.as_ref())?;
        let weights_tensor = input_tensor(node, ctx, 2)?;
        let weights = weights_tensor.values::<f32>().map_err(ExecutionError::Type)?;
        let types = i32s_of(input_tensor(node, ctx, 3)?.as_ref())?;
        let keep: HashSet<u64> = ids_of(input_tensor(node, ctx, 4)?.as_ref())?.into_iter().collect();

        let mut per_row_limit = usize::MAX;
        let mut order_by_weight_desc = false;
        for command in &node.post_process {
            let parts: Vec<&str> = command.split_whitespace().collect();
            match parts.as_slice() {
                ["limit", n] => {
                    per_row_limit = n
                        .parse()
                        .map_err(|_| ExecutionError::InvalidPostProcess(command.clone()))?;
                }
                ["order_by", "weight", rest @ ..] => {
                    order_by_weight_desc = matches!(rest.first(), Some(&"desc"));
                }
                _ => return Err(ExecutionError::InvalidPostProcess(command.clone())),
            }
        }

        let mut rows = Vec::with_capacity(segments.len());
        for (begin, end) in segments {
            let mut row: Vec<Neighbor> = (begin..end.min(nb_ids.len()))
                .filter(|i| keep.contains(&nb_ids[*i]))
                .map(|i| Neighbor {
                    id: nb_ids[i],
                    weight: weights.get(i).copied().unwrap_or(0.0),
                    edge_type: types.get(i).copied().unwrap_or(-1),
                })
                .collect();
            row.sort_by(|a, b| {
                let ordering = a
                    .weight
                    .partial_cmp(&b.weight)
                    .unwrap_or(std::cmp::Ordering::Equal);
                if order_by_weight_desc {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            row.truncate(per_row_limit);
            rows.push(row);
        }
        put_adjacency(node, ctx, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemGraph;
    use std::sync::Arc;

    fn graph() -> Arc<MemGraph> {
        Arc::new(
            MemGraph::from_json(
                r#"{
                  "nodes": [
                    {"id": 1, "type": 0, "weight": 1.0, "features": {"price": [5.0]}},
                    {"id": 2, "type": 0, "weight": 2.0, "features": {"price": [1.0]}},
                    {"id": 3, "type": 1, "weight": 1.0, "features": {"price": [9.0]}}
                  ],
                  "edges": [
                    {"src": 1, "dst": 2, "type": 0, "weight": 1.0},
                    {"src": 1, "dst": 3, "type": 0, "weight": 3.0}
                  ]
                }"#,
            )
            .unwrap(),
        )
    }

    fn env() -> Arc<RuntimeEnv> {
        RuntimeEnv::builder(tokio::runtime::Handle::current())
            .graph(graph())
            .build()
    }

    #[tokio::test]
    async fn sample_node_draws_requested_count() {
        let ctx = OpKernelContext::new();
        ctx.put("types", Tensor::from_vec(vec![1], vec![0i32])).unwrap();
        ctx.put("count", Tensor::scalar(8i32)).unwrap();
        let node = DagNodeProto {
            name: "API_SAMPLE_NODE,0".to_string(),
            op: "API_SAMPLE_NODE".to_string(),
            inputs: vec!["types".to_string(), "count".to_string()],
            output_num: 1,
            ..Default::default()
        };
        SampleNode.compute(&node, &ctx, &env()).unwrap();
        let out = ctx.get("API_SAMPLE_NODE,0:0").unwrap();
        let ids = out.values::<u64>().unwrap();
        assert_eq!(ids.len(), 8);
        assert!(ids.iter().all(|id| [1, 2].contains(id)));
    }

    #[tokio::test]
    async fn get_node_applies_dnf() {
        let ctx = OpKernelContext::new();
        ctx.put("nodes", Tensor::from_vec(vec![3], vec![1u64, 2, 3]))
            .unwrap();
        let node = DagNodeProto {
            name: "API_GET_NODE,0".to_string(),
            op: "API_GET_NODE".to_string(),
            inputs: vec!["nodes".to_string()],
            dnf: vec!["price gt 3".to_string()],
            output_num: 1,
            ..Default::default()
        };
        GetNode.compute(&node, &ctx, &env()).unwrap();
        let out = ctx.get("API_GET_NODE,0:0").unwrap();
        assert_eq!(out.values::<u64>().unwrap(), &[1, 3]);
    }

    #[tokio::test]
    async fn neighbor_filter_keeps_only_surviving_ids() {
        let ctx = OpKernelContext::new();
        ctx.put("idx", segments_tensor(&[(0, 2)])).unwrap();
        ctx.put("ids", Tensor::from_vec(vec![2], vec![2u64, 3])).unwrap();
        ctx.put("w", Tensor::from_vec(vec![2], vec![1.0f32, 3.0])).unwrap();
        ctx.put("t", Tensor::from_vec(vec![2], vec![0i32, 0])).unwrap();
        ctx.put("keep", Tensor::from_vec(vec![1], vec![3u64])).unwrap();
        let node = DagNodeProto {
            name: "API_GET_NB_FILTER,9".to_string(),
            op: "API_GET_NB_FILTER".to_string(),
            inputs: ["idx", "ids", "w", "t", "keep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            post_process: vec!["limit 10".to_string()],
            output_num: 4,
            ..Default::default()
        };
        NeighborFilter.compute(&node, &ctx, &env()).unwrap();
        let ids = ctx.get("API_GET_NB_FILTER,9:1").unwrap();
        assert_eq!(ids.values::<u64>().unwrap(), &[3]);
        let idx = ctx.get("API_GET_NB_FILTER,9:0").unwrap();
        assert_eq!(idx.values::<i32>().unwrap(), &[0, 1]);
    }
}
