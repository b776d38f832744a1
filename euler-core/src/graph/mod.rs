//! The graph collaborator behind the API kernels. Storage formats are out
//! of scope; this trait is the interface the kernels program against, with
//! an in-memory implementation for servers and tests.

use std::collections::HashMap;

use euler_types::serde::Deserialize;
use rand::Rng;

/// A typed neighbour: target id, edge weight, edge type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub weight: f32,
    pub edge_type: i32,
}

/// A typed edge with src and dst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeRef {
    pub src: u64,
    pub dst: u64,
    pub edge_type: i32,
    pub weight: f32,
}

pub trait GraphStore: Send + Sync {
    /// Weighted sample of `count` node ids of the given types.
    fn sample_nodes(&self, node_types: &[i32], count: usize) -> Vec<u64>;

    /// Weighted sample of `count` edges of the given types.
    fn sample_edges(&self, edge_types: &[i32], count: usize) -> Vec<EdgeRef>;

    fn node_type(&self, id: u64) -> Option<i32>;

    fn node_weight(&self, id: u64) -> Option<f32>;

    /// Outgoing neighbours filtered by edge type, in stored order.
    fn neighbors(&self, id: u64, edge_types: &[i32]) -> Vec<Neighbor>;

    /// Incoming neighbours filtered by edge type.
    fn reverse_neighbors(&self, id: u64, edge_types: &[i32]) -> Vec<Neighbor>;

    /// Dense float feature of one node, empty when absent.
    fn feature(&self, id: u64, name: &str) -> Vec<f32>;

    /// Graph labels served by this store.
    fn labels(&self) -> Vec<String>;

    /// Per-type node weight sums, index = node type.
    fn node_sum_weights(&self) -> Vec<f32>;

    /// Per-type edge weight sums, index = edge type.
    fn edge_sum_weights(&self) -> Vec<f32>;

    fn contains_node(&self, id: u64) -> bool {
        self.node_type(id).is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(crate = "euler_types::serde")]
pub struct NodeSpec {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub node_type: i32,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub features: HashMap<String, Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(crate = "euler_types::serde")]
pub struct EdgeSpec {
    pub src: u64,
    pub dst: u64,
    #[serde(rename = "type", default)]
    pub edge_type: i32,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(crate = "euler_types::serde")]
pub struct GraphSpec {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Default)]
struct NodeRecord {
    node_type: i32,
    weight: f32,
    features: HashMap<String, Vec<f32>>,
    out: Vec<Neighbor>,
    into: Vec<Neighbor>,
}

/// In-memory graph, loaded from a JSON spec.
#[derive(Debug, Default)]
pub struct MemGraph {
    nodes: HashMap<u64, NodeRecord>,
    edges: Vec<EdgeRef>,
    labels: Vec<String>,
}

impl MemGraph {
    pub fn from_spec(spec: GraphSpec) -> Self {
        let mut nodes: HashMap<u64, NodeRecord> = HashMap::new();
        for node in spec.nodes {
            nodes.insert(
                node.id,
                NodeRecord {
                    node_type: node.node_type,
                    weight: node.weight,
                    features: node.features,
                    out: Vec::new(),
                    into: Vec::new(),
                },
            );
        }
        let mut edges = Vec::with_capacity(spec.edges.len());
        for edge in spec.edges {
            edges.push(EdgeRef {
                src: edge.src,
                dst: edge.dst,
                edge_type: edge.edge_type,
                weight: edge.weight,
            });
            if let Some(record) = nodes.get_mut(&edge.src) {
                record.out.push(Neighbor {
                    id: edge.dst,
                    weight: edge.weight,
                    edge_type: edge.edge_type,
                });
            }
            if let Some(record) = nodes.get_mut(&edge.dst) {
                record.into.push(Neighbor {
                    id: edge.src,
                    weight: edge.weight,
                    edge_type: edge.edge_type,
                });
            }
        }
        Self {
            nodes,
            edges,
            labels: spec.labels,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_spec(serde_json::from_str(text)?))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}

fn weighted_sample<T: Copy>(items: &[(T, f32)], count: usize) -> Vec<T> {
    if items.is_empty() {
        return Vec::new();
    }
    let total: f32 = items.iter().map(|(_, w)| w.max(0.0)).sum();
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if total <= 0.0 {
            out.push(items[rng.gen_range(0..items.len())].0);
            continue;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut chosen = items[items.len() - 1].0;
        for (item, weight) in items {
            target -= weight.max(0.0);
            if target <= 0.0 {
                chosen = *item;
                break;
            }
        }
        out.push(chosen);
    }
    out
}

impl GraphStore for MemGraph {
    fn sample_nodes(&self, node_types: &[i32], count: usize) -> Vec<u64> {
        let candidates: Vec<(u64, f32)> = self
            .nodes
            .iter()
            .filter(|(_, r)| node_types.is_empty() || node_types.contains(&r.node_type))
            .map(|(id, r)| (*id, r.weight))
            .collect();
        weighted_sample(&candidates, count)
    }

    fn sample_edges(&self, edge_types: &[i32], count: usize) -> Vec<EdgeRef> {
        let candidates: Vec<(EdgeRef, f32)> = self
            .edges
            .iter()
            .filter(|e| edge_types.is_empty() || edge_types.contains(&e.edge_type))
            .map(|e| (*e, e.weight))
            .collect();
        weighted_sample(&candidates, count)
    }

    fn node_type(&self, id: u64) -> Option<i32> {
        self.nodes.get(&id).map(|r| r.node_type)
    }

    fn node_weight(&self, id: u64) -> Option<f32> {
        self.nodes.get(&id).map(|r| r.weight)
    }

    fn neighbors(&self, id: u64, edge_types: &[i32]) -> Vec<Neighbor> {
        self.nodes
            .get(&id)
            .map(|r| {
                r.out
                    .iter()
                    .filter(|n| edge_types.is_empty() || edge_types.contains(&n.edge_type))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reverse_neighbors(&self, id: u64, edge_types: &[i32]) -> Vec<Neighbor> {
        self.nodes
            .get(&id)
            .map(|r| {
                r.into
                    .iter()
                    .filter(|n| edge_types.is_empty() || edge_types.contains(&n.edge_type))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn feature(&self, id: u64, name: &str) -> Vec<f32> {
        self.nodes
            .get(&id)
            .and_then(|r| r.features.get(name).cloned())
            .unwrap_or_default()
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn node_sum_weights(&self) -> Vec<f32> {
        let mut sums = Vec::new();
        for record in self.nodes.values() {
            let t = record.node_type.max(0) as usize;
            if sums.len() <= t {
                sums.resize(t + 1, 0.0);
            }
            sums[t] += record.weight;
        }
        sums
    }

    fn edge_sum_weights(&self) -> Vec<f32> {
        let mut sums = Vec::new();
        for edge in &self.edges {
            let t = edge.edge_type.max(0) as usize;
            if sums.len() <= t {
                sums.resize(t + 1, 0.0);
            }
            sums[t] += edge.weight;
        }
        sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_graph() -> MemGraph {
        MemGraph::from_json(
            r#"{
              "labels": ["train"],
              "nodes": [
                {"id": 1, "type": 0, "weight": 1.0, "features": {"fid": [1.0, 2.0]}},
                {"id": 2, "type": 0, "weight": 2.0, "features": {"fid": [3.0]}},
                {"id": 3, "type": 1, "weight": 1.0}
              ],
              "edges": [
                {"src": 1, "dst": 2, "type": 0, "weight": 1.0},
                {"src": 1, "dst": 3, "type": 1, "weight": 2.0},
                {"src": 2, "dst": 3, "type": 0, "weight": 1.0}
              ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn sampling_respects_types() {
        let g = tiny_graph();
        let sampled = g.sample_nodes(&[0], 100);
        assert_eq!(sampled.len(), 100);
        assert!(sampled.iter().all(|id| [1, 2].contains(id)));
        let edges = g.sample_edges(&[1], 10);
        assert!(edges.iter().all(|e| e.edge_type == 1));
    }

    #[test]
    fn neighbors_filter_by_edge_type() {
        let g = tiny_graph();
        let all = g.neighbors(1, &[]);
        assert_eq!(all.len(), 2);
        let typed = g.neighbors(1, &[1]);
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].id, 3);
        let reverse = g.reverse_neighbors(3, &[]);
        assert_eq!(reverse.len(), 2);
    }

    #[test]
    fn weight_sums_per_type() {
        let g = tiny_graph();
        assert_eq!(g.node_sum_weights(), vec![3.0, 1.0]);
        assert_eq!(g.edge_sum_weights(), vec![2.0, 2.0]);
    }
}
