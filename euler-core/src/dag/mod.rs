//! Immutable execution DAG, materialised from the wire form.
//!
//! Nodes carry their `DagNodeProto`; edges carry `(src_slot, dst_slot)`.
//! Topology is recovered from each node's `inputs` strings: entries of the
//! form `<name>:<slot>` whose `<name>` matches another node become edges,
//! everything else is an external tensor resolved from the context at run
//! time.

use std::collections::HashMap;

use daggy::petgraph::visit::EdgeRef;
use daggy::petgraph::Direction;
use daggy::{NodeIndex, Walker};

use crate::errors::ExecutionError;
use crate::op_kernel::registry;
use euler_types::grpc::{DagNodeProto, DagProto};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEdge {
    pub src_slot: i32,
    pub dst_slot: i32,
}

#[derive(Debug)]
pub struct Dag {
    name: String,
    graph: daggy::Dag<DagNodeProto, SlotEdge>,
}

impl Dag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_indexes(&self) -> Vec<NodeIndex> {
        self.graph.graph().node_indices().collect()
    }

    pub fn node(&self, index: NodeIndex) -> &DagNodeProto {
        &self.graph[index]
    }

    pub fn in_degree(&self, index: NodeIndex) -> usize {
        self.graph
            .graph()
            .neighbors_directed(index, Direction::Incoming)
            .count()
    }

    pub fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph.children(index).iter(&self.graph).map(|(_, n)| n).collect()
    }

    /// Direct and transitive consumers, used to skip dependents of a failed
    /// node.
    pub fn descendants(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut stack = vec![index];
        let mut seen = vec![false; self.graph.node_count()];
        let mut result = Vec::new();
        while let Some(current) = stack.pop() {
            for next in self.successors(current) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    result.push(next);
                    stack.push(next);
                }
            }
        }
        result
    }

    pub fn edges_into(&self, index: NodeIndex) -> Vec<(NodeIndex, SlotEdge)> {
        self.graph
            .graph()
            .edges_directed(index, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect()
    }

    /// Builds the DAG from its wire form. Every op must be registered; the
    /// returned error names the eventual offender.
    pub fn from_proto(proto: &DagProto) -> Result<Self, ExecutionError> {
        let mut graph = daggy::Dag::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();

        for node in &proto.nodes {
            if !registry::is_registered(&node.op) {
                return Err(ExecutionError::KernelNotFound(node.op.clone()));
            }
            let index = graph.add_node(node.clone());
            index_of.insert(node.name.clone(), index);
        }

        for node in &proto.nodes {
            let dst = index_of[&node.name];
            for (dst_slot, input) in node.inputs.iter().enumerate() {
                let Some((src_name, src_slot)) = input.rsplit_once(':') else {
                    // Bare name: an external tensor, not an edge.
                    continue;
                };
                let Some(&src) = index_of.get(src_name) else {
                    continue;
                };
                let src_slot: i32 = src_slot
                    .parse()
                    .map_err(|_| ExecutionError::InvalidInputRef(input.clone()))?;
                graph
                    .add_edge(
                        src,
                        dst,
                        SlotEdge {
                            src_slot,
                            dst_slot: dst_slot as i32,
                        },
                    )
                    .map_err(|_| ExecutionError::Cycle)?;
            }
        }

        Ok(Self {
            name: proto.name.clone(),
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use euler_types::grpc::DagNodeProto;

    fn node(name: &str, op: &str, inputs: &[&str]) -> DagNodeProto {
        DagNodeProto {
            name: name.to_string(),
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output_num: 1,
            ..Default::default()
        }
    }

    #[test]
    fn from_proto_recovers_topology() {
        crate::kernels::register_builtin();
        let proto = DagProto {
            name: "q".to_string(),
            nodes: vec![
                node("AS,0", "AS", &["external_input"]),
                node("AS,1", "AS", &["AS,0:0"]),
                node("AS,2", "AS", &["AS,0:0", "AS,1:0"]),
            ],
            ..Default::default()
        };
        let dag = Dag::from_proto(&proto).unwrap();
        assert_eq!(dag.num_nodes(), 3);
        assert_eq!(dag.num_edges(), 3);

        let indexes = dag.node_indexes();
        let root = indexes
            .iter()
            .find(|i| dag.node(**i).name == "AS,0")
            .copied()
            .unwrap();
        assert_eq!(dag.in_degree(root), 0);
        assert_eq!(dag.successors(root).len(), 2);
        assert_eq!(dag.descendants(root).len(), 2);
    }

    #[test]
    fn unknown_op_is_rejected() {
        crate::kernels::register_builtin();
        let proto = DagProto {
            nodes: vec![node("NOPE,0", "NOPE", &[])],
            ..Default::default()
        };
        assert!(matches!(
            Dag::from_proto(&proto),
            Err(ExecutionError::KernelNotFound(_))
        ));
    }
}
