mod node_def;
pub mod sub_graph_iso;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

pub use node_def::{
    AttrDef, CondAttr, EdgeDef, FusionOutput, GatherOpInfo, MergeIdxSource, MergeOpInfo, NodeDef,
    RemoteDef, SplitOpInfo, UdfDef, UniqueOpInfo, EXTERNAL,
};

use crate::errors::ExecutionError;
use euler_types::grpc::DagProto;

pub const REMOTE_OP: &str = "REMOTE";

/// Replace a connected subset with one node of this name, rewiring consumers
/// through the output map.
#[derive(Debug, Clone, Default)]
pub struct FusionRule {
    pub fusion_name: String,
    pub fusion_output_map: Vec<FusionOutput>,
}

/// Split one fused remote into one replica per shard with split ops in front
/// and merge ops behind.
#[derive(Debug, Clone, Default)]
pub struct ShardRule {
    pub split_op_info: Vec<SplitOpInfo>,
    pub merge_op_info: Vec<MergeOpInfo>,
    pub split_num: i32,
}

/// Deduplicate designated inputs of a node and scatter its outputs back.
#[derive(Debug, Clone, Default)]
pub struct UniqueGatherRule {
    pub unique_op_info: Vec<UniqueOpInfo>,
    pub gather_op_info: Vec<GatherOpInfo>,
}

/// The mutable build-time DAG. Nodes are keyed by stable ids; `pre`/`succ`
/// sets mirror the edges in both directions.
#[derive(Debug, Clone, Default)]
pub struct DagDef {
    nodes: BTreeMap<i32, NodeDef>,
    id_counter: i32,
}

impl DagDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> i32 {
        let id = self.id_counter;
        self.id_counter += 1;
        id
    }

    /// Creates a node with a fresh id. The node is not inserted yet.
    pub fn produce_node(&mut self, name: impl Into<String>, output_num: i32) -> NodeDef {
        let id = self.next_id();
        NodeDef::new(name, id, output_num)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.values()
    }

    pub fn get(&self, id: i32) -> Option<&NodeDef> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut NodeDef> {
        self.nodes.get_mut(&id)
    }

    fn node(&self, id: i32) -> Result<&NodeDef, ExecutionError> {
        self.nodes.get(&id).ok_or(ExecutionError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: i32) -> Result<&mut NodeDef, ExecutionError> {
        self.nodes
            .get_mut(&id)
            .ok_or(ExecutionError::NodeNotFound(id))
    }

    pub fn erase(&mut self, id: i32) -> Option<NodeDef> {
        self.nodes.remove(&id)
    }

    /// Inserts `node` and wires `pre`/`succ` in both directions. Acyclicity
    /// is the caller's obligation; `topological_sort` checks defensively.
    pub fn add_node(
        &mut self,
        mut node: NodeDef,
        pre: &BTreeSet<i32>,
        succ: &BTreeSet<i32>,
    ) -> Result<(), ExecutionError> {
        let id = node.id;
        for &p in pre {
            self.node_mut(p)?.succ.insert(id);
            node.pre.insert(p);
        }
        for &s in succ {
            self.node_mut(s)?.pre.insert(id);
            node.succ.insert(s);
        }
        if id >= self.id_counter {
            self.id_counter = id + 1;
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Removes every pre/succ relation crossing the boundary of `nodes`.
    pub fn cut_relation(
        &mut self,
        nodes: &BTreeSet<i32>,
        in_nodes: &BTreeSet<i32>,
        out_nodes: &BTreeSet<i32>,
    ) {
        for &i in in_nodes {
            if let Some(n) = self.nodes.get_mut(&i) {
                n.succ.retain(|s| !nodes.contains(s));
            }
        }
        for &o in out_nodes {
            if let Some(n) = self.nodes.get_mut(&o) {
                n.pre.retain(|p| !nodes.contains(p));
            }
        }
        for &id in nodes {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.pre.retain(|p| !in_nodes.contains(p));
                n.succ.retain(|s| !out_nodes.contains(s));
            }
        }
    }

    /// Predecessors and successors of `sub` that lie outside it.
    pub fn in_out_nodes(&self, sub: &BTreeSet<i32>) -> (BTreeSet<i32>, BTreeSet<i32>) {
        let mut in_nodes = BTreeSet::new();
        let mut out_nodes = BTreeSet::new();
        for &id in sub {
            if let Some(node) = self.nodes.get(&id) {
                in_nodes.extend(node.pre.iter().filter(|p| !sub.contains(p)));
                out_nodes.extend(node.succ.iter().filter(|s| !sub.contains(s)));
            }
        }
        (in_nodes, out_nodes)
    }

    /// Kahn ordering of the whole graph; fails on a cycle.
    pub fn topological_sort(&self) -> Result<Vec<i32>, ExecutionError> {
        let all: BTreeSet<i32> = self.nodes.keys().copied().collect();
        self.topological_sort_subset(&all)
    }

    /// Kahn ordering of `sub`, considering only edges inside it. Ties break
    /// on the smaller id so the order is deterministic.
    pub fn topological_sort_subset(
        &self,
        sub: &BTreeSet<i32>,
    ) -> Result<Vec<i32>, ExecutionError> {
        let mut indegree: BTreeMap<i32, usize> = BTreeMap::new();
        for &id in sub {
            let node = self.node(id)?;
            let d = node.pre.iter().filter(|p| sub.contains(p)).count();
            indegree.insert(id, d);
        }
        let mut ready: BTreeSet<i32> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(sub.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(&id);
            order.push(id);
            for &s in &self.nodes[&id].succ {
                if let Some(d) = indegree.get_mut(&s) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(s);
                    }
                }
            }
        }
        if order.len() != sub.len() {
            return Err(ExecutionError::Cycle);
        }
        Ok(order)
    }

    /// Set of nodes reachable from `roots` along forward edges, skipping
    /// `excluded` entirely.
    fn reachable_avoiding(&self, roots: &BTreeSet<i32>, excluded: &BTreeSet<i32>) -> BTreeSet<i32> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<i32> = roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if excluded.contains(&id) || !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.succ.iter().copied());
            }
        }
        seen
    }

    /// A subset can only be fused when no path leaves it and re-enters it:
    /// reaching any of its external predecessors from any of its external
    /// successors (without passing through the subset) would close a cycle
    /// around the fusion node.
    fn fusion_available(
        &self,
        nodes: &BTreeSet<i32>,
        in_nodes: &BTreeSet<i32>,
        out_nodes: &BTreeSet<i32>,
    ) -> bool {
        let reach = self.reachable_avoiding(out_nodes, nodes);
        in_nodes.iter().all(|i| !reach.contains(i))
    }

    /// Replaces `nodes` with a single node per `rule`. Returns the new
    /// node's id. For `REMOTE` the subset moves inside the new node and its
    /// cross-boundary inputs become `REMOTE,<id>:<slot>` references.
    pub fn fusion_nodes(
        &mut self,
        nodes: &BTreeSet<i32>,
        rule: &FusionRule,
    ) -> Result<i32, ExecutionError> {
        for &id in nodes {
            self.node(id)?;
        }
        for output in &rule.fusion_output_map {
            if !nodes.contains(&output.inner_id) {
                return Err(ExecutionError::InvalidFusionOutput(format!(
                    "{},{}:{}",
                    output.inner_name, output.inner_id, output.inner_slot
                )));
            }
        }
        let (in_nodes, out_nodes) = self.in_out_nodes(nodes);
        if !self.fusion_available(nodes, &in_nodes, &out_nodes) {
            return Err(ExecutionError::FusionWouldCycle(
                nodes.iter().copied().collect(),
            ));
        }

        let order = self.topological_sort_subset(nodes)?;

        // External inputs of the subset become the fusion node's inputs,
        // deduplicated, in subset topological order.
        let mut fusion_inputs: Vec<EdgeDef> = Vec::new();
        let mut slot_of: HashMap<EdgeDef, usize> = HashMap::new();
        for &id in &order {
            for edge in &self.nodes[&id].input_edges {
                if edge.is_external() || !nodes.contains(&edge.src_id) {
                    if !slot_of.contains_key(edge) {
                        slot_of.insert(edge.clone(), fusion_inputs.len());
                        fusion_inputs.push(edge.clone());
                    }
                }
            }
        }

        let fusion_id = self.next_id();
        let output_num = rule
            .fusion_output_map
            .iter()
            .map(|o| o.fusion_slot + 1)
            .max()
            .unwrap_or(0);
        let mut fusion = NodeDef::new(&rule.fusion_name, fusion_id, output_num);
        fusion.input_edges = fusion_inputs;
        fusion.pre = in_nodes.clone();
        fusion.succ = out_nodes.clone();

        for &i in &in_nodes {
            let n = self.node_mut(i)?;
            n.succ.retain(|s| !nodes.contains(s));
            n.succ.insert(fusion_id);
        }
        for &o in &out_nodes {
            let fusion_name = rule.fusion_name.clone();
            let outputs = rule.fusion_output_map.clone();
            let n = self.node_mut(o)?;
            n.pre.retain(|p| !nodes.contains(p));
            n.pre.insert(fusion_id);
            for edge in &mut n.input_edges {
                if !edge.is_external() && nodes.contains(&edge.src_id) {
                    let mapped = outputs
                        .iter()
                        .find(|f| f.inner_id == edge.src_id && f.inner_slot == edge.src_slot)
                        .ok_or_else(|| ExecutionError::InvalidFusionOutput(edge.encode()))?;
                    *edge = EdgeDef::new(fusion_name.clone(), fusion_id, mapped.fusion_slot);
                }
            }
        }

        if rule.fusion_name == REMOTE_OP {
            let mut inner_nodes = Vec::with_capacity(order.len());
            for &id in &order {
                let mut inner = self.nodes.remove(&id).expect("subset node");
                inner.pre.retain(|p| nodes.contains(p));
                inner.succ.retain(|s| nodes.contains(s));
                for edge in &mut inner.input_edges {
                    if !edge.is_external() && !nodes.contains(&edge.src_id) {
                        let slot = slot_of[edge];
                        *edge = EdgeDef::new(REMOTE_OP, fusion_id, slot as i32);
                    }
                }
                inner_nodes.push(inner);
            }
            fusion.remote = Some(RemoteDef {
                shard_idx: -1,
                inner_nodes,
                fusion_output_map: rule.fusion_output_map.clone(),
            });
        } else {
            for &id in nodes {
                self.nodes.remove(&id);
            }
        }

        self.nodes.insert(fusion_id, fusion);
        Ok(fusion_id)
    }

    /// Splits one `REMOTE` node into `split_num` shard replicas. Split ops
    /// go in front (ids first), replicas next, merge ops last; the original
    /// node's consumers are repointed at the merges.
    pub fn shard_remote(&mut self, remote_id: i32, rule: &ShardRule) -> Result<(), ExecutionError> {
        let prototype = self.node(remote_id)?.clone();
        let remote_def = prototype
            .remote
            .as_ref()
            .ok_or(ExecutionError::NotRemote(remote_id))?;
        for info in &rule.split_op_info {
            for &i in &info.inputs_idx {
                if i >= prototype.input_edges.len() {
                    return Err(ExecutionError::SplitInputOutOfRange {
                        index: i,
                        num_inputs: prototype.input_edges.len(),
                    });
                }
            }
        }

        for &p in &prototype.pre {
            self.node_mut(p)?.succ.remove(&remote_id);
        }

        // Split ops: output slot 2s carries shard s's data, slot 2s+1 the
        // matching merge index.
        let mut split_ids = Vec::with_capacity(rule.split_op_info.len());
        for info in &rule.split_op_info {
            let id = self.next_id();
            let mut node = NodeDef::new(&info.op_name, id, 2 * rule.split_num);
            for &i in &info.inputs_idx {
                let edge = prototype.input_edges[i].clone();
                if !edge.is_external() {
                    node.pre.insert(edge.src_id);
                    self.node_mut(edge.src_id)?.succ.insert(id);
                }
                node.input_edges.push(edge);
            }
            self.nodes.insert(id, node);
            split_ids.push(id);
        }

        // One replica per shard, fed by slot 2s of every split op.
        let mut replica_ids = Vec::with_capacity(rule.split_num as usize);
        for s in 0..rule.split_num {
            let id = self.next_id();
            let mut node = NodeDef::new(&prototype.name, id, prototype.output_num);
            node.remote = Some(RemoteDef {
                shard_idx: s,
                inner_nodes: remote_def.inner_nodes.clone(),
                fusion_output_map: remote_def.fusion_output_map.clone(),
            });
            for (j, &split_id) in split_ids.iter().enumerate() {
                let split_name = rule.split_op_info[j].op_name.clone();
                node.input_edges.push(EdgeDef::new(split_name, split_id, 2 * s));
                node.pre.insert(split_id);
                self.node_mut(split_id)?.succ.insert(id);
            }
            self.nodes.insert(id, node);
            replica_ids.push(id);
        }

        // Merge ops: per shard the replica outputs named by `inputs_idx`,
        // then the merge-index edge when the merge needs one. Output slot 0
        // is the stitched value; slots 1..=N republish per-shard indices for
        // downstream merges.
        let mut merge_ids = Vec::with_capacity(rule.merge_op_info.len());
        for info in &rule.merge_op_info {
            let id = self.next_id();
            let mut node = NodeDef::new(&info.op_name, id, 1 + rule.split_num);
            for s in 0..rule.split_num as usize {
                let replica_id = replica_ids[s];
                for &i in &info.inputs_idx {
                    node.input_edges
                        .push(EdgeDef::new(prototype.name.clone(), replica_id, i as i32));
                }
                node.pre.insert(replica_id);
                self.node_mut(replica_id)?.succ.insert(id);
                match info.idx_source {
                    MergeIdxSource::None => {}
                    MergeIdxSource::Split(j) => {
                        let split_id = split_ids[j];
                        let split_name = rule.split_op_info[j].op_name.clone();
                        node.input_edges
                            .push(EdgeDef::new(split_name, split_id, 2 * s as i32 + 1));
                        node.pre.insert(split_id);
                        self.node_mut(split_id)?.succ.insert(id);
                    }
                    MergeIdxSource::Merge(m) => {
                        let merge_id = merge_ids[m];
                        let merge_name = rule.merge_op_info[m].op_name.clone();
                        node.input_edges
                            .push(EdgeDef::new(merge_name, merge_id, s as i32 + 1));
                        node.pre.insert(merge_id);
                        self.node_mut(merge_id)?.succ.insert(id);
                    }
                }
            }
            self.nodes.insert(id, node);
            merge_ids.push(id);
        }

        // The k-th merge op carries the k-th fusion output; repoint every
        // consumer of the original remote accordingly.
        for &consumer in &prototype.succ {
            let mut new_links = Vec::new();
            {
                let merge_infos = rule.merge_op_info.clone();
                let node = self.node_mut(consumer)?;
                node.pre.remove(&remote_id);
                for edge in &mut node.input_edges {
                    if edge.src_id == remote_id {
                        let slot = edge.src_slot as usize;
                        let merge_id = *merge_ids.get(slot).ok_or_else(|| {
                            ExecutionError::Internal(format!(
                                "no merge op for remote output {slot}"
                            ))
                        })?;
                        *edge = EdgeDef::new(merge_infos[slot].op_name.clone(), merge_id, 0);
                        node.pre.insert(merge_id);
                        new_links.push(merge_id);
                    }
                }
            }
            for merge_id in new_links {
                self.node_mut(merge_id)?.succ.insert(consumer);
            }
        }

        self.nodes.remove(&remote_id);
        Ok(())
    }

    /// Inserts unique ops in front of `node_id` on the designated inputs and
    /// gather ops behind it that scatter outputs back to original positions.
    /// Unique ops emit (unique keys, scatter index); gathers consume the
    /// index at their last input.
    pub fn unique_and_gather(
        &mut self,
        node_id: i32,
        rule: &UniqueGatherRule,
    ) -> Result<(), ExecutionError> {
        let target = self.node(node_id)?.clone();

        let mut unique_ids = Vec::with_capacity(rule.unique_op_info.len());
        for info in &rule.unique_op_info {
            let id = self.next_id();
            let mut node = NodeDef::new(&info.op_name, id, 2);
            for &i in &info.inputs_idx {
                let edge = target
                    .input_edges
                    .get(i)
                    .ok_or(ExecutionError::SplitInputOutOfRange {
                        index: i,
                        num_inputs: target.input_edges.len(),
                    })?
                    .clone();
                if !edge.is_external() {
                    node.pre.insert(edge.src_id);
                    self.node_mut(edge.src_id)?.succ.insert(id);
                }
                node.input_edges.push(edge);
            }
            node.succ.insert(node_id);
            self.nodes.insert(id, node);
            unique_ids.push(id);
        }

        // Rewire the target's deduplicated inputs onto the unique outputs.
        for (k, info) in rule.unique_op_info.iter().enumerate() {
            let unique_id = unique_ids[k];
            let unique_name = info.op_name.clone();
            for &i in &info.inputs_idx {
                let (old, still_used) = {
                    let node = self.node_mut(node_id)?;
                    let old = node.input_edges[i].clone();
                    node.input_edges[i] = EdgeDef::new(unique_name.clone(), unique_id, 0);
                    node.pre.insert(unique_id);
                    let still_used = !old.is_external()
                        && node
                            .input_edges
                            .iter()
                            .any(|e| !e.is_external() && e.src_id == old.src_id);
                    (old, still_used)
                };
                if !old.is_external() && !still_used {
                    self.node_mut(node_id)?.pre.remove(&old.src_id);
                    self.node_mut(old.src_id)?.succ.remove(&node_id);
                }
            }
        }

        for info in &rule.gather_op_info {
            let id = self.next_id();
            let unique_id = *unique_ids
                .get(info.unique_op_idx)
                .ok_or_else(|| ExecutionError::Internal("bad unique op index".to_string()))?;
            let unique_name = rule.unique_op_info[info.unique_op_idx].op_name.clone();
            let mut node = NodeDef::new(&info.op_name, id, info.inputs_idx.len() as i32);
            for &slot in &info.inputs_idx {
                node.input_edges
                    .push(EdgeDef::new(target.name.clone(), node_id, slot as i32));
            }
            node.input_edges.push(EdgeDef::new(unique_name, unique_id, 1));
            node.pre.insert(node_id);
            node.pre.insert(unique_id);

            // Consumers of the gathered slots move behind the gather op.
            let gathered: HashSet<i32> = info.inputs_idx.iter().map(|&s| s as i32).collect();
            let mut detached = Vec::new();
            for &consumer in &target.succ {
                let mut moved = false;
                let still_direct;
                {
                    let c = self.node_mut(consumer)?;
                    for edge in &mut c.input_edges {
                        if edge.src_id == node_id && gathered.contains(&edge.src_slot) {
                            let new_slot = info
                                .inputs_idx
                                .iter()
                                .position(|&s| s as i32 == edge.src_slot)
                                .expect("gathered slot") as i32;
                            *edge = EdgeDef::new(node.name.clone(), id, new_slot);
                            moved = true;
                        }
                    }
                    still_direct = c
                        .input_edges
                        .iter()
                        .any(|e| !e.is_external() && e.src_id == node_id);
                    if moved {
                        c.pre.insert(id);
                        if !still_direct {
                            c.pre.remove(&node_id);
                        }
                        node.succ.insert(consumer);
                    }
                }
                if moved && !still_direct {
                    detached.push(consumer);
                }
            }
            for consumer in detached {
                self.node_mut(node_id)?.succ.remove(&consumer);
            }
            self.node_mut(node_id)?.succ.insert(id);
            self.node_mut(unique_id)?.succ.insert(id);
            self.nodes.insert(id, node);
        }
        Ok(())
    }

    /// For graph-partition mode: the largest weakly-connected group of
    /// shardable (non local-only) nodes that can be fused without a path
    /// leaving and re-entering the group.
    pub fn macro_fusion_subset(&self, local_only_ops: &HashSet<String>) -> BTreeSet<i32> {
        let mut candidates: BTreeSet<i32> = self
            .nodes
            .values()
            .filter(|n| !local_only_ops.contains(&n.name) && !n.is_remote())
            .map(|n| n.id)
            .collect();

        // Drop any candidate whose predecessor sits outside the set but is
        // reachable from it; fusing such a node would close a cycle.
        loop {
            let reach = self.reachable_avoiding(&candidates, &BTreeSet::new());
            let mut dropped = false;
            let snapshot: Vec<i32> = candidates.iter().copied().collect();
            for id in snapshot {
                let node = &self.nodes[&id];
                let poisoned = node
                    .pre
                    .iter()
                    .any(|p| !candidates.contains(p) && reach.contains(p));
                if poisoned {
                    candidates.remove(&id);
                    dropped = true;
                }
            }
            if !dropped {
                break;
            }
        }

        // Largest weakly-connected component; smallest member id breaks ties.
        let mut best: BTreeSet<i32> = BTreeSet::new();
        let mut seen: BTreeSet<i32> = BTreeSet::new();
        for &start in &candidates {
            if seen.contains(&start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(id) = queue.pop_front() {
                if !candidates.contains(&id) || !component.insert(id) {
                    continue;
                }
                seen.insert(id);
                let node = &self.nodes[&id];
                queue.extend(node.pre.iter().copied());
                queue.extend(node.succ.iter().copied());
            }
            if component.len() > best.len() {
                best = component;
            }
        }
        best
    }

    /// Serialises the finished graph; nodes appear in topological order.
    pub fn to_proto(&self) -> Result<DagProto, ExecutionError> {
        let order = self.topological_sort()?;
        let mut proto = DagProto::default();
        for id in order {
            proto.nodes.push(self.nodes[&id].to_proto());
        }
        Ok(proto)
    }
}

#[cfg(test)]
mod tests;
