//! Pattern-rewrite optimiser: macro-fusion of contiguous shardable ops
//! into REMOTE nodes, shard-splitting with split/merge scaffolding,
//! unique-and-gather insertion, and common-subexpression elimination.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use euler_core::dag_def::sub_graph_iso::{sub_graph_match, ExtraConds};
use euler_core::dag_def::{
    DagDef, EdgeDef, FusionOutput, FusionRule, GatherOpInfo, MergeIdxSource, MergeOpInfo, NodeDef,
    ShardRule, SplitOpInfo, UniqueGatherRule, UniqueOpInfo, REMOTE_OP,
};
use euler_core::errors::ExecutionError;

use crate::errors::CompileError;
use crate::translator::Mode;

/// Ops that must stay on the caller's side of a shard boundary.
fn local_only_ops() -> HashSet<String> {
    [
        "AS",
        "REMOTE",
        "API_GET_NB_FILTER",
        "POST_PROCESS",
        "BROAD_CAST_SPLIT",
        "SAMPLE_NODE_SPLIT",
        "SAMPLE_EDGE_SPLIT",
        "GP_BROAD_CAST_SPLIT",
        "GP_APPEND_MERGE",
        "GP_UNIQUE_MERGE",
        "GP_IDX_MERGE",
        "GP_DATA_MERGE",
        "GP_REGULAR_DATA_MERGE",
        "ID_UNIQUE",
        "ID_SPLIT",
        "ID_GATHER",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Which split op feeds one input of a shardable op, with the op-relative
/// inputs the split consumes.
fn split_rule_for(op: &str, input: usize) -> Option<(&'static str, Vec<usize>)> {
    match (op, input) {
        ("API_SAMPLE_NODE", 0) | ("API_SAMPLE_EDGE", 0) => Some(("BROAD_CAST_SPLIT", vec![0])),
        ("API_SAMPLE_NODE", 1) => Some(("SAMPLE_NODE_SPLIT", vec![1, 0])),
        ("API_SAMPLE_EDGE", 1) => Some(("SAMPLE_EDGE_SPLIT", vec![1, 0])),
        ("API_GET_NODE", 0)
        | ("API_GET_EDGE", 0)
        | ("API_SAMPLE_NB", 0)
        | ("API_GET_NB_NODE", 0)
        | ("API_GET_NODE_T", 0)
        | ("API_GET_P", 0) => Some(("GP_BROAD_CAST_SPLIT", vec![0])),
        _ => None,
    }
}

/// Which merge op stitches one output of a shardable op. Returns the merge
/// op, the op input whose split/merge provides the merge index, and the
/// op-relative output slots the merge consumes. Property reads interleave
/// index and value slots, so even slots merge as indices and odd slots as
/// data keyed by their even partner.
fn merge_rule_for(op: &str, output: usize) -> Option<(&'static str, Option<usize>, Vec<usize>)> {
    match (op, output) {
        ("API_SAMPLE_NODE", 0) | ("API_SAMPLE_EDGE", 0) => {
            Some(("GP_APPEND_MERGE", Some(1), vec![0]))
        }
        ("API_GET_NODE", 0) | ("API_GET_EDGE", 0) => Some(("GP_UNIQUE_MERGE", None, vec![0])),
        ("API_SAMPLE_NB", 0) | ("API_GET_NB_NODE", 0) => Some(("GP_IDX_MERGE", Some(0), vec![0])),
        ("API_SAMPLE_NB", k @ 1..=3) | ("API_GET_NB_NODE", k @ 1..=3) => {
            Some(("GP_DATA_MERGE", Some(0), vec![k, 0]))
        }
        ("API_GET_NODE_T", 0) => Some(("GP_REGULAR_DATA_MERGE", Some(0), vec![0])),
        ("API_GET_P", k) if k % 2 == 0 => Some(("GP_IDX_MERGE", Some(0), vec![k])),
        ("API_GET_P", k) => Some(("GP_DATA_MERGE", Some(0), vec![k, k - 1])),
        _ => None,
    }
}

/// Split/merge scaffolding derived from the actual subset being fused,
/// mirroring how the fusion node will collect its inputs.
struct ShardParts {
    fusion_outputs: Vec<FusionOutput>,
    split_op_info: Vec<SplitOpInfo>,
    merge_op_info: Vec<MergeOpInfo>,
}

fn build_shard_parts(dag: &DagDef, order: &[i32]) -> Result<ShardParts, CompileError> {
    let subset: BTreeSet<i32> = order.iter().copied().collect();

    // Fusion inputs: external edges in subset order, deduplicated, exactly
    // as `fusion_nodes` collects them.
    let mut fusion_slot_of_edge: HashMap<EdgeDef, usize> = HashMap::new();
    let mut fusion_input_count = 0usize;
    let mut fusion_slot_of_input: HashMap<(i32, usize), usize> = HashMap::new();
    for &id in order {
        let node = dag.get(id).ok_or(ExecutionError::NodeNotFound(id))?;
        for (input_idx, edge) in node.input_edges.iter().enumerate() {
            if edge.is_external() || !subset.contains(&edge.src_id) {
                let slot = *fusion_slot_of_edge.entry(edge.clone()).or_insert_with(|| {
                    let slot = fusion_input_count;
                    fusion_input_count += 1;
                    slot
                });
                fusion_slot_of_input.insert((id, input_idx), slot);
            }
        }
    }

    // One fusion output per op output, in subset order.
    let mut fusion_outputs = Vec::new();
    let mut base_of: BTreeMap<i32, usize> = BTreeMap::new();
    let mut counter = 0usize;
    for &id in order {
        let node = dag.get(id).expect("subset node");
        base_of.insert(id, counter);
        for slot in 0..node.output_num {
            fusion_outputs.push(FusionOutput::new(
                node.name.clone(),
                id,
                slot,
                counter as i32,
            ));
            counter += 1;
        }
    }

    // One split op per external input occurrence.
    let mut split_op_info = Vec::new();
    let mut split_idx_of_input: HashMap<(i32, usize), usize> = HashMap::new();
    for &id in order {
        let node = dag.get(id).expect("subset node");
        for (input_idx, edge) in node.input_edges.iter().enumerate() {
            if !(edge.is_external() || !subset.contains(&edge.src_id)) {
                continue;
            }
            let (split_op, op_inputs) =
                split_rule_for(&node.name, input_idx).ok_or_else(|| CompileError::MissingSplitRule {
                    op: node.name.clone(),
                    input: input_idx,
                })?;
            let fusion_inputs: Vec<usize> = op_inputs
                .iter()
                .map(|i| {
                    fusion_slot_of_input.get(&(id, *i)).copied().ok_or_else(|| {
                        CompileError::MissingSplitRule {
                            op: node.name.clone(),
                            input: *i,
                        }
                    })
                })
                .collect::<Result<_, _>>()?;
            split_idx_of_input.insert((id, input_idx), split_op_info.len());
            split_op_info.push(SplitOpInfo::new(split_op, fusion_inputs));
        }
    }

    // One merge op per fusion output, index sources resolved through the
    // split table or an earlier merge.
    let mut merge_op_info = Vec::new();
    let mut merge_idx_of_output: HashMap<(i32, i32), usize> = HashMap::new();
    for &id in order {
        let node = dag.get(id).expect("subset node");
        let base = base_of[&id];
        for output in 0..node.output_num as usize {
            let (merge_op, key_input, op_outputs) =
                merge_rule_for(&node.name, output).ok_or_else(|| CompileError::MissingMergeRule {
                    op: node.name.clone(),
                    output,
                })?;
            let idx_source = match key_input {
                None => MergeIdxSource::None,
                Some(key_input) => {
                    let edge = node.input_edges.get(key_input).ok_or_else(|| {
                        CompileError::MissingMergeRule {
                            op: node.name.clone(),
                            output,
                        }
                    })?;
                    if edge.is_external() || !subset.contains(&edge.src_id) {
                        MergeIdxSource::Split(split_idx_of_input[&(id, key_input)])
                    } else {
                        MergeIdxSource::Merge(
                            merge_idx_of_output[&(edge.src_id, edge.src_slot)],
                        )
                    }
                }
            };
            let inputs: Vec<usize> = op_outputs.iter().map(|slot| base + slot).collect();
            merge_idx_of_output.insert((id, output as i32), merge_op_info.len());
            merge_op_info.push(MergeOpInfo::new(merge_op, idx_source, inputs));
        }
    }

    Ok(ShardParts {
        fusion_outputs,
        split_op_info,
        merge_op_info,
    })
}

/// A pattern DAG built from adjacency rows of the form
/// `"<name>:<id> <succ_name>:<succ_id> ..."`.
pub fn pattern_from_adjacency(rows: &[&str]) -> DagDef {
    let mut dag = DagDef::new();
    let mut edges: Vec<(i32, i32)> = Vec::new();
    for row in rows {
        let mut parts = row.split_whitespace();
        let Some(head) = parts.next() else { continue };
        let Some((name, id)) = head.rsplit_once(':') else {
            continue;
        };
        let id: i32 = id.parse().unwrap_or_default();
        let node = NodeDef::new(name, id, 1);
        dag.add_node(node, &BTreeSet::new(), &BTreeSet::new())
            .expect("fresh pattern node");
        for succ in parts {
            if let Some((_, succ_id)) = succ.rsplit_once(':') {
                if let Ok(succ_id) = succ_id.parse() {
                    edges.push((id, succ_id));
                }
            }
        }
    }
    for (from, to) in edges {
        if let Some(node) = dag.get_mut(from) {
            node.succ.insert(to);
        }
        if let Some(node) = dag.get_mut(to) {
            node.pre.insert(from);
        }
    }
    dag
}

/// Static scaffolding for a hand-built rule; table-driven rules derive
/// theirs from the matched host nodes instead.
#[derive(Default)]
pub struct StaticParts {
    pub fusion_output_map: Vec<FusionOutput>,
    pub split_op_info: Vec<SplitOpInfo>,
    pub merge_op_info: Vec<MergeOpInfo>,
}

pub struct FusionAndShardRule {
    pub opt_type: Mode,
    pub pattern: DagDef,
    pub extra_cond: ExtraConds,
    pub target_name: String,
    pub split_num: i32,
    /// `None` derives split/merge/output scaffolding from the tables.
    pub static_parts: Option<StaticParts>,
}

pub struct UniqueAndGatherRule {
    pub pattern: DagDef,
    pub extra_cond: ExtraConds,
    pub unique_op_info: Vec<UniqueOpInfo>,
    /// When set, gather op infos cover every output of the matched node.
    pub dynamic_gather: Option<String>,
    pub gather_op_info: Vec<GatherOpInfo>,
}

pub enum OptimizeRule {
    FusionAndShard(FusionAndShardRule),
    UniqueAndGather(UniqueAndGatherRule),
}

impl OptimizeRule {
    fn opt_type(&self) -> Mode {
        match self {
            OptimizeRule::FusionAndShard(rule) => rule.opt_type,
            OptimizeRule::UniqueAndGather(_) => Mode::Local,
        }
    }
}

/// Run mode vs rule environment.
fn rule_applies(mode: Mode, rule_type: Mode) -> bool {
    match mode {
        Mode::Local => rule_type == Mode::Local,
        Mode::Distribute => rule_type == Mode::Local || rule_type == Mode::Distribute,
        Mode::GraphPartition => rule_type == Mode::GraphPartition,
    }
}

pub struct Optimizer {
    mode: Mode,
    shard_num: i32,
    rules: Vec<OptimizeRule>,
    local_only: HashSet<String>,
}

impl Optimizer {
    pub fn new(mode: Mode, shard_num: i32) -> Self {
        let mut optimizer = Self {
            mode,
            shard_num,
            rules: Vec::new(),
            local_only: local_only_ops(),
        };
        optimizer.install_default_rules();
        optimizer
    }

    pub fn add_rule(&mut self, rule: OptimizeRule) {
        self.rules.push(rule);
    }

    fn install_default_rules(&mut self) {
        // Deduplicate lookup keys before feature and type reads.
        for op in ["API_GET_NODE_T", "API_GET_P"] {
            self.rules.push(OptimizeRule::UniqueAndGather(UniqueAndGatherRule {
                pattern: pattern_from_adjacency(&[&format!("{op}:0")]),
                extra_cond: ExtraConds::new(),
                unique_op_info: vec![UniqueOpInfo {
                    op_name: "ID_UNIQUE".to_string(),
                    inputs_idx: vec![0],
                }],
                dynamic_gather: Some("ID_GATHER".to_string()),
                gather_op_info: Vec::new(),
            }));
        }
        // One shard-split rule per shardable op.
        for op in [
            "API_SAMPLE_NODE",
            "API_SAMPLE_EDGE",
            "API_GET_NODE",
            "API_GET_EDGE",
            "API_SAMPLE_NB",
            "API_GET_NB_NODE",
            "API_GET_NODE_T",
            "API_GET_P",
        ] {
            self.rules.push(OptimizeRule::FusionAndShard(FusionAndShardRule {
                opt_type: Mode::Distribute,
                pattern: pattern_from_adjacency(&[&format!("{op}:0")]),
                extra_cond: ExtraConds::new(),
                target_name: REMOTE_OP.to_string(),
                split_num: self.shard_num,
                static_parts: None,
            }));
        }
    }

    pub fn optimize(&self, dag: &mut DagDef) -> Result<(), CompileError> {
        if self.mode == Mode::GraphPartition {
            loop {
                let subset = dag.macro_fusion_subset(&self.local_only);
                if subset.is_empty() {
                    return Ok(());
                }
                let order = dag.topological_sort_subset(&subset)?;
                let parts = build_shard_parts(dag, &order)?;
                self.fuse_and_shard(dag, &subset, REMOTE_OP, self.shard_num, parts)?;
            }
        }
        for rule in &self.rules {
            if !rule_applies(self.mode, rule.opt_type()) {
                continue;
            }
            match rule {
                OptimizeRule::FusionAndShard(rule) => self.apply_fusion_rule(rule, dag)?,
                OptimizeRule::UniqueAndGather(rule) => self.apply_unique_rule(rule, dag)?,
            }
        }
        self.common_subexpression_elimination(dag)?;
        Ok(())
    }

    fn fuse_and_shard(
        &self,
        dag: &mut DagDef,
        subset: &BTreeSet<i32>,
        target_name: &str,
        split_num: i32,
        parts: ShardParts,
    ) -> Result<i32, CompileError> {
        let fusion_rule = FusionRule {
            fusion_name: target_name.to_string(),
            fusion_output_map: parts.fusion_outputs,
        };
        let fusion_id = dag.fusion_nodes(subset, &fusion_rule)?;
        if target_name == REMOTE_OP {
            let shard_rule = ShardRule {
                split_op_info: parts.split_op_info,
                merge_op_info: parts.merge_op_info,
                split_num,
            };
            dag.shard_remote(fusion_id, &shard_rule)?;
        }
        Ok(fusion_id)
    }

    fn apply_fusion_rule(
        &self,
        rule: &FusionAndShardRule,
        dag: &mut DagDef,
    ) -> Result<(), CompileError> {
        loop {
            let matches = sub_graph_match(dag, &rule.pattern, &rule.extra_cond);
            let mut applied = false;
            for mapping in matches {
                let subset: BTreeSet<i32> = mapping.values().copied().collect();
                let order = dag.topological_sort_subset(&subset)?;
                let parts = match &rule.static_parts {
                    Some(parts) => ShardParts {
                        fusion_outputs: parts
                            .fusion_output_map
                            .iter()
                            .map(|output| {
                                FusionOutput::new(
                                    output.inner_name.clone(),
                                    mapping[&output.inner_id],
                                    output.inner_slot,
                                    output.fusion_slot,
                                )
                            })
                            .collect(),
                        split_op_info: parts.split_op_info.clone(),
                        merge_op_info: parts.merge_op_info.clone(),
                    },
                    None => build_shard_parts(dag, &order)?,
                };
                match self.fuse_and_shard(dag, &subset, &rule.target_name, rule.split_num, parts) {
                    Ok(_) => {
                        applied = true;
                        break;
                    }
                    // An embedding that would close a cycle is skipped; the
                    // next one may still apply.
                    Err(CompileError::Execution(ExecutionError::FusionWouldCycle(_))) => continue,
                    Err(other) => return Err(other),
                }
            }
            if !applied {
                return Ok(());
            }
        }
    }

    fn apply_unique_rule(
        &self,
        rule: &UniqueAndGatherRule,
        dag: &mut DagDef,
    ) -> Result<(), CompileError> {
        let matches = sub_graph_match(dag, &rule.pattern, &rule.extra_cond);
        for mapping in matches {
            let Some(&node_id) = mapping.values().next() else {
                continue;
            };
            let gather_op_info = match &rule.dynamic_gather {
                Some(gather_op) => {
                    let node = dag.get(node_id).ok_or(ExecutionError::NodeNotFound(node_id))?;
                    vec![GatherOpInfo {
                        op_name: gather_op.clone(),
                        unique_op_idx: 0,
                        inputs_idx: (0..node.output_num as usize).collect(),
                    }]
                }
                None => rule.gather_op_info.clone(),
            };
            let unique_gather = UniqueGatherRule {
                unique_op_info: rule.unique_op_info.clone(),
                gather_op_info,
            };
            dag.unique_and_gather(node_id, &unique_gather)?;
        }
        Ok(())
    }

    /// Collapses duplicate `ID_SPLIT` / `ID_UNIQUE` nodes over identical
    /// inputs, rewiring consumers to the surviving node.
    fn common_subexpression_elimination(&self, dag: &mut DagDef) -> Result<(), CompileError> {
        let whitelist = ["ID_SPLIT", "ID_UNIQUE"];
        let mut keeper_of: HashMap<String, i32> = HashMap::new();
        for node_id in dag.topological_sort()? {
            let Some(node) = dag.get(node_id) else { continue };
            if !whitelist.contains(&node.name.as_str()) {
                continue;
            }
            let mut key = node.name.clone();
            for edge in &node.input_edges {
                key.push(',');
                key.push_str(&format!("{}_{}", edge.src_id, edge.src_slot));
            }
            let Some(&keeper_id) = keeper_of.get(&key) else {
                keeper_of.insert(key, node_id);
                continue;
            };

            let duplicate = dag.get(node_id).expect("duplicate exists").clone();
            let keeper_name = dag.get(keeper_id).expect("keeper exists").name.clone();
            dag.cut_relation(
                &[node_id].into(),
                &duplicate.pre,
                &duplicate.succ,
            );
            for &succ_id in &duplicate.succ {
                let node = dag
                    .get_mut(succ_id)
                    .ok_or(ExecutionError::NodeNotFound(succ_id))?;
                node.pre.insert(keeper_id);
                for edge in &mut node.input_edges {
                    if edge.src_id == node_id {
                        edge.src_id = keeper_id;
                        edge.src_name = keeper_name.clone();
                    }
                }
                dag.get_mut(keeper_id)
                    .ok_or(ExecutionError::NodeNotFound(keeper_id))?
                    .succ
                    .insert(succ_id);
            }
            dag.erase(node_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
