use std::collections::BTreeSet;

use euler_types::grpc::DagNodeProto;

/// Marks an input that names an external tensor rather than another node.
pub const EXTERNAL: i32 = -1;

/// One input of a logical node: where the value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeDef {
    pub src_name: String,
    pub src_id: i32,
    pub src_slot: i32,
}

impl EdgeDef {
    pub fn new(src_name: impl Into<String>, src_id: i32, src_slot: i32) -> Self {
        Self {
            src_name: src_name.into(),
            src_id,
            src_slot,
        }
    }

    /// An input naming a tensor installed by the caller.
    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, EXTERNAL, EXTERNAL)
    }

    pub fn is_external(&self) -> bool {
        self.src_id == EXTERNAL
    }

    /// Wire form: `<src_name>,<src_id>:<src_slot>`, or the bare tensor name
    /// for external inputs.
    pub fn encode(&self) -> String {
        if self.is_external() {
            self.src_name.clone()
        } else {
            format!("{},{}:{}", self.src_name, self.src_id, self.src_slot)
        }
    }
}

/// A disjunction of conjunctions of `field op value` terms plus ordered
/// post-process commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CondAttr {
    pub dnf: Vec<Vec<String>>,
    pub post_process: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrDef {
    /// A string key referencing a tensor in the context.
    Norm(String),
    Cond(CondAttr),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UdfDef {
    pub name: String,
    pub str_params: Vec<String>,
    pub num_params: Vec<String>,
}

/// Maps one inner output of a fused subgraph onto a slot of the fusion node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionOutput {
    pub inner_name: String,
    pub inner_id: i32,
    pub inner_slot: i32,
    pub fusion_slot: i32,
}

impl FusionOutput {
    pub fn new(inner_name: impl Into<String>, inner_id: i32, inner_slot: i32, fusion_slot: i32) -> Self {
        Self {
            inner_name: inner_name.into(),
            inner_id,
            inner_slot,
            fusion_slot,
        }
    }
}

/// A split op inserted in front of a sharded remote: which fusion inputs it
/// consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOpInfo {
    pub op_name: String,
    pub inputs_idx: Vec<usize>,
}

impl SplitOpInfo {
    pub fn new(op_name: impl Into<String>, inputs_idx: Vec<usize>) -> Self {
        Self {
            op_name: op_name.into(),
            inputs_idx,
        }
    }
}

/// Where a merge op gets its merge-index tensors from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeIdxSource {
    /// Sequential append, no index needed.
    None,
    /// Per shard `s`, slot `2 s + 1` of the given split op.
    Split(usize),
    /// Per shard `s`, slot `s + 1` of the given earlier merge op.
    Merge(usize),
}

/// A merge op stitching per-shard replies back together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOpInfo {
    pub op_name: String,
    pub idx_source: MergeIdxSource,
    /// Fusion output slots the merge consumes from every shard replica.
    pub inputs_idx: Vec<usize>,
}

impl MergeOpInfo {
    pub fn new(op_name: impl Into<String>, idx_source: MergeIdxSource, inputs_idx: Vec<usize>) -> Self {
        Self {
            op_name: op_name.into(),
            idx_source,
            inputs_idx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueOpInfo {
    pub op_name: String,
    /// Input positions of the target node to deduplicate.
    pub inputs_idx: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherOpInfo {
    pub op_name: String,
    /// Which unique op provides the scatter mapping.
    pub unique_op_idx: usize,
    /// Output slots of the target node to scatter back.
    pub inputs_idx: Vec<usize>,
}

/// Payload a `REMOTE` node carries: the shard it targets, the sub-DAG it
/// ships, and how inner outputs map onto its own slots.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDef {
    pub shard_idx: i32,
    pub inner_nodes: Vec<NodeDef>,
    pub fusion_output_map: Vec<FusionOutput>,
}

/// Mutable build-time operator node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub name: String,
    pub op_alias: String,
    pub id: i32,
    pub attrs: Vec<AttrDef>,
    pub input_edges: Vec<EdgeDef>,
    pub pre: BTreeSet<i32>,
    pub succ: BTreeSet<i32>,
    pub output_num: i32,
    pub udf: Option<UdfDef>,
    pub remote: Option<RemoteDef>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, id: i32, output_num: i32) -> Self {
        Self {
            name: name.into(),
            op_alias: String::new(),
            id,
            attrs: Vec::new(),
            input_edges: Vec::new(),
            pre: BTreeSet::new(),
            succ: BTreeSet::new(),
            output_num,
            udf: None,
            remote: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// The conjunction list of the first condition attribute, if any.
    pub fn cond(&self) -> Option<&CondAttr> {
        self.attrs.iter().find_map(|attr| match attr {
            AttrDef::Cond(cond) => Some(cond),
            AttrDef::Norm(_) => None,
        })
    }

    pub fn to_proto(&self) -> DagNodeProto {
        let mut proto = DagNodeProto {
            name: format!("{},{}", self.name, self.id),
            op: self.name.clone(),
            op_alias: self.op_alias.clone(),
            output_num: self.output_num,
            ..Default::default()
        };
        for edge in &self.input_edges {
            proto.inputs.push(edge.encode());
        }
        for attr in &self.attrs {
            match attr {
                // Plain attributes travel as extra external inputs.
                AttrDef::Norm(key) => proto.inputs.push(key.clone()),
                AttrDef::Cond(cond) => {
                    for conj in &cond.dnf {
                        proto.dnf.push(conj.join(","));
                    }
                    proto.post_process.extend(cond.post_process.iter().cloned());
                }
            }
        }
        if let Some(udf) = &self.udf {
            proto.udf_name = udf.name.clone();
            proto.udf_str_params = udf.str_params.clone();
            proto.udf_num_params = udf.num_params.clone();
        }
        if let Some(remote) = &self.remote {
            proto.shard_idx = remote.shard_idx;
            for inner in &remote.inner_nodes {
                proto.inner_nodes.push(inner.to_proto());
            }
            for output in &remote.fusion_output_map {
                proto.output_list.push(format!(
                    "{},{}:{}",
                    output.inner_name, output.inner_id, output.inner_slot
                ));
            }
            for output in &remote.fusion_output_map {
                proto.remote_output_list.push(format!(
                    "{},{}:{}",
                    self.name, self.id, output.fusion_slot
                ));
            }
        }
        proto
    }
}
