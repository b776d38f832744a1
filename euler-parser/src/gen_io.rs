//! Per-op input wiring and output arity tables used by the translator.

use euler_core::dag_def::{AttrDef, EdgeDef, NodeDef};

/// Ops whose natural chain output is the flat id vector at slot 1.
const NB_PRODUCERS: [&str; 6] = [
    "API_SAMPLE_NB",
    "API_GATHER_RESULT",
    "API_GET_RNB_NODE",
    "API_GET_NB_NODE",
    "API_GET_NB_FILTER",
    "API_SAMPLE_N_WITH_TYPES",
];

/// Chain-start ops read their parameters as external tensors: plain
/// attributes become external input edges.
pub fn is_chain_start(op: &str) -> bool {
    matches!(
        op,
        "API_SAMPLE_NODE" | "API_SAMPLE_EDGE" | "API_GET_NODE" | "API_GET_EDGE"
    )
}

fn begin_inputs(node: &mut NodeDef) {
    let attrs = std::mem::take(&mut node.attrs);
    for attr in attrs {
        match attr {
            AttrDef::Norm(key) => node.input_edges.push(EdgeDef::external(key)),
            other => node.attrs.push(other),
        }
    }
}

fn chain_inputs(op: &str, pre: &NodeDef, node: &mut NodeDef) {
    let mut takes_slot_one = NB_PRODUCERS.contains(&pre.name.as_str());
    if op == "API_GET_P" && pre.name == "API_GET_NB_EDGE" {
        takes_slot_one = true;
    }
    if takes_slot_one {
        node.input_edges.push(EdgeDef::new(pre.name.clone(), pre.id, 1));
    } else {
        for slot in 0..pre.output_num {
            node.input_edges
                .push(EdgeDef::new(pre.name.clone(), pre.id, slot));
        }
    }
}

/// Wires a node's inputs given its (optional) chain predecessor.
pub fn gen_inputs(op: &str, pre: Option<&NodeDef>, node: &mut NodeDef) {
    if is_chain_start(op) {
        begin_inputs(node);
        return;
    }
    if let Some(pre) = pre {
        chain_inputs(op, pre, node);
    }
}

/// Declared output count per op. API_GET_P emits an index/value pair per
/// requested feature.
pub fn output_num(op: &str, node: &NodeDef) -> i32 {
    match op {
        "API_SAMPLE_NB" | "API_GET_NB_NODE" | "API_GET_RNB_NODE" | "API_GET_NB_FILTER" => 4,
        "API_GET_NB_EDGE" => 3,
        "API_SAMPLE_N_WITH_TYPES" => 2,
        "API_GET_P" => {
            let features = node
                .attrs
                .iter()
                .filter(|attr| matches!(attr, AttrDef::Norm(_)))
                .count();
            (features * 2) as i32
        }
        _ => 1,
    }
}
