//! Sub-graph monomorphism search used by the pattern-rewrite rules.
//!
//! Embeddings are node-disjoint: once a host node is consumed by one match
//! it is unavailable to later ones. Matching is by op name plus structural
//! consistency with every already-mapped neighbour, with optional extra
//! predicates per pattern node.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::{DagDef, NodeDef};

/// Extra predicate on the host node matched to one pattern node, keyed by
/// `"<op_name>,<pattern_id>"`.
pub type ExtraCond = Arc<dyn Fn(&NodeDef) -> bool + Send + Sync>;
pub type ExtraConds = HashMap<String, ExtraCond>;

pub fn extra_cond_key(op_name: &str, pattern_id: i32) -> String {
    format!("{op_name},{pattern_id}")
}

struct Matcher<'a> {
    host: &'a DagDef,
    pattern: &'a DagDef,
    extra: &'a ExtraConds,
    pattern_order: Vec<i32>,
    consumed: &'a BTreeSet<i32>,
}

impl<'a> Matcher<'a> {
    fn node_feasible(&self, host_node: &NodeDef, pattern_node: &NodeDef) -> bool {
        if host_node.name != pattern_node.name {
            return false;
        }
        if pattern_node.pre.len() > host_node.pre.len()
            || pattern_node.succ.len() > host_node.succ.len()
        {
            return false;
        }
        let key = extra_cond_key(&pattern_node.name, pattern_node.id);
        if let Some(cond) = self.extra.get(&key) {
            if !cond(host_node) {
                return false;
            }
        }
        true
    }

    fn consistent(
        &self,
        host_id: i32,
        pattern_node: &NodeDef,
        p2m: &BTreeMap<i32, i32>,
    ) -> bool {
        let host_node = self.host.get(host_id).expect("host node");
        for p_pre in &pattern_node.pre {
            if let Some(&m_pre) = p2m.get(p_pre) {
                if !host_node.pre.contains(&m_pre) {
                    return false;
                }
            }
        }
        for p_succ in &pattern_node.succ {
            if let Some(&m_succ) = p2m.get(p_succ) {
                if !host_node.succ.contains(&m_succ) {
                    return false;
                }
            }
        }
        true
    }

    fn search(
        &self,
        index: usize,
        p2m: &mut BTreeMap<i32, i32>,
        m2p: &mut BTreeMap<i32, i32>,
    ) -> bool {
        let Some(&pattern_id) = self.pattern_order.get(index) else {
            return true;
        };
        let pattern_node = self.pattern.get(pattern_id).expect("pattern node");
        let candidates: Vec<i32> = self
            .host
            .node_ids()
            .filter(|id| !self.consumed.contains(id) && !m2p.contains_key(id))
            .collect();
        for host_id in candidates {
            let host_node = self.host.get(host_id).expect("host node");
            if !self.node_feasible(host_node, pattern_node) {
                continue;
            }
            if !self.consistent(host_id, pattern_node, p2m) {
                continue;
            }
            p2m.insert(pattern_id, host_id);
            m2p.insert(host_id, pattern_id);
            if self.search(index + 1, p2m, m2p) {
                return true;
            }
            p2m.remove(&pattern_id);
            m2p.remove(&host_id);
        }
        false
    }
}

/// All node-disjoint embeddings of `pattern` into `host`, as
/// pattern-id → host-id maps.
pub fn sub_graph_match(
    host: &DagDef,
    pattern: &DagDef,
    extra: &ExtraConds,
) -> Vec<BTreeMap<i32, i32>> {
    let Ok(pattern_order) = pattern.topological_sort() else {
        return Vec::new();
    };
    if pattern_order.is_empty() {
        return Vec::new();
    }
    let mut consumed = BTreeSet::new();
    let mut results = Vec::new();
    loop {
        let matcher = Matcher {
            host,
            pattern,
            extra,
            pattern_order: pattern_order.clone(),
            consumed: &consumed,
        };
        let mut p2m = BTreeMap::new();
        let mut m2p = BTreeMap::new();
        if !matcher.search(0, &mut p2m, &mut m2p) {
            break;
        }
        consumed.extend(p2m.values().copied());
        results.push(p2m);
    }
    results
}
