//! Grammar tree for the traversal language, plus the tokeniser that builds
//! it from query text.
//!
//! A query is a chain of steps: `v(nodes).outV(etypes).has(price gt 3)
//! .limit(10).as(nb)`. API steps become API nodes under the root; filter
//! and post-process clauses become child nodes of the preceding API node;
//! `v_select(alias)` / `e_select(alias)` attach a SELECT child to the next
//! API step.

use std::collections::HashMap;

use crate::errors::CompileError;

pub type NodeId = usize;

/// Synthesised attributes, filled bottom-up before translation.
#[derive(Debug, Clone, Default)]
pub struct Prop {
    /// Parameter tokens, including `udf_*` names and `[` `]` markers.
    pub values: Vec<String>,
    /// Disjunction of conjunctions of `field op value` terms.
    pub dnf: Vec<Vec<String>>,
    /// Ordered post-process commands.
    pub post_process: Vec<String>,
    /// Whether the step carried any condition clause at all.
    pub has_condition: bool,
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub node_type: String,
    pub values: Vec<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub prop: Prop,
    pub op_alias: String,
    /// Alias named by a preceding `v_select` / `e_select`.
    pub select: Option<String>,
}

#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn new() -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.push("QUERY", None, Vec::new());
        tree
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn push(
        &mut self,
        node_type: &str,
        parent: Option<NodeId>,
        values: Vec<String>,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            node_type: node_type.to_string(),
            values,
            parent,
            children: Vec::new(),
            prop: Prop::default(),
            op_alias: String::new(),
            select: None,
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    pub fn get(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Post-order traversal from the root.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        self.walk(self.root(), &mut order);
        order
    }

    fn walk(&self, id: NodeId, order: &mut Vec<NodeId>) {
        for &child in &self.nodes[id].children {
            self.walk(child, order);
        }
        order.push(id);
    }
}

struct Step {
    name: String,
    args: Vec<String>,
    offset: usize,
}

fn split_steps(query: &str) -> Result<Vec<Step>, CompileError> {
    let bytes = query.as_bytes();
    let mut steps = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b'.' || bytes[i].is_ascii_whitespace()) {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let name_begin = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        if i == name_begin || i >= bytes.len() || bytes[i] != b'(' {
            return Err(CompileError::Parse {
                offset: i,
                message: "expected step name followed by '('".to_string(),
            });
        }
        let name = query[name_begin..i].to_string();
        let args_begin = i + 1;
        let mut depth = 1;
        i += 1;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return Err(CompileError::Parse {
                offset: args_begin,
                message: "unbalanced parentheses".to_string(),
            });
        }
        let raw_args = &query[args_begin..i - 1];
        let args = raw_args
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        steps.push(Step {
            name,
            args,
            offset: name_begin,
        });
    }
    Ok(steps)
}

fn api_op(step: &str) -> Option<&'static str> {
    let table: HashMap<&str, &str> = [
        ("v", "API_GET_NODE"),
        ("e", "API_GET_EDGE"),
        ("sampleN", "API_SAMPLE_NODE"),
        ("sampleE", "API_SAMPLE_EDGE"),
        ("sampleNB", "API_SAMPLE_NB"),
        ("sampleLNB", "API_SAMPLE_LNB"),
        ("outV", "API_GET_NB_NODE"),
        ("outE", "API_GET_NB_EDGE"),
        ("inV", "API_GET_RNB_NODE"),
        ("label", "API_GET_NODE_T"),
        ("values", "API_GET_P"),
    ]
    .into();
    table.get(step).copied()
}

/// Builds the grammar tree for one query.
pub fn build_grammar_tree(query: &str) -> Result<Tree, CompileError> {
    let mut tree = Tree::new();
    let root = tree.root();
    let mut current_api: Option<NodeId> = None;
    let mut pending_select: Option<String> = None;

    for step in split_steps(query)? {
        if let Some(op) = api_op(&step.name) {
            let api = tree.push(op, Some(root), Vec::new());
            if let Some(alias) = pending_select.take() {
                tree.push("SELECT", Some(api), vec![alias]);
            }
            tree.push("PARAMS", Some(api), step.args);
            current_api = Some(api);
            continue;
        }
        let api = current_api.ok_or_else(|| CompileError::Parse {
            offset: step.offset,
            message: format!("clause '{}' has no preceding step", step.name),
        })?;
        match step.name.as_str() {
            "has" => {
                // One has() is a conjunction; terms separated by "and".
                let joined = step.args.join(" , ");
                let terms: Vec<String> = joined
                    .split(" and ")
                    .map(|t| t.replace(" , ", " "))
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                let conj = tree.push("CONJ", Some(api), Vec::new());
                for term in terms {
                    tree.push("TERM", Some(conj), term.split_whitespace().map(str::to_string).collect());
                }
            }
            "hasLabel" => {
                let label = step.args.first().cloned().unwrap_or_default();
                let conj = tree.push("CONJ", Some(api), Vec::new());
                tree.push(
                    "TERM",
                    Some(conj),
                    vec!["label".to_string(), "eq".to_string(), label],
                );
            }
            "limit" => {
                let count = step.args.first().cloned().unwrap_or_default();
                tree.push("LIMIT", Some(api), vec![count]);
            }
            "order_by" => {
                tree.push("ORDER_BY", Some(api), step.args);
            }
            "as" => {
                let alias = step
                    .args
                    .first()
                    .cloned()
                    .ok_or_else(|| CompileError::BadArity {
                        step: "as".to_string(),
                        expected: "1".to_string(),
                        actual: 0,
                    })?;
                tree.push("AS", Some(api), vec![alias]);
            }
            "v_select" | "e_select" => {
                pending_select = Some(step.args.first().cloned().ok_or_else(|| {
                    CompileError::BadArity {
                        step: step.name.clone(),
                        expected: "1".to_string(),
                        actual: 0,
                    }
                })?);
            }
            other => return Err(CompileError::UnknownStep(other.to_string())),
        }
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_becomes_api_nodes_with_clause_children() {
        let tree =
            build_grammar_tree("v(nodes).outV(etypes).has(price gt 3).limit(10).as(nb)").unwrap();
        let root = tree.get(tree.root());
        assert_eq!(root.children.len(), 2);
        let get_node = tree.get(root.children[0]);
        assert_eq!(get_node.node_type, "API_GET_NODE");
        let nb = tree.get(root.children[1]);
        assert_eq!(nb.node_type, "API_GET_NB_NODE");
        let kinds: Vec<&str> = nb
            .children
            .iter()
            .map(|c| tree.get(*c).node_type.as_str())
            .collect();
        assert_eq!(kinds, vec!["PARAMS", "CONJ", "LIMIT", "AS"]);
    }

    #[test]
    fn select_attaches_to_next_step() {
        let tree = build_grammar_tree("v(nodes).as(n1).v_select(n1).values(fid)").unwrap();
        let root = tree.get(tree.root());
        let values = tree.get(root.children[1]);
        assert_eq!(values.node_type, "API_GET_P");
        let first_child = tree.get(values.children[0]);
        assert_eq!(first_child.node_type, "SELECT");
        assert_eq!(first_child.values, vec!["n1"]);
    }

    #[test]
    fn unbalanced_query_fails() {
        assert!(build_grammar_tree("v(nodes").is_err());
        assert!(build_grammar_tree("v(nodes).bogus(1)").is_err());
    }
}
