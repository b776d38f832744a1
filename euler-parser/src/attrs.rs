//! Pass 1 of translation: fold clause children into each API node's
//! synthesised `Prop`, bottom-up over the post-order sequence.

use crate::tree::{NodeId, Tree};

fn fold_api_node(tree: &mut Tree, id: NodeId) {
    let children = tree.get(id).children.clone();
    let mut prop = std::mem::take(&mut tree.get_mut(id).prop);
    let mut alias = None;
    let mut select = None;
    for child in children {
        let node_type = tree.get(child).node_type.clone();
        let values = tree.get(child).values.clone();
        match node_type.as_str() {
            "PARAMS" => prop.values.extend(values),
            "CONJ" => {
                let terms: Vec<String> = tree
                    .get(child)
                    .children
                    .clone()
                    .into_iter()
                    .map(|term| tree.get(term).values.join(" "))
                    .collect();
                prop.dnf.push(terms);
                prop.has_condition = true;
            }
            "LIMIT" => {
                prop.post_process.push(format!("limit {}", values.join(" ")));
                prop.has_condition = true;
            }
            "ORDER_BY" => {
                prop.post_process
                    .push(format!("order_by {}", values.join(" ")));
                prop.has_condition = true;
            }
            "AS" => alias = values.first().cloned(),
            "SELECT" => select = values.first().cloned(),
            _ => {}
        }
    }
    let node = tree.get_mut(id);
    node.prop = prop;
    if let Some(alias) = alias {
        node.op_alias = alias;
    }
    if select.is_some() {
        node.select = select;
    }
}

/// Computes every API node's properties. Clause nodes carry their raw
/// token payload already, so one bottom-up sweep suffices.
pub fn calculate(tree: &mut Tree) {
    for id in tree.post_order() {
        if tree.get(id).node_type.starts_with("API_") {
            fold_api_node(tree, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build_grammar_tree;

    #[test]
    fn props_accumulate_in_clause_order() {
        let mut tree = build_grammar_tree(
            "v(nodes).has(price gt 3 and att lt 5).has(label eq 1).order_by(id, desc).limit(7).as(x)",
        )
        .unwrap();
        calculate(&mut tree);
        let api = tree.get(tree.get(tree.root()).children[0]);
        assert_eq!(api.prop.values, vec!["nodes"]);
        assert_eq!(
            api.prop.dnf,
            vec![
                vec!["price gt 3".to_string(), "att lt 5".to_string()],
                vec!["label eq 1".to_string()],
            ]
        );
        assert_eq!(
            api.prop.post_process,
            vec!["order_by id desc".to_string(), "limit 7".to_string()]
        );
        assert_eq!(api.op_alias, "x");
    }

    #[test]
    fn select_is_recorded_on_the_following_step() {
        let mut tree =
            build_grammar_tree("v(nodes).as(n1).v_select(n1).values(fid)").unwrap();
        calculate(&mut tree);
        let values = tree.get(tree.get(tree.root()).children[1]);
        assert_eq!(values.select.as_deref(), Some("n1"));
        assert_eq!(values.prop.values, vec!["fid"]);
    }
}
