use std::collections::BTreeSet;

use euler_core::dag_def::{EdgeDef, FusionOutput, NodeDef, REMOTE_OP};

use super::*;

fn ids(values: &[i32]) -> BTreeSet<i32> {
    values.iter().copied().collect()
}

fn check_struct(dag: &DagDef, id: i32, pre: &[i32], succ: &[i32]) {
    let node = dag.get(id).unwrap_or_else(|| panic!("node {id} missing"));
    assert_eq!(node.pre, ids(pre), "pre of {id}");
    assert_eq!(node.succ, ids(succ), "succ of {id}");
}

/// 0 1
/// |/
/// 2
/// |\
/// 3 4
/// |/
/// 5
fn host_dag() -> DagDef {
    let mut dag = pattern_from_adjacency(&[
        "0:0 2:2",
        "1:1 2:2",
        "2:2 3:3 4:4",
        "3:3 5:5",
        "4:4 5:5",
        "5:5",
    ]);
    dag.get_mut(2).unwrap().input_edges.push(EdgeDef::new("0", 0, 0));
    dag.get_mut(2).unwrap().input_edges.push(EdgeDef::new("1", 1, 0));
    dag.get_mut(3).unwrap().input_edges.push(EdgeDef::new("2", 2, 0));
    dag.get_mut(4).unwrap().input_edges.push(EdgeDef::new("2", 2, 1));
    dag.get_mut(5).unwrap().input_edges.push(EdgeDef::new("3", 3, 0));
    dag.get_mut(5).unwrap().input_edges.push(EdgeDef::new("4", 4, 0));
    dag
}

#[test]
fn static_fusion_rule_rewrites_consumers() {
    let mut optimizer = Optimizer::new(Mode::Local, 1);
    optimizer.add_rule(OptimizeRule::FusionAndShard(FusionAndShardRule {
        opt_type: Mode::Local,
        pattern: pattern_from_adjacency(&["2:0 3:1", "3:1"]),
        extra_cond: ExtraConds::new(),
        target_name: "NEW".to_string(),
        split_num: 1,
        static_parts: Some(StaticParts {
            fusion_output_map: vec![
                FusionOutput::new("2", 0, 1, 0),
                FusionOutput::new("3", 1, 0, 1),
            ],
            ..Default::default()
        }),
    }));

    let mut dag = host_dag();
    optimizer.optimize(&mut dag).unwrap();

    let fusion_id = 6;
    check_struct(&dag, 0, &[], &[fusion_id]);
    check_struct(&dag, 1, &[], &[fusion_id]);
    check_struct(&dag, fusion_id, &[0, 1], &[4, 5]);
    check_struct(&dag, 4, &[fusion_id], &[5]);
    check_struct(&dag, 5, &[fusion_id, 4], &[]);

    let node4 = dag.get(4).unwrap();
    assert_eq!(node4.input_edges, vec![EdgeDef::new("NEW", fusion_id, 0)]);
    let node5 = dag.get(5).unwrap();
    assert_eq!(
        node5.input_edges,
        vec![EdgeDef::new("NEW", fusion_id, 1), EdgeDef::new("4", 4, 0)]
    );
}

/// Spec'd partition behaviour: a chain A -> B -> C with B local-only must
/// produce two separate sharded remotes, never one crossing B.
#[test]
fn partition_never_fuses_across_local_only_ops() {
    let mut dag = DagDef::new();
    let mut a = dag.produce_node("API_GET_NODE", 1);
    a.input_edges.push(EdgeDef::external("nodes"));
    let a_id = a.id;
    dag.add_node(a, &BTreeSet::new(), &BTreeSet::new()).unwrap();

    let mut b = dag.produce_node("AS", 1);
    b.input_edges.push(EdgeDef::new("API_GET_NODE", a_id, 0));
    let b_id = b.id;
    dag.add_node(b, &[a_id].into(), &BTreeSet::new()).unwrap();

    let mut c = dag.produce_node("API_GET_NODE_T", 1);
    c.input_edges.push(EdgeDef::new("AS", b_id, 0));
    let c_id = c.id;
    dag.add_node(c, &[b_id].into(), &BTreeSet::new()).unwrap();

    let optimizer = Optimizer::new(Mode::GraphPartition, 2);
    optimizer.optimize(&mut dag).unwrap();

    let remotes: Vec<&NodeDef> = dag.nodes().filter(|n| n.name == REMOTE_OP).collect();
    assert_eq!(remotes.len(), 4, "two fused groups, two shards each");
    for remote in &remotes {
        let inner = &remote.remote.as_ref().unwrap().inner_nodes;
        assert_eq!(inner.len(), 1);
        assert_ne!(inner[0].name, "AS");
    }
    // Both groups carry split and merge scaffolding.
    assert!(dag.nodes().any(|n| n.name == "GP_BROAD_CAST_SPLIT"));
    assert!(dag.nodes().any(|n| n.name == "GP_UNIQUE_MERGE"));
    assert!(dag.nodes().any(|n| n.name == "GP_REGULAR_DATA_MERGE"));
    // The AS node survived outside every remote.
    assert!(dag.get(b_id).is_some());
    assert!(dag.topological_sort().is_ok());
    assert!(dag.get(a_id).is_none());
    assert!(dag.get(c_id).is_none());
}

#[test]
fn cse_collapses_duplicate_unique_ops_and_is_idempotent() {
    let mut dag = DagDef::new();
    let mut source = dag.produce_node("API_GET_NODE", 1);
    source.input_edges.push(EdgeDef::external("nodes"));
    let source_id = source.id;
    dag.add_node(source, &BTreeSet::new(), &BTreeSet::new()).unwrap();

    let mut consumers = Vec::new();
    for _ in 0..2 {
        let mut unique = dag.produce_node("ID_UNIQUE", 2);
        unique
            .input_edges
            .push(EdgeDef::new("API_GET_NODE", source_id, 0));
        let unique_id = unique.id;
        dag.add_node(unique, &[source_id].into(), &BTreeSet::new())
            .unwrap();

        let mut reader = dag.produce_node("API_GET_NODE_T", 1);
        reader
            .input_edges
            .push(EdgeDef::new("ID_UNIQUE", unique_id, 0));
        let reader_id = reader.id;
        dag.add_node(reader, &[unique_id].into(), &BTreeSet::new())
            .unwrap();
        consumers.push((unique_id, reader_id));
    }

    let optimizer = Optimizer::new(Mode::Local, 1);
    optimizer
        .common_subexpression_elimination(&mut dag)
        .unwrap();

    let uniques: Vec<i32> = dag
        .nodes()
        .filter(|n| n.name == "ID_UNIQUE")
        .map(|n| n.id)
        .collect();
    assert_eq!(uniques.len(), 1);
    let keeper = uniques[0];
    for (_, reader_id) in &consumers {
        let reader = dag.get(*reader_id).unwrap();
        assert_eq!(reader.input_edges[0].src_id, keeper);
        assert!(reader.pre.contains(&keeper));
    }

    // Idempotent: a second pass changes nothing.
    let before: Vec<i32> = dag.node_ids().collect();
    optimizer
        .common_subexpression_elimination(&mut dag)
        .unwrap();
    let after: Vec<i32> = dag.node_ids().collect();
    assert_eq!(before, after);
}
