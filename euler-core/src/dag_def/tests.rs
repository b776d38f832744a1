use std::collections::{BTreeSet, HashSet};

use proptest::prelude::*;

use super::sub_graph_iso::{sub_graph_match, ExtraConds};
use super::*;

fn ids(values: &[i32]) -> BTreeSet<i32> {
    values.iter().copied().collect()
}

/// 0 1
/// |/
/// 2
/// |\
/// 3 4
/// |/
/// 5
fn build_dag() -> DagDef {
    let mut dag = DagDef::new();
    let node0 = dag.produce_node("0", 1);
    let node1 = dag.produce_node("1", 1);
    let mut node2 = dag.produce_node("2", 1);
    node2.input_edges.push(EdgeDef::new("0", 0, 0));
    node2.input_edges.push(EdgeDef::new("1", 1, 0));
    let mut node3 = dag.produce_node("3", 1);
    node3.input_edges.push(EdgeDef::new("2", 2, 0));
    let mut node4 = dag.produce_node("4", 1);
    node4.input_edges.push(EdgeDef::new("2", 2, 0));
    let mut node5 = dag.produce_node("5", 1);
    node5.input_edges.push(EdgeDef::new("3", 3, 0));
    node5.input_edges.push(EdgeDef::new("4", 4, 0));

    dag.add_node(node0, &ids(&[]), &ids(&[])).unwrap();
    dag.add_node(node1, &ids(&[]), &ids(&[])).unwrap();
    dag.add_node(node2, &ids(&[0, 1]), &ids(&[])).unwrap();
    dag.add_node(node3, &ids(&[2]), &ids(&[])).unwrap();
    dag.add_node(node4, &ids(&[2]), &ids(&[])).unwrap();
    dag.add_node(node5, &ids(&[3, 4]), &ids(&[])).unwrap();
    dag
}

fn check_struct(dag: &DagDef, id: i32, pre: &[i32], succ: &[i32]) {
    let node = dag.get(id).unwrap_or_else(|| panic!("node {id} missing"));
    assert_eq!(node.pre, ids(pre), "pre of node {id}");
    assert_eq!(node.succ, ids(succ), "succ of node {id}");
}

fn check_inputs(dag: &DagDef, id: i32, expected: &[(&str, i32, i32)]) {
    let node = dag.get(id).unwrap();
    let actual: Vec<(&str, i32, i32)> = node
        .input_edges
        .iter()
        .map(|e| (e.src_name.as_str(), e.src_id, e.src_slot))
        .collect();
    assert_eq!(actual, expected, "inputs of node {id}");
}

#[test]
fn init_wires_both_directions() {
    let dag = build_dag();
    check_struct(&dag, 0, &[], &[2]);
    check_struct(&dag, 1, &[], &[2]);
    check_struct(&dag, 2, &[0, 1], &[3, 4]);
    check_struct(&dag, 3, &[2], &[5]);
    check_struct(&dag, 4, &[2], &[5]);
    check_struct(&dag, 5, &[3, 4], &[]);
}

#[test]
fn topological_sort_subset_orders_by_dependency() {
    let dag = build_dag();
    let order = dag.topological_sort_subset(&ids(&[2, 3, 4, 5])).unwrap();
    assert_eq!(order, vec![2, 3, 4, 5]);
}

#[test]
fn topological_sort_detects_cycles() {
    let mut dag = build_dag();
    // Force a back edge 5 -> 2.
    dag.get_mut(5).unwrap().succ.insert(2);
    dag.get_mut(2).unwrap().pre.insert(5);
    assert!(matches!(
        dag.topological_sort(),
        Err(ExecutionError::Cycle)
    ));
}

#[test]
fn macro_fusion_excludes_nodes_behind_local_only_ops() {
    let dag = build_dag();
    let local_only: HashSet<String> = ["3".to_string()].into();
    let subset = dag.macro_fusion_subset(&local_only);
    assert_eq!(subset, ids(&[0, 1, 2, 4]));
}

#[test]
fn fusion_replaces_subset_and_rewires_consumers() {
    let mut dag = build_dag();
    let rule = FusionRule {
        fusion_name: "6".to_string(),
        fusion_output_map: vec![
            FusionOutput::new("3", 3, 0, 0),
            FusionOutput::new("4", 4, 0, 1),
        ],
    };
    let fusion_id = dag.fusion_nodes(&ids(&[2, 3, 4]), &rule).unwrap();
    assert_eq!(fusion_id, 6);
    check_struct(&dag, 0, &[], &[6]);
    check_struct(&dag, 1, &[], &[6]);
    check_struct(&dag, 6, &[0, 1], &[5]);
    check_struct(&dag, 5, &[6], &[]);
    check_inputs(&dag, 6, &[("0", 0, 0), ("1", 1, 0)]);
    check_inputs(&dag, 5, &[("6", 6, 0), ("6", 6, 1)]);
    assert!(dag.get(2).is_none());
    assert!(dag.get(3).is_none());
    assert!(dag.get(4).is_none());
}

#[test]
fn remote_fusion_moves_subset_inside() {
    let mut dag = build_dag();
    let rule = FusionRule {
        fusion_name: REMOTE_OP.to_string(),
        fusion_output_map: vec![
            FusionOutput::new("3", 3, 0, 0),
            FusionOutput::new("4", 4, 0, 1),
        ],
    };
    let fusion_id = dag.fusion_nodes(&ids(&[2, 3, 4]), &rule).unwrap();
    assert_eq!(fusion_id, 6);

    check_struct(&dag, 0, &[], &[6]);
    check_struct(&dag, 1, &[], &[6]);
    check_struct(&dag, 6, &[0, 1], &[5]);
    check_struct(&dag, 5, &[6], &[]);
    check_inputs(&dag, 6, &[("0", 0, 0), ("1", 1, 0)]);
    check_inputs(&dag, 5, &[("REMOTE", 6, 0), ("REMOTE", 6, 1)]);

    let remote = dag.get(6).unwrap().remote.as_ref().unwrap();
    assert_eq!(remote.inner_nodes.len(), 3);
    let inner2 = remote.inner_nodes.iter().find(|n| n.id == 2).unwrap();
    assert_eq!(inner2.pre, ids(&[]));
    assert_eq!(inner2.succ, ids(&[3, 4]));
    let inputs: Vec<String> = inner2.input_edges.iter().map(EdgeDef::encode).collect();
    assert_eq!(inputs, vec!["REMOTE,6:0", "REMOTE,6:1"]);
    let inner3 = remote.inner_nodes.iter().find(|n| n.id == 3).unwrap();
    assert_eq!(inner3.pre, ids(&[2]));
    assert_eq!(inner3.succ, ids(&[]));
    assert_eq!(inner3.input_edges, vec![EdgeDef::new("2", 2, 0)]);
}

#[test]
fn fusion_rejects_path_through_outside() {
    let mut dag = build_dag();
    // {2, 5} has the path 2 -> 3 -> 5 running outside the subset.
    let rule = FusionRule {
        fusion_name: "X".to_string(),
        fusion_output_map: vec![FusionOutput::new("5", 5, 0, 0)],
    };
    assert!(matches!(
        dag.fusion_nodes(&ids(&[2, 5]), &rule),
        Err(ExecutionError::FusionWouldCycle(_))
    ));
}

#[test]
fn shard_remote_builds_split_replica_merge_scaffolding() {
    let mut dag = build_dag();
    let rule = FusionRule {
        fusion_name: REMOTE_OP.to_string(),
        fusion_output_map: vec![FusionOutput::new("2", 2, 0, 0)],
    };
    let fusion_id = dag.fusion_nodes(&ids(&[2]), &rule).unwrap();
    assert_eq!(fusion_id, 6);

    let shard_rule = ShardRule {
        split_op_info: vec![
            SplitOpInfo::new("split0", vec![0]),
            SplitOpInfo::new("split1", vec![1]),
        ],
        merge_op_info: vec![MergeOpInfo::new("merge0", MergeIdxSource::Split(0), vec![0])],
        split_num: 2,
    };
    dag.shard_remote(fusion_id, &shard_rule).unwrap();

    // Ids: splits 7/8, replicas 9/10, merge 11; the prototype is gone.
    assert!(dag.get(6).is_none());
    check_struct(&dag, 0, &[], &[7]);
    check_struct(&dag, 1, &[], &[8]);
    check_struct(&dag, 7, &[0], &[9, 10, 11]);
    check_struct(&dag, 8, &[1], &[9, 10]);
    check_struct(&dag, 9, &[7, 8], &[11]);
    check_struct(&dag, 10, &[7, 8], &[11]);
    check_struct(&dag, 11, &[7, 9, 10], &[3, 4]);
    check_struct(&dag, 3, &[11], &[5]);
    check_struct(&dag, 4, &[11], &[5]);

    check_inputs(&dag, 7, &[("0", 0, 0)]);
    check_inputs(&dag, 8, &[("1", 1, 0)]);
    check_inputs(&dag, 9, &[("split0", 7, 0), ("split1", 8, 0)]);
    check_inputs(&dag, 10, &[("split0", 7, 2), ("split1", 8, 2)]);
    check_inputs(
        &dag,
        11,
        &[
            ("REMOTE", 9, 0),
            ("split0", 7, 1),
            ("REMOTE", 10, 0),
            ("split0", 7, 3),
        ],
    );
    check_inputs(&dag, 3, &[("merge0", 11, 0)]);
    check_inputs(&dag, 4, &[("merge0", 11, 0)]);

    for replica in [9, 10] {
        let node = dag.get(replica).unwrap();
        let remote = node.remote.as_ref().unwrap();
        assert_eq!(remote.shard_idx, replica - 9);
        assert_eq!(remote.inner_nodes.len(), 1);
        assert_eq!(remote.inner_nodes[0].id, 2);
    }
}

#[test]
fn unique_and_gather_inserts_scaffolding() {
    let mut dag = build_dag();
    let rule = UniqueGatherRule {
        unique_op_info: vec![UniqueOpInfo {
            op_name: "ID_UNIQUE".to_string(),
            inputs_idx: vec![0],
        }],
        gather_op_info: vec![GatherOpInfo {
            op_name: "ID_GATHER".to_string(),
            unique_op_idx: 0,
            inputs_idx: vec![0],
        }],
    };
    dag.unique_and_gather(3, &rule).unwrap();

    // Unique id 6 sits between 2 and 3; gather id 7 between 3 and 5.
    check_struct(&dag, 6, &[2], &[3]);
    check_inputs(&dag, 6, &[("2", 2, 0)]);
    check_inputs(&dag, 3, &[("ID_UNIQUE", 6, 0)]);
    check_struct(&dag, 7, &[3, 6], &[5]);
    check_inputs(&dag, 7, &[("3", 3, 0), ("ID_UNIQUE", 6, 1)]);
    let node5 = dag.get(5).unwrap();
    assert_eq!(node5.input_edges[0], EdgeDef::new("ID_GATHER", 7, 0));
    assert_eq!(node5.input_edges[1], EdgeDef::new("4", 4, 0));
    assert!(dag.topological_sort().is_ok());
}

#[test]
fn to_proto_encodes_every_node_in_topological_order() {
    let dag = build_dag();
    let proto = dag.to_proto().unwrap();
    assert_eq!(proto.nodes.len(), 6);
    assert_eq!(proto.nodes[0].name, "0,0");
    assert_eq!(proto.nodes[2].op, "2");
    assert_eq!(proto.nodes[2].inputs, vec!["0,0:0", "1,1:0"]);
    assert_eq!(proto.nodes[5].inputs, vec!["3,3:0", "4,4:0"]);
}

/// gm:
///   0 1
///   |/
///   2
/// / | \
/// 3 4 3
/// \ | /
///   6
///
/// gp:
///   2
///   |\
///   3 4
///   |/
///   6
/// A layered random DAG: `names[i]` is node i's op name, and each node
/// may depend on any earlier node, so the graph is acyclic by
/// construction.
fn random_dag(names: &[u8], edges: &[(usize, usize)]) -> DagDef {
    let mut dag = DagDef::new();
    for name in names {
        let node = dag.produce_node(format!("op{name}"), 1);
        dag.add_node(node, &ids(&[]), &ids(&[])).unwrap();
    }
    for (from, to) in edges {
        let (from, to) = (*from % names.len(), *to % names.len());
        if from < to {
            dag.get_mut(from as i32).unwrap().succ.insert(to as i32);
            dag.get_mut(to as i32).unwrap().pre.insert(from as i32);
        }
    }
    dag
}

proptest! {
    /// Every returned embedding is a monomorphism and no host node is
    /// shared between embeddings.
    #[test]
    fn matcher_is_sound_and_disjoint(
        host_names in proptest::collection::vec(0u8..3, 2..12),
        host_edges in proptest::collection::vec((0usize..12, 0usize..12), 0..20),
        pattern_names in proptest::collection::vec(0u8..3, 1..4),
        pattern_edges in proptest::collection::vec((0usize..4, 0usize..4), 0..4),
    ) {
        let host = random_dag(&host_names, &host_edges);
        let pattern = random_dag(&pattern_names, &pattern_edges);
        let matches = sub_graph_match(&host, &pattern, &ExtraConds::new());

        let mut used_hosts = BTreeSet::new();
        for mapping in &matches {
            prop_assert_eq!(mapping.len(), pattern.len());
            for (p, m) in mapping {
                let p_node = pattern.get(*p).unwrap();
                let m_node = host.get(*m).unwrap();
                prop_assert_eq!(&p_node.name, &m_node.name);
                for p_succ in &p_node.succ {
                    prop_assert!(m_node.succ.contains(&mapping[p_succ]));
                }
                prop_assert!(used_hosts.insert(*m));
            }
        }
    }
}

#[test]
fn sub_graph_match_finds_monomorphism() {
    let mut gm = DagDef::new();
    for name in ["0", "1", "2", "3", "4", "3", "6"] {
        let node = gm.produce_node(name, 1);
        gm.add_node(node, &ids(&[]), &ids(&[])).unwrap();
    }
    for (node, pre) in [(2, vec![0, 1]), (3, vec![2]), (4, vec![2]), (5, vec![2])] {
        for p in pre {
            gm.get_mut(node).unwrap().pre.insert(p);
            gm.get_mut(p).unwrap().succ.insert(node);
        }
    }
    for p in [3, 4, 5] {
        gm.get_mut(6).unwrap().pre.insert(p);
        gm.get_mut(p).unwrap().succ.insert(6);
    }

    let mut gp = DagDef::new();
    for name in ["2", "3", "4", "6"] {
        let node = gp.produce_node(name, 1);
        gp.add_node(node, &ids(&[]), &ids(&[])).unwrap();
    }
    for (node, pre) in [(1, vec![0]), (2, vec![0]), (3, vec![1, 2])] {
        for p in pre {
            gp.get_mut(node).unwrap().pre.insert(p);
            gp.get_mut(p).unwrap().succ.insert(node);
        }
    }

    let matches = sub_graph_match(&gm, &gp, &ExtraConds::new());
    assert!(!matches.is_empty());
    let mut seen_hosts = BTreeSet::new();
    for mapping in &matches {
        assert_eq!(mapping[&0], 2);
        assert!(mapping[&1] == 3 || mapping[&1] == 5);
        assert_eq!(mapping[&2], 4);
        assert_eq!(mapping[&3], 6);
        // Monomorphism: every pattern edge maps onto a host edge.
        for (p, m) in mapping {
            let p_node = gp.get(*p).unwrap();
            let m_node = gm.get(*m).unwrap();
            for p_succ in &p_node.succ {
                assert!(m_node.succ.contains(&mapping[p_succ]));
            }
            // Disjoint embeddings never reuse a host node.
            assert!(seen_hosts.insert(*m));
        }
    }
}
