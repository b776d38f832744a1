//! Pass 2 of translation: walk the grammar tree in post-order and emit one
//! logical node per API step, plus AS, POST_PROCESS and the expanded
//! subgraphs for neighbour filtering and layer sampling.

use std::collections::{BTreeSet, HashMap, HashSet};

use euler_core::dag_def::{AttrDef, CondAttr, DagDef, EdgeDef, NodeDef, UdfDef};
use euler_types::tracing::info;

use crate::errors::CompileError;
use crate::gen_io;
use crate::tree::{NodeId, Tree, TreeNode};

/// Run mode, which doubles as the optimiser environment the translator
/// plans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Distribute,
    GraphPartition,
}

/// Which fields carry which index, parsed from the cluster's `index_info`
/// meta (`"att:hash_range_index,price:range_index"`). Neighbour-indexed
/// fields can be filtered during the neighbour read itself.
#[derive(Debug, Clone, Default)]
pub struct IndexInfo {
    neighbour_indexed: HashSet<String>,
    global_indexed: HashSet<String>,
}

impl IndexInfo {
    pub fn parse(spec: &str) -> Self {
        let mut info = Self::default();
        for entry in spec.split(',') {
            let Some((field, kind)) = entry.split_once(':') else {
                continue;
            };
            match kind.trim() {
                "hash_range_index" => {
                    info.neighbour_indexed.insert(field.trim().to_string());
                }
                _ => {
                    info.global_indexed.insert(field.trim().to_string());
                }
            }
        }
        info
    }

    pub fn is_neighbour_indexed(&self, field: &str) -> bool {
        self.neighbour_indexed.contains(field)
    }
}

pub struct Translator {
    mode: Mode,
    index: IndexInfo,
}

type AsTable = HashMap<String, i32>;

impl Translator {
    pub fn new(mode: Mode, index: IndexInfo) -> Self {
        Self { mode, index }
    }

    pub fn translate(&self, tree: &Tree, dag: &mut DagDef) -> Result<(), CompileError> {
        let mut as_table = AsTable::new();
        let mut default_pre = -1;
        for id in tree.post_order() {
            let node = tree.get(id);
            if !node.node_type.starts_with("API_") {
                continue;
            }
            default_pre = match node.node_type.as_str() {
                "API_SAMPLE_LNB" => self.layer_sampler_builder(tree, id, default_pre, dag, &mut as_table)?,
                "API_GET_NB_NODE" => self.get_nb_builder(tree, id, default_pre, dag, &mut as_table)?,
                "API_SAMPLE_NB" => self.sample_nb_builder(tree, id, default_pre, dag, &mut as_table)?,
                _ => self.single_node_builder(tree, id, default_pre, dag, &mut as_table)?,
            };
        }
        Ok(())
    }

    /// Fills alias, plain/UDF parameters and the condition attribute from
    /// the tree node's computed properties.
    fn fill_node(&self, tree_node: &TreeNode, node: &mut NodeDef) {
        node.op_alias = tree_node.op_alias.clone();
        let mut udf: Option<UdfDef> = None;
        let mut in_num_params = false;
        for token in &tree_node.prop.values {
            if token.starts_with("udf_") {
                udf = Some(UdfDef {
                    name: token.clone(),
                    ..Default::default()
                });
            } else if let Some(udf) = udf.as_mut() {
                match token.as_str() {
                    "[" => in_num_params = true,
                    "]" => in_num_params = false,
                    value => {
                        if in_num_params {
                            udf.num_params.push(value.to_string());
                        } else {
                            udf.str_params.push(value.to_string());
                        }
                    }
                }
            } else {
                node.attrs.push(AttrDef::Norm(token.clone()));
            }
        }
        node.udf = udf;
        if !tree_node.prop.dnf.is_empty() || !tree_node.prop.post_process.is_empty() {
            node.attrs.push(AttrDef::Cond(CondAttr {
                dnf: tree_node.prop.dnf.clone(),
                post_process: tree_node.prop.post_process.clone(),
            }));
        }
    }

    /// The predecessor the step chains from: a SELECT alias when present,
    /// the previous step otherwise.
    fn pre_node<'a>(
        &self,
        tree_node: &TreeNode,
        dag: &'a DagDef,
        as_table: &AsTable,
        default_pre: i32,
    ) -> Result<Option<&'a NodeDef>, CompileError> {
        if let Some(alias) = &tree_node.select {
            let id = as_table
                .get(alias)
                .copied()
                .ok_or_else(|| CompileError::UnknownAlias(alias.clone()))?;
            return Ok(dag.get(id));
        }
        if default_pre < 0 {
            return Ok(None);
        }
        Ok(dag.get(default_pre))
    }

    fn add_as_node(
        &self,
        producer_id: i32,
        dag: &mut DagDef,
        as_table: &mut AsTable,
    ) -> Result<(), CompileError> {
        let producer = dag
            .get(producer_id)
            .ok_or(euler_core::ExecutionError::NodeNotFound(producer_id))?;
        let alias = producer.op_alias.clone();
        let output_num = producer.output_num;
        let producer_name = producer.name.clone();
        let mut as_node = dag.produce_node("AS", output_num);
        as_node.op_alias = alias.clone();
        for slot in 0..output_num {
            as_node
                .input_edges
                .push(EdgeDef::new(producer_name.clone(), producer_id, slot));
        }
        let pre: BTreeSet<i32> = [producer_id].into();
        dag.add_node(as_node, &pre, &BTreeSet::new())
            .map_err(CompileError::Execution)?;
        dag.get_mut(producer_id)
            .ok_or(euler_core::ExecutionError::NodeNotFound(producer_id))?
            .op_alias
            .clear();
        // SELECT resolves to the producer, not the AS node.
        as_table.insert(alias, producer_id);
        Ok(())
    }

    /// Splits trailing post-process commands into an explicit POST_PROCESS
    /// node. `order_by weight` needs a producer that emits weights.
    fn add_post_process_node(
        &self,
        producer_id: i32,
        dag: &mut DagDef,
    ) -> Result<Option<i32>, CompileError> {
        let producer = dag
            .get(producer_id)
            .ok_or(euler_core::ExecutionError::NodeNotFound(producer_id))?;
        let Some(cond) = producer.cond() else {
            return Ok(None);
        };
        if cond.post_process.is_empty() {
            return Ok(None);
        }
        for command in &cond.post_process {
            let mut parts = command.split_whitespace();
            if parts.next() == Some("order_by")
                && parts.next() == Some("weight")
                && producer.name != "API_GET_NODE_WITH_WEIGHT"
                && producer.name != "API_GET_EDGE_WITH_WEIGHT"
            {
                return Err(CompileError::OrderByWeightUnsupported(producer.name.clone()));
            }
        }
        let post_process = cond.post_process.clone();
        let producer_name = producer.name.clone();
        let producer_alias = producer.op_alias.clone();
        let output_num = producer.output_num;

        let mut pp_node = dag.produce_node("POST_PROCESS", output_num);
        pp_node.op_alias = producer_alias;
        for slot in 0..output_num {
            pp_node
                .input_edges
                .push(EdgeDef::new(producer_name.clone(), producer_id, slot));
        }
        pp_node.attrs.push(AttrDef::Cond(CondAttr {
            dnf: Vec::new(),
            post_process,
        }));
        let pp_id = pp_node.id;
        let pre: BTreeSet<i32> = [producer_id].into();
        dag.add_node(pp_node, &pre, &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        // The commands now live on the POST_PROCESS node alone.
        let producer = dag.get_mut(producer_id).expect("producer exists");
        producer.op_alias.clear();
        for attr in &mut producer.attrs {
            if let AttrDef::Cond(cond) = attr {
                cond.post_process.clear();
            }
        }
        Ok(Some(pp_id))
    }

    fn single_node_builder(
        &self,
        tree: &Tree,
        id: NodeId,
        default_pre: i32,
        dag: &mut DagDef,
        as_table: &mut AsTable,
    ) -> Result<i32, CompileError> {
        let tree_node = tree.get(id);
        let op = tree_node.node_type.clone();
        let mut node = dag.produce_node(&op, 0);
        self.fill_node(tree_node, &mut node);
        let pre_node = self.pre_node(tree_node, dag, as_table, default_pre)?;
        let pre_ids: BTreeSet<i32> = pre_node.iter().map(|p| p.id).collect();
        gen_io::gen_inputs(&op, pre_node, &mut node);
        node.output_num = gen_io::output_num(&op, &node);
        let node_id = node.id;
        dag.add_node(node, &pre_ids, &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        let mut result_id = node_id;
        if self.mode != Mode::Local && (op == "API_GET_NODE" || op == "API_GET_EDGE") {
            if let Some(pp_id) = self.add_post_process_node(node_id, dag)? {
                result_id = pp_id;
            }
        }
        let alias = dag.get(result_id).map(|n| n.op_alias.clone()).unwrap_or_default();
        if !alias.is_empty() {
            self.add_as_node(result_id, dag, as_table)?;
        }
        Ok(result_id)
    }

    fn filter_index_counts(&self, tree_node: &TreeNode) -> (usize, usize) {
        let mut nb_indexed = 0;
        let mut global = 0;
        for conjunction in &tree_node.prop.dnf {
            for term in conjunction {
                let field = term.split_whitespace().next().unwrap_or_default();
                if self.index.is_neighbour_indexed(field) {
                    nb_indexed += 1;
                } else {
                    global += 1;
                }
            }
        }
        (nb_indexed, global)
    }

    /// Neighbour reads with non-neighbour-indexed predicates cost an extra
    /// round trip: raw neighbour read, id filter, then adjacency rebuild.
    fn get_nb_builder(
        &self,
        tree: &Tree,
        id: NodeId,
        default_pre: i32,
        dag: &mut DagDef,
        as_table: &mut AsTable,
    ) -> Result<i32, CompileError> {
        let tree_node = tree.get(id);
        let (nb_indexed, global) = self.filter_index_counts(tree_node);
        if nb_indexed != 0 && global != 0 {
            return Err(CompileError::MixedIndexFilter);
        }
        if self.mode == Mode::Local || global == 0 {
            return self.single_node_builder(tree, id, default_pre, dag, as_table);
        }
        info!("global-index neighbour filter costs an extra round trip");

        // Raw neighbour read without condition.
        let mut nb_node = dag.produce_node("API_GET_NB_NODE", 4);
        for token in &tree_node.prop.values {
            nb_node.attrs.push(AttrDef::Norm(token.clone()));
        }
        let pre_node = self.pre_node(tree_node, dag, as_table, default_pre)?;
        let pre_ids: BTreeSet<i32> = pre_node.iter().map(|p| p.id).collect();
        gen_io::gen_inputs("API_GET_NB_NODE", pre_node, &mut nb_node);
        let nb_id = nb_node.id;
        dag.add_node(nb_node, &pre_ids, &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        // Filter the neighbour ids through the global index.
        let mut filter_node = dag.produce_node("API_GET_NODE", 1);
        filter_node.attrs.push(AttrDef::Cond(CondAttr {
            dnf: tree_node.prop.dnf.clone(),
            post_process: Vec::new(),
        }));
        filter_node
            .input_edges
            .push(EdgeDef::new("API_GET_NB_NODE", nb_id, 1));
        let filter_id = filter_node.id;
        dag.add_node(filter_node, &[nb_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        // Rebuild the adjacency from the surviving ids.
        let mut rebuild = dag.produce_node("API_GET_NB_FILTER", 4);
        rebuild.attrs.push(AttrDef::Cond(CondAttr {
            dnf: Vec::new(),
            post_process: tree_node.prop.post_process.clone(),
        }));
        for slot in 0..4 {
            rebuild
                .input_edges
                .push(EdgeDef::new("API_GET_NB_NODE", nb_id, slot));
        }
        rebuild
            .input_edges
            .push(EdgeDef::new("API_GET_NODE", filter_id, 0));
        rebuild.op_alias = tree_node.op_alias.clone();
        let rebuild_id = rebuild.id;
        dag.add_node(rebuild, &[nb_id, filter_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        if !tree_node.op_alias.is_empty() {
            self.add_as_node(rebuild_id, dag, as_table)?;
        }
        Ok(rebuild_id)
    }

    fn sample_nb_builder(
        &self,
        tree: &Tree,
        id: NodeId,
        default_pre: i32,
        dag: &mut DagDef,
        as_table: &mut AsTable,
    ) -> Result<i32, CompileError> {
        let (_, global) = self.filter_index_counts(tree.get(id));
        if global != 0 {
            return Err(CompileError::NeighborIndexOnly);
        }
        self.single_node_builder(tree, id, default_pre, dag, as_table)
    }

    /// The slot a layer sampler chains from depends on the predecessor's
    /// output layout.
    fn chain_slot(pre: &NodeDef) -> i32 {
        match pre.name.as_str() {
            "API_GATHER_RESULT" => 4,
            "API_GET_NODE" | "API_SAMPLE_NODE" => 0,
            _ => 1,
        }
    }

    fn layer_sampler_builder(
        &self,
        tree: &Tree,
        id: NodeId,
        default_pre: i32,
        dag: &mut DagDef,
        as_table: &mut AsTable,
    ) -> Result<i32, CompileError> {
        let tree_node = tree.get(id);
        let params = &tree_node.prop.values;
        let (edge_types, n, m, weight_func, default_node) = match params.as_slice() {
            [edge_types, n, m, default_node] => {
                (edge_types.clone(), n.clone(), m.clone(), None, default_node.clone())
            }
            [edge_types, n, m, weight_func, default_node] => (
                edge_types.clone(),
                n.clone(),
                m.clone(),
                Some(weight_func.clone()),
                default_node.clone(),
            ),
            _ => {
                return Err(CompileError::BadArity {
                    step: "sampleLNB".to_string(),
                    expected: "edge_types, n, m, [weight_func], default_node".to_string(),
                    actual: params.len(),
                })
            }
        };

        let pre_node = self.pre_node(tree_node, dag, as_table, default_pre)?;
        let (pre_id, pre_name, pre_slot) = match pre_node {
            Some(pre) => (pre.id, pre.name.clone(), Self::chain_slot(pre)),
            None => {
                return Err(CompileError::Parse {
                    offset: 0,
                    message: "sampleLNB needs a preceding step".to_string(),
                })
            }
        };

        // Stage one: roots plus the layer to draw adjacency from.
        let (roots_id, roots_name, layer_id, layer_name) = match weight_func {
            None => {
                let mut sum_node = dag.produce_node("API_GET_EDGE_SUM_WEIGHT", 2);
                sum_node.attrs.push(AttrDef::Norm(edge_types.clone()));
                sum_node
                    .input_edges
                    .push(EdgeDef::new(pre_name.clone(), pre_id, pre_slot));
                let sum_id = sum_node.id;
                dag.add_node(sum_node, &[pre_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;

                let mut root_node = dag.produce_node("API_SAMPLE_ROOT", 1);
                root_node
                    .input_edges
                    .push(EdgeDef::new("API_GET_EDGE_SUM_WEIGHT", sum_id, 0));
                root_node
                    .input_edges
                    .push(EdgeDef::new("API_GET_EDGE_SUM_WEIGHT", sum_id, 1));
                root_node.attrs.push(AttrDef::Norm(n.clone()));
                root_node.attrs.push(AttrDef::Norm(m.clone()));
                root_node.attrs.push(AttrDef::Norm(default_node.clone()));
                let root_id = root_node.id;
                dag.add_node(root_node, &[sum_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;

                let mut layer_node = dag.produce_node("API_SAMPLE_L", 3);
                layer_node.attrs.push(AttrDef::Norm(edge_types.clone()));
                layer_node.attrs.push(AttrDef::Norm(default_node.clone()));
                layer_node
                    .input_edges
                    .push(EdgeDef::new("API_SAMPLE_ROOT", root_id, 0));
                let layer_id = layer_node.id;
                dag.add_node(layer_node, &[root_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;
                (sum_id, "API_GET_EDGE_SUM_WEIGHT", layer_id, "API_SAMPLE_L")
            }
            Some(weight_func) => {
                let mut reshape = dag.produce_node("API_RESHAPE", 1);
                reshape.attrs.push(AttrDef::Norm("?,1".to_string()));
                reshape
                    .input_edges
                    .push(EdgeDef::new(pre_name.clone(), pre_id, pre_slot));
                let reshape_id = reshape.id;
                dag.add_node(reshape, &[pre_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;

                let mut nb_node = dag.produce_node("API_GET_NB_NODE", 4);
                nb_node.attrs.push(AttrDef::Norm(edge_types.clone()));
                nb_node
                    .input_edges
                    .push(EdgeDef::new(pre_name.clone(), pre_id, pre_slot));
                let nb_id = nb_node.id;
                dag.add_node(nb_node, &[pre_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;

                let mut layer_node = dag.produce_node("API_LOCAL_SAMPLE_L", 3);
                layer_node.attrs.push(AttrDef::Norm(n.clone()));
                layer_node.attrs.push(AttrDef::Norm(m.clone()));
                layer_node.attrs.push(AttrDef::Norm(weight_func));
                layer_node.attrs.push(AttrDef::Norm(default_node.clone()));
                for slot in 0..4 {
                    layer_node
                        .input_edges
                        .push(EdgeDef::new("API_GET_NB_NODE", nb_id, slot));
                }
                let layer_id = layer_node.id;
                dag.add_node(layer_node, &[nb_id].into(), &BTreeSet::new())
                    .map_err(CompileError::Execution)?;
                (reshape_id, "API_RESHAPE", layer_id, "API_LOCAL_SAMPLE_L")
            }
        };

        // Stage two: adjacency inside the layer, then the gathered block.
        let mut gen_adj = dag.produce_node("API_SPARSE_GEN_ADJ", 2);
        gen_adj.attrs.push(AttrDef::Norm(n.clone()));
        gen_adj
            .input_edges
            .push(EdgeDef::new(roots_name, roots_id, 0));
        gen_adj
            .input_edges
            .push(EdgeDef::new(layer_name, layer_id, 0));
        let gen_adj_id = gen_adj.id;
        dag.add_node(gen_adj, &[roots_id, layer_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        let mut get_adj = dag.produce_node("API_SPARSE_GET_ADJ", 2);
        get_adj.attrs.push(AttrDef::Norm(edge_types));
        get_adj.attrs.push(AttrDef::Norm(m));
        get_adj
            .input_edges
            .push(EdgeDef::new("API_SPARSE_GEN_ADJ", gen_adj_id, 0));
        get_adj
            .input_edges
            .push(EdgeDef::new("API_SPARSE_GEN_ADJ", gen_adj_id, 1));
        let get_adj_id = get_adj.id;
        dag.add_node(get_adj, &[gen_adj_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        let mut gather = dag.produce_node("API_GATHER_RESULT", 5);
        gather
            .input_edges
            .push(EdgeDef::new("API_SPARSE_GET_ADJ", get_adj_id, 0));
        gather
            .input_edges
            .push(EdgeDef::new("API_SPARSE_GET_ADJ", get_adj_id, 1));
        gather
            .input_edges
            .push(EdgeDef::new(layer_name, layer_id, 0));
        gather.op_alias = tree_node.op_alias.clone();
        let gather_id = gather.id;
        dag.add_node(gather, &[get_adj_id, layer_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        if !tree_node.op_alias.is_empty() {
            self.add_as_node(gather_id, dag, as_table)?;
        }
        Ok(gather_id)
    }
}
