//! Query compiler: text → tree → logical DAG → optimised execution DAG,
//! memoised by query text for the life of the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use euler_core::dag_def::{AttrDef, DagDef, EdgeDef};
use euler_core::Dag;
use euler_types::parking_lot::RwLock;
use euler_types::tracing::info;

use crate::attrs;
use crate::errors::CompileError;
use crate::optimizer::Optimizer;
use crate::translator::{IndexInfo, Mode, Translator};
use crate::tree::build_grammar_tree;

pub struct Compiler {
    translator: Translator,
    optimizer: Optimizer,
    cache: RwLock<HashMap<String, Arc<Dag>>>,
}

impl Compiler {
    pub fn new(shard_num: i32, mode: Mode, index_info: &str) -> Self {
        euler_core::kernels::register_builtin();
        Self {
            translator: Translator::new(mode, IndexInfo::parse(index_info)),
            optimizer: Optimizer::new(mode, shard_num),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compiles without caching; mainly for inspection and tests.
    pub fn compile_to_dag_def(&self, query: &str, optimize: bool) -> Result<DagDef, CompileError> {
        let mut tree = build_grammar_tree(query)?;
        attrs::calculate(&mut tree);
        let mut dag = DagDef::new();
        self.translator.translate(&tree, &mut dag)?;
        if optimize {
            self.optimizer.optimize(&mut dag)?;
        }
        Ok(dag)
    }

    /// Compiles one query into an immutable execution DAG, hitting the
    /// cache when the text was seen before.
    pub fn compile(&self, query: &str) -> Result<Arc<Dag>, CompileError> {
        if let Some(hit) = self.cache.read().get(query) {
            return Ok(hit.clone());
        }
        let mut cache = self.cache.write();
        if let Some(hit) = cache.get(query) {
            return Ok(hit.clone());
        }
        info!(query, "compiling");
        let dag_def = self.compile_to_dag_def(query, true)?;
        let dag = Arc::new(Dag::from_proto(&dag_def.to_proto()?)?);
        cache.insert(query.to_string(), dag.clone());
        Ok(dag)
    }

    /// Convenience path: a single op plus an AS node, keyed by op, inputs
    /// and attribute names.
    pub fn op_to_dag(
        &self,
        op_name: &str,
        alias: &str,
        output_num: i32,
        input_names: &[&str],
        attr_names: &[&str],
    ) -> Result<Arc<Dag>, CompileError> {
        let mut key = op_name.to_string();
        for name in input_names.iter().chain(attr_names) {
            key.push(' ');
            key.push_str(name);
        }
        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(hit.clone());
        }
        let mut cache = self.cache.write();
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        info!(op = op_name, "compiling single op");

        let mut dag_def = DagDef::new();
        let mut node = dag_def.produce_node(op_name, output_num);
        for name in input_names {
            node.input_edges.push(EdgeDef::external(*name));
        }
        for name in attr_names {
            node.attrs.push(AttrDef::Norm((*name).to_string()));
        }
        let node_id = node.id;
        let node_name = node.name.clone();
        dag_def
            .add_node(node, &BTreeSet::new(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        let mut as_node = dag_def.produce_node("AS", output_num);
        as_node.op_alias = alias.to_string();
        for slot in 0..output_num {
            as_node
                .input_edges
                .push(EdgeDef::new(node_name.clone(), node_id, slot));
        }
        dag_def
            .add_node(as_node, &[node_id].into(), &BTreeSet::new())
            .map_err(CompileError::Execution)?;

        self.optimizer.optimize(&mut dag_def)?;
        let dag = Arc::new(Dag::from_proto(&dag_def.to_proto()?)?);
        cache.insert(key, dag.clone());
        Ok(dag)
    }
}
