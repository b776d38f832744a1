//! Built-in op kernels and their registration hook.

pub(crate) mod api;
mod common;
mod layer;
mod merge;
mod remote;
mod split;
mod unique;
pub mod util;

use std::sync::Arc;
use std::sync::Once;

use crate::op_kernel::registry;

/// Registers every built-in kernel. Safe to call more than once; the
/// registry keeps the first registration.
pub fn register_builtin() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        registry::register("AS", Arc::new(common::As));
        registry::register("POST_PROCESS", Arc::new(common::PostProcess));

        registry::register("BROAD_CAST_SPLIT", Arc::new(split::BroadcastSplit));
        registry::register("GP_BROAD_CAST_SPLIT", Arc::new(split::BroadcastSplit));
        registry::register(
            "SAMPLE_NODE_SPLIT",
            Arc::new(split::SampleCountSplit { edges: false }),
        );
        registry::register(
            "SAMPLE_EDGE_SPLIT",
            Arc::new(split::SampleCountSplit { edges: true }),
        );
        registry::register("ID_SPLIT", Arc::new(split::IdSplit));

        registry::register("GP_APPEND_MERGE", Arc::new(merge::AppendMerge));
        registry::register("APPEND_MERGE", Arc::new(merge::AppendMerge));
        registry::register("GP_UNIQUE_MERGE", Arc::new(merge::UniqueMerge));
        registry::register("GP_IDX_MERGE", Arc::new(merge::IdxMerge));
        registry::register("GP_DATA_MERGE", Arc::new(merge::DataMerge));
        registry::register("GP_REGULAR_DATA_MERGE", Arc::new(merge::RegularDataMerge));

        registry::register("ID_UNIQUE", Arc::new(unique::IdUnique));
        registry::register("ID_GATHER", Arc::new(unique::IdGather));

        registry::register_async("REMOTE", Arc::new(remote::Remote));

        registry::register("API_SAMPLE_NODE", Arc::new(api::SampleNode));
        registry::register("API_SAMPLE_EDGE", Arc::new(api::SampleEdge));
        registry::register("API_GET_NODE", Arc::new(api::GetNode));
        registry::register("API_GET_EDGE", Arc::new(api::GetEdge));
        registry::register("API_GET_NODE_T", Arc::new(api::GetNodeType));
        registry::register("API_GET_P", Arc::new(api::GetFeature));
        registry::register("API_SAMPLE_NB", Arc::new(api::SampleNeighbors));
        registry::register("API_GET_NB_NODE", Arc::new(api::GetNeighbors { reverse: false }));
        registry::register("API_GET_RNB_NODE", Arc::new(api::GetNeighbors { reverse: true }));
        registry::register("API_GET_NB_EDGE", Arc::new(api::GetNeighborEdges));
        registry::register("API_GET_NB_FILTER", Arc::new(api::NeighborFilter));

        registry::register("API_RESHAPE", Arc::new(layer::Reshape));
        registry::register("API_GET_EDGE_SUM_WEIGHT", Arc::new(layer::EdgeSumWeight));
        registry::register("API_SAMPLE_ROOT", Arc::new(layer::SampleRoot));
        registry::register("API_SAMPLE_L", Arc::new(layer::SampleLayer));
        registry::register("API_LOCAL_SAMPLE_L", Arc::new(layer::LocalSampleLayer));
        registry::register("API_SPARSE_GEN_ADJ", Arc::new(layer::SparseGenAdj));
        registry::register("API_SPARSE_GET_ADJ", Arc::new(layer::SparseGetAdj));
        registry::register("API_GATHER_RESULT", Arc::new(layer::GatherResult));
    });
}
