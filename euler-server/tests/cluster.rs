//! In-process cluster scenarios: real tonic transport over loopback, one
//! `MemGraph` per shard, membership through the in-process monitor.

use std::sync::Arc;

use euler_client::{Graph, ServerMonitor, SimpleServerMonitor};
use euler_core::graph::MemGraph;
use euler_core::{Dag, Executor, OpKernelContext, RuntimeEnv};
use euler_server::spawn_local_shard;
use euler_types::grpc::{DagNodeProto, DagProto, ExecuteRequest};
use euler_types::models::{ClientOptions, RunMode, ServerOptions};
use euler_types::tensor::Tensor;

use euler_client::Meta;

fn shard_graph(ids: &[u64]) -> Arc<MemGraph> {
    let nodes: Vec<String> = ids
        .iter()
        .map(|id| {
            format!(
                r#"{{"id": {id}, "type": {}, "weight": 1.0, "features": {{"fid": [{}.0]}}}}"#,
                id % 2,
                id * 10
            )
        })
        .collect();
    let edges: Vec<String> = ids
        .iter()
        .zip(ids.iter().cycle().skip(1))
        .map(|(src, dst)| format!(r#"{{"src": {src}, "dst": {dst}, "type": 0, "weight": 1.0}}"#))
        .collect();
    let spec = format!(
        r#"{{"labels": ["train"], "nodes": [{}], "edges": [{}]}}"#,
        nodes.join(","),
        edges.join(",")
    );
    Arc::new(MemGraph::from_json(&spec).unwrap())
}

fn global_meta(num_shards: usize) -> Meta {
    Meta::from([
        ("num_shards".to_string(), num_shards.to_string()),
        ("index_info".to_string(), "price:range_index".to_string()),
    ])
}

async fn start_cluster(
    shards: Vec<Arc<MemGraph>>,
) -> (Arc<SimpleServerMonitor>, usize) {
    let monitor = SimpleServerMonitor::new();
    let num_shards = shards.len();
    for (shard_idx, graph) in shards.into_iter().enumerate() {
        let options = ServerOptions {
            shard_idx,
            ..ServerOptions::default()
        };
        spawn_local_shard(
            options,
            graph,
            "price:range_index",
            monitor.clone(),
            global_meta(num_shards),
        )
        .await
        .unwrap();
    }
    (monitor, num_shards)
}

fn client_options(num_shards: usize) -> ClientOptions {
    ClientOptions {
        mode: RunMode::Remote,
        shard_num: num_shards,
        num_retries: 3,
        ..ClientOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_shard_sample_returns_requested_count() {
    let (monitor, num_shards) = start_cluster(vec![shard_graph(&[1, 2, 3, 4])]).await;
    let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
    let graph = Graph::connect(
        dyn_monitor,
        &client_options(num_shards),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let result = graph
        .run(
            "sampleN(n_types, cnt).as(n)",
            vec![
                ("n_types".to_string(), Tensor::from_vec(vec![1], vec![1i32])),
                ("cnt".to_string(), Tensor::scalar(10i32)),
            ],
        )
        .await
        .unwrap();

    let sampled = result.get("n", 0).expect("sampled ids");
    let ids = sampled.values::<u64>().unwrap();
    assert_eq!(ids.len(), 10);
    // Type-1 nodes in the fixture are the odd ids.
    assert!(ids.iter().all(|id| id % 2 == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sharded_type_read_stitches_rows_back() {
    let (monitor, num_shards) =
        start_cluster(vec![shard_graph(&[1, 4, 5]), shard_graph(&[2, 3, 6])]).await;
    let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
    let graph = Graph::connect(
        dyn_monitor,
        &client_options(num_shards),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let result = graph
        .run(
            "v(nodes).as(n).label().as(l)",
            vec![(
                "nodes".to_string(),
                Tensor::from_vec(vec![4], vec![1u64, 2, 5, 6]),
            )],
        )
        .await
        .unwrap();

    // The id read unions per-shard answers in shard order.
    let ids = result.get("n", 0).expect("ids");
    assert_eq!(ids.values::<u64>().unwrap(), &[1, 5, 2, 6]);
    // Node type is id % 2, regardless of which shard answered.
    let types = result.get("l", 0).expect("types");
    assert_eq!(types.values::<i32>().unwrap(), &[1, 1, 0, 0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sharded_feature_read_pairs_index_and_values() {
    let (monitor, num_shards) =
        start_cluster(vec![shard_graph(&[1, 4, 5]), shard_graph(&[2, 3, 6])]).await;
    let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
    let graph = Graph::connect(
        dyn_monitor,
        &client_options(num_shards),
        tokio::runtime::Handle::current(),
    )
    .unwrap();

    let result = graph
        .run(
            "v(nodes).as(n).values(fid).as(f)",
            vec![(
                "nodes".to_string(),
                Tensor::from_vec(vec![3], vec![1u64, 2, 3]),
            )],
        )
        .await
        .unwrap();

    let index = result.get("f", 0).expect("segments");
    let values = result.get("f", 1).expect("values");
    assert_eq!(index.values::<i32>().unwrap(), &[0, 1, 1, 2, 2, 3]);
    assert_eq!(values.values::<f32>().unwrap(), &[10.0, 20.0, 30.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_round_trips() {
    let (monitor, num_shards) = start_cluster(vec![shard_graph(&[1, 2])]).await;
    let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
    let options = client_options(num_shards);
    let client =
        euler_client::RpcClient::connect(dyn_monitor, 0, &options).unwrap();
    let reply = client.ping("hello").await.unwrap();
    assert_eq!(reply.content, "Pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_requested_output_is_internal() {
    euler_core::kernels::register_builtin();
    let env = RuntimeEnv::builder(tokio::runtime::Handle::current())
        .graph(shard_graph(&[1, 2]))
        .build();
    let request = ExecuteRequest {
        inputs: vec![Tensor::from_vec(vec![1], vec![1u64]).encode("seed")],
        graph: Some(DagProto {
            nodes: vec![DagNodeProto {
                name: "AS,0".to_string(),
                op: "AS".to_string(),
                inputs: vec!["seed".to_string()],
                output_num: 1,
                ..Default::default()
            }],
            ..Default::default()
        }),
        outputs: vec!["AS,0:7".to_string()],
    };
    let err = euler_server::WorkerService::execute_request(env, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), euler_types::tonic::Code::Internal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_mode_runs_the_layer_sampler() {
    euler_core::kernels::register_builtin();
    let graph = Graph::local(
        shard_graph(&[1, 2, 3, 4]),
        "price:range_index",
        tokio::runtime::Handle::current(),
    );
    let result = graph
        .run(
            "v(nodes).sampleLNB(etypes, n, m, 0).as(layer)",
            vec![
                (
                    "nodes".to_string(),
                    Tensor::from_vec(vec![4], vec![1u64, 2, 3, 4]),
                ),
                ("etypes".to_string(), Tensor::from_vec(vec![1], vec![0i32])),
                ("n".to_string(), Tensor::scalar(3i32)),
                ("m".to_string(), Tensor::scalar(2i32)),
            ],
        )
        .await
        .unwrap();

    // Five-slot gather block: adjacency idx, adjacency ids, weights,
    // types, and the sampled layer.
    for slot in 0..5 {
        assert!(result.get("layer", slot).is_some(), "missing slot {slot}");
    }
    let adjacency = result.get("layer", 0).unwrap();
    assert_eq!(adjacency.shape().dims()[1], 2);
}

#[test]
fn server_loads_its_graph_from_the_data_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.json");
    std::fs::write(
        &path,
        r#"{"nodes": [{"id": 1}, {"id": 2}], "edges": [{"src": 1, "dst": 2}]}"#,
    )
    .unwrap();
    let options = ServerOptions {
        data_path: Some(path.to_string_lossy().into_owned()),
        ..ServerOptions::default()
    };
    let server = euler_server::EulerServer::from_data_path(options, "").unwrap();
    let env = server.runtime_env();
    assert!(env.graph().is_ok());

    let missing = ServerOptions::default();
    assert!(euler_server::EulerServer::from_data_path(missing, "").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_executes_a_dag_in_process() {
    euler_core::kernels::register_builtin();
    let env = RuntimeEnv::builder(tokio::runtime::Handle::current())
        .graph(shard_graph(&[7, 8]))
        .build();
    let ctx = Arc::new(OpKernelContext::new());
    ctx.put("nodes", Tensor::from_vec(vec![2], vec![7u64, 8]))
        .unwrap();
    let proto = DagProto {
        nodes: vec![DagNodeProto {
            name: "API_GET_NODE_T,0".to_string(),
            op: "API_GET_NODE_T".to_string(),
            inputs: vec!["nodes".to_string()],
            output_num: 1,
            ..Default::default()
        }],
        ..Default::default()
    };
    let dag = Arc::new(Dag::from_proto(&proto).unwrap());
    Executor::new(dag, ctx.clone(), env).run().await.unwrap();
    let types = ctx.get("API_GET_NODE_T,0:0").unwrap();
    assert_eq!(types.values::<i32>().unwrap(), &[1, 0]);
}
