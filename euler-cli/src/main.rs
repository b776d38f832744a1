//! Console for the graph-query service: compile a traversal and inspect
//! the optimised plan, or run it against an in-process graph.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use euler_client::Graph;
use euler_core::graph::MemGraph;
use euler_parser::{Compiler, Mode};
use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;
use euler_types::tracing::error;

#[derive(Parser)]
#[command(name = "euler", about = "Graph query console")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a traversal and print the optimised plan.
    Compile {
        query: String,
        #[arg(long, default_value = "local")]
        mode: String,
        #[arg(long, default_value_t = 1)]
        shard_num: i32,
        #[arg(long, default_value = "")]
        index_info: String,
    },
    /// Run a traversal against a JSON graph file, printing the aliased
    /// results.
    Run {
        query: String,
        #[arg(long)]
        graph: String,
        /// External tensors as name=v1,v2 integer lists.
        #[arg(long)]
        input: Vec<String>,
    },
}

fn parse_mode(mode: &str) -> Mode {
    match mode {
        "remote" => Mode::Distribute,
        "graph_partition" => Mode::GraphPartition,
        _ => Mode::Local,
    }
}

fn print_node(node: &DagNodeProto, indent: usize) {
    let pad = " ".repeat(indent);
    println!("{pad}{} ({})", node.name, node.op);
    if !node.op_alias.is_empty() {
        println!("{pad}  alias: {}", node.op_alias);
    }
    for input in &node.inputs {
        println!("{pad}  <- {input}");
    }
    for dnf in &node.dnf {
        println!("{pad}  dnf: {dnf}");
    }
    for command in &node.post_process {
        println!("{pad}  post: {command}");
    }
    if !node.inner_nodes.is_empty() {
        println!("{pad}  shard {} [", node.shard_idx);
        for inner in &node.inner_nodes {
            print_node(inner, indent + 4);
        }
        println!("{pad}  ]");
    }
}

fn compile(query: &str, mode: &str, shard_num: i32, index_info: &str) -> Result<(), String> {
    let compiler = Compiler::new(shard_num, parse_mode(mode), index_info);
    let dag_def = compiler
        .compile_to_dag_def(query, true)
        .map_err(|err| err.to_string())?;
    let proto = dag_def.to_proto().map_err(|err| err.to_string())?;
    for node in &proto.nodes {
        print_node(node, 0);
    }
    Ok(())
}

fn parse_input(spec: &str) -> Result<(String, Tensor), String> {
    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| format!("bad input '{spec}', expected name=v1,v2"))?;
    let parsed: Result<Vec<i64>, _> = values.split(',').map(|v| v.trim().parse()).collect();
    let parsed = parsed.map_err(|_| format!("bad values in '{spec}'"))?;
    let tensor = if parsed.len() == 1 {
        Tensor::scalar(parsed[0] as i32)
    } else {
        Tensor::from_vec(vec![parsed.len()], parsed.iter().map(|v| *v as u64).collect::<Vec<_>>())
    };
    Ok((name.to_string(), tensor))
}

fn run(query: &str, graph_path: &str, inputs: &[String]) -> Result<(), String> {
    let text = std::fs::read_to_string(graph_path).map_err(|err| err.to_string())?;
    let graph = Arc::new(MemGraph::from_json(&text).map_err(|err| err.to_string())?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| err.to_string())?;
    let facade = Graph::local(graph, "", runtime.handle().clone());

    let mut tensors = Vec::new();
    for spec in inputs {
        tensors.push(parse_input(spec)?);
    }
    let result = runtime
        .block_on(facade.run(query, tensors))
        .map_err(|err| err.to_string())?;

    let mut aliases = result.aliases();
    aliases.sort_unstable();
    for alias in aliases {
        let mut slot = 0;
        while let Some(tensor) = result.get(alias, slot) {
            println!("{alias}:{slot} {} {} = {:?}", tensor.dtype(), tensor.shape(), tensor.data());
            slot += 1;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Commands::Compile {
            query,
            mode,
            shard_num,
            index_info,
        } => compile(query, mode, *shard_num, index_info),
        Commands::Run {
            query,
            graph,
            input,
        } => run(query, graph, input),
    };
    if let Err(err) = outcome {
        error!("{err}");
        std::process::exit(1);
    }
}
