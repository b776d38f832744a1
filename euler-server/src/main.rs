use std::sync::Arc;

use euler_client::{Meta, SimpleServerMonitor};
use euler_server::EulerServer;
use euler_types::models::ServerOptions;
use euler_types::tracing::error;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "euler-server.yaml".to_string());
    let options: ServerOptions = ServerOptions::from_yaml(&std::fs::read_to_string(&config_path)?)?;

    let shard_idx = options.shard_idx;
    let server = EulerServer::from_data_path(options, "")?;

    // Standalone deployments plug a discovery-service registry in here; a
    // single-process server registers against an in-process monitor so the
    // advertised metadata is still exercised.
    let registry = SimpleServerMonitor::new();
    let global_meta = Meta::from([("num_shards".to_string(), (shard_idx + 1).to_string())]);

    let io_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("euler-io")
        .enable_all()
        .build()?;
    io_runtime.block_on(server.serve(registry, global_meta))?;
    Ok(())
}
