pub mod client_manager;
pub mod errors;
pub mod query;
pub mod rpc_client;
pub mod rpc_manager;
pub mod server_monitor;

pub use client_manager::ClientManager;
pub use errors::ClientError;
pub use query::{Graph, QueryResult};
pub use rpc_client::RpcClient;
pub use rpc_manager::RpcManager;
pub use server_monitor::{
    Meta, Server, ServerMonitor, ServerMonitorBase, ServerRegister, ShardCallback,
    SimpleServerMonitor,
};
