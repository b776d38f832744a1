pub mod server;
pub mod service;

pub use server::{shard_meta, spawn_local_shard, EulerServer};
pub use service::WorkerService;
