pub mod config;
pub mod dtype;
pub mod errors;
pub mod models;
pub mod shape;
pub mod tensor;

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod grpc {
    tonic::include_proto!("euler");
}

// Re-export the shared stack so downstream crates pick up one version.
pub use parking_lot;
pub use prost;
pub use serde;
pub use serde_json;
pub use serde_yaml;
pub use thiserror;
pub use tonic;
pub use tracing;
