use euler_core::errors::ExecutionError;
use euler_parser::CompileError;
use euler_types::errors::{Status, TypeError};
use euler_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to listen on the server monitor for shard {0}")]
    MonitorSubscription(usize),
    #[error("Missing cluster meta '{0}'")]
    MissingMeta(String),
    #[error("Shard {shard} reports {actual} weight types, other shards report {expected}")]
    MisalignedWeights {
        shard: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid weight meta for shard {shard}: '{value}'")]
    InvalidWeightMeta { shard: usize, value: String },
    #[error("Shard index {0} out of range")]
    ShardOutOfRange(usize),
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Rpc(#[from] Status),
}
