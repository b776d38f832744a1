use euler_types::errors::{ErrorKind, Status, TypeError};
use euler_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Node {0} not found in graph")]
    NodeNotFound(i32),
    #[error("Graph contains a cycle")]
    Cycle,
    #[error("Fusing nodes {0:?} would create a cycle through the outside graph")]
    FusionWouldCycle(Vec<i32>),
    #[error("Fusion output {0} does not reference a fused node")]
    InvalidFusionOutput(String),
    #[error("Node {0} is not a remote node")]
    NotRemote(i32),
    #[error("Split info references input {index} but node has {num_inputs} inputs")]
    SplitInputOutOfRange { index: usize, num_inputs: usize },
    #[error("No op kernel '{0}' registered")]
    KernelNotFound(String),
    #[error("Invalid input reference '{0}'")]
    InvalidInputRef(String),
    #[error("Kernel '{op}' failed: {source}")]
    KernelFailed {
        op: String,
        #[source]
        source: Box<ExecutionError>,
    },
    #[error("Input {input} of '{op}' is missing")]
    MissingInput { op: String, input: String },
    #[error("Query cancelled")]
    Cancelled,
    #[error("Query deadline exceeded")]
    DeadlineExceeded,
    #[error("No shard clients available")]
    NoShardClients,
    #[error("No graph store attached to this runtime")]
    NoGraphStore,
    #[error("Invalid post-process command '{0}'")]
    InvalidPostProcess(String),
    #[error("Invalid filter term '{0}'")]
    InvalidFilterTerm(String),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Rpc(#[from] Status),
    #[error("{0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::NodeNotFound(_) | ExecutionError::KernelNotFound(_) => {
                ErrorKind::NotFound
            }
            ExecutionError::Cancelled => ErrorKind::Cancelled,
            ExecutionError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ExecutionError::InvalidInputRef(_)
            | ExecutionError::InvalidPostProcess(_)
            | ExecutionError::InvalidFilterTerm(_) => ErrorKind::InvalidArgument,
            ExecutionError::Rpc(status) => status.kind,
            ExecutionError::KernelFailed { source, .. } => source.kind(),
            ExecutionError::Type(err) => match err {
                TypeError::TensorExists(_) => ErrorKind::AlreadyExists,
                TypeError::TensorNotFound(_) => ErrorKind::NotFound,
                TypeError::InvalidProto(_) | TypeError::UnknownDType(_) => ErrorKind::ProtoError,
                _ => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        }
    }
}

impl From<ExecutionError> for Status {
    fn from(err: ExecutionError) -> Self {
        Status::new(err.kind(), err.to_string())
    }
}
