use euler_core::errors::ExecutionError;
use euler_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("Unknown traversal step '{0}'")]
    UnknownStep(String),
    #[error("Step '{step}' expects {expected} parameters, got {actual}")]
    BadArity {
        step: String,
        expected: String,
        actual: usize,
    },
    #[error("SELECT references unknown alias '{0}'")]
    UnknownAlias(String),
    #[error("order_by weight requires an op that emits weights, got '{0}'")]
    OrderByWeightUnsupported(String),
    #[error("Filter mixes neighbour-indexed and global-indexed fields")]
    MixedIndexFilter,
    #[error("sampleNB supports neighbour-indexed filter fields only")]
    NeighborIndexOnly,
    #[error("No split rule for {op}:{input}")]
    MissingSplitRule { op: String, input: usize },
    #[error("No merge rule for {op}:{output}")]
    MissingMergeRule { op: String, output: usize },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
