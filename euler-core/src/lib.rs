pub mod dag;
pub mod dag_def;
pub mod env;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod kernels;
pub mod op_kernel;

pub use dag::Dag;
pub use dag_def::DagDef;
pub use env::{QueryContext, RuntimeEnv, ShardClients, ShardWeights};
pub use errors::ExecutionError;
pub use executor::Executor;
pub use op_kernel::{output_name, OpKernelContext};
