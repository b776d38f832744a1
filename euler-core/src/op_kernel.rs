//! Op kernels, their process-wide registry, and the per-query tensor
//! context.

use std::collections::HashMap;
use std::sync::Arc;

use euler_types::errors::TypeError;
use euler_types::grpc::{DagNodeProto, TensorProto};
use euler_types::parking_lot::Mutex;
use euler_types::tensor::Tensor;
use euler_types::tonic;

use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;

/// Name of one output slot: `<node_name>:<slot>` where the node name is
/// `<op>,<id>`. The producer installs it, consumers look it up verbatim.
pub fn output_name(node: &DagNodeProto, slot: usize) -> String {
    format!("{}:{}", node.name, slot)
}

/// Query-scoped mapping from tensor name to tensor. Aliases are cheap
/// `Arc` clones; the last one dropped frees the buffer.
#[derive(Debug, Default)]
pub struct OpKernelContext {
    tensors: Mutex<HashMap<String, Arc<Tensor>>>,
}

impl OpKernelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh tensor. Fails if the name is taken.
    pub fn put(&self, name: impl Into<String>, tensor: Tensor) -> Result<Arc<Tensor>, TypeError> {
        let arc = Arc::new(tensor);
        self.put_arc(name, arc.clone())?;
        Ok(arc)
    }

    /// Installs an alias to an existing tensor. Fails if the name is taken.
    pub fn put_arc(&self, name: impl Into<String>, tensor: Arc<Tensor>) -> Result<(), TypeError> {
        let name = name.into();
        let mut tensors = self.tensors.lock();
        if tensors.contains_key(&name) {
            return Err(TypeError::TensorExists(name));
        }
        tensors.insert(name, tensor);
        Ok(())
    }

    /// Decodes a wire tensor into a fresh entry named by the proto.
    pub fn decode(&self, proto: &TensorProto) -> Result<(), TypeError> {
        self.decode_named(proto.name.clone(), proto)
    }

    pub fn decode_named(
        &self,
        name: impl Into<String>,
        proto: &TensorProto,
    ) -> Result<(), TypeError> {
        let tensor = Tensor::from_proto(proto)?;
        self.put(name, tensor).map(|_| ())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Tensor>, TypeError> {
        self.try_get(name)
            .ok_or_else(|| TypeError::TensorNotFound(name.to_string()))
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<Tensor>> {
        self.tensors.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.lock().contains_key(name)
    }

    /// Drops one name. The tensor itself lives on while other aliases hold
    /// it.
    pub fn remove(&self, name: &str) -> Option<Arc<Tensor>> {
        self.tensors.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tensors.lock().keys().cloned().collect()
    }
}

/// A synchronous kernel: runs to completion on the compute pool thread.
pub trait OpKernel: Send + Sync {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError>;
}

/// An asynchronous kernel: may await I/O (the remote operator). Completion
/// of the returned future is the single "done" notification.
#[tonic::async_trait]
pub trait AsyncOpKernel: Send + Sync {
    async fn compute_async(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError>;
}

#[derive(Clone)]
pub enum Kernel {
    Sync(Arc<dyn OpKernel>),
    Async(Arc<dyn AsyncOpKernel>),
}

impl Kernel {
    pub async fn run(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        match self {
            Kernel::Sync(kernel) => kernel.compute(node, ctx, env),
            Kernel::Async(kernel) => kernel.compute_async(node, ctx, env).await,
        }
    }
}

pub mod registry {
    //! Process-wide op registry: populated by registration hooks at
    //! startup, then read-only. Entries are never removed; kernels are
    //! process-lived singletons.

    use std::collections::HashMap;
    use std::sync::{Arc, OnceLock};

    use euler_types::parking_lot::RwLock;

    use super::{AsyncOpKernel, Kernel, OpKernel};

    fn table() -> &'static RwLock<HashMap<String, Kernel>> {
        static TABLE: OnceLock<RwLock<HashMap<String, Kernel>>> = OnceLock::new();
        TABLE.get_or_init(|| RwLock::new(HashMap::new()))
    }

    /// Registers a synchronous kernel. Re-registration of the same name is
    /// ignored so hooks can run more than once.
    pub fn register(name: &str, kernel: Arc<dyn OpKernel>) {
        table()
            .write()
            .entry(name.to_string())
            .or_insert(Kernel::Sync(kernel));
    }

    pub fn register_async(name: &str, kernel: Arc<dyn AsyncOpKernel>) {
        table()
            .write()
            .entry(name.to_string())
            .or_insert(Kernel::Async(kernel));
    }

    pub fn lookup(name: &str) -> Option<Kernel> {
        table().read().get(name).cloned()
    }

    pub fn is_registered(name: &str) -> bool {
        table().read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use euler_types::dtype::DType;
    use euler_types::shape::TensorShape;

    #[test]
    fn duplicate_name_is_rejected() {
        let ctx = OpKernelContext::new();
        ctx.put("a", Tensor::zeroed(TensorShape::new(vec![1]), DType::Int64))
            .unwrap();
        let err = ctx
            .put("a", Tensor::zeroed(TensorShape::new(vec![1]), DType::Int64))
            .unwrap_err();
        assert!(matches!(err, TypeError::TensorExists(_)));
    }

    #[test]
    fn alias_shares_the_same_tensor() {
        let ctx = OpKernelContext::new();
        let original = ctx
            .put("a", Tensor::from_vec(vec![2], vec![7i64, 8]))
            .unwrap();
        ctx.put_arc("b", original.clone()).unwrap();
        let via_alias = ctx.get("b").unwrap();
        assert!(Arc::ptr_eq(&original, &via_alias));
        // Removing one alias leaves the other valid.
        ctx.remove("a");
        assert!(ctx.get("a").is_err());
        assert_eq!(ctx.get("b").unwrap().values::<i64>().unwrap(), &[7, 8]);
    }

    #[test]
    fn missing_tensor_is_not_found() {
        let ctx = OpKernelContext::new();
        assert!(matches!(
            ctx.get("nope"),
            Err(TypeError::TensorNotFound(_))
        ));
    }
}
