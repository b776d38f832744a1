use serde::{Deserialize, Serialize};

use crate::grpc::TensorShapeProto;

/// An ordered sequence of non-negative extents. Scalars have no dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<usize>,
}

impl TensorShape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn set(&mut self, axis: usize, dim: usize) {
        self.dims[axis] = dim;
    }

    /// Product of all extents except the first. Used by merge kernels to
    /// translate row counts into element counts.
    pub fn inner_size(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    pub fn to_proto(&self) -> TensorShapeProto {
        TensorShapeProto {
            dims: self.dims.iter().map(|d| *d as i64).collect(),
        }
    }

    pub fn from_proto(proto: &TensorShapeProto) -> Self {
        Self {
            dims: proto.dims.iter().map(|d| *d as usize).collect(),
        }
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl std::ops::Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, axis: usize) -> &usize {
        &self.dims[axis]
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}
