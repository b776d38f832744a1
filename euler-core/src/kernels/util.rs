//! Shared conversions between context tensors and kernel-level values.

use std::sync::Arc;

use euler_types::grpc::DagNodeProto;
use euler_types::tensor::Tensor;

use crate::errors::ExecutionError;
use crate::op_kernel::OpKernelContext;

pub fn input_tensor(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    index: usize,
) -> Result<Arc<Tensor>, ExecutionError> {
    let name = node
        .inputs
        .get(index)
        .ok_or_else(|| ExecutionError::MissingInput {
            op: node.op.clone(),
            input: format!("#{index}"),
        })?;
    ctx.try_get(name).ok_or_else(|| ExecutionError::MissingInput {
        op: node.op.clone(),
        input: name.clone(),
    })
}

/// Node/edge ids as u64, accepting the integer dtypes callers actually
/// send.
pub fn ids_of(tensor: &Tensor) -> Result<Vec<u64>, ExecutionError> {
    if let Ok(values) = tensor.values::<u64>() {
        return Ok(values.to_vec());
    }
    if let Ok(values) = tensor.values::<i64>() {
        return Ok(values.iter().map(|v| *v as u64).collect());
    }
    if let Ok(values) = tensor.values::<i32>() {
        return Ok(values.iter().map(|v| *v as u64).collect());
    }
    Err(ExecutionError::Internal(format!(
        "expected integer ids, got {}",
        tensor.dtype()
    )))
}

pub fn i32s_of(tensor: &Tensor) -> Result<Vec<i32>, ExecutionError> {
    if let Ok(values) = tensor.values::<i32>() {
        return Ok(values.to_vec());
    }
    if let Ok(values) = tensor.values::<i64>() {
        return Ok(values.iter().map(|v| *v as i32).collect());
    }
    Err(ExecutionError::Internal(format!(
        "expected i32 values, got {}",
        tensor.dtype()
    )))
}

pub fn scalar_i32(tensor: &Tensor) -> Result<i32, ExecutionError> {
    let values = i32s_of(tensor)?;
    values
        .first()
        .copied()
        .ok_or_else(|| ExecutionError::Internal("expected a scalar, got empty tensor".to_string()))
}

pub fn scalar_f32(tensor: &Tensor) -> Result<f32, ExecutionError> {
    if let Ok(values) = tensor.values::<f32>() {
        if let Some(v) = values.first() {
            return Ok(*v);
        }
    }
    if let Ok(v) = scalar_i32(tensor) {
        return Ok(v as f32);
    }
    Err(ExecutionError::Internal(
        "expected a numeric scalar".to_string(),
    ))
}

pub fn scalar_string(tensor: &Tensor) -> Result<String, ExecutionError> {
    tensor
        .scalar_value::<String>()
        .map_err(|_| ExecutionError::Internal("expected a string scalar".to_string()))
}

/// A numeric parameter input: the named tensor when installed, otherwise
/// the name parsed as a literal.
pub fn param_i32(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    index: usize,
) -> Result<i32, ExecutionError> {
    let name = node
        .inputs
        .get(index)
        .ok_or_else(|| ExecutionError::MissingInput {
            op: node.op.clone(),
            input: format!("#{index}"),
        })?;
    match ctx.try_get(name) {
        Some(tensor) => scalar_i32(&tensor),
        None => name.parse().map_err(|_| ExecutionError::MissingInput {
            op: node.op.clone(),
            input: name.clone(),
        }),
    }
}

/// A type-list parameter: the named tensor when installed, otherwise the
/// name parsed as comma-separated literals.
pub fn param_i32_list(
    node: &DagNodeProto,
    ctx: &OpKernelContext,
    index: usize,
) -> Result<Vec<i32>, ExecutionError> {
    let name = node
        .inputs
        .get(index)
        .ok_or_else(|| ExecutionError::MissingInput {
            op: node.op.clone(),
            input: format!("#{index}"),
        })?;
    match ctx.try_get(name) {
        Some(tensor) => i32s_of(&tensor),
        None => name
            .split(',')
            .map(|part| {
                part.trim().parse().map_err(|_| ExecutionError::MissingInput {
                    op: node.op.clone(),
                    input: name.clone(),
                })
            })
            .collect(),
    }
}

/// Number of rows of a tensor: the leading extent, or the element count for
/// rank 0/1.
pub fn row_count(tensor: &Tensor) -> usize {
    if tensor.shape().rank() >= 2 {
        tensor.shape()[0]
    } else {
        tensor.num_elements()
    }
}

/// Elements per row.
pub fn row_width(tensor: &Tensor) -> usize {
    if tensor.shape().rank() >= 2 {
        tensor.shape().inner_size()
    } else {
        1
    }
}

/// Adjacency segments: `pairs[i] = (begin, end)` in row units, encoded as
/// an `[n, 2]` i32 tensor.
pub fn segments_of(tensor: &Tensor) -> Result<Vec<(usize, usize)>, ExecutionError> {
    let raw = i32s_of(tensor)?;
    if raw.len() % 2 != 0 {
        return Err(ExecutionError::Internal(
            "adjacency index tensor must have 2 columns".to_string(),
        ));
    }
    Ok(raw
        .chunks_exact(2)
        .map(|c| (c[0].max(0) as usize, c[1].max(0) as usize))
        .collect())
}

pub fn segments_tensor(segments: &[(usize, usize)]) -> Tensor {
    let mut values = Vec::with_capacity(segments.len() * 2);
    for (begin, end) in segments {
        values.push(*begin as i32);
        values.push(*end as i32);
    }
    Tensor::from_vec(vec![segments.len(), 2], values)
}
