//! ID_UNIQUE / ID_GATHER: collapse duplicate lookup keys in front of an
//! op, scatter its outputs back to the original positions behind it.

use std::collections::HashMap;

use euler_types::dtype::DType;
use euler_types::grpc::DagNodeProto;
use euler_types::tensor::{Tensor, TensorValue};

use super::util::{i32s_of, ids_of, input_tensor, row_width};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

/// Output 0: first-seen unique ids. Output 1: for every input element, the
/// position of its id in output 0.
pub struct IdUnique;

impl OpKernel for IdUnique {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let ids = ids_of(input_tensor(node, ctx, 0)?.as_ref())?;
        let mut position: HashMap<u64, i32> = HashMap::new();
        let mut unique = Vec::new();
        let mut mapping = Vec::with_capacity(ids.len());
        for id in ids {
            let next = unique.len() as i32;
            let slot = *position.entry(id).or_insert_with(|| {
                unique.push(id);
                next
            });
            mapping.push(slot);
        }
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![unique.len()], unique),
        )
        .map_err(ExecutionError::Type)?;
        ctx.put(
            output_name(node, 1),
            Tensor::from_vec(vec![mapping.len()], mapping),
        )
        .map_err(ExecutionError::Type)?;
        Ok(())
    }
}

fn gather_generic<T: TensorValue + Copy>(
    data: &Tensor,
    mapping: &[i32],
) -> Result<Tensor, ExecutionError> {
    let width = row_width(data).max(1);
    let values = data.values::<T>()?;
    let mut out = Vec::with_capacity(mapping.len() * width);
    for &slot in mapping {
        let begin = slot.max(0) as usize * width;
        for offset in 0..width {
            out.push(*values.get(begin + offset).ok_or_else(|| {
                ExecutionError::Internal("gather index out of range".to_string())
            })?);
        }
    }
    let mut dims = vec![mapping.len()];
    if data.shape().rank() >= 2 {
        dims.extend_from_slice(&data.shape().dims()[1..]);
    }
    Ok(Tensor::from_vec(dims, out))
}

/// Inputs: the deduplicated op's outputs, then the unique mapping as the
/// final input. Each output row set is scattered back to original order.
pub struct IdGather;

impl OpKernel for IdGather {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let num_data = node.inputs.len().saturating_sub(1);
        let mapping = i32s_of(input_tensor(node, ctx, num_data)?.as_ref())?;
        for slot in 0..num_data {
            let data = input_tensor(node, ctx, slot)?;
            let gathered = match data.dtype() {
                DType::UInt64 => gather_generic::<u64>(&data, &mapping),
                DType::Int64 => gather_generic::<i64>(&data, &mapping),
                DType::Int32 => gather_generic::<i32>(&data, &mapping),
                DType::Float32 => gather_generic::<f32>(&data, &mapping),
                DType::Float64 => gather_generic::<f64>(&data, &mapping),
                other => Err(ExecutionError::Internal(format!(
                    "gather does not support dtype {other}"
                ))),
            }?;
            ctx.put(output_name(node, slot), gathered)
                .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn env() -> Arc<RuntimeEnv> {
        RuntimeEnv::builder(tokio::runtime::Handle::current()).build()
    }

    #[tokio::test]
    async fn unique_then_gather_restores_positions() {
        let ctx = OpKernelContext::new();
        ctx.put("ids", Tensor::from_vec(vec![4], vec![7u64, 8, 7, 9]))
            .unwrap();
        let unique_node = DagNodeProto {
            name: "ID_UNIQUE,1".to_string(),
            op: "ID_UNIQUE".to_string(),
            inputs: vec!["ids".to_string()],
            output_num: 2,
            ..Default::default()
        };
        IdUnique.compute(&unique_node, &ctx, &env()).unwrap();
        assert_eq!(
            ctx.get("ID_UNIQUE,1:0").unwrap().values::<u64>().unwrap(),
            &[7, 8, 9]
        );
        assert_eq!(
            ctx.get("ID_UNIQUE,1:1").unwrap().values::<i32>().unwrap(),
            &[0, 1, 0, 2]
        );

        // A per-unique-id result scattered back to all four positions.
        ctx.put("vals", Tensor::from_vec(vec![3], vec![70i64, 80, 90]))
            .unwrap();
        let gather_node = DagNodeProto {
            name: "ID_GATHER,2".to_string(),
            op: "ID_GATHER".to_string(),
            inputs: vec!["vals".to_string(), "ID_UNIQUE,1:1".to_string()],
            output_num: 1,
            ..Default::default()
        };
        IdGather.compute(&gather_node, &ctx, &env()).unwrap();
        assert_eq!(
            ctx.get("ID_GATHER,2:0").unwrap().values::<i64>().unwrap(),
            &[70, 80, 70, 90]
        );
    }
}
