//! Merge ops stitching per-shard replies back together. Input layout is
//! group-per-shard: each shard contributes its data tensors followed by a
//! merge-index tensor when the merge needs one. Output slot 0 is the
//! stitched value; slots `1..=N` republish per-shard index tensors for
//! downstream merges.

use std::collections::HashMap;
use std::sync::Arc;

use euler_types::dtype::DType;
use euler_types::grpc::DagNodeProto;
use euler_types::tensor::{Tensor, TensorValue};

use super::util::{i32s_of, ids_of, input_tensor, row_count, row_width, segments_of, segments_tensor};
use crate::env::RuntimeEnv;
use crate::errors::ExecutionError;
use crate::op_kernel::{output_name, OpKernel, OpKernelContext};

fn num_shards(node: &DagNodeProto) -> usize {
    (node.output_num.max(1) as usize) - 1
}

fn group_arity(node: &DagNodeProto, shards: usize) -> Result<usize, ExecutionError> {
    if shards == 0 || node.inputs.len() % shards != 0 {
        return Err(ExecutionError::Internal(format!(
            "merge op {} has {} inputs for {} shards",
            node.op,
            node.inputs.len(),
            shards
        )));
    }
    Ok(node.inputs.len() / shards)
}

fn output_shape(rows: usize, sample: &Tensor) -> Vec<usize> {
    if sample.shape().rank() >= 2 {
        let mut dims = vec![rows];
        dims.extend_from_slice(&sample.shape().dims()[1..]);
        dims
    } else {
        vec![rows]
    }
}

fn concat_generic<T: TensorValue + Copy>(parts: &[Arc<Tensor>]) -> Result<Tensor, ExecutionError> {
    let mut values = Vec::new();
    let mut rows = 0;
    for part in parts {
        values.extend_from_slice(part.values::<T>()?);
        rows += row_count(part);
    }
    Ok(Tensor::from_vec(output_shape(rows, &parts[0]), values))
}

fn concat_rows(parts: &[Arc<Tensor>]) -> Result<Tensor, ExecutionError> {
    let dtype = parts[0].dtype();
    match dtype {
        DType::UInt64 => concat_generic::<u64>(parts),
        DType::Int64 => concat_generic::<i64>(parts),
        DType::Int32 => concat_generic::<i32>(parts),
        DType::Float32 => concat_generic::<f32>(parts),
        DType::Float64 => concat_generic::<f64>(parts),
        DType::UInt8 => concat_generic::<u8>(parts),
        DType::Int8 => concat_generic::<i8>(parts),
        other => Err(ExecutionError::Internal(format!(
            "merge does not support dtype {other}"
        ))),
    }
}

/// Appends each shard's reply in shard order.
pub struct AppendMerge;

impl OpKernel for AppendMerge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shards = num_shards(node);
        let group = group_arity(node, shards)?;
        let parts: Vec<Arc<Tensor>> = (0..shards)
            .map(|s| input_tensor(node, ctx, s * group))
            .collect::<Result<_, _>>()?;
        let merged = concat_rows(&parts)?;
        ctx.put(output_name(node, 0), merged)
            .map_err(ExecutionError::Type)?;
        let mut offset = 0i32;
        for (s, part) in parts.iter().enumerate() {
            let rows = row_count(part) as i32;
            let positions: Vec<i32> = (offset..offset + rows).collect();
            ctx.put(
                output_name(node, s + 1),
                Tensor::from_vec(vec![positions.len()], positions),
            )
            .map_err(ExecutionError::Type)?;
            offset += rows;
        }
        Ok(())
    }
}

/// Unions id vectors, keeping first-seen order. Slot `s + 1` maps shard
/// `s`'s elements onto positions in the union.
pub struct UniqueMerge;

impl OpKernel for UniqueMerge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shards = num_shards(node);
        let group = group_arity(node, shards)?;
        let mut position: HashMap<u64, i32> = HashMap::new();
        let mut unique: Vec<u64> = Vec::new();
        let mut mappings: Vec<Vec<i32>> = Vec::with_capacity(shards);
        for s in 0..shards {
            let ids = ids_of(input_tensor(node, ctx, s * group)?.as_ref())?;
            let mut mapping = Vec::with_capacity(ids.len());
            for id in ids {
                let next = unique.len() as i32;
                let slot = *position.entry(id).or_insert_with(|| {
                    unique.push(id);
                    next
                });
                mapping.push(slot);
            }
            mappings.push(mapping);
        }
        ctx.put(
            output_name(node, 0),
            Tensor::from_vec(vec![unique.len()], unique),
        )
        .map_err(ExecutionError::Type)?;
        for (s, mapping) in mappings.into_iter().enumerate() {
            ctx.put(
                output_name(node, s + 1),
                Tensor::from_vec(vec![mapping.len()], mapping),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

/// Rebuilds global adjacency segments from per-shard segments. Each shard
/// sends `(segments, merge_idx)` where `merge_idx[j]` is the global row of
/// local row `j`; the owner of a row is the shard with a non-empty segment.
pub struct IdxMerge;

impl OpKernel for IdxMerge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shards = num_shards(node);
        let group = group_arity(node, shards)?;
        let mut lengths: Vec<usize> = Vec::new();
        let mut merge_indexes: Vec<Arc<Tensor>> = Vec::with_capacity(shards);
        for s in 0..shards {
            let segments = segments_of(input_tensor(node, ctx, s * group)?.as_ref())?;
            let merge_idx_tensor = input_tensor(node, ctx, s * group + group - 1)?;
            let merge_idx = i32s_of(&merge_idx_tensor)?;
            for (j, (begin, end)) in segments.iter().enumerate() {
                let row = *merge_idx.get(j).unwrap_or(&(j as i32)) as usize;
                if lengths.len() <= row {
                    lengths.resize(row + 1, 0);
                }
                let len = end.saturating_sub(*begin);
                if len > 0 || lengths[row] == 0 {
                    lengths[row] = lengths[row].max(len);
                }
            }
            merge_indexes.push(merge_idx_tensor);
        }
        let mut segments = Vec::with_capacity(lengths.len());
        let mut offset = 0usize;
        for len in &lengths {
            segments.push((offset, offset + len));
            offset += len;
        }
        ctx.put(output_name(node, 0), segments_tensor(&segments))
            .map_err(ExecutionError::Type)?;
        for (s, merge_idx) in merge_indexes.into_iter().enumerate() {
            ctx.put_arc(output_name(node, s + 1), merge_idx)
                .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

struct RowPlacement {
    shard: usize,
    begin: usize,
    len: usize,
}

fn place_rows(
    per_shard: &[(Vec<(usize, usize)>, Vec<i32>)],
) -> (Vec<Option<RowPlacement>>, Vec<usize>) {
    let mut placements: Vec<Option<RowPlacement>> = Vec::new();
    for (shard, (segments, merge_idx)) in per_shard.iter().enumerate() {
        for (j, (begin, end)) in segments.iter().enumerate() {
            let row = *merge_idx.get(j).unwrap_or(&(j as i32)) as usize;
            if placements.len() <= row {
                placements.resize_with(row + 1, || None);
            }
            let len = end.saturating_sub(*begin);
            let replace = match &placements[row] {
                None => true,
                Some(existing) => existing.len == 0 && len > 0,
            };
            if replace {
                placements[row] = Some(RowPlacement {
                    shard,
                    begin: *begin,
                    len,
                });
            }
        }
    }
    let mut addresses = Vec::with_capacity(placements.len());
    let mut offset = 0usize;
    for placement in &placements {
        addresses.push(offset);
        offset += placement.as_ref().map_or(0, |p| p.len);
    }
    (placements, addresses)
}

fn merge_segments_generic<T: TensorValue + Copy>(
    datas: &[Arc<Tensor>],
    placements: &[Option<RowPlacement>],
    addresses: &[usize],
    width: usize,
    total_rows: usize,
) -> Result<Tensor, ExecutionError> {
    let mut out: Vec<T> = vec![T::default(); total_rows * width];
    for (row, placement) in placements.iter().enumerate() {
        let Some(p) = placement else { continue };
        if p.len == 0 {
            continue;
        }
        let src = datas[p.shard].values::<T>()?;
        let src_begin = p.begin * width;
        let src_end = (p.begin + p.len) * width;
        let dst_begin = addresses[row] * width;
        out[dst_begin..dst_begin + (src_end - src_begin)]
            .copy_from_slice(&src[src_begin..src_end]);
    }
    Ok(Tensor::from_vec(
        output_shape(total_rows, &datas[0]),
        out,
    ))
}

/// Merges variable-length per-row segments: each shard sends
/// `(data, segments, merge_idx)` triplets. Slot `s + 1` publishes, per
/// local row, the global row address its segment landed at.
pub struct DataMerge;

impl OpKernel for DataMerge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shards = num_shards(node);
        let group = group_arity(node, shards)?;
        if group < 3 {
            return Err(ExecutionError::Internal(format!(
                "data merge needs (data, segments, merge_idx) triplets, got group of {group}"
            )));
        }
        let mut datas = Vec::with_capacity(shards);
        let mut per_shard = Vec::with_capacity(shards);
        for s in 0..shards {
            let data = input_tensor(node, ctx, s * group)?;
            let segments = segments_of(input_tensor(node, ctx, s * group + 1)?.as_ref())?;
            let merge_idx = i32s_of(input_tensor(node, ctx, s * group + 2)?.as_ref())?;
            datas.push(data);
            per_shard.push((segments, merge_idx));
        }
        let (placements, addresses) = place_rows(&per_shard);
        let width = row_width(&datas[0]).max(1);
        let total_rows: usize = placements.iter().map(|p| p.as_ref().map_or(0, |p| p.len)).sum();

        let merged = match datas[0].dtype() {
            DType::UInt64 => {
                merge_segments_generic::<u64>(&datas, &placements, &addresses, width, total_rows)
            }
            DType::Int64 => {
                merge_segments_generic::<i64>(&datas, &placements, &addresses, width, total_rows)
            }
            DType::Int32 => {
                merge_segments_generic::<i32>(&datas, &placements, &addresses, width, total_rows)
            }
            DType::Float32 => {
                merge_segments_generic::<f32>(&datas, &placements, &addresses, width, total_rows)
            }
            DType::Float64 => {
                merge_segments_generic::<f64>(&datas, &placements, &addresses, width, total_rows)
            }
            DType::UInt8 => {
                merge_segments_generic::<u8>(&datas, &placements, &addresses, width, total_rows)
            }
            other => Err(ExecutionError::Internal(format!(
                "data merge does not support dtype {other}"
            ))),
        }?;
        ctx.put(output_name(node, 0), merged)
            .map_err(ExecutionError::Type)?;

        for (s, (segments, merge_idx)) in per_shard.iter().enumerate() {
            let mut row_addresses = Vec::with_capacity(segments.len());
            for (j, _) in segments.iter().enumerate() {
                let row = *merge_idx.get(j).unwrap_or(&(j as i32)) as usize;
                row_addresses.push(*addresses.get(row).unwrap_or(&0) as i32);
            }
            ctx.put(
                output_name(node, s + 1),
                Tensor::from_vec(vec![row_addresses.len()], row_addresses),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}

/// Values a shard emits for rows it does not hold. A row made entirely of
/// these never overwrites another shard's answer.
trait MissingValue: Sized {
    fn is_missing(&self) -> bool {
        false
    }
}

impl MissingValue for i32 {
    fn is_missing(&self) -> bool {
        *self == -1
    }
}

impl MissingValue for i64 {
    fn is_missing(&self) -> bool {
        *self == -1
    }
}

impl MissingValue for u64 {
    fn is_missing(&self) -> bool {
        *self == u64::MAX
    }
}

impl MissingValue for f32 {
    fn is_missing(&self) -> bool {
        self.is_nan()
    }
}

impl MissingValue for f64 {
    fn is_missing(&self) -> bool {
        self.is_nan()
    }
}

impl MissingValue for u8 {}
impl MissingValue for i8 {}

fn merge_rows_generic<T: TensorValue + Copy + MissingValue>(
    datas: &[Arc<Tensor>],
    merge_indexes: &[Vec<i32>],
    width: usize,
    total_rows: usize,
) -> Result<Tensor, ExecutionError> {
    let mut out: Vec<T> = vec![T::default(); total_rows * width];
    let mut written = vec![false; total_rows];
    for (shard, data) in datas.iter().enumerate() {
        let values = data.values::<T>()?;
        for (local_row, global_row) in merge_indexes[shard].iter().enumerate() {
            let src = local_row * width;
            let dst_row = (*global_row).max(0) as usize;
            let dst = dst_row * width;
            if src + width > values.len() || dst + width > out.len() {
                continue;
            }
            let row = &values[src..src + width];
            if written[dst_row] && row.iter().all(MissingValue::is_missing) {
                continue;
            }
            out[dst..dst + width].copy_from_slice(row);
            if !row.iter().all(MissingValue::is_missing) {
                written[dst_row] = true;
            }
        }
    }
    Ok(Tensor::from_vec(output_shape(total_rows, &datas[0]), out))
}

/// Merges fixed-width rows by global row index: each shard sends
/// `(data, merge_idx)` pairs.
pub struct RegularDataMerge;

impl OpKernel for RegularDataMerge {
    fn compute(
        &self,
        node: &DagNodeProto,
        ctx: &OpKernelContext,
        _env: &RuntimeEnv,
    ) -> Result<(), ExecutionError> {
        let shards = num_shards(node);
        let group = group_arity(node, shards)?;
        let mut datas = Vec::with_capacity(shards);
        let mut merge_indexes = Vec::with_capacity(shards);
        for s in 0..shards {
            datas.push(input_tensor(node, ctx, s * group)?);
            merge_indexes.push(i32s_of(input_tensor(node, ctx, s * group + group - 1)?.as_ref())?);
        }
        let total_rows = merge_indexes
            .iter()
            .flatten()
            .map(|r| (*r).max(0) as usize + 1)
            .max()
            .unwrap_or(0);
        let width = row_width(&datas[0]).max(1);
        let merged = match datas[0].dtype() {
            DType::UInt64 => merge_rows_generic::<u64>(&datas, &merge_indexes, width, total_rows),
            DType::Int64 => merge_rows_generic::<i64>(&datas, &merge_indexes, width, total_rows),
            DType::Int32 => merge_rows_generic::<i32>(&datas, &merge_indexes, width, total_rows),
            DType::Float32 => merge_rows_generic::<f32>(&datas, &merge_indexes, width, total_rows),
            DType::Float64 => merge_rows_generic::<f64>(&datas, &merge_indexes, width, total_rows),
            other => Err(ExecutionError::Internal(format!(
                "regular data merge does not support dtype {other}"
            ))),
        }?;
        ctx.put(output_name(node, 0), merged)
            .map_err(ExecutionError::Type)?;
        for (s, merge_idx) in merge_indexes.into_iter().enumerate() {
            ctx.put(
                output_name(node, s + 1),
                Tensor::from_vec(vec![merge_idx.len()], merge_idx),
            )
            .map_err(ExecutionError::Type)?;
        }
        Ok(())
    }
}
