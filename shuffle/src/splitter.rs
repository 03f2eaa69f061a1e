// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Scatters the rows of one batch into the per-partition column buffers.
//!
//! Splitting is done in two phases: first all capacity for the batch is ensured
//! (the only fallible part), then rows are copied. A denied memory reservation
//! therefore never leaves a partition with half of a batch's rows.

use crate::buffers::{ColumnBuffer, ColumnKind, PartitionBufferManager};
use crate::common::bit;
use crate::errors::Result;
use arrow::array::{Array, ArrayData, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::ArrowNativeType;
use arrow::record_batch::RecordBatch;
use itertools::Itertools;

/// Reusable per-batch scratch, sized once and recycled across batches.
#[derive(Default)]
pub(crate) struct ScratchSpace {
    /// Partition ids for each row in the current batch.
    pub partition_ids: Vec<u32>,
    /// The start indices of partitions in `partition_row_indices`. partition_starts[K]
    /// and partition_starts[K + 1] delimit partition K.
    pub partition_starts: Vec<u32>,
    /// Row indices of the input batch grouped by partition, batch order preserved
    /// within each partition.
    pub partition_row_indices: Vec<u32>,
}

impl ScratchSpace {
    pub fn new(num_partitions: usize, batch_size: usize) -> Self {
        Self {
            partition_ids: vec![0; batch_size],
            partition_starts: vec![0; num_partitions + 1],
            partition_row_indices: vec![0; batch_size],
        }
    }
}

/// Turns per-row partition ids into a grouped row-index view via counting sort:
/// count each partition, accumulate counts into partition ends, then walk the rows
/// in reverse so the scatter is stable. E.g. ids `[1, 2, 1, 1, 0, 2]` produce
/// starts `[0, 1, 4, 6]` and row indices `[4, 0, 2, 3, 1, 5]`.
pub(crate) fn map_partition_ids_to_starts_and_indices(
    scratch: &mut ScratchSpace,
    num_partitions: usize,
    num_rows: usize,
) {
    let partition_ids = &scratch.partition_ids[..num_rows];

    let partition_counters = &mut scratch.partition_starts;
    partition_counters.resize(num_partitions + 1, 0);
    partition_counters.fill(0);
    partition_ids
        .iter()
        .for_each(|partition_id| partition_counters[*partition_id as usize] += 1);

    // accumulate counters into partition ends, e.g. [1, 3, 2, 1, 0] => [1, 4, 6, 7, 7]
    let partition_ends = partition_counters;
    let mut accum = 0;
    partition_ends.iter_mut().for_each(|v| {
        *v += accum;
        accum = *v;
    });

    // walking the rows backwards keeps equal partition ids in batch order, and after
    // the walk the decremented ends have become the partition starts
    let partition_row_indices = &mut scratch.partition_row_indices;
    partition_row_indices.resize(num_rows, 0);
    for (index, partition_id) in partition_ids.iter().enumerate().rev() {
        partition_ends[*partition_id as usize] -= 1;
        let end = partition_ends[*partition_id as usize];
        partition_row_indices[end as usize] = index as u32;
    }
}

/// Scatters all rows of `input` into the partition buffers, according to the grouping
/// already present in `scratch`.
///
/// On a recoverable allocation failure the reservation is rolled back to its state at
/// entry except for capacity that was already granted, and no row has been copied;
/// the caller may free memory and call again with the same arguments.
pub(crate) fn split_batch(
    manager: &mut PartitionBufferManager,
    scratch: &ScratchSpace,
    input: &RecordBatch,
) -> Result<()> {
    let num_rows = input.num_rows();
    if num_rows == 0 {
        return Ok(());
    }

    let columns: Vec<ArrayData> = input.columns().iter().map(|c| c.to_data()).collect();
    let kinds: Vec<ColumnKind> = manager.specs().iter().map(|s| s.kind).collect();

    // keep the per-column estimate of variable-length value widths current
    let mut batch_avg = vec![0usize; kinds.len()];
    for (col_idx, kind) in kinds.iter().enumerate() {
        if *kind == ColumnKind::Binary {
            let data = &columns[col_idx];
            let offsets = data.buffers()[0].typed_data::<i32>();
            let total =
                (offsets[data.offset() + num_rows] - offsets[data.offset()]) as usize;
            batch_avg[col_idx] = bit::ceil(total.max(1), num_rows);
        }
    }
    manager.record_value_sizes(&batch_avg);

    // phase 1: ensure row and value-byte capacity for every target partition
    let mut demand = vec![0usize; kinds.len()];
    for (partition_id, (&start, &end)) in
        scratch.partition_starts.iter().tuple_windows().enumerate()
    {
        let indices = &scratch.partition_row_indices[start as usize..end as usize];
        if indices.is_empty() {
            continue;
        }
        demand.fill(0);
        for (col_idx, kind) in kinds.iter().enumerate() {
            if *kind == ColumnKind::Binary {
                let data = &columns[col_idx];
                let offsets = &data.buffers()[0].typed_data::<i32>()[data.offset()..];
                demand[col_idx] = indices
                    .iter()
                    .map(|idx| (offsets[*idx as usize + 1] - offsets[*idx as usize]) as usize)
                    .sum();
            }
        }
        manager.ensure_capacity(partition_id, indices.len(), &demand)?;
    }

    // phase 1b: gather nested-column chunks and charge them before keeping any
    let mut staged: Vec<(usize, usize, ArrayRef, usize)> = vec![];
    let mut staged_bytes = 0usize;
    if kinds.iter().any(|k| *k == ColumnKind::Complex) {
        for (partition_id, (&start, &end)) in
            scratch.partition_starts.iter().tuple_windows().enumerate()
        {
            let indices = &scratch.partition_row_indices[start as usize..end as usize];
            if indices.is_empty() {
                continue;
            }
            let take_indices = UInt32Array::from(indices.to_vec());
            for (col_idx, kind) in kinds.iter().enumerate() {
                if *kind != ColumnKind::Complex {
                    continue;
                }
                let chunk = match take(input.column(col_idx), &take_indices, None) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        manager.unreserve(staged_bytes);
                        return Err(e.into());
                    }
                };
                let bytes = chunk.get_array_memory_size();
                if let Err(e) = manager.reserve(bytes) {
                    manager.unreserve(staged_bytes);
                    return Err(e);
                }
                staged_bytes += bytes;
                staged.push((partition_id, col_idx, chunk, bytes));
            }
        }
    }

    // phase 2: all memory is granted, copying cannot fail
    for (partition_id, col_idx, chunk, bytes) in staged {
        manager.push_chunk(partition_id, col_idx, chunk, bytes);
    }
    for (partition_id, (&start, &end)) in
        scratch.partition_starts.iter().tuple_windows().enumerate()
    {
        let indices = &scratch.partition_row_indices[start as usize..end as usize];
        if indices.is_empty() {
            continue;
        }
        let part = manager.partition_mut(partition_id);
        let used = part.used;
        for (col_idx, kind) in kinds.iter().enumerate() {
            scatter_column(
                &mut part.columns[col_idx],
                kind,
                &columns[col_idx],
                input.column(col_idx),
                indices,
                used,
            );
        }
        part.used += indices.len();
    }
    Ok(())
}

fn scatter_column(
    col: &mut ColumnBuffer,
    kind: &ColumnKind,
    data: &ArrayData,
    array: &ArrayRef,
    indices: &[u32],
    used: usize,
) {
    // bitmaps are kept all-valid, so only null rows need a bit flip
    if let Some(nulls) = array.nulls().filter(|n| n.null_count() > 0) {
        if let Some(validity) = col.validity.as_mut() {
            let bits = validity.as_slice_mut();
            let mut any_null = false;
            for (row, idx) in indices.iter().enumerate() {
                if nulls.is_null(*idx as usize) {
                    bit::unset_bit(bits, used + row);
                    any_null = true;
                }
            }
            col.has_nulls |= any_null;
        }
    }

    match *kind {
        ColumnKind::Fixed(1) => scatter_fixed::<u8>(data, indices, col, used),
        ColumnKind::Fixed(2) => scatter_fixed::<u16>(data, indices, col, used),
        ColumnKind::Fixed(4) => scatter_fixed::<u32>(data, indices, col, used),
        ColumnKind::Fixed(8) => scatter_fixed::<u64>(data, indices, col, used),
        ColumnKind::Fixed(_) => scatter_fixed::<i128>(data, indices, col, used),
        ColumnKind::Boolean => {
            let src = data.buffers()[0].as_slice();
            if let Some(values) = col.values.as_mut() {
                let bits = values.as_slice_mut();
                for (row, idx) in indices.iter().enumerate() {
                    if bit::get_bit(src, data.offset() + *idx as usize) {
                        bit::set_bit(bits, used + row);
                    } else {
                        bit::unset_bit(bits, used + row);
                    }
                }
            }
        }
        ColumnKind::Binary => {
            let src_offsets = &data.buffers()[0].typed_data::<i32>()[data.offset()..];
            let src_values = data.buffers()[1].as_slice();
            let mut value_offset = col.value_offset;
            if let (Some(values), Some(offsets)) = (col.values.as_mut(), col.offsets.as_mut()) {
                let dst_values = values.as_slice_mut();
                let dst_offsets = offsets.typed_mut::<i32>();
                for (row, idx) in indices.iter().enumerate() {
                    let start = src_offsets[*idx as usize] as usize;
                    let end = src_offsets[*idx as usize + 1] as usize;
                    dst_values[value_offset..value_offset + (end - start)]
                        .copy_from_slice(&src_values[start..end]);
                    value_offset += end - start;
                    dst_offsets[used + row + 1] = value_offset as i32;
                }
            }
            col.value_offset = value_offset;
        }
        // chunks were gathered and pushed before the scatter
        ColumnKind::Complex => {}
    }
}

fn scatter_fixed<T: ArrowNativeType>(
    data: &ArrayData,
    indices: &[u32],
    col: &mut ColumnBuffer,
    used: usize,
) {
    let src = &data.buffers()[0].typed_data::<T>()[data.offset()..];
    if let Some(values) = col.values.as_mut() {
        let dst = &mut values.typed_mut::<T>()[used..used + indices.len()];
        for (out, idx) in dst.iter_mut().zip(indices) {
            *out = src[*idx as usize];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffers::PartitionBufferManager;
    use crate::errors::ShuffleError;
    use arrow::array::{AsArray, Int32Array, Int64Array, ListArray, StringArray};
    use arrow::datatypes::{DataType, Field, Int32Type, Schema, SchemaRef};
    use datafusion::execution::memory_pool::MemoryConsumer;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use std::sync::Arc;

    fn manager(schema: SchemaRef, partitions: usize, limit: usize) -> PartitionBufferManager {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(limit, 1.0)
            .build_arc()
            .unwrap();
        let reservation = MemoryConsumer::new("test").register(&runtime.memory_pool);
        PartitionBufferManager::try_new(schema, partitions, reservation).unwrap()
    }

    fn scratch_from_ids(ids: &[u32], num_partitions: usize) -> ScratchSpace {
        let mut scratch = ScratchSpace::new(num_partitions, ids.len());
        scratch.partition_ids[..ids.len()].copy_from_slice(ids);
        map_partition_ids_to_starts_and_indices(&mut scratch, num_partitions, ids.len());
        scratch
    }

    #[test]
    fn test_map_partition_ids_to_starts_and_indices() {
        let scratch = scratch_from_ids(&[1, 2, 1, 1, 0, 2], 3);
        assert_eq!(vec![0, 1, 4, 6], scratch.partition_starts);
        assert_eq!(vec![4, 0, 2, 3, 1, 5], scratch.partition_row_indices);
    }

    #[test]
    fn test_map_with_empty_partitions() {
        let scratch = scratch_from_ids(&[3, 3, 0], 5);
        assert_eq!(vec![0, 1, 1, 1, 3, 3], scratch.partition_starts);
        assert_eq!(vec![2, 0, 1], scratch.partition_row_indices);
    }

    #[test]
    fn split_preserves_rows_and_batch_order() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int32Array::from(vec![10, 11, 12, 13, 14, 15])),
                Arc::new(StringArray::from(vec!["a", "bb", "ccc", "", "eeeee", "f"])),
            ],
        )
        .unwrap();

        let mut manager = manager(schema, 3, 1 << 20);
        let scratch = scratch_from_ids(&[1, 2, 1, 1, 0, 2], 3);
        split_batch(&mut manager, &scratch, &batch).unwrap();

        assert_eq!(1, manager.used_rows(0));
        assert_eq!(3, manager.used_rows(1));
        assert_eq!(2, manager.used_rows(2));

        let p1 = manager.take_batch(1).unwrap().unwrap();
        let a = p1.column(0).as_primitive::<Int32Type>();
        assert_eq!(&[10, 12, 13], a.values().as_ref());
        let s = p1.column(1).as_string::<i32>();
        assert_eq!("a", s.value(0));
        assert_eq!("ccc", s.value(1));
        assert_eq!("", s.value(2));

        let p0 = manager.take_batch(0).unwrap().unwrap();
        assert_eq!(
            "eeeee",
            p0.column(1).as_string::<i32>().value(0)
        );
    }

    #[test]
    fn split_accumulates_across_batches() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let mut manager = manager(Arc::clone(&schema), 2, 1 << 20);

        for base in [0i64, 100, 200] {
            let batch = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from(vec![base, base + 1]))],
            )
            .unwrap();
            let scratch = scratch_from_ids(&[0, 1], 2);
            split_batch(&mut manager, &scratch, &batch).unwrap();
        }

        let p0 = manager.take_batch(0).unwrap().unwrap();
        let v = p0.column(0).as_primitive::<arrow::datatypes::Int64Type>();
        assert_eq!(&[0, 100, 200], v.values().as_ref());
    }

    #[test]
    fn split_carries_nulls() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(vec![
                Some(1),
                None,
                Some(3),
                None,
            ]))],
        )
        .unwrap();

        let mut manager = manager(schema, 2, 1 << 20);
        let scratch = scratch_from_ids(&[0, 0, 1, 1], 2);
        split_batch(&mut manager, &scratch, &batch).unwrap();

        let p0 = manager.take_batch(0).unwrap().unwrap();
        let a = p0.column(0).as_primitive::<Int32Type>();
        assert_eq!(1, a.value(0));
        assert!(a.is_null(1));

        let p1 = manager.take_batch(1).unwrap().unwrap();
        let a = p1.column(0).as_primitive::<Int32Type>();
        assert_eq!(3, a.value(0));
        assert!(a.is_null(1));
    }

    #[test]
    fn split_boolean_values() {
        let schema = Arc::new(Schema::new(vec![Field::new("b", DataType::Boolean, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(arrow::array::BooleanArray::from(vec![
                true, false, true, true, false,
            ]))],
        )
        .unwrap();

        let mut manager = manager(schema, 2, 1 << 20);
        let scratch = scratch_from_ids(&[0, 1, 0, 1, 0], 2);
        split_batch(&mut manager, &scratch, &batch).unwrap();

        let p0 = manager.take_batch(0).unwrap().unwrap();
        let b = p0.column(0).as_boolean();
        assert_eq!(vec![true, true, false], (0..3).map(|i| b.value(i)).collect::<Vec<_>>());
    }

    #[test]
    fn split_nested_lists_via_gather() {
        let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
            Some(vec![Some(3)]),
            Some(vec![]),
        ]);
        let schema = Arc::new(Schema::new(vec![Field::new(
            "l",
            list.data_type().clone(),
            true,
        )]));
        let batch = RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(list)]).unwrap();

        let mut manager = manager(schema, 2, 1 << 20);
        let scratch = scratch_from_ids(&[0, 1, 0, 1], 2);
        split_batch(&mut manager, &scratch, &batch).unwrap();

        let p0 = manager.take_batch(0).unwrap().unwrap();
        assert_eq!(2, p0.num_rows());
        let l = p0.column(0).as_list::<i32>();
        assert_eq!(2, l.value(0).len());
        assert_eq!(1, l.value(1).len());

        let p1 = manager.take_batch(1).unwrap().unwrap();
        let l = p1.column(0).as_list::<i32>();
        assert!(l.is_null(0));
        assert_eq!(0, l.value(1).len());
    }

    #[test]
    fn denied_reservation_copies_no_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from_iter_values(0..1024))],
        )
        .unwrap();

        let mut manager = manager(schema, 4, 256);
        let ids: Vec<u32> = (0..1024).map(|i| (i % 4) as u32).collect();
        let scratch = scratch_from_ids(&ids, 4);
        let err = split_batch(&mut manager, &scratch, &batch).unwrap_err();
        assert!(matches!(err, ShuffleError::AllocationFailure { .. }));
        for p in 0..4 {
            assert_eq!(0, manager.used_rows(p));
        }
    }
}
