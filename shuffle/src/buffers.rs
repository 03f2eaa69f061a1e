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

//! Per-partition column buffers that rows are scattered into, plus the memory
//! accounting that makes buffer growth observable to the engine's memory pool.

use crate::common::bit;
use crate::common::buffer::AlignedBuffer;
use crate::errors::{Result, ShuffleError};
use arrow::array::{make_array, new_empty_array, ArrayData, ArrayRef};
use arrow::buffer::Buffer;
use arrow::compute::concat;
use arrow::datatypes::{DataType, FieldRef, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::execution::memory_pool::MemoryReservation;

/// Row capacity is always grown in multiples of this many rows.
const ROW_GRANULARITY: usize = 64;

/// Default guess for the byte width of variable-length values before any batch has
/// been observed.
const DEFAULT_BINARY_VALUE_SIZE: usize = 8;

/// The storage shape of a column, decided once per schema at writer creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ColumnKind {
    Boolean,
    /// Fixed-width values with the given element width in bytes (1, 2, 4, 8 or 16).
    Fixed(usize),
    /// `Utf8` / `Binary`: i32 offsets plus a value byte buffer.
    Binary,
    /// Nested columns kept as gathered array chunks.
    Complex,
}

impl ColumnKind {
    pub(crate) fn try_from_data_type(dt: &DataType) -> Result<ColumnKind> {
        use DataType::*;
        Ok(match dt {
            Boolean => ColumnKind::Boolean,
            Int8 | UInt8 => ColumnKind::Fixed(1),
            Int16 | UInt16 => ColumnKind::Fixed(2),
            Int32 | UInt32 | Float32 | Date32 => ColumnKind::Fixed(4),
            Int64 | UInt64 | Float64 | Timestamp(TimeUnit::Microsecond, _) => ColumnKind::Fixed(8),
            Decimal128(_, _) => ColumnKind::Fixed(16),
            Utf8 | Binary => ColumnKind::Binary,
            List(_) | Struct(_) | Map(_, _) => ColumnKind::Complex,
            other => {
                return Err(ShuffleError::Serialization(format!(
                    "unsupported shuffle data type: {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ColumnSpec {
    pub field: FieldRef,
    pub kind: ColumnKind,
}

/// Buffers of one column within one partition. Which fields are populated depends on
/// the column kind; everything is allocated lazily on the first `ensure_capacity`.
pub(crate) struct ColumnBuffer {
    pub kind: ColumnKind,
    /// Validity bitmap, pre-filled all-valid so batches without nulls skip it entirely.
    pub validity: Option<AlignedBuffer>,
    /// Whether any null has been scattered into this buffer since the last reset.
    pub has_nulls: bool,
    /// i32 end offsets for binary columns, `offsets[0]` is always 0.
    pub offsets: Option<AlignedBuffer>,
    pub values: Option<AlignedBuffer>,
    /// Bytes of the value buffer in use (binary columns).
    pub value_offset: usize,
    /// Gathered chunks for complex columns, in append order.
    pub chunks: Vec<ArrayRef>,
}

impl ColumnBuffer {
    fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            validity: None,
            has_nulls: false,
            offsets: None,
            values: None,
            value_offset: 0,
            chunks: vec![],
        }
    }
}

pub(crate) struct PartitionBuffer {
    pub columns: Vec<ColumnBuffer>,
    /// Rows scattered into this partition since the last flush.
    pub used: usize,
    /// Row capacity of the fixed-size buffers.
    pub capacity: usize,
    /// Bytes charged to the memory reservation for this partition.
    accounted: usize,
    /// Portion of `accounted` held by complex-column chunks, released on reset.
    chunk_bytes: usize,
}

impl PartitionBuffer {
    fn new(specs: &[ColumnSpec]) -> Self {
        Self {
            columns: specs.iter().map(|s| ColumnBuffer::new(s.kind)).collect(),
            used: 0,
            capacity: 0,
            accounted: 0,
            chunk_bytes: 0,
        }
    }
}

/// Matches the rounding `AlignedBuffer` applies so byte deltas can be computed before
/// any allocation happens.
fn aligned(bytes: usize) -> usize {
    bit::round_upto_power_of_2(bytes.max(1), 64)
}

fn buffer_capacity(buffer: &Option<AlignedBuffer>) -> usize {
    buffer.as_ref().map(|b| b.capacity()).unwrap_or(0)
}

pub(crate) struct PartitionBufferManager {
    schema: SchemaRef,
    specs: Vec<ColumnSpec>,
    partitions: Vec<PartitionBuffer>,
    reservation: MemoryReservation,
    /// Empirical average value width per column, maintained for binary columns only.
    avg_value_size: Vec<usize>,
}

impl PartitionBufferManager {
    pub fn try_new(
        schema: SchemaRef,
        num_partitions: usize,
        reservation: MemoryReservation,
    ) -> Result<Self> {
        let specs = schema
            .fields()
            .iter()
            .map(|field| {
                Ok(ColumnSpec {
                    field: field.clone(),
                    kind: ColumnKind::try_from_data_type(field.data_type())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let partitions = (0..num_partitions)
            .map(|_| PartitionBuffer::new(&specs))
            .collect();
        let avg_value_size = vec![0; specs.len()];
        Ok(Self {
            schema,
            specs,
            partitions,
            reservation,
            avg_value_size,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_mut(&mut self, partition_id: usize) -> &mut PartitionBuffer {
        &mut self.partitions[partition_id]
    }

    pub fn used_rows(&self, partition_id: usize) -> usize {
        self.partitions[partition_id].used
    }

    pub fn buffered_bytes(&self, partition_id: usize) -> usize {
        self.partitions[partition_id].accounted
    }

    pub fn memory_used(&self) -> usize {
        self.reservation.size()
    }

    /// Feeds the observed mean value width per column into the running estimate that
    /// seeds value-buffer allocations.
    pub fn record_value_sizes(&mut self, batch_avg: &[usize]) {
        for (avg, observed) in self.avg_value_size.iter_mut().zip(batch_avg) {
            if *observed == 0 {
                continue;
            }
            *avg = if *avg == 0 {
                *observed
            } else {
                (*avg + *observed).div_ceil(2)
            };
        }
    }

    /// Grows one partition's buffers to fit `additional_rows` more rows plus
    /// `binary_demand[col]` more value bytes per binary column. Memory is charged to
    /// the reservation before anything is allocated, so a denied reservation leaves
    /// the buffers untouched and surfaces as a recoverable allocation failure.
    ///
    /// Row capacity grows by at least doubling, rounded to a 64 row boundary; binary
    /// value capacity grows independently, seeded by the column's empirical value
    /// width when first allocated. Capacity never shrinks, so re-running the same
    /// request is a no-op.
    pub fn ensure_capacity(
        &mut self,
        partition_id: usize,
        additional_rows: usize,
        binary_demand: &[usize],
    ) -> Result<()> {
        debug_assert_eq!(binary_demand.len(), self.specs.len());
        let part = &self.partitions[partition_id];
        let target_rows = part.used + additional_rows;
        let new_capacity = if target_rows > part.capacity {
            bit::round_upto_power_of_2(target_rows.max(part.capacity * 2), ROW_GRANULARITY)
        } else {
            part.capacity
        };
        if new_capacity == 0 {
            return Ok(());
        }

        // first pass: compute the byte delta without touching anything
        let mut delta = 0usize;
        for (col_idx, (spec, col)) in self.specs.iter().zip(part.columns.iter()).enumerate() {
            let targets = column_targets(
                spec,
                col,
                new_capacity,
                binary_demand[col_idx],
                &self.avg_value_size,
                col_idx,
            );
            delta += targets.validity.saturating_sub(buffer_capacity(&col.validity));
            delta += targets.offsets.saturating_sub(buffer_capacity(&col.offsets));
            delta += targets.values.saturating_sub(buffer_capacity(&col.values));
        }

        if delta > 0 {
            self.reservation
                .try_grow(delta)
                .map_err(|_| ShuffleError::AllocationFailure { requested: delta })?;
        }

        // second pass: allocate, the reservation already covers it
        let part = &mut self.partitions[partition_id];
        for (col_idx, (spec, col)) in self.specs.iter().zip(part.columns.iter_mut()).enumerate() {
            let targets = column_targets(
                spec,
                col,
                new_capacity,
                binary_demand[col_idx],
                &self.avg_value_size,
                col_idx,
            );
            if targets.validity > 0 {
                grow_validity(&mut col.validity, targets.validity);
            }
            if targets.offsets > 0 {
                grow_plain(&mut col.offsets, targets.offsets);
            }
            if targets.values > 0 {
                grow_plain(&mut col.values, targets.values);
            }
        }
        part.capacity = new_capacity;
        part.accounted += delta;
        Ok(())
    }

    /// Charges `bytes` to the reservation without assigning them to a partition yet.
    /// Used while complex-column chunks for a batch are staged.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        self.reservation
            .try_grow(bytes)
            .map_err(|_| ShuffleError::AllocationFailure { requested: bytes })
    }

    /// Returns staged bytes that will not be used after all.
    pub fn unreserve(&mut self, bytes: usize) {
        self.reservation.shrink(bytes);
    }

    /// Hands a previously reserved complex-column chunk to its partition.
    pub fn push_chunk(&mut self, partition_id: usize, col: usize, chunk: ArrayRef, bytes: usize) {
        let part = &mut self.partitions[partition_id];
        part.columns[col].chunks.push(chunk);
        part.accounted += bytes;
        part.chunk_bytes += bytes;
    }

    /// Assembles the partition's buffered rows into a batch and resets the buffers for
    /// reuse. Returns `None` when nothing is buffered.
    pub fn take_batch(&mut self, partition_id: usize) -> Result<Option<RecordBatch>> {
        let part = &mut self.partitions[partition_id];
        let used = part.used;
        if used == 0 {
            return Ok(None);
        }

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.specs.len());
        for (spec, col) in self.specs.iter().zip(part.columns.iter()) {
            arrays.push(assemble_column(spec, col, used)?);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(used));
        let batch = RecordBatch::try_new_with_options(self.schema.clone(), arrays, &options)?;

        self.reset(partition_id);
        Ok(Some(batch))
    }

    /// Clears the row content of a partition while keeping its allocations.
    pub fn reset(&mut self, partition_id: usize) {
        let part = &mut self.partitions[partition_id];
        part.used = 0;
        let chunk_bytes = std::mem::take(&mut part.chunk_bytes);
        part.accounted -= chunk_bytes;
        for col in part.columns.iter_mut() {
            col.value_offset = 0;
            col.has_nulls = false;
            col.chunks.clear();
            if let Some(validity) = col.validity.as_mut() {
                validity.fill(0xff);
            }
        }
        self.reservation.shrink(chunk_bytes);
    }

    /// Frees a partition's allocations entirely, returning the bytes given back to the
    /// memory pool. The partition stays usable and will re-allocate on demand.
    pub fn release(&mut self, partition_id: usize) -> usize {
        let part = &mut self.partitions[partition_id];
        let freed = part.accounted;
        *part = PartitionBuffer::new(&self.specs);
        self.reservation.shrink(freed);
        freed
    }

    pub fn release_all(&mut self) -> usize {
        (0..self.partitions.len()).map(|p| self.release(p)).sum()
    }
}

struct BufferTargets {
    validity: usize,
    offsets: usize,
    values: usize,
}

/// Target byte capacities for one column's buffers given a new row capacity. A zero
/// target means the buffer is not used by this column kind.
fn column_targets(
    spec: &ColumnSpec,
    col: &ColumnBuffer,
    new_capacity: usize,
    demand: usize,
    avg_value_size: &[usize],
    col_idx: usize,
) -> BufferTargets {
    let nullable = spec.field.is_nullable() && spec.kind != ColumnKind::Complex;
    let validity = if nullable {
        aligned(bit::ceil(new_capacity, 8))
    } else {
        0
    };
    let (offsets, values) = match spec.kind {
        ColumnKind::Fixed(width) => (0, aligned(new_capacity * width)),
        ColumnKind::Boolean => (0, aligned(bit::ceil(new_capacity, 8))),
        ColumnKind::Binary => {
            let offsets = aligned((new_capacity + 1) * std::mem::size_of::<i32>());
            let current = buffer_capacity(&col.values);
            let needed = col.value_offset + demand;
            let values = if current == 0 {
                let avg = avg_value_size
                    .get(col_idx)
                    .copied()
                    .filter(|avg| *avg > 0)
                    .unwrap_or(DEFAULT_BINARY_VALUE_SIZE);
                aligned(needed.max(avg * new_capacity))
            } else if needed > current {
                aligned(needed.max(current * 2))
            } else {
                current
            };
            (offsets, values)
        }
        ColumnKind::Complex => (0, 0),
    };
    BufferTargets {
        validity: validity.max(buffer_capacity(&col.validity)),
        offsets: offsets.max(buffer_capacity(&col.offsets)),
        values: values.max(buffer_capacity(&col.values)),
    }
}

fn grow_plain(buffer: &mut Option<AlignedBuffer>, target: usize) {
    match buffer {
        Some(b) => b.resize(target),
        None => *buffer = Some(AlignedBuffer::new(target)),
    }
}

/// Validity bitmaps are kept all-valid outside of explicitly unset bits, including
/// any region added by growth.
fn grow_validity(buffer: &mut Option<AlignedBuffer>, target: usize) {
    match buffer {
        Some(b) => {
            let old = b.capacity();
            if target > old {
                b.resize(target);
                b.as_slice_mut()[old..].fill(0xff);
            }
        }
        None => {
            let mut b = AlignedBuffer::new(target);
            b.fill(0xff);
            *buffer = Some(b);
        }
    }
}

fn assemble_column(spec: &ColumnSpec, col: &ColumnBuffer, used: usize) -> Result<ArrayRef> {
    let nulls = if col.has_nulls {
        col.validity
            .as_ref()
            .map(|v| Buffer::from(&v.as_slice()[..bit::ceil(used, 8)]))
    } else {
        None
    };

    let data = match col.kind {
        ColumnKind::Fixed(width) => {
            let values = col
                .values
                .as_ref()
                .map(|b| Buffer::from(&b.as_slice()[..used * width]))
                .unwrap_or_else(|| Buffer::from(&[] as &[u8]));
            ArrayData::try_new(
                spec.field.data_type().clone(),
                used,
                nulls,
                0,
                vec![values],
                vec![],
            )?
        }
        ColumnKind::Boolean => {
            let values = col
                .values
                .as_ref()
                .map(|b| Buffer::from(&b.as_slice()[..bit::ceil(used, 8)]))
                .unwrap_or_else(|| Buffer::from(&[] as &[u8]));
            ArrayData::try_new(DataType::Boolean, used, nulls, 0, vec![values], vec![])?
        }
        ColumnKind::Binary => {
            let offsets = col
                .offsets
                .as_ref()
                .map(|b| Buffer::from_slice_ref(&b.typed::<i32>()[..used + 1]))
                .unwrap_or_else(|| Buffer::from_slice_ref(&[0i32]));
            let values = col
                .values
                .as_ref()
                .map(|b| Buffer::from(&b.as_slice()[..col.value_offset]))
                .unwrap_or_else(|| Buffer::from(&[] as &[u8]));
            ArrayData::try_new(
                spec.field.data_type().clone(),
                used,
                nulls,
                0,
                vec![offsets, values],
                vec![],
            )?
        }
        ColumnKind::Complex => {
            let array = match col.chunks.len() {
                0 => new_empty_array(spec.field.data_type()),
                1 => col.chunks[0].clone(),
                _ => {
                    let refs: Vec<&dyn arrow::array::Array> =
                        col.chunks.iter().map(|c| c.as_ref()).collect();
                    concat(&refs)?
                }
            };
            return Ok(array);
        }
    };
    Ok(make_array(data))
}
