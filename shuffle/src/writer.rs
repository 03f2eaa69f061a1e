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

//! The shuffle writer façade: accepts batches, scatters them into partition
//! buffers, spills under memory pressure and assembles the final per-partition
//! block streams on `stop`.

use crate::buffers::PartitionBufferManager;
use crate::codec::{CompressionCodec, ShuffleBlockWriter};
use crate::errors::{Result, ShuffleError};
use crate::metrics::ShuffleWriterMetrics;
use crate::partitioning::{PartitionIdAssigner, ShufflePartitioning};
use crate::sink::ShuffleSink;
use crate::splitter::{map_partition_ids_to_starts_and_indices, split_batch, ScratchSpace};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use datafusion::execution::disk_manager::{DiskManagerConfig, RefCountedTempFile};
use datafusion::execution::memory_pool::MemoryConsumer;
use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};
use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ShuffleWriterOptions {
    /// Target number of buffered rows per partition before a flush to the partition's
    /// spill file.
    pub buffer_size: usize,
    pub codec: CompressionCodec,
    /// Payload bodies below this size are stored uncompressed.
    pub compression_min_size: usize,
    /// Memory budget in bytes for all partition buffers of this writer.
    pub memory_limit: usize,
    /// Directory for spill files; the operating system temp directory when unset.
    pub spill_dir: Option<PathBuf>,
    /// Seed for range-partitioning bound sampling.
    pub sample_seed: u64,
}

impl Default for ShuffleWriterOptions {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            codec: CompressionCodec::Lz4Frame,
            compression_min_size: 64,
            memory_limit: 64 * 1024 * 1024,
            spill_dir: None,
            sample_seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WriterState {
    Open,
    Splitting,
    Stopped,
    Failed,
}

struct SpillFile {
    /// Keeps the temp file alive until the contents are copied to the sink.
    temp_file: RefCountedTempFile,
    file: File,
}

/// Columnar shuffle writer.
///
/// All methods take `&self`: the writer is internally synchronized so that
/// `evict_fixed_size` can be driven by a memory arbiter thread while one task feeds
/// `split`.
pub struct ShuffleWriter<S: ShuffleSink> {
    inner: Mutex<WriterInner<S>>,
}

struct WriterInner<S: ShuffleSink> {
    options: ShuffleWriterOptions,
    state: WriterState,
    assigner: PartitionIdAssigner,
    scratch: ScratchSpace,
    buffers: PartitionBufferManager,
    block_writer: ShuffleBlockWriter,
    /// Intermediate spill output per partition, copied into the sink at `stop`.
    spills: Vec<Option<SpillFile>>,
    sink: S,
    runtime: Arc<RuntimeEnv>,
    metrics_set: ExecutionPlanMetricsSet,
    metrics: ShuffleWriterMetrics,
    partition_lengths: Vec<u64>,
}

impl<S: ShuffleSink> ShuffleWriter<S> {
    pub fn try_new(
        schema: SchemaRef,
        partitioning: ShufflePartitioning,
        options: ShuffleWriterOptions,
        sink: S,
    ) -> Result<Self> {
        let num_partitions = partitioning.partition_count();
        if num_partitions == 0 {
            return Err(ShuffleError::InvalidPartitionCount(0));
        }
        if options.memory_limit == 0 {
            return Err(ShuffleError::Config(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        if options.buffer_size == 0 {
            return Err(ShuffleError::Config(
                "buffer size must be greater than zero".to_string(),
            ));
        }

        let mut runtime_builder =
            RuntimeEnvBuilder::new().with_memory_limit(options.memory_limit, 1.0);
        if let Some(dir) = &options.spill_dir {
            runtime_builder =
                runtime_builder.with_disk_manager(DiskManagerConfig::NewSpecified(vec![
                    dir.clone()
                ]));
        }
        let runtime = runtime_builder.build_arc()?;

        let reservation = MemoryConsumer::new("ShuffleWriter")
            .with_can_spill(true)
            .register(&runtime.memory_pool);

        let assigner = PartitionIdAssigner::try_new(partitioning, options.sample_seed)?;
        let block_writer = ShuffleBlockWriter::try_new(
            schema.as_ref(),
            options.codec.clone(),
            options.compression_min_size,
        )?;
        let buffers = PartitionBufferManager::try_new(schema, num_partitions, reservation)?;

        let metrics_set = ExecutionPlanMetricsSet::new();
        let metrics = ShuffleWriterMetrics::new(&metrics_set, 0);

        Ok(Self {
            inner: Mutex::new(WriterInner {
                scratch: ScratchSpace::new(num_partitions, options.buffer_size),
                options,
                state: WriterState::Open,
                assigner,
                buffers,
                block_writer,
                spills: (0..num_partitions).map(|_| None).collect(),
                sink,
                runtime,
                metrics_set,
                metrics,
                partition_lengths: vec![],
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterInner<S>>> {
        self.inner
            .lock()
            .map_err(|_| ShuffleError::InvalidState("writer lock poisoned".to_string()))
    }

    /// Partitions and buffers all rows of `batch`. Oversized batches are processed in
    /// `buffer_size` row slices.
    pub fn split(&self, batch: &RecordBatch) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_active()?;
        inner.state = WriterState::Splitting;
        let result = inner.split(batch);
        if result.is_err() {
            inner.state = WriterState::Failed;
        }
        result
    }

    /// Flushes buffered partitions, largest first, until at least `size` bytes of
    /// buffer memory have been given back. Returns the bytes actually freed, which
    /// may be less when little is buffered, or zero when `size` is zero.
    pub fn evict_fixed_size(&self, size: usize) -> Result<usize> {
        let mut inner = self.lock()?;
        inner.check_active()?;
        let result = inner.evict(size);
        if result.is_err() {
            inner.state = WriterState::Failed;
        }
        result
    }

    /// Flushes every partition into the sink in ascending partition id order and
    /// finalizes the sink. Idempotent: repeated calls return the same per-partition
    /// byte lengths.
    pub fn stop(&self) -> Result<Vec<u64>> {
        let mut inner = self.lock()?;
        match inner.state {
            WriterState::Stopped => return Ok(inner.partition_lengths.clone()),
            WriterState::Failed => {
                return Err(ShuffleError::InvalidState(
                    "shuffle writer has failed".to_string(),
                ))
            }
            WriterState::Open | WriterState::Splitting => {}
        }
        match inner.stop() {
            Ok(lengths) => {
                inner.partition_lengths = lengths.clone();
                inner.state = WriterState::Stopped;
                Ok(lengths)
            }
            Err(e) => {
                inner.state = WriterState::Failed;
                Err(e)
            }
        }
    }

    /// Bytes written per partition. Only available after a successful `stop`.
    pub fn partition_lengths(&self) -> Result<Vec<u64>> {
        let inner = self.lock()?;
        if inner.state != WriterState::Stopped {
            return Err(ShuffleError::InvalidState(
                "partition lengths are available after stop".to_string(),
            ));
        }
        Ok(inner.partition_lengths.clone())
    }

    pub fn metrics(&self) -> Result<ExecutionPlanMetricsSet> {
        Ok(self.lock()?.metrics_set.clone())
    }

    /// Buffer memory currently charged to the memory pool.
    pub fn memory_used(&self) -> Result<usize> {
        Ok(self.lock()?.buffers.memory_used())
    }

    /// Consumes the writer and returns its sink.
    pub fn into_sink(self) -> Result<S> {
        let inner = self
            .inner
            .into_inner()
            .map_err(|_| ShuffleError::InvalidState("writer lock poisoned".to_string()))?;
        Ok(inner.sink)
    }
}

impl<S: ShuffleSink> WriterInner<S> {
    fn check_active(&self) -> Result<()> {
        match self.state {
            WriterState::Open | WriterState::Splitting => Ok(()),
            WriterState::Stopped => Err(ShuffleError::InvalidState(
                "shuffle writer is stopped".to_string(),
            )),
            WriterState::Failed => Err(ShuffleError::InvalidState(
                "shuffle writer has failed".to_string(),
            )),
        }
    }

    fn split(&mut self, batch: &RecordBatch) -> Result<()> {
        let start_time = Instant::now();
        let mut start = 0;
        while start < batch.num_rows() {
            let end = (start + self.options.buffer_size).min(batch.num_rows());
            self.split_slice(&batch.slice(start, end - start))?;
            start = end;
        }
        self.metrics.input_batches.add(1);
        self.metrics
            .baseline
            .elapsed_compute()
            .add_duration(start_time.elapsed());
        Ok(())
    }

    fn split_slice(&mut self, batch: &RecordBatch) -> Result<()> {
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return Ok(());
        }
        self.metrics.baseline.record_output(num_rows);

        let mut timer = self.metrics.repart_time.timer();
        self.assigner.assign(batch, &mut self.scratch.partition_ids)?;
        map_partition_ids_to_starts_and_indices(
            &mut self.scratch,
            self.buffers.num_partitions(),
            num_rows,
        );
        timer.stop();
        drop(timer);

        match split_batch(&mut self.buffers, &self.scratch, batch) {
            Ok(()) => {}
            Err(ShuffleError::AllocationFailure { requested }) => {
                // free at least the denied amount and retry once
                let freed = self.evict(requested.max(1))?;
                log::debug!(
                    "denied reservation of {requested} bytes, evicted {freed} bytes of partition buffers"
                );
                if freed == 0 {
                    return Err(ShuffleError::OutOfMemory { requested });
                }
                split_batch(&mut self.buffers, &self.scratch, batch).map_err(|e| match e {
                    ShuffleError::AllocationFailure { requested } => {
                        ShuffleError::OutOfMemory { requested }
                    }
                    other => other,
                })?;
            }
            Err(e) => return Err(e),
        }

        // partitions that reached the target row count go to their spill file now
        for partition_id in 0..self.buffers.num_partitions() {
            if self.buffers.used_rows(partition_id) >= self.options.buffer_size {
                self.flush_partition(partition_id)?;
            }
        }
        Ok(())
    }

    /// Serializes a partition's buffered rows into its spill file and resets the
    /// buffers for reuse. Returns the bytes written.
    fn flush_partition(&mut self, partition_id: usize) -> Result<u64> {
        let Some(batch) = self.buffers.take_batch(partition_id)? else {
            return Ok(0);
        };

        let slot = &mut self.spills[partition_id];
        if slot.is_none() {
            let temp_file = self
                .runtime
                .disk_manager
                .create_tmp_file("shuffle writer spill")?;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(temp_file.path())?;
            *slot = Some(SpillFile { temp_file, file });
        }
        let Some(spill) = slot.as_mut() else {
            return Err(ShuffleError::InvalidState(
                "spill file unavailable".to_string(),
            ));
        };

        let mut encode_timer = self.metrics.encode_time.timer();
        let written = self.block_writer.write_batch(&batch, &mut spill.file)? as u64;
        encode_timer.stop();
        self.metrics.data_size.add(written as usize);
        Ok(written)
    }

    /// Largest-first eviction: flush and release buffered partitions until at least
    /// `size` bytes are freed or nothing is left to evict.
    fn evict(&mut self, size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        let mut candidates: Vec<(usize, usize)> = (0..self.buffers.num_partitions())
            .map(|p| (self.buffers.buffered_bytes(p), p))
            .filter(|(bytes, _)| *bytes > 0)
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        let mut freed = 0;
        for (buffered, partition_id) in candidates {
            if freed >= size {
                break;
            }
            let written = self.flush_partition(partition_id)?;
            freed += self.buffers.release(partition_id);
            self.metrics.spill_count.add(1);
            self.metrics.spilled_bytes.add(written as usize);
            log::debug!(
                "evicted partition {partition_id}: {buffered} buffered bytes, {written} bytes spilled"
            );
        }
        Ok(freed)
    }

    fn stop(&mut self) -> Result<Vec<u64>> {
        let start_time = Instant::now();
        let num_partitions = self.buffers.num_partitions();
        let mut lengths = vec![0u64; num_partitions];

        for partition_id in 0..num_partitions {
            let residual = self.buffers.take_batch(partition_id)?;

            let mut out = self.sink.open_partition(partition_id)?;
            let mut written = self.block_writer.write_header(&mut out)? as u64;

            if let Some(spill) = self.spills[partition_id].take() {
                drop(spill.file);
                let mut write_timer = self.metrics.write_time.timer();
                let mut reader = File::open(spill.temp_file.path())?;
                written += std::io::copy(&mut reader, &mut out)?;
                write_timer.stop();
            }

            if let Some(batch) = residual {
                let mut encode_timer = self.metrics.encode_time.timer();
                let bytes = self.block_writer.write_batch(&batch, &mut out)?;
                encode_timer.stop();
                self.metrics.data_size.add(bytes);
                written += bytes as u64;
            }

            written += self.block_writer.write_end_marker(&mut out)? as u64;
            out.flush()?;
            lengths[partition_id] = written;
        }

        let mut write_timer = self.metrics.write_time.timer();
        self.sink.finalize()?;
        write_timer.stop();

        self.buffers.release_all();
        self.metrics
            .baseline
            .elapsed_compute()
            .add_duration(start_time.elapsed());
        Ok(lengths)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::ShuffleBlockReader;
    use crate::sink::{InMemorySink, LocalDiskSink};
    use arrow::array::{Array, AsArray, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Int32Type, Int64Type, Schema};
    use datafusion::physical_expr::expressions::col;
    use std::collections::{HashMap, HashSet};

    fn read_stream(bytes: &[u8]) -> Vec<RecordBatch> {
        let mut reader = ShuffleBlockReader::try_new(bytes).unwrap();
        let mut batches = vec![];
        while let Some(batch) = reader.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    fn options(codec: CompressionCodec, memory_limit: usize, buffer_size: usize) -> ShuffleWriterOptions {
        ShuffleWriterOptions {
            buffer_size,
            codec,
            compression_min_size: 0,
            memory_limit,
            spill_dir: None,
            sample_seed: 42,
        }
    }

    fn kv_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, false),
            Field::new("v", DataType::Utf8, true),
        ]))
    }

    fn kv_batch(range: std::ops::Range<i32>) -> RecordBatch {
        let keys: Vec<i32> = range.clone().map(|i| i % 10).collect();
        let values: Vec<Option<String>> = range
            .map(|i| if i % 7 == 0 { None } else { Some(format!("v{i}")) })
            .collect();
        RecordBatch::try_new(
            kv_schema(),
            vec![
                Arc::new(Int32Array::from(keys)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap()
    }

    fn pairs(batches: &[RecordBatch]) -> Vec<(i32, Option<String>)> {
        let mut out = vec![];
        for batch in batches {
            let k = batch.column(0).as_primitive::<Int32Type>();
            let v = batch.column(1).as_string::<i32>();
            for i in 0..batch.num_rows() {
                let value = v.is_valid(i).then(|| v.value(i).to_string());
                out.push((k.value(i), value));
            }
        }
        out
    }

    #[test]
    fn hash_shuffle_groups_keys_and_keeps_row_order() {
        let writer = ShuffleWriter::try_new(
            kv_schema(),
            ShufflePartitioning::Hash(vec![col("k", kv_schema().as_ref()).unwrap()], 3),
            options(CompressionCodec::Lz4Frame, 1 << 20, 8192),
            InMemorySink::new(),
        )
        .unwrap();

        writer.split(&kv_batch(0..50)).unwrap();
        writer.split(&kv_batch(50..100)).unwrap();
        let lengths = writer.stop().unwrap();
        assert_eq!(3, lengths.len());

        let input = pairs(&[kv_batch(0..50), kv_batch(50..100)]);
        let sink = writer.into_sink().unwrap();

        let mut seen_keys: HashMap<i32, usize> = HashMap::new();
        let mut total_rows = 0;
        for partition_id in 0..3 {
            assert_eq!(
                lengths[partition_id] as usize,
                sink.partition(partition_id).len()
            );
            let rows = pairs(&read_stream(sink.partition(partition_id)));
            total_rows += rows.len();

            let keys: HashSet<i32> = rows.iter().map(|(k, _)| *k).collect();
            for key in &keys {
                // each key lives in exactly one partition
                assert!(seen_keys.insert(*key, partition_id).is_none());
            }
            // rows arrive in input order within the partition
            let expected: Vec<_> = input
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .cloned()
                .collect();
            assert_eq!(expected, rows);
        }
        assert_eq!(100, total_rows);
    }

    #[test]
    fn tight_memory_budget_spills_mid_stream() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let writer = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::Single,
            options(CompressionCodec::None, 4096, 8192),
            InMemorySink::new(),
        )
        .unwrap();

        for base in [0i64, 256, 512] {
            let batch = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from_iter_values(base..base + 256))],
            )
            .unwrap();
            writer.split(&batch).unwrap();
        }
        writer.stop().unwrap();

        let metrics = writer.metrics().unwrap().clone_inner();
        assert!(metrics.spill_count().unwrap() >= 1);

        let sink = writer.into_sink().unwrap();
        let batches = read_stream(sink.partition(0));
        // at least one spilled payload plus the residual payload
        assert!(batches.len() >= 2);
        let values: Vec<i64> = batches
            .iter()
            .flat_map(|b| {
                b.column(0)
                    .as_primitive::<Int64Type>()
                    .values()
                    .iter()
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!((0..768).collect::<Vec<i64>>(), values);
    }

    #[test]
    fn null_and_empty_string_survive_the_writer() {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(StringArray::from(vec![Some(""), None, Some("a")]))],
        )
        .unwrap();

        let writer = ShuffleWriter::try_new(
            schema,
            ShufflePartitioning::Single,
            options(CompressionCodec::Zstd(1), 1 << 20, 8192),
            InMemorySink::new(),
        )
        .unwrap();
        writer.split(&batch).unwrap();
        writer.stop().unwrap();

        let sink = writer.into_sink().unwrap();
        let decoded = read_stream(sink.partition(0));
        let s = decoded[0].column(0).as_string::<i32>();
        assert!(s.is_valid(0));
        assert_eq!("", s.value(0));
        assert!(s.is_null(1));
        assert_eq!("a", s.value(2));
    }

    #[test]
    fn round_robin_spreads_rows_evenly() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let writer = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::RoundRobin(2),
            options(CompressionCodec::None, 1 << 20, 8192),
            InMemorySink::new(),
        )
        .unwrap();

        for _ in 0..2 {
            let batch = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int32Array::from_iter_values(0..5))],
            )
            .unwrap();
            writer.split(&batch).unwrap();
        }
        writer.stop().unwrap();
        let sink = writer.into_sink().unwrap();

        let rows = |p: usize| -> usize {
            read_stream(sink.partition(p))
                .iter()
                .map(|b| b.num_rows())
                .sum()
        };
        assert_eq!(5, rows(0));
        assert_eq!(5, rows(1));
    }

    #[test]
    fn writer_lifecycle_is_enforced() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let writer = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::RoundRobin(2),
            options(CompressionCodec::None, 1 << 20, 8192),
            InMemorySink::new(),
        )
        .unwrap();

        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        writer.split(&batch).unwrap();

        assert!(writer.partition_lengths().is_err());
        let lengths = writer.stop().unwrap();
        // stop is idempotent
        assert_eq!(lengths, writer.stop().unwrap());
        assert_eq!(lengths, writer.partition_lengths().unwrap());

        let err = writer.split(&batch).unwrap_err();
        assert!(matches!(err, ShuffleError::InvalidState(_)));
        let err = writer.evict_fixed_size(1024).unwrap_err();
        assert!(matches!(err, ShuffleError::InvalidState(_)));
    }

    #[test]
    fn evict_zero_is_a_noop() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let writer = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::Single,
            options(CompressionCodec::None, 1 << 20, 8192),
            InMemorySink::new(),
        )
        .unwrap();
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        writer.split(&batch).unwrap();

        assert_eq!(0, writer.evict_fixed_size(0).unwrap());
        assert!(writer.memory_used().unwrap() > 0);

        // a real eviction frees the buffered bytes
        let freed = writer.evict_fixed_size(usize::MAX).unwrap();
        assert!(freed > 0);
        assert_eq!(0, writer.memory_used().unwrap());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let err = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::RoundRobin(0),
            options(CompressionCodec::None, 1 << 20, 8192),
            InMemorySink::new(),
        );
        assert!(matches!(err, Err(ShuffleError::InvalidPartitionCount(0))));

        let err = ShuffleWriter::try_new(
            schema,
            ShufflePartitioning::Single,
            options(CompressionCodec::None, 0, 8192),
            InMemorySink::new(),
        );
        assert!(matches!(err, Err(ShuffleError::Config(_))));
    }

    #[test]
    fn disk_sink_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("shuffle.data");
        let index_path = dir.path().join("shuffle.index");

        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let writer = ShuffleWriter::try_new(
            Arc::clone(&schema),
            ShufflePartitioning::RoundRobin(2),
            options(CompressionCodec::Lz4Frame, 1 << 20, 8192),
            LocalDiskSink::try_new(&data_path, &index_path).unwrap(),
        )
        .unwrap();

        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from_iter_values(0..100))],
        )
        .unwrap();
        writer.split(&batch).unwrap();
        let lengths = writer.stop().unwrap();

        let data = std::fs::read(&data_path).unwrap();
        let index = std::fs::read(&index_path).unwrap();
        let offsets: Vec<usize> = index
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as usize)
            .collect();
        assert_eq!(3, offsets.len());
        assert_eq!(data.len(), offsets[2]);
        assert_eq!(lengths[0] as usize, offsets[1] - offsets[0]);
        assert_eq!(lengths[1] as usize, offsets[2] - offsets[1]);

        let p0 = read_stream(&data[offsets[0]..offsets[1]]);
        let p1 = read_stream(&data[offsets[1]..offsets[2]]);
        let rows: usize = p0.iter().chain(p1.iter()).map(|b| b.num_rows()).sum();
        assert_eq!(100, rows);
    }
}
