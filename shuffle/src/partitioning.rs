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

use crate::errors::{Result, ShuffleError};
use crate::range_partitioner::RangePartitioner;
use ahash::RandomState;
use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter};
use datafusion::common::hash_utils::create_hashes;
use datafusion::error::DataFusionError;
use datafusion::physical_expr::{LexOrdering, PhysicalExpr};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ShufflePartitioning {
    /// All rows go to the single output partition
    Single,
    /// Rotate over partitions row by row, the rotation continuing across batches
    RoundRobin(usize),
    /// Allocate rows based on a hash of one or more expressions and the specified number
    /// of partitions
    Hash(Vec<Arc<dyn PhysicalExpr>>, usize),
    /// Allocate rows based on lexical order of one or more expressions, with bounds
    /// determined by sampling up to `sample_size` rows of the first batch
    Range(LexOrdering, usize, usize),
}

impl ShufflePartitioning {
    pub fn partition_count(&self) -> usize {
        use ShufflePartitioning::*;
        match self {
            Single => 1,
            RoundRobin(n) | Hash(_, n) | Range(_, n, _) => *n,
        }
    }
}

struct RangeState {
    converter: RowConverter,
    bounds: Vec<OwnedRow>,
}

/// Computes a partition id for every row of a batch, reusing scratch allocations
/// across batches.
pub(crate) struct PartitionIdAssigner {
    partitioning: ShufflePartitioning,
    /// Hash state with fixed seeds so the row -> partition mapping is stable across
    /// writers and runs.
    random_state: RandomState,
    /// Hashes for each row in the current batch. Only populated for hash partitioning.
    hashes_buf: Vec<u64>,
    /// Next partition id handed out by round-robin, carried across batches.
    round_robin_start: usize,
    /// Bounds computed from the first batch for range partitioning.
    range_state: Option<RangeState>,
    seed: u64,
}

impl PartitionIdAssigner {
    pub fn try_new(partitioning: ShufflePartitioning, seed: u64) -> Result<Self> {
        if partitioning.partition_count() == 0 {
            return Err(ShuffleError::InvalidPartitionCount(0));
        }
        Ok(Self {
            partitioning,
            random_state: RandomState::with_seeds(0, 0, 0, 0),
            hashes_buf: vec![],
            round_robin_start: 0,
            range_state: None,
            seed,
        })
    }

    /// Fills `partition_ids[..num_rows]` with the partition id of every input row.
    pub fn assign(&mut self, input: &RecordBatch, partition_ids: &mut Vec<u32>) -> Result<()> {
        let num_rows = input.num_rows();
        partition_ids.resize(num_rows, 0);
        let partition_ids = &mut partition_ids[..num_rows];

        match &self.partitioning {
            ShufflePartitioning::Single => partition_ids.fill(0),
            ShufflePartitioning::RoundRobin(n) => {
                let start = self.round_robin_start;
                for (index, partition_id) in partition_ids.iter_mut().enumerate() {
                    *partition_id = ((start + index) % n) as u32;
                }
                self.round_robin_start = (start + num_rows) % n;
            }
            ShufflePartitioning::Hash(exprs, n) => {
                let arrays = exprs
                    .iter()
                    .map(|expr| expr.evaluate(input)?.into_array(num_rows))
                    .collect::<Result<Vec<_>, DataFusionError>>()?;

                self.hashes_buf.resize(num_rows, 0);
                self.hashes_buf.fill(0);
                create_hashes(&arrays, &self.random_state, &mut self.hashes_buf)?;
                for (partition_id, hash) in partition_ids.iter_mut().zip(&self.hashes_buf) {
                    *partition_id = (hash % *n as u64) as u32;
                }
            }
            ShufflePartitioning::Range(lex_ordering, n, sample_size) => {
                let arrays = lex_ordering
                    .iter()
                    .map(|sort_expr| sort_expr.expr.evaluate(input)?.into_array(num_rows))
                    .collect::<Result<Vec<ArrayRef>, DataFusionError>>()?;

                // When the first batch arrives, generate the bounds (as Rows) by
                // reservoir sampling the batch.
                let state = match self.range_state.take() {
                    Some(state) => state,
                    None => {
                        let (bounds, converter) = RangePartitioner::generate_bounds(
                            &arrays,
                            lex_ordering,
                            *n,
                            num_rows,
                            *sample_size,
                            self.seed,
                        )?;
                        RangeState { converter, bounds }
                    }
                };

                let rows = state.converter.convert_columns(arrays.as_slice())?;
                RangePartitioner::partition_indices_for_batch(&rows, &state.bounds, partition_ids);
                self.range_state = Some(state);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use datafusion::physical_expr::expressions::col;
    use datafusion::physical_expr::PhysicalSortExpr;

    fn test_batch(values: Vec<i32>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap()
    }

    #[test]
    fn zero_partitions_rejected() {
        let err = PartitionIdAssigner::try_new(ShufflePartitioning::RoundRobin(0), 0);
        assert!(matches!(
            err,
            Err(ShuffleError::InvalidPartitionCount(0))
        ));
    }

    #[test]
    fn single_assigns_everything_to_partition_zero() {
        let mut assigner = PartitionIdAssigner::try_new(ShufflePartitioning::Single, 0).unwrap();
        let mut ids = vec![];
        assigner.assign(&test_batch(vec![1, 2, 3]), &mut ids).unwrap();
        assert_eq!(vec![0, 0, 0], ids);
    }

    #[test]
    fn round_robin_rotation_continues_across_batches() {
        let mut assigner =
            PartitionIdAssigner::try_new(ShufflePartitioning::RoundRobin(3), 0).unwrap();
        let mut ids = vec![];
        assigner.assign(&test_batch(vec![0; 4]), &mut ids).unwrap();
        assert_eq!(vec![0, 1, 2, 0], ids);
        assigner.assign(&test_batch(vec![0; 4]), &mut ids).unwrap();
        assert_eq!(vec![1, 2, 0, 1], ids);
    }

    #[test]
    fn hash_assignment_is_deterministic() {
        let batch = test_batch((0..100).collect());
        let expr = col("a", batch.schema().as_ref()).unwrap();
        let partitioning = ShufflePartitioning::Hash(vec![expr], 4);

        let mut assigner1 = PartitionIdAssigner::try_new(partitioning.clone(), 0).unwrap();
        let mut assigner2 = PartitionIdAssigner::try_new(partitioning, 0).unwrap();
        let (mut ids1, mut ids2) = (vec![], vec![]);
        assigner1.assign(&batch, &mut ids1).unwrap();
        assigner2.assign(&batch, &mut ids2).unwrap();

        assert_eq!(ids1, ids2);
        assert!(ids1.iter().all(|p| *p < 4));
        // equal keys land in the same partition
        let batch2 = test_batch((0..100).collect());
        let mut ids3 = vec![];
        assigner2.assign(&batch2, &mut ids3).unwrap();
        assert_eq!(ids1, ids3);
    }

    #[test]
    fn hash_on_strings() {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["a", "b", "a", "c", "a"]))],
        )
        .unwrap();
        let expr = col("s", batch.schema().as_ref()).unwrap();
        let mut assigner =
            PartitionIdAssigner::try_new(ShufflePartitioning::Hash(vec![expr], 8), 0).unwrap();
        let mut ids = vec![];
        assigner.assign(&batch, &mut ids).unwrap();
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[0], ids[4]);
    }

    #[test]
    fn range_ids_follow_sort_order() {
        let batch = test_batch((0..1000).collect());
        let sort_expr = PhysicalSortExpr::new_default(col("a", batch.schema().as_ref()).unwrap());
        let ordering = LexOrdering::new(vec![sort_expr]).unwrap();
        let mut assigner =
            PartitionIdAssigner::try_new(ShufflePartitioning::Range(ordering, 4, 100), 42)
                .unwrap();
        let mut ids = vec![];
        assigner.assign(&batch, &mut ids).unwrap();
        assert!(ids.windows(2).all(|w| w[0] <= w[1]));
        assert!(ids.iter().all(|p| *p < 4));

        // bounds are frozen after the first batch, so a repeat batch maps identically
        let mut ids2 = vec![];
        assigner.assign(&test_batch((0..1000).collect()), &mut ids2).unwrap();
        assert_eq!(ids, ids2);
    }
}
