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

use crate::errors::Result;
use arrow::array::{ArrayRef, UInt64Array};
use arrow::compute::take;
use arrow::error::ArrowError;
use arrow::row::{OwnedRow, Row, RowConverter, Rows, SortField};
use datafusion::physical_expr::LexOrdering;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub struct RangePartitioner;

impl RangePartitioner {
    /// Samples the sort-key columns of the first batch and derives the partition bounds
    /// as [`OwnedRow`]s, so later batches only need a row conversion plus binary search.
    pub fn generate_bounds(
        arrays: &[ArrayRef],
        lex_ordering: &LexOrdering,
        partitions: usize,
        num_rows: usize,
        sample_size: usize,
        seed: u64,
    ) -> Result<(Vec<OwnedRow>, RowConverter)> {
        let indices = UInt64Array::from(Self::reservoir_sample_indices(
            num_rows,
            sample_size,
            seed,
        ));
        let sampled: Vec<ArrayRef> = arrays
            .iter()
            .map(|array| take(array, &indices, None))
            .collect::<Result<_, ArrowError>>()?;

        let sort_fields = lex_ordering
            .iter()
            .zip(arrays.iter())
            .map(|(sort_expr, array)| {
                SortField::new_with_options(array.data_type().clone(), sort_expr.options)
            })
            .collect();

        Self::determine_bounds_for_rows(sort_fields, sampled, partitions)
    }

    // Adapted from https://en.wikipedia.org/wiki/Reservoir_sampling#Optimal:_Algorithm_L
    // We use sample_size instead of k and num_rows instead of n.
    // We keep indices in the reservoir instead of actual values since we do one take()
    // on the input arrays at the end.
    pub fn reservoir_sample_indices(num_rows: usize, sample_size: usize, seed: u64) -> Vec<u64> {
        if num_rows <= sample_size {
            // Just return the original input since we can't create a bigger sample.
            return (0..num_rows as u64).collect();
        }

        // Initialize our reservoir with indices of the first |sample_size| elements.
        let mut reservoir: Vec<u64> = (0..sample_size as u64).collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut w = (rng.random::<f64>().ln() / sample_size as f64).exp();
        let mut i = sample_size - 1;

        while i < num_rows {
            i += (rng.random::<f64>().ln() / (1.0 - w).ln()).floor() as usize + 1;

            if i < num_rows {
                // Replace a random item in the reservoir with i
                let random_index = rng.random_range(0..sample_size);
                reservoir[random_index] = i as u64;
                w *= (rng.random::<f64>().ln() / sample_size as f64).exp();
            }
        }

        reservoir
    }

    // Adapted from org.apache.spark.RangePartitioner.determineBounds
    pub fn determine_bounds_for_rows(
        sort_fields: Vec<SortField>,
        sampled_columns: Vec<ArrayRef>,
        partitions: usize,
    ) -> Result<(Vec<OwnedRow>, RowConverter)> {
        let converter = RowConverter::new(sort_fields)?;
        let sampled_rows = converter.convert_columns(sampled_columns.as_slice())?;
        let mut sorted_sampled_rows: Vec<(usize, Row)> = sampled_rows.iter().enumerate().collect();
        sorted_sampled_rows.sort_unstable_by(|(_, a), (_, b)| a.cmp(b));

        let num_candidates = sampled_rows.num_rows();
        let step = 1.0 / partitions as f64;
        let mut cumulative_weights = 0.0;
        let mut target = step;
        let mut bounds_indices = Vec::with_capacity(partitions.saturating_sub(1));
        let mut i = 0;
        let mut j = 0;
        let mut previous_bound: Option<Row> = None;
        let sample_weight = 1.0 / num_candidates as f64;
        while (i < num_candidates) && (j + 1 < partitions) {
            let (index, key) = sorted_sampled_rows[i];
            cumulative_weights += sample_weight;
            if cumulative_weights >= target {
                // Skip duplicate values.
                if previous_bound.is_none_or(|bound| key > bound) {
                    bounds_indices.push(index);
                    target += step;
                    j += 1;
                    previous_bound = Some(key)
                }
            }
            i += 1
        }

        let bounds = bounds_indices
            .iter()
            .map(|idx| sampled_rows.row(*idx).owned())
            .collect();

        Ok((bounds, converter))
    }

    /// Assigns each row the index of the first bound that is not less than it.
    pub fn partition_indices_for_batch(
        row_batch: &Rows,
        bounds: &[OwnedRow],
        partition_ids: &mut [u32],
    ) {
        for (index, row) in row_batch.iter().enumerate() {
            partition_ids[index] = bounds.partition_point(|bound| bound.row() < row) as u32;
        }
    }
}
