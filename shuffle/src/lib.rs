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

//! Columnar shuffle writer built on Arrow and DataFusion.
//!
//! Input batches are routed to output partitions by a [`ShufflePartitioning`]
//! strategy, accumulated row by row in columnar partition buffers under a
//! DataFusion memory reservation, spilled to disk when the budget is exhausted
//! and written out as independent compressed block streams that
//! [`ShuffleBlockReader`] decodes back into record batches.

mod buffers;
pub mod codec;
mod common;
pub mod errors;
pub mod metrics;
pub mod partitioning;
mod range_partitioner;
pub mod sink;
mod splitter;
pub mod writer;

pub use codec::{CompressionCodec, ShuffleBlockReader, ShuffleBlockWriter};
pub use errors::{Result, ShuffleError};
pub use metrics::ShuffleWriterMetrics;
pub use partitioning::ShufflePartitioning;
pub use sink::{InMemorySink, LocalDiskSink, ShuffleSink};
pub use writer::{ShuffleWriter, ShuffleWriterOptions};
