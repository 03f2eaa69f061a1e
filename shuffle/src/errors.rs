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

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;

pub type Result<T, E = ShuffleError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ShuffleError {
    #[error("Partition count must be greater than zero, got {0}")]
    InvalidPartitionCount(usize),

    /// Operation attempted on a writer that is already stopped or has failed.
    #[error("Invalid writer state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The memory reservation could not grow. Recoverable: the writer reacts by
    /// evicting buffered partitions and retrying once.
    #[error("Failed to reserve {requested} bytes for partition buffers")]
    AllocationFailure { requested: usize },

    /// Allocation still failed after eviction. Fatal for this writer.
    #[error("Out of memory while buffering partition data, requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to write to shuffle output sink")]
    SinkWrite(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error(transparent)]
    DataFusion(#[from] DataFusionError),
}

impl ShuffleError {
    /// Whether the writer can continue after this error by freeing memory.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShuffleError::AllocationFailure { .. })
    }
}

impl From<ShuffleError> for DataFusionError {
    fn from(value: ShuffleError) -> Self {
        match value {
            ShuffleError::DataFusion(e) => e,
            ShuffleError::Arrow(e) => DataFusionError::ArrowError(Box::new(e), None),
            other => DataFusionError::External(Box::new(other)),
        }
    }
}
