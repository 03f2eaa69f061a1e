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
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for finished partition streams.
///
/// `open_partition` is called exactly once per partition, in ascending id order, and
/// all bytes of that partition are appended before the next partition is opened.
pub trait ShuffleSink: Send {
    fn open_partition(&mut self, partition_id: usize) -> Result<&mut dyn Write>;
    fn finalize(&mut self) -> Result<()>;
}

struct CountWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes all partitions into a single data file, with a companion index file of
/// little-endian `i64` byte offsets (one more entry than partitions) that lets a
/// reader seek to any partition's stream.
pub struct LocalDiskSink {
    data: CountWriter<BufWriter<File>>,
    index_path: PathBuf,
    offsets: Vec<i64>,
}

impl LocalDiskSink {
    pub fn try_new(data_path: &Path, index_path: &Path) -> Result<Self> {
        let file = File::create(data_path)?;
        Ok(Self {
            data: CountWriter {
                inner: BufWriter::new(file),
                written: 0,
            },
            index_path: index_path.to_path_buf(),
            offsets: vec![],
        })
    }
}

impl ShuffleSink for LocalDiskSink {
    fn open_partition(&mut self, partition_id: usize) -> Result<&mut dyn Write> {
        if partition_id != self.offsets.len() {
            return Err(ShuffleError::InvalidState(format!(
                "partition {partition_id} opened out of order, expected {}",
                self.offsets.len()
            )));
        }
        self.offsets.push(self.data.written as i64);
        Ok(&mut self.data)
    }

    fn finalize(&mut self) -> Result<()> {
        self.offsets.push(self.data.written as i64);
        self.data.flush()?;

        let mut index = BufWriter::new(File::create(&self.index_path)?);
        for offset in &self.offsets {
            index.write_all(&offset.to_le_bytes())?;
        }
        index.flush()?;
        Ok(())
    }
}

/// Keeps every partition stream in memory. Intended for tests and embedding.
#[derive(Default)]
pub struct InMemorySink {
    partitions: Vec<Vec<u8>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, partition_id: usize) -> &[u8] {
        &self.partitions[partition_id]
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

impl ShuffleSink for InMemorySink {
    fn open_partition(&mut self, partition_id: usize) -> Result<&mut dyn Write> {
        if partition_id != self.partitions.len() {
            return Err(ShuffleError::InvalidState(format!(
                "partition {partition_id} opened out of order, expected {}",
                self.partitions.len()
            )));
        }
        self.partitions.push(vec![]);
        let last = self.partitions.len() - 1;
        Ok(&mut self.partitions[last])
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
