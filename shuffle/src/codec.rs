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

//! Wire format for partition block streams.
//!
//! A stream is `[header][payload]*[end marker]`. The header carries a codec id and a
//! recursive schema encoding so a stream is self-describing. Each payload is framed
//! as `[uncompressed_len: i64 LE][compressed_len: i64 LE][bytes]`; a payload whose
//! two lengths are equal is stored raw. The end marker is the frame `[-1][-1]`.
//!
//! Payload bodies hold the row count followed by one section group per column in
//! schema order: a validity section (zero length means all valid), an offsets
//! section for variable-length and list-shaped columns, then values or children.
//! The decoder drives itself from the schema, so no per-column type tags appear in
//! payload bodies.

use crate::common::bit;
use crate::errors::{Result, ShuffleError};
use arrow::array::{make_array, ArrayData};
use arrow::buffer::{BooleanBuffer, Buffer, MutableBuffer};
use arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    Lz4Frame,
    Zstd(i32),
}

impl CompressionCodec {
    fn id(&self) -> u8 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Lz4Frame => 1,
            CompressionCodec::Zstd(_) => 2,
        }
    }

    fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Lz4Frame),
            2 => Ok(CompressionCodec::Zstd(1)),
            other => Err(ShuffleError::Serialization(format!(
                "unknown compression codec id {other}"
            ))),
        }
    }
}

/// Serializes batches of one schema into framed payloads.
pub struct ShuffleBlockWriter {
    header: Vec<u8>,
    codec: CompressionCodec,
    /// Bodies smaller than this skip compression entirely.
    compression_min_size: usize,
}

impl ShuffleBlockWriter {
    pub fn try_new(
        schema: &Schema,
        codec: CompressionCodec,
        compression_min_size: usize,
    ) -> Result<Self> {
        let mut header = vec![codec.id()];
        write_u32(&mut header, schema.fields().len() as u32)?;
        for field in schema.fields() {
            encode_field(field, &mut header)?;
        }
        Ok(Self {
            header,
            codec,
            compression_min_size,
        })
    }

    /// Writes the stream header, returning the bytes written.
    pub fn write_header<W: Write>(&self, out: &mut W) -> Result<usize> {
        out.write_all(&self.header)?;
        Ok(self.header.len())
    }

    /// Writes one batch as a framed payload, returning the bytes written.
    pub fn write_batch<W: Write>(&self, batch: &RecordBatch, out: &mut W) -> Result<usize> {
        let mut body = Vec::with_capacity(4096);
        write_u64(&mut body, batch.num_rows() as u64)?;
        for column in batch.columns() {
            write_column(&column.to_data(), &mut body)?;
        }

        let uncompressed_len = body.len();
        let compressed = if uncompressed_len >= self.compression_min_size {
            match &self.codec {
                CompressionCodec::None => None,
                CompressionCodec::Lz4Frame => {
                    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                    encoder.write_all(&body)?;
                    Some(
                        encoder
                            .finish()
                            .map_err(|e| ShuffleError::Serialization(e.to_string()))?,
                    )
                }
                CompressionCodec::Zstd(level) => Some(zstd::bulk::compress(&body, *level)?),
            }
        } else {
            None
        };

        // incompressible bodies fall back to raw, which keeps the convention that
        // equal lengths mean an uncompressed payload
        let payload = match compressed {
            Some(c) if c.len() < uncompressed_len => c,
            _ => body,
        };

        write_i64(out, uncompressed_len as i64)?;
        write_i64(out, payload.len() as i64)?;
        out.write_all(&payload)?;
        Ok(16 + payload.len())
    }

    pub fn write_end_marker<W: Write>(&self, out: &mut W) -> Result<usize> {
        write_i64(out, -1)?;
        write_i64(out, -1)?;
        Ok(16)
    }
}

/// Decodes a partition block stream produced by [`ShuffleBlockWriter`].
pub struct ShuffleBlockReader<R: Read> {
    input: R,
    schema: SchemaRef,
    codec: CompressionCodec,
}

impl<R: Read> ShuffleBlockReader<R> {
    /// Reads the stream header.
    pub fn try_new(mut input: R) -> Result<Self> {
        let mut id = [0u8; 1];
        input.read_exact(&mut id)?;
        let codec = CompressionCodec::from_id(id[0])?;

        let num_fields = read_u32(&mut input)? as usize;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            fields.push(decode_field(&mut input)?);
        }
        Ok(Self {
            input,
            schema: Arc::new(Schema::new(fields)),
            codec,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Returns the next batch, or `None` at the end marker.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let uncompressed_len = read_i64(&mut self.input)?;
        let compressed_len = read_i64(&mut self.input)?;
        if uncompressed_len == -1 && compressed_len == -1 {
            return Ok(None);
        }
        if uncompressed_len < 0 || compressed_len < 0 {
            return Err(ShuffleError::Serialization(
                "corrupt payload frame".to_string(),
            ));
        }

        let mut payload = vec![0u8; compressed_len as usize];
        self.input.read_exact(&mut payload)?;

        let body = if compressed_len == uncompressed_len {
            payload
        } else {
            match self.codec {
                CompressionCodec::None => {
                    return Err(ShuffleError::Serialization(
                        "compressed payload in uncompressed stream".to_string(),
                    ))
                }
                CompressionCodec::Lz4Frame => {
                    let mut decoder = lz4_flex::frame::FrameDecoder::new(payload.as_slice());
                    let mut body = Vec::with_capacity(uncompressed_len as usize);
                    decoder.read_to_end(&mut body)?;
                    body
                }
                CompressionCodec::Zstd(_) => {
                    zstd::bulk::decompress(&payload, uncompressed_len as usize)?
                }
            }
        };

        let mut cursor = Cursor::new(body);
        let num_rows = read_u64(&mut cursor)? as usize;
        let mut arrays = Vec::with_capacity(self.schema.fields().len());
        for field in self.schema.fields() {
            let data = read_column(&mut cursor, field.data_type(), num_rows)?;
            arrays.push(make_array(data));
        }
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch = RecordBatch::try_new_with_options(self.schema.clone(), arrays, &options)?;
        Ok(Some(batch))
    }
}

// schema header type tags
const TAG_BOOLEAN: u8 = 0;
const TAG_INT8: u8 = 1;
const TAG_INT16: u8 = 2;
const TAG_INT32: u8 = 3;
const TAG_INT64: u8 = 4;
const TAG_UINT8: u8 = 5;
const TAG_UINT16: u8 = 6;
const TAG_UINT32: u8 = 7;
const TAG_UINT64: u8 = 8;
const TAG_FLOAT32: u8 = 9;
const TAG_FLOAT64: u8 = 10;
const TAG_DATE32: u8 = 11;
const TAG_TIMESTAMP_MICROS: u8 = 12;
const TAG_DECIMAL128: u8 = 13;
const TAG_UTF8: u8 = 14;
const TAG_BINARY: u8 = 15;
const TAG_LIST: u8 = 16;
const TAG_STRUCT: u8 = 17;
const TAG_MAP: u8 = 18;

fn encode_field(field: &Field, out: &mut Vec<u8>) -> Result<()> {
    let name = field.name().as_bytes();
    write_u32(out, name.len() as u32)?;
    out.write_all(name)?;
    out.write_all(&[field.is_nullable() as u8])?;
    encode_data_type(field.data_type(), out)
}

fn encode_data_type(dt: &DataType, out: &mut Vec<u8>) -> Result<()> {
    match dt {
        DataType::Boolean => out.write_all(&[TAG_BOOLEAN])?,
        DataType::Int8 => out.write_all(&[TAG_INT8])?,
        DataType::Int16 => out.write_all(&[TAG_INT16])?,
        DataType::Int32 => out.write_all(&[TAG_INT32])?,
        DataType::Int64 => out.write_all(&[TAG_INT64])?,
        DataType::UInt8 => out.write_all(&[TAG_UINT8])?,
        DataType::UInt16 => out.write_all(&[TAG_UINT16])?,
        DataType::UInt32 => out.write_all(&[TAG_UINT32])?,
        DataType::UInt64 => out.write_all(&[TAG_UINT64])?,
        DataType::Float32 => out.write_all(&[TAG_FLOAT32])?,
        DataType::Float64 => out.write_all(&[TAG_FLOAT64])?,
        DataType::Date32 => out.write_all(&[TAG_DATE32])?,
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            out.write_all(&[TAG_TIMESTAMP_MICROS])?;
            let tz = tz.as_ref().map(|s| s.as_bytes()).unwrap_or_default();
            write_u32(out, tz.len() as u32)?;
            out.write_all(tz)?;
        }
        DataType::Decimal128(precision, scale) => {
            out.write_all(&[TAG_DECIMAL128, *precision, *scale as u8])?;
        }
        DataType::Utf8 => out.write_all(&[TAG_UTF8])?,
        DataType::Binary => out.write_all(&[TAG_BINARY])?,
        DataType::List(child) => {
            out.write_all(&[TAG_LIST])?;
            encode_field(child, out)?;
        }
        DataType::Struct(fields) => {
            out.write_all(&[TAG_STRUCT])?;
            write_u32(out, fields.len() as u32)?;
            for field in fields {
                encode_field(field, out)?;
            }
        }
        DataType::Map(entries, sorted) => {
            out.write_all(&[TAG_MAP, *sorted as u8])?;
            encode_field(entries, out)?;
        }
        other => {
            return Err(ShuffleError::Serialization(format!(
                "unsupported shuffle data type: {other}"
            )))
        }
    }
    Ok(())
}

fn decode_field<R: Read>(input: &mut R) -> Result<Field> {
    let name_len = read_u32(input)? as usize;
    let mut name = vec![0u8; name_len];
    input.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|e| ShuffleError::Serialization(format!("invalid field name: {e}")))?;
    let nullable = read_u8(input)? != 0;
    let data_type = decode_data_type(input)?;
    Ok(Field::new(name, data_type, nullable))
}

fn decode_data_type<R: Read>(input: &mut R) -> Result<DataType> {
    Ok(match read_u8(input)? {
        TAG_BOOLEAN => DataType::Boolean,
        TAG_INT8 => DataType::Int8,
        TAG_INT16 => DataType::Int16,
        TAG_INT32 => DataType::Int32,
        TAG_INT64 => DataType::Int64,
        TAG_UINT8 => DataType::UInt8,
        TAG_UINT16 => DataType::UInt16,
        TAG_UINT32 => DataType::UInt32,
        TAG_UINT64 => DataType::UInt64,
        TAG_FLOAT32 => DataType::Float32,
        TAG_FLOAT64 => DataType::Float64,
        TAG_DATE32 => DataType::Date32,
        TAG_TIMESTAMP_MICROS => {
            let tz_len = read_u32(input)? as usize;
            let tz = if tz_len == 0 {
                None
            } else {
                let mut tz = vec![0u8; tz_len];
                input.read_exact(&mut tz)?;
                let tz = String::from_utf8(tz)
                    .map_err(|e| ShuffleError::Serialization(format!("invalid timezone: {e}")))?;
                Some(Arc::from(tz.as_str()))
            };
            DataType::Timestamp(TimeUnit::Microsecond, tz)
        }
        TAG_DECIMAL128 => {
            let precision = read_u8(input)?;
            let scale = read_u8(input)? as i8;
            DataType::Decimal128(precision, scale)
        }
        TAG_UTF8 => DataType::Utf8,
        TAG_BINARY => DataType::Binary,
        TAG_LIST => DataType::List(FieldRef::new(decode_field(input)?)),
        TAG_STRUCT => {
            let n = read_u32(input)? as usize;
            let mut fields = Vec::with_capacity(n);
            for _ in 0..n {
                fields.push(decode_field(input)?);
            }
            DataType::Struct(fields.into())
        }
        TAG_MAP => {
            let sorted = read_u8(input)? != 0;
            DataType::Map(FieldRef::new(decode_field(input)?), sorted)
        }
        other => {
            return Err(ShuffleError::Serialization(format!(
                "unknown data type tag {other}"
            )))
        }
    })
}

fn fixed_width(dt: &DataType) -> Option<usize> {
    use DataType::*;
    match dt {
        Int8 | UInt8 => Some(1),
        Int16 | UInt16 => Some(2),
        Int32 | UInt32 | Float32 | Date32 => Some(4),
        Int64 | UInt64 | Float64 | Timestamp(TimeUnit::Microsecond, _) => Some(8),
        Decimal128(_, _) => Some(16),
        _ => None,
    }
}

/// Recursively writes one column's sections. Handles sliced data by always writing
/// from `data.offset()` and rebasing offsets to start at zero.
fn write_column(data: &ArrayData, out: &mut Vec<u8>) -> Result<()> {
    // validity section, zero length means all valid
    match data.nulls() {
        Some(nulls) if nulls.null_count() > 0 => {
            let mut bits = vec![0xffu8; bit::ceil(data.len(), 8)];
            for i in 0..data.len() {
                if nulls.is_null(i) {
                    bit::unset_bit(&mut bits, i);
                }
            }
            write_u32(out, bits.len() as u32)?;
            out.write_all(&bits)?;
        }
        _ => write_u32(out, 0)?,
    }

    let dt = data.data_type();
    if let Some(width) = fixed_width(dt) {
        let bytes = &data.buffers()[0].as_slice()
            [data.offset() * width..(data.offset() + data.len()) * width];
        write_u32(out, bytes.len() as u32)?;
        out.write_all(bytes)?;
        return Ok(());
    }

    match dt {
        DataType::Boolean => {
            let bools =
                BooleanBuffer::new(data.buffers()[0].clone(), data.offset(), data.len());
            let mut bits = vec![0u8; bit::ceil(data.len(), 8)];
            for (i, v) in bools.iter().enumerate() {
                if v {
                    bit::set_bit(&mut bits, i);
                }
            }
            write_u32(out, bits.len() as u32)?;
            out.write_all(&bits)?;
        }
        DataType::Utf8 | DataType::Binary => {
            let (first, last) = write_offsets(data, out)?;
            let values = &data.buffers()[1].as_slice()[first..last];
            write_u32(out, values.len() as u32)?;
            out.write_all(values)?;
        }
        DataType::List(_) => {
            let (first, last) = write_offsets(data, out)?;
            let child = data.child_data()[0].slice(first, last - first);
            write_column(&child, out)?;
        }
        DataType::Struct(_) => {
            for child in data.child_data() {
                let child = child.slice(data.offset(), data.len());
                write_column(&child, out)?;
            }
        }
        DataType::Map(_, _) => {
            let (first, last) = write_offsets(data, out)?;
            let entries = data.child_data()[0].slice(first, last - first);
            write_column(&entries, out)?;
        }
        other => {
            return Err(ShuffleError::Serialization(format!(
                "unsupported shuffle data type: {other}"
            )))
        }
    }
    Ok(())
}

/// Writes the i32 offsets section rebased to zero, returning the covered value range
/// of the original buffer.
fn write_offsets(data: &ArrayData, out: &mut Vec<u8>) -> Result<(usize, usize)> {
    let offsets =
        &data.buffers()[0].typed_data::<i32>()[data.offset()..data.offset() + data.len() + 1];
    let first = offsets[0];
    write_u32(out, ((data.len() + 1) * 4) as u32)?;
    for offset in offsets {
        out.write_all(&(offset - first).to_le_bytes())?;
    }
    Ok((first as usize, offsets[data.len()] as usize))
}

/// Copies decoded bytes into an arrow-allocated buffer so downstream typed access
/// sees properly aligned data.
fn aligned_buffer(bytes: &[u8]) -> Buffer {
    let mut buffer = MutableBuffer::new(bytes.len());
    buffer.extend_from_slice(bytes);
    buffer.into()
}

fn read_section<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_column<R: Read>(input: &mut R, dt: &DataType, num_rows: usize) -> Result<ArrayData> {
    let validity = read_section(input)?;
    let nulls = if validity.is_empty() {
        None
    } else {
        Some(aligned_buffer(&validity))
    };

    if fixed_width(dt).is_some() || matches!(dt, DataType::Boolean) {
        let values = read_section(input)?;
        return Ok(ArrayData::try_new(
            dt.clone(),
            num_rows,
            nulls,
            0,
            vec![aligned_buffer(&values)],
            vec![],
        )?);
    }

    match dt {
        DataType::Utf8 | DataType::Binary => {
            let offsets = read_section(input)?;
            let values = read_section(input)?;
            Ok(ArrayData::try_new(
                dt.clone(),
                num_rows,
                nulls,
                0,
                vec![aligned_buffer(&offsets), aligned_buffer(&values)],
                vec![],
            )?)
        }
        DataType::List(child_field) => {
            let offsets = read_section(input)?;
            let child_rows = last_offset(&offsets)?;
            let child = read_column(input, child_field.data_type(), child_rows)?;
            Ok(ArrayData::try_new(
                dt.clone(),
                num_rows,
                nulls,
                0,
                vec![aligned_buffer(&offsets)],
                vec![child],
            )?)
        }
        DataType::Struct(fields) => {
            let mut children = Vec::with_capacity(fields.len());
            for field in fields {
                children.push(read_column(input, field.data_type(), num_rows)?);
            }
            Ok(ArrayData::try_new(
                dt.clone(),
                num_rows,
                nulls,
                0,
                vec![],
                children,
            )?)
        }
        DataType::Map(entries_field, _) => {
            let offsets = read_section(input)?;
            let entry_rows = last_offset(&offsets)?;
            let entries = read_column(input, entries_field.data_type(), entry_rows)?;
            Ok(ArrayData::try_new(
                dt.clone(),
                num_rows,
                nulls,
                0,
                vec![aligned_buffer(&offsets)],
                vec![entries],
            )?)
        }
        other => Err(ShuffleError::Serialization(format!(
            "unsupported shuffle data type: {other}"
        ))),
    }
}

fn last_offset(offsets: &[u8]) -> Result<usize> {
    if offsets.len() < 4 || offsets.len() % 4 != 0 {
        return Err(ShuffleError::Serialization(
            "corrupt offsets section".to_string(),
        ));
    }
    let mut last = [0u8; 4];
    last.copy_from_slice(&offsets[offsets.len() - 4..]);
    Ok(i32::from_le_bytes(last) as usize)
}

fn write_u32<W: Write>(out: &mut W, value: u32) -> std::io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(out: &mut W, value: u64) -> std::io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_i64<W: Write>(out: &mut W, value: i64) -> std::io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn read_u8<R: Read>(input: &mut R) -> std::io::Result<u8> {
    let mut bytes = [0u8; 1];
    input.read_exact(&mut bytes)?;
    Ok(bytes[0])
}

fn read_u32<R: Read>(input: &mut R) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(input: &mut R) -> std::io::Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_i64<R: Read>(input: &mut R) -> std::io::Result<i64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}
