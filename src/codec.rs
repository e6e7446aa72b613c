//! Parquet encoding of input and output record files.
//!
//! Input files hold two columns, `id` (the key, binary or utf8) and `val`
//! (the payload, binary). Output files hold `id` (binary key) and `val`
//! (Int64 byte length, `-1` for a failed key).

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arrow::array::{Array, ArrayRef, BinaryArray, Int64Array, LargeBinaryArray, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::{AggregatedRecord, WorkItem};

pub const KEY_COLUMN: &str = "id";
pub const VALUE_COLUMN: &str = "val";

/// Rows decoded per batch when reading input files.
const READ_BATCH_SIZE: usize = 256;

pub fn item_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(KEY_COLUMN, DataType::Binary, false),
        Field::new(VALUE_COLUMN, DataType::Binary, false),
    ]))
}

pub fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(KEY_COLUMN, DataType::Binary, false),
        Field::new(VALUE_COLUMN, DataType::Int64, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Writes `items` as an input file. The writer must be closed to write the
/// footer, which this function does before returning.
pub fn write_items<W: Write + Send>(writer: W, items: &[WorkItem]) -> anyhow::Result<()> {
    let schema = item_schema();
    let mut writer = ArrowWriter::try_new(writer, schema.clone(), Some(writer_properties()))?;
    if !items.is_empty() {
        let keys: Vec<&[u8]> = items.iter().map(|i| i.key.as_bytes()).collect();
        let vals: Vec<&[u8]> = items.iter().map(|i| i.payload.as_ref()).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(BinaryArray::from(keys)) as ArrayRef,
                Arc::new(BinaryArray::from(vals)) as ArrayRef,
            ],
        )?;
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(())
}

/// Writes aggregated records as an output file.
pub fn write_records<W: Write + Send>(
    writer: W,
    records: &[AggregatedRecord],
) -> anyhow::Result<()> {
    let schema = record_schema();
    let mut writer = ArrowWriter::try_new(writer, schema.clone(), Some(writer_properties()))?;
    if !records.is_empty() {
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_bytes()).collect();
        let vals: Vec<i64> = records.iter().map(AggregatedRecord::encoded_value).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(BinaryArray::from(keys)) as ArrayRef,
                Arc::new(Int64Array::from(vals)) as ArrayRef,
            ],
        )?;
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(())
}

/// Opens an input file for batch-by-batch reading.
pub fn open_items(path: &Path) -> anyhow::Result<ParquetRecordBatchReader> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(READ_BATCH_SIZE)
        .build()?;
    Ok(reader)
}

/// Decodes one input batch into (key, payload) pairs.
pub fn decode_items(batch: &RecordBatch) -> anyhow::Result<Vec<(String, Bytes)>> {
    let keys = batch
        .column_by_name(KEY_COLUMN)
        .ok_or_else(|| anyhow!("missing `{KEY_COLUMN}` column"))?;
    let vals = batch
        .column_by_name(VALUE_COLUMN)
        .ok_or_else(|| anyhow!("missing `{VALUE_COLUMN}` column"))?;

    let keys = key_strings(keys)?;
    let vals = binary_values(vals)?;
    Ok(keys.into_iter().zip(vals).collect())
}

fn key_strings(arr: &ArrayRef) -> anyhow::Result<Vec<String>> {
    if arr.null_count() > 0 {
        return Err(anyhow!("key column contains {} null values", arr.null_count()));
    }
    if let Some(strings) = arr.as_any().downcast_ref::<StringArray>() {
        return Ok((0..strings.len())
            .map(|i| strings.value(i).to_string())
            .collect());
    }
    binary_values(arr)?
        .into_iter()
        .map(|b| String::from_utf8(b.to_vec()).context("key is not valid UTF-8"))
        .collect()
}

fn binary_values(arr: &ArrayRef) -> anyhow::Result<Vec<Bytes>> {
    if arr.null_count() > 0 {
        return Err(anyhow!("column contains {} null values", arr.null_count()));
    }
    if let Some(binary) = arr.as_any().downcast_ref::<BinaryArray>() {
        return Ok((0..binary.len())
            .map(|i| Bytes::copy_from_slice(binary.value(i)))
            .collect());
    }
    if let Some(binary) = arr.as_any().downcast_ref::<LargeBinaryArray>() {
        return Ok((0..binary.len())
            .map(|i| Bytes::copy_from_slice(binary.value(i)))
            .collect());
    }
    Err(anyhow!("unsupported column type {}", arr.data_type()))
}

/// Reads an output file back into records.
pub fn read_records(path: &Path) -> anyhow::Result<Vec<AggregatedRecord>> {
    let mut records = Vec::new();
    for batch in open_items(path)? {
        let batch = batch?;
        let keys = batch
            .column_by_name(KEY_COLUMN)
            .ok_or_else(|| anyhow!("missing `{KEY_COLUMN}` column"))?;
        let vals = batch
            .column_by_name(VALUE_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| anyhow!("`{VALUE_COLUMN}` is not an Int64 column"))?;
        for (key, i) in key_strings(keys)?.into_iter().zip(0..vals.len()) {
            let value = vals.value(i);
            records.push(AggregatedRecord {
                key,
                value: u64::try_from(value).ok(),
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn items_survive_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.parquet");
        let items = vec![
            WorkItem::new("song.mp3", vec![1u8, 2, 3]),
            WorkItem::new("empty.mp3", Vec::new()),
        ];
        write_items(File::create(&path).unwrap(), &items).unwrap();

        let decoded: Vec<(String, Bytes)> = open_items(&path)
            .unwrap()
            .flat_map(|b| decode_items(&b.unwrap()).unwrap())
            .collect();
        assert_eq!(
            decoded,
            vec![
                ("song.mp3".to_string(), Bytes::from_static(&[1, 2, 3])),
                ("empty.mp3".to_string(), Bytes::new()),
            ]
        );
    }

    #[test]
    fn failed_keys_are_written_as_minus_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let records = vec![AggregatedRecord::new("a", 10), AggregatedRecord::failed("b")];
        write_records(File::create(&path).unwrap(), &records).unwrap();

        assert_eq!(read_records(&path).unwrap(), records);
    }

    #[test]
    fn utf8_key_column_is_accepted() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(KEY_COLUMN, DataType::Utf8, false),
            Field::new(VALUE_COLUMN, DataType::Binary, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["k"])) as ArrayRef,
                Arc::new(BinaryArray::from(vec![b"v".as_ref()])) as ArrayRef,
            ],
        )
        .unwrap();
        assert_eq!(
            decode_items(&batch).unwrap(),
            vec![("k".to_string(), Bytes::from_static(b"v"))]
        );
    }

    #[test]
    fn null_utf8_key_is_an_error() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(KEY_COLUMN, DataType::Utf8, true),
            Field::new(VALUE_COLUMN, DataType::Binary, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("k"), None])) as ArrayRef,
                Arc::new(BinaryArray::from(vec![b"v".as_ref(), b"w".as_ref()])) as ArrayRef,
            ],
        )
        .unwrap();
        assert!(decode_items(&batch).is_err());
    }

    #[test]
    fn missing_column_is_an_error() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            KEY_COLUMN,
            DataType::Binary,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(BinaryArray::from(vec![b"k".as_ref()])) as ArrayRef],
        )
        .unwrap();
        assert!(decode_items(&batch).is_err());
    }
}
