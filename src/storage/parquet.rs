//! Parquet codec: write document tables, read metadata/statistics, stream
//! columns and rows.
//!
//! All reads go through in-memory buffers handed out by the blob store, so the
//! codec is identical over the in-memory and filesystem stores. Writes either
//! produce a complete `PAR1…PAR1` file or fail; there is no fallback format.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::file::statistics::Statistics;
use serde_json::{Map, Value};

use super::StorageError;

/// Primitive column types supported by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
}

impl TableColumn {
    pub fn required(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required: true,
        }
    }

    pub fn optional(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required: false,
        }
    }
}

/// A flat table schema. Nested values are stored JSON-encoded in string
/// columns; shredded variant columns use dotted flat names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<TableColumn>,
}

impl TableSchema {
    pub fn new(columns: Vec<TableColumn>) -> Self {
        Self { columns }
    }

    fn to_arrow(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| {
                    let data_type = match c.column_type {
                        ColumnType::String => DataType::Utf8,
                        ColumnType::Int32 => DataType::Int32,
                        ColumnType::Int64 => DataType::Int64,
                        ColumnType::Double => DataType::Float64,
                        ColumnType::Boolean => DataType::Boolean,
                    };
                    Field::new(c.name.as_str(), data_type, !c.required)
                })
                .collect::<Vec<_>>(),
        )
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Str(s) => Value::String(s.clone()),
            ColumnValue::Int(i) => Value::from(*i),
            ColumnValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Coerce a JSON value into a cell of the given column type. Values that
    /// do not fit become nulls.
    pub fn from_json(value: &Value, column_type: ColumnType) -> ColumnValue {
        match (column_type, value) {
            (ColumnType::String, Value::String(s)) => ColumnValue::Str(s.clone()),
            (ColumnType::Int32 | ColumnType::Int64, v) => {
                v.as_i64().map(ColumnValue::Int).unwrap_or(ColumnValue::Null)
            }
            (ColumnType::Double, v) => v
                .as_f64()
                .map(ColumnValue::Double)
                .unwrap_or(ColumnValue::Null),
            (ColumnType::Boolean, Value::Bool(b)) => ColumnValue::Bool(*b),
            _ => ColumnValue::Null,
        }
    }
}

/// Column statistics surfaced from row-group metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub min: Option<ColumnValue>,
    pub max: Option<ColumnValue>,
    pub null_count: Option<u64>,
}

/// Per-column metadata of a row group.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub path_in_schema: String,
    pub statistics: Option<ColumnStats>,
}

/// Row-group metadata: row count plus per-column statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RowGroupMeta {
    pub num_rows: usize,
    pub columns: Vec<ColumnMeta>,
}

impl RowGroupMeta {
    pub fn column(&self, path: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.path_in_schema == path)
    }
}

/// Cheap file metadata: no data pages are touched.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub row_groups: Vec<RowGroupMeta>,
}

impl FileMetadata {
    pub fn total_rows(&self) -> usize {
        self.row_groups.iter().map(|rg| rg.num_rows).sum()
    }
}

/// Write options beyond the schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Cap rows per row group; `None` uses the writer default.
    pub max_row_group_size: Option<usize>,
}

/// The Parquet codec. Stateless; all inputs and outputs are byte buffers.
pub struct ParquetCodec;

impl ParquetCodec {
    /// Encode columns into Parquet bytes. `columns[i]` belongs to
    /// `schema.columns[i]`; all columns must have equal length.
    pub fn write_table(
        label: &str,
        schema: &TableSchema,
        columns: &[Vec<ColumnValue>],
    ) -> Result<Vec<u8>, StorageError> {
        Self::write_table_opts(label, schema, columns, WriteOptions::default())
    }

    pub fn write_table_opts(
        label: &str,
        schema: &TableSchema,
        columns: &[Vec<ColumnValue>],
        opts: WriteOptions,
    ) -> Result<Vec<u8>, StorageError> {
        let fail = |cause: String| StorageError::ParquetWrite {
            path: label.to_string(),
            cause,
        };

        if columns.len() != schema.columns.len() {
            return Err(fail(format!(
                "expected {} columns, got {}",
                schema.columns.len(),
                columns.len()
            )));
        }
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        if columns.iter().any(|c| c.len() != num_rows) {
            return Err(fail("column lengths differ".to_string()));
        }

        let arrow_schema = Arc::new(schema.to_arrow());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for (spec, values) in schema.columns.iter().zip(columns) {
            arrays.push(build_array(spec, values).map_err(fail)?);
        }

        let batch = RecordBatch::try_new(arrow_schema.clone(), arrays)
            .map_err(|e| fail(e.to_string()))?;

        let mut props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_statistics_enabled(EnabledStatistics::Chunk);
        if let Some(size) = opts.max_row_group_size {
            props = props.set_max_row_group_size(size.max(1));
        }

        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, arrow_schema, Some(props.build()))
            .map_err(|e| fail(e.to_string()))?;
        writer.write(&batch).map_err(|e| fail(e.to_string()))?;
        writer.close().map_err(|e| fail(e.to_string()))?;

        Ok(buf)
    }

    /// Read row-group metadata and column statistics without touching data.
    pub fn read_metadata(label: &str, bytes: &[u8]) -> Result<FileMetadata, StorageError> {
        check_magic(label, bytes)?;
        let builder = reader_builder(label, bytes)?;
        let metadata = builder.metadata();

        let mut row_groups = Vec::with_capacity(metadata.num_row_groups());
        for rg in metadata.row_groups() {
            let mut columns = Vec::with_capacity(rg.num_columns());
            for col in rg.columns() {
                columns.push(ColumnMeta {
                    path_in_schema: col.column_path().string(),
                    statistics: col.statistics().map(decode_statistics),
                });
            }
            row_groups.push(RowGroupMeta {
                num_rows: rg.num_rows().max(0) as usize,
                columns,
            });
        }
        Ok(FileMetadata { row_groups })
    }

    /// Stream one column as per-batch chunks of typed values.
    pub fn read_column(
        label: &str,
        bytes: &[u8],
        column: &str,
        row_groups: Option<&[usize]>,
    ) -> Result<ColumnChunks, StorageError> {
        check_magic(label, bytes)?;
        let builder = reader_builder(label, bytes)?;

        let leaf = builder
            .parquet_schema()
            .columns()
            .iter()
            .position(|c| c.path().string() == column)
            .ok_or_else(|| StorageError::ParquetRead {
                path: label.to_string(),
                cause: format!("no such column '{}'", column),
            })?;
        let mask = ProjectionMask::leaves(builder.parquet_schema(), [leaf]);

        let mut builder = builder.with_projection(mask);
        if let Some(rgs) = row_groups {
            builder = builder.with_row_groups(rgs.to_vec());
        }
        let reader = builder.build().map_err(|e| StorageError::ParquetRead {
            path: label.to_string(),
            cause: e.to_string(),
        })?;

        Ok(ColumnChunks {
            label: label.to_string(),
            reader,
        })
    }

    /// Stream rows as JSON maps, optionally restricted to a column subset and
    /// a row-group selection.
    pub fn read_rows(
        label: &str,
        bytes: &[u8],
        columns: Option<&[&str]>,
        row_groups: Option<&[usize]>,
    ) -> Result<RowReader, StorageError> {
        check_magic(label, bytes)?;
        let builder = reader_builder(label, bytes)?;

        let mut builder = if let Some(subset) = columns {
            let descr = builder.parquet_schema();
            let mut leaves = Vec::new();
            for name in subset {
                let idx = descr
                    .columns()
                    .iter()
                    .position(|c| &c.path().string() == name)
                    .ok_or_else(|| StorageError::ParquetRead {
                        path: label.to_string(),
                        cause: format!("no such column '{}'", name),
                    })?;
                leaves.push(idx);
            }
            let mask = ProjectionMask::leaves(descr, leaves);
            builder.with_projection(mask)
        } else {
            builder
        };
        if let Some(rgs) = row_groups {
            builder = builder.with_row_groups(rgs.to_vec());
        }

        let reader = builder.build().map_err(|e| StorageError::ParquetRead {
            path: label.to_string(),
            cause: e.to_string(),
        })?;

        Ok(RowReader {
            label: label.to_string(),
            reader,
            pending: VecDeque::new(),
        })
    }
}

fn reader_builder(
    label: &str,
    bytes: &[u8],
) -> Result<ParquetRecordBatchReaderBuilder<Bytes>, StorageError> {
    ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes)).map_err(|e| {
        StorageError::ParquetRead {
            path: label.to_string(),
            cause: e.to_string(),
        }
    })
}

fn check_magic(label: &str, bytes: &[u8]) -> Result<(), StorageError> {
    const MAGIC: &[u8] = b"PAR1";
    if bytes.len() < 8 || &bytes[..4] != MAGIC || &bytes[bytes.len() - 4..] != MAGIC {
        return Err(StorageError::ParquetRead {
            path: label.to_string(),
            cause: "missing PAR1 magic bytes (corrupt or truncated file)".to_string(),
        });
    }
    Ok(())
}

fn build_array(spec: &TableColumn, values: &[ColumnValue]) -> Result<ArrayRef, String> {
    let bad_cell = |v: &ColumnValue| {
        format!(
            "column '{}' expected {:?}, got {:?}",
            spec.name, spec.column_type, v
        )
    };
    match spec.column_type {
        ColumnType::String => {
            let mut out: Vec<Option<&str>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    ColumnValue::Str(s) => out.push(Some(s.as_str())),
                    ColumnValue::Null if !spec.required => out.push(None),
                    other => return Err(bad_cell(other)),
                }
            }
            Ok(Arc::new(StringArray::from(out)) as ArrayRef)
        }
        ColumnType::Int32 => {
            let mut out: Vec<Option<i32>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    ColumnValue::Int(i) => {
                        let narrow =
                            i32::try_from(*i).map_err(|_| bad_cell(&ColumnValue::Int(*i)))?;
                        out.push(Some(narrow));
                    }
                    ColumnValue::Null if !spec.required => out.push(None),
                    other => return Err(bad_cell(other)),
                }
            }
            Ok(Arc::new(Int32Array::from(out)) as ArrayRef)
        }
        ColumnType::Int64 => {
            let mut out: Vec<Option<i64>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    ColumnValue::Int(i) => out.push(Some(*i)),
                    ColumnValue::Null if !spec.required => out.push(None),
                    other => return Err(bad_cell(other)),
                }
            }
            Ok(Arc::new(Int64Array::from(out)) as ArrayRef)
        }
        ColumnType::Double => {
            let mut out: Vec<Option<f64>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    ColumnValue::Double(d) => out.push(Some(*d)),
                    ColumnValue::Int(i) => out.push(Some(*i as f64)),
                    ColumnValue::Null if !spec.required => out.push(None),
                    other => return Err(bad_cell(other)),
                }
            }
            Ok(Arc::new(Float64Array::from(out)) as ArrayRef)
        }
        ColumnType::Boolean => {
            let mut out: Vec<Option<bool>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    ColumnValue::Bool(b) => out.push(Some(*b)),
                    ColumnValue::Null if !spec.required => out.push(None),
                    other => return Err(bad_cell(other)),
                }
            }
            Ok(Arc::new(BooleanArray::from(out)) as ArrayRef)
        }
    }
}

fn decode_statistics(stats: &Statistics) -> ColumnStats {
    let (min, max) = match stats {
        Statistics::Boolean(s) => (
            s.min_opt().map(|v| ColumnValue::Bool(*v)),
            s.max_opt().map(|v| ColumnValue::Bool(*v)),
        ),
        Statistics::Int32(s) => (
            s.min_opt().map(|v| ColumnValue::Int(*v as i64)),
            s.max_opt().map(|v| ColumnValue::Int(*v as i64)),
        ),
        Statistics::Int64(s) => (
            s.min_opt().map(|v| ColumnValue::Int(*v)),
            s.max_opt().map(|v| ColumnValue::Int(*v)),
        ),
        Statistics::Float(s) => (
            s.min_opt().map(|v| ColumnValue::Double(*v as f64)),
            s.max_opt().map(|v| ColumnValue::Double(*v as f64)),
        ),
        Statistics::Double(s) => (
            s.min_opt().map(|v| ColumnValue::Double(*v)),
            s.max_opt().map(|v| ColumnValue::Double(*v)),
        ),
        Statistics::ByteArray(s) => (
            s.min_opt()
                .and_then(|v| v.as_utf8().ok())
                .map(|v| ColumnValue::Str(v.to_string())),
            s.max_opt()
                .and_then(|v| v.as_utf8().ok())
                .map(|v| ColumnValue::Str(v.to_string())),
        ),
        _ => (None, None),
    };
    ColumnStats {
        min,
        max,
        null_count: stats.null_count_opt(),
    }
}

/// Lazy per-batch chunks of one column.
pub struct ColumnChunks {
    label: String,
    reader: ParquetRecordBatchReader,
}

impl Iterator for ColumnChunks {
    type Item = Result<Vec<ColumnValue>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self.reader.next()? {
            Ok(batch) => batch,
            Err(e) => {
                return Some(Err(StorageError::ParquetRead {
                    path: self.label.clone(),
                    cause: e.to_string(),
                }))
            }
        };
        if batch.num_columns() == 0 {
            return Some(Ok(Vec::new()));
        }
        Some(Ok(array_to_values(batch.column(0))))
    }
}

/// Lazy row reader yielding JSON maps.
pub struct RowReader {
    label: String,
    reader: ParquetRecordBatchReader,
    pending: VecDeque<Map<String, Value>>,
}

impl std::fmt::Debug for RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("label", &self.label)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Iterator for RowReader {
    type Item = Result<Map<String, Value>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            let batch = match self.reader.next()? {
                Ok(batch) => batch,
                Err(e) => {
                    return Some(Err(StorageError::ParquetRead {
                        path: self.label.clone(),
                        cause: e.to_string(),
                    }))
                }
            };
            let names: Vec<String> = batch
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect();
            let columns: Vec<Vec<ColumnValue>> =
                batch.columns().iter().map(array_to_values).collect();
            for row_idx in 0..batch.num_rows() {
                let mut row = Map::new();
                for (name, col) in names.iter().zip(&columns) {
                    row.insert(name.clone(), col[row_idx].to_json());
                }
                self.pending.push_back(row);
            }
        }
    }
}

fn array_to_values(array: &ArrayRef) -> Vec<ColumnValue> {
    let n = array.len();
    let mut out = Vec::with_capacity(n);
    match array.data_type() {
        DataType::Utf8 => {
            if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
                for i in 0..n {
                    out.push(if a.is_null(i) {
                        ColumnValue::Null
                    } else {
                        ColumnValue::Str(a.value(i).to_string())
                    });
                }
            }
        }
        DataType::Int32 => {
            if let Some(a) = array.as_any().downcast_ref::<Int32Array>() {
                for i in 0..n {
                    out.push(if a.is_null(i) {
                        ColumnValue::Null
                    } else {
                        ColumnValue::Int(a.value(i) as i64)
                    });
                }
            }
        }
        DataType::Int64 => {
            if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
                for i in 0..n {
                    out.push(if a.is_null(i) {
                        ColumnValue::Null
                    } else {
                        ColumnValue::Int(a.value(i))
                    });
                }
            }
        }
        DataType::Float64 => {
            if let Some(a) = array.as_any().downcast_ref::<Float64Array>() {
                for i in 0..n {
                    out.push(if a.is_null(i) {
                        ColumnValue::Null
                    } else {
                        ColumnValue::Double(a.value(i))
                    });
                }
            }
        }
        DataType::Boolean => {
            if let Some(a) = array.as_any().downcast_ref::<BooleanArray>() {
                for i in 0..n {
                    out.push(if a.is_null(i) {
                        ColumnValue::Null
                    } else {
                        ColumnValue::Bool(a.value(i))
                    });
                }
            }
        }
        _ => out.resize(n, ColumnValue::Null),
    }
    // Unsupported array types decode as all nulls rather than panicking.
    if out.len() != n {
        out.resize(n, ColumnValue::Null);
    }
    out
}
