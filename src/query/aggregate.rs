//! Columnar aggregation: COUNT/SUM/AVG/MIN/MAX evaluated directly on Parquet
//! columns and row-group statistics. Whole-row objects are never built.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::{ColumnValue, ParquetCodec};

use super::QueryError;

/// One aggregation: what to compute over which column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    /// `field = "*"` counts rows from metadata alone.
    Count { field: String },
    Sum { field: String },
    Avg { field: String },
    Min { field: String },
    Max { field: String },
}

impl Aggregation {
    fn field(&self) -> &str {
        match self {
            Aggregation::Count { field }
            | Aggregation::Sum { field }
            | Aggregation::Avg { field }
            | Aggregation::Min { field }
            | Aggregation::Max { field } => field,
        }
    }

    /// Parse one spec entry. Accepts the long form `{type: "sum", field:
    /// "price"}` and the shorthand `{sum: "price"}` / `{count: "*"}`.
    fn parse(name: &str, value: &Value) -> Result<Self, QueryError> {
        let obj = value.as_object().ok_or_else(|| {
            QueryError::InvalidAggregate(format!("aggregation '{}' must be an object", name))
        })?;

        let (kind, field) = if let Some(kind) = obj.get("type").and_then(|v| v.as_str()) {
            let field = obj.get("field").and_then(|v| v.as_str()).ok_or_else(|| {
                QueryError::InvalidAggregate(format!("aggregation '{}' needs a field", name))
            })?;
            (kind.to_string(), field.to_string())
        } else if obj.len() == 1 {
            let (kind, field_value) = obj.iter().next().ok_or_else(|| {
                QueryError::InvalidAggregate(format!("aggregation '{}' is empty", name))
            })?;
            let field = field_value.as_str().ok_or_else(|| {
                QueryError::InvalidAggregate(format!(
                    "aggregation '{}' needs a field name",
                    name
                ))
            })?;
            (kind.clone(), field.to_string())
        } else {
            return Err(QueryError::InvalidAggregate(format!(
                "aggregation '{}' has an unrecognized shape",
                name
            )));
        };

        match kind.as_str() {
            "count" => Ok(Aggregation::Count { field }),
            "sum" => Ok(Aggregation::Sum { field }),
            "avg" => Ok(Aggregation::Avg { field }),
            "min" => Ok(Aggregation::Min { field }),
            "max" => Ok(Aggregation::Max { field }),
            other => Err(QueryError::InvalidAggregate(format!(
                "unknown aggregation type '{}' on '{}'",
                other, name
            ))),
        }
    }
}

/// Named aggregations, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AggregateSpec {
    pub entries: Vec<(String, Aggregation)>,
}

impl AggregateSpec {
    pub fn parse(value: &Value) -> Result<Self, QueryError> {
        let obj = value.as_object().ok_or_else(|| {
            QueryError::InvalidAggregate("aggregate spec must be an object".to_string())
        })?;
        let mut entries = Vec::new();
        for (name, entry) in obj {
            entries.push((name.clone(), Aggregation::parse(name, entry)?));
        }
        Ok(Self { entries })
    }
}

/// Bookkeeping about how the aggregation was answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub metadata_only: bool,
    pub data_read: bool,
    pub used_column_stats: bool,
    /// Always zero: aggregations never construct whole-row objects.
    pub rows_materialized: u64,
}

/// Aggregation result: named values plus `_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub values: Map<String, Value>,
    #[serde(rename = "_stats")]
    pub stats: AggregateStats,
}

/// Streamed per-column accumulators.
#[derive(Debug, Default, Clone)]
struct ColumnAccumulator {
    non_null: u64,
    sum_int: i64,
    sum_float: f64,
    all_int: bool,
    min: Option<ColumnValue>,
    max: Option<ColumnValue>,
}

impl ColumnAccumulator {
    fn new() -> Self {
        Self {
            all_int: true,
            ..Self::default()
        }
    }

    fn accept(&mut self, value: &ColumnValue) {
        match value {
            ColumnValue::Null => return,
            ColumnValue::Int(i) => {
                self.sum_int = self.sum_int.wrapping_add(*i);
                self.sum_float += *i as f64;
            }
            ColumnValue::Double(d) => {
                self.all_int = false;
                self.sum_float += d;
            }
            _ => {
                self.all_int = false;
            }
        }
        self.non_null += 1;
        if self
            .min
            .as_ref()
            .map(|m| column_value_lt(value, m))
            .unwrap_or(true)
        {
            self.min = Some(value.clone());
        }
        if self
            .max
            .as_ref()
            .map(|m| column_value_lt(m, value))
            .unwrap_or(true)
        {
            self.max = Some(value.clone());
        }
    }

    fn sum(&self) -> Value {
        if self.non_null == 0 {
            Value::from(0)
        } else if self.all_int {
            Value::from(self.sum_int)
        } else {
            serde_json::Number::from_f64(self.sum_float)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }

    fn avg(&self) -> Value {
        if self.non_null == 0 {
            Value::Null
        } else {
            serde_json::Number::from_f64(self.sum_float / self.non_null as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

fn column_value_lt(a: &ColumnValue, b: &ColumnValue) -> bool {
    match (a, b) {
        (ColumnValue::Int(x), ColumnValue::Int(y)) => x < y,
        (ColumnValue::Double(x), ColumnValue::Double(y)) => x < y,
        (ColumnValue::Int(x), ColumnValue::Double(y)) => (*x as f64) < *y,
        (ColumnValue::Double(x), ColumnValue::Int(y)) => *x < (*y as f64),
        (ColumnValue::Str(x), ColumnValue::Str(y)) => x < y,
        (ColumnValue::Bool(x), ColumnValue::Bool(y)) => !x & y,
        _ => false,
    }
}

/// Evaluate an aggregation spec over a Parquet file.
pub fn aggregate(
    label: &str,
    bytes: &[u8],
    spec: &AggregateSpec,
) -> Result<AggregateOutcome, QueryError> {
    let metadata = ParquetCodec::read_metadata(label, bytes)?;
    let total_rows: u64 = metadata.row_groups.iter().map(|rg| rg.num_rows as u64).sum();

    let mut stats = AggregateStats {
        metadata_only: true,
        data_read: false,
        used_column_stats: false,
        rows_materialized: 0,
    };

    // Which columns must actually be streamed: sum/avg always, count(col)
    // always, min/max only when row-group statistics cannot answer them.
    let mut scan_columns: Vec<String> = Vec::new();
    let needs_scan = |col: &str, scan_columns: &mut Vec<String>| {
        if !scan_columns.iter().any(|c| c == col) {
            scan_columns.push(col.to_string());
        }
    };

    for (_, agg) in &spec.entries {
        match agg {
            Aggregation::Count { field } if field == "*" => {}
            Aggregation::Count { field } => needs_scan(field, &mut scan_columns),
            Aggregation::Sum { field } | Aggregation::Avg { field } => {
                needs_scan(field, &mut scan_columns)
            }
            Aggregation::Min { field } | Aggregation::Max { field } => {
                if stats_bounds(&metadata, field).is_none() {
                    needs_scan(field, &mut scan_columns);
                }
            }
        }
    }

    // One pass per scanned column regardless of how many aggregations use it.
    let mut accumulators: Map<String, Value> = Map::new();
    let mut scanned: std::collections::HashMap<String, ColumnAccumulator> =
        std::collections::HashMap::new();
    for column in &scan_columns {
        let mut acc = ColumnAccumulator::new();
        for chunk in ParquetCodec::read_column(label, bytes, column, None)? {
            for value in chunk? {
                acc.accept(&value);
            }
        }
        stats.metadata_only = false;
        stats.data_read = true;
        scanned.insert(column.clone(), acc);
    }

    for (name, agg) in &spec.entries {
        let value = match agg {
            Aggregation::Count { field } if field == "*" => Value::from(total_rows),
            Aggregation::Count { field } => Value::from(
                scanned
                    .get(field)
                    .map(|acc| acc.non_null)
                    .unwrap_or(0),
            ),
            Aggregation::Sum { field } => scanned
                .get(field)
                .map(|acc| acc.sum())
                .unwrap_or(Value::from(0)),
            Aggregation::Avg { field } => scanned
                .get(field)
                .map(|acc| acc.avg())
                .unwrap_or(Value::Null),
            Aggregation::Min { field } => match scanned.get(field) {
                Some(acc) => acc.min.as_ref().map(|v| v.to_json()).unwrap_or(Value::Null),
                None => {
                    stats.used_column_stats = true;
                    stats_bounds(&metadata, field)
                        .map(|(min, _)| min.to_json())
                        .unwrap_or(Value::Null)
                }
            },
            Aggregation::Max { field } => match scanned.get(field) {
                Some(acc) => acc.max.as_ref().map(|v| v.to_json()).unwrap_or(Value::Null),
                None => {
                    stats.used_column_stats = true;
                    stats_bounds(&metadata, field)
                        .map(|(_, max)| max.to_json())
                        .unwrap_or(Value::Null)
                }
            },
        };
        accumulators.insert(name.clone(), value);
    }

    Ok(AggregateOutcome {
        values: accumulators,
        stats,
    })
}

/// Build an all-zero outcome for an empty store (no file to read).
pub fn empty_outcome(spec: &AggregateSpec) -> AggregateOutcome {
    let mut values = Map::new();
    for (name, agg) in &spec.entries {
        let value = match agg {
            Aggregation::Count { .. } => Value::from(0),
            Aggregation::Sum { .. } => Value::from(0),
            Aggregation::Avg { .. } | Aggregation::Min { .. } | Aggregation::Max { .. } => {
                Value::Null
            }
        };
        values.insert(name.clone(), value);
    }
    AggregateOutcome {
        values,
        stats: AggregateStats {
            metadata_only: true,
            data_read: false,
            used_column_stats: false,
            rows_materialized: 0,
        },
    }
}

/// Fold min/max over all row groups' statistics. `None` when any row group
/// lacks statistics for the column (or the file has no rows with values).
fn stats_bounds(
    metadata: &crate::storage::FileMetadata,
    column: &str,
) -> Option<(ColumnValue, ColumnValue)> {
    let mut min: Option<ColumnValue> = None;
    let mut max: Option<ColumnValue> = None;
    for rg in &metadata.row_groups {
        if rg.num_rows == 0 {
            continue;
        }
        let col = rg.column(column)?;
        let col_stats = col.statistics.as_ref()?;

        // A row group that is entirely null carries no bounds; skip it.
        if col_stats.null_count == Some(rg.num_rows as u64) {
            continue;
        }
        let rg_min = col_stats.min.as_ref()?;
        let rg_max = col_stats.max.as_ref()?;
        if min.as_ref().map(|m| column_value_lt(rg_min, m)).unwrap_or(true) {
            min = Some(rg_min.clone());
        }
        if max.as_ref().map(|m| column_value_lt(m, rg_max)).unwrap_or(true) {
            max = Some(rg_max.clone());
        }
    }
    Some((min?, max?))
}
