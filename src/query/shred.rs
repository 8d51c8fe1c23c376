//! Variant shredding: selected entity fields are stored twice inside the
//! `$data` variant column — once in the JSON remainder and once as native
//! typed side columns — so Parquet row-group statistics can prune scans
//! before any column bytes are read.

use serde_json::{Map, Value};

use crate::models::TypeDef;
use crate::storage::RowGroupMeta;

use super::filter::compare_values;

/// Fields always shredded, independent of any type definition.
pub const DEFAULT_DATA_SHRED_FIELDS: &[&str] = &["$type"];

/// Marker stored in the variant metadata sub-column.
pub const VARIANT_METADATA_V1: &str = "pqv1";

/// Shredding configuration for one variant column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShredConfig {
    pub column_name: String,
    pub shred_fields: Vec<String>,
}

impl ShredConfig {
    pub fn new(column_name: &str, shred_fields: Vec<String>) -> Self {
        Self {
            column_name: column_name.to_string(),
            shred_fields,
        }
    }

    pub fn is_shredded(&self, field: &str) -> bool {
        self.shred_fields.iter().any(|f| f == field)
    }
}

/// All shreddable fields for a type: the defaults, the explicit `$shred`
/// list, and the auto-shredded enum/boolean/date/indexed fields.
pub fn data_shred_fields(type_def: Option<&TypeDef>) -> Vec<String> {
    let mut fields: Vec<String> = DEFAULT_DATA_SHRED_FIELDS
        .iter()
        .map(|f| f.to_string())
        .collect();
    if let Some(def) = type_def {
        for field in def.shred_fields.iter().cloned().chain(def.auto_shred_fields()) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
    }
    fields
}

/// The shredded layout of a document batch, ready for the Parquet writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ShreddedVariantData {
    /// Column name to per-row values, in a deterministic column order:
    /// metadata, value, then one typed column per shredded field.
    pub column_data: Vec<(String, Vec<Value>)>,
    /// Typed columns the writer should record min/max statistics for.
    pub statistics_paths: Vec<String>,
}

/// The flat column name of a shredded field's typed copy.
pub fn typed_value_path(column_name: &str, field: &str) -> String {
    format!("{}.typed_value.{}.typed_value", column_name, field)
}

/// Build the shredded variant layout for a batch of documents.
pub fn prepare_shredded_variant_data(
    documents: &[Map<String, Value>],
    shred_fields: &[String],
    column_name: &str,
) -> ShreddedVariantData {
    let mut metadata_column = Vec::with_capacity(documents.len());
    let mut value_column = Vec::with_capacity(documents.len());
    let mut typed_columns: Vec<Vec<Value>> = vec![Vec::with_capacity(documents.len()); shred_fields.len()];

    let is_scalar = |v: &Value| {
        matches!(
            v,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    };

    for document in documents {
        metadata_column.push(Value::String(VARIANT_METADATA_V1.to_string()));

        // The JSON remainder excludes the shredded scalar fields; they live
        // in the typed side columns. Non-scalar values stay in the remainder
        // since typed columns cannot carry them.
        let mut remainder = Map::new();
        for (key, value) in document {
            let shredded = shred_fields.iter().any(|f| f == key) && is_scalar(value);
            if !shredded {
                remainder.insert(key.clone(), value.clone());
            }
        }
        value_column.push(Value::String(
            serde_json::to_string(&Value::Object(remainder)).unwrap_or_default(),
        ));

        for (i, field) in shred_fields.iter().enumerate() {
            let value = document
                .get(field)
                .filter(|v| is_scalar(v))
                .cloned()
                .unwrap_or(Value::Null);
            typed_columns[i].push(value);
        }
    }

    let mut column_data = vec![
        (format!("{}.metadata", column_name), metadata_column),
        (format!("{}.value", column_name), value_column),
    ];
    let mut statistics_paths = Vec::with_capacity(shred_fields.len());
    for (field, values) in shred_fields.iter().zip(typed_columns) {
        let path = typed_value_path(column_name, field);
        statistics_paths.push(path.clone());
        column_data.push((path, values));
    }

    ShreddedVariantData {
        column_data,
        statistics_paths,
    }
}

/// Map a `$data.<field>` filter path to its statistics path, iff the field is
/// shredded under the config's column.
pub fn map_filter_to_statistics_path(path: &str, config: &ShredConfig) -> Option<String> {
    let prefix = format!("{}.", config.column_name);
    let field = path.strip_prefix(&prefix)?;
    if config.is_shredded(field) {
        Some(typed_value_path(&config.column_name, field))
    } else {
        None
    }
}

/// Rewrite all shredded-field leaves of a filter tree, preserving logical
/// operators. Unmapped leaves pass through unchanged.
pub fn transform_filter_for_shredding(filter: &Value, configs: &[ShredConfig]) -> Value {
    let Some(obj) = filter.as_object() else {
        return filter.clone();
    };
    let mut out = Map::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let rewritten = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| transform_filter_for_shredding(item, configs))
                            .collect::<Vec<_>>()
                    })
                    .map(Value::Array)
                    .unwrap_or_else(|| value.clone());
                out.insert(key.clone(), rewritten);
            }
            "$not" => {
                out.insert(
                    key.clone(),
                    transform_filter_for_shredding(value, configs),
                );
            }
            _ => {
                let mapped = configs
                    .iter()
                    .find_map(|config| map_filter_to_statistics_path(key, config));
                out.insert(mapped.unwrap_or_else(|| key.clone()), value.clone());
            }
        }
    }
    Value::Object(out)
}

/// True iff any condition in the tree targets a shredded field.
pub fn can_pushdown_with_shredding(filter: &Value, configs: &[ShredConfig]) -> bool {
    let Some(obj) = filter.as_object() else {
        return false;
    };
    obj.iter().any(|(key, value)| match key.as_str() {
        "$and" | "$or" | "$nor" => value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .any(|item| can_pushdown_with_shredding(item, configs))
            })
            .unwrap_or(false),
        "$not" => can_pushdown_with_shredding(value, configs),
        _ => configs
            .iter()
            .any(|config| map_filter_to_statistics_path(key, config).is_some()),
    })
}

/// A `(min, max) -> bool` predicate deciding whether a row group *might*
/// contain a matching value for one leaf condition.
#[derive(Debug, Clone)]
pub struct ShredPredicate {
    checks: Vec<RangeCheck>,
}

#[derive(Debug, Clone)]
enum RangeCheck {
    /// Equality and `$in`: any candidate within `[min, max]`.
    AnyOf(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

impl ShredPredicate {
    /// Whether `[min, max]` may contain a matching value. Every check must be
    /// individually satisfiable for the group to survive.
    pub fn matches(&self, min: &Value, max: &Value) -> bool {
        self.checks.iter().all(|check| match check {
            RangeCheck::AnyOf(candidates) => candidates.iter().any(|candidate| {
                in_range(candidate, min, max)
            }),
            RangeCheck::Gt(bound) => {
                compare_values(max, bound) == Some(std::cmp::Ordering::Greater)
            }
            RangeCheck::Gte(bound) => matches!(
                compare_values(max, bound),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            RangeCheck::Lt(bound) => {
                compare_values(min, bound) == Some(std::cmp::Ordering::Less)
            }
            RangeCheck::Lte(bound) => matches!(
                compare_values(min, bound),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
        })
    }
}

fn in_range(candidate: &Value, min: &Value, max: &Value) -> bool {
    let ge_min = matches!(
        compare_values(candidate, min),
        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
    );
    let le_max = matches!(
        compare_values(candidate, max),
        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
    );
    ge_min && le_max
}

/// Convert a leaf condition (bare value, `$in`, or range operators) into a
/// row-group predicate. Conditions the statistics cannot decide return
/// `None` — callers must keep the row group.
pub fn create_shredded_predicate(condition: &Value) -> Option<ShredPredicate> {
    let mut checks = Vec::new();
    match condition.as_object() {
        None => checks.push(RangeCheck::AnyOf(vec![condition.clone()])),
        Some(obj) if obj.keys().any(|k| k.starts_with('$')) => {
            for (op, v) in obj {
                match op.as_str() {
                    "$eq" => checks.push(RangeCheck::AnyOf(vec![v.clone()])),
                    "$in" => checks.push(RangeCheck::AnyOf(v.as_array()?.clone())),
                    "$gt" => checks.push(RangeCheck::Gt(v.clone())),
                    "$gte" => checks.push(RangeCheck::Gte(v.clone())),
                    "$lt" => checks.push(RangeCheck::Lt(v.clone())),
                    "$lte" => checks.push(RangeCheck::Lte(v.clone())),
                    // Anything else is beyond min/max reasoning.
                    _ => return None,
                }
            }
        }
        Some(_) => checks.push(RangeCheck::AnyOf(vec![condition.clone()])),
    }
    if checks.is_empty() {
        return None;
    }
    Some(ShredPredicate { checks })
}

/// Decide whether a row group can be skipped for a rewritten filter: true
/// only when at least one leaf has usable statistics and every such leaf
/// evaluates false. Logical subtrees are conservatively kept.
pub fn should_skip_row_group(filter: &Value, row_group: &RowGroupMeta) -> bool {
    let Some(obj) = filter.as_object() else {
        return false;
    };

    let mut decided_any = false;
    for (key, condition) in obj {
        if key.starts_with('$') {
            // $and/$or/$not subtrees never force a skip.
            continue;
        }
        let Some(column) = row_group.column(key) else {
            continue;
        };
        let Some(stats) = column.statistics.as_ref() else {
            continue;
        };
        let (Some(min), Some(max)) = (stats.min.as_ref(), stats.max.as_ref()) else {
            continue;
        };
        let Some(predicate) = create_shredded_predicate(condition) else {
            continue;
        };
        decided_any = true;
        if predicate.matches(&min.to_json(), &max.to_json()) {
            return false;
        }
    }
    decided_any
}
