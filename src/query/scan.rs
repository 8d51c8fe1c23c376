//! Parquet-side filtered scans: rewrite a filter through the shredding
//! config, prune row groups via statistics, then materialize and evaluate
//! only the surviving rows.

use serde_json::{Map, Value};

use crate::storage::ParquetCodec;

use super::filter::Filter;
use super::shred::{
    can_pushdown_with_shredding, should_skip_row_group, transform_filter_for_shredding,
    ShredConfig,
};
use super::QueryError;

/// Result of a filtered scan, with pruning bookkeeping.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub rows: Vec<Map<String, Value>>,
    pub row_groups_total: usize,
    pub row_groups_scanned: usize,
}

/// Scan an entity Parquet file with a filter. Row groups whose statistics
/// prove the predicate cannot match are skipped without reading any column
/// bytes.
pub fn scan_parquet(
    label: &str,
    bytes: &[u8],
    filter: &Value,
    configs: &[ShredConfig],
) -> Result<ScanOutcome, QueryError> {
    let rewritten = if can_pushdown_with_shredding(filter, configs) {
        transform_filter_for_shredding(filter, configs)
    } else {
        filter.clone()
    };

    let metadata = ParquetCodec::read_metadata(label, bytes)?;
    let row_groups_total = metadata.row_groups.len();

    let surviving: Vec<usize> = metadata
        .row_groups
        .iter()
        .enumerate()
        .filter(|(_, rg)| !should_skip_row_group(&rewritten, rg))
        .map(|(i, _)| i)
        .collect();

    let parsed = Filter::parse(filter)?;
    let mut rows = Vec::new();
    if !surviving.is_empty() {
        for row in ParquetCodec::read_rows(label, bytes, None, Some(&surviving))? {
            let document = reconstruct_document(row?);
            if parsed.matches(&document) {
                rows.push(document);
            }
        }
    }

    Ok(ScanOutcome {
        rows,
        row_groups_total,
        row_groups_scanned: surviving.len(),
    })
}

/// Rebuild a logical document from an entity-file row: built-in columns pass
/// through, the variant remainder is parsed back, and typed shredded copies
/// win over the remainder.
pub fn reconstruct_document(row: Map<String, Value>) -> Map<String, Value> {
    let mut document = Map::new();
    let mut typed: Vec<(String, Value)> = Vec::new();

    for (column, value) in row {
        if let Some(rest) = column.strip_prefix("$data.") {
            if rest == "metadata" {
                continue;
            }
            if rest == "value" {
                if let Some(remainder) = value
                    .as_str()
                    .and_then(|s| serde_json::from_str::<Value>(s).ok())
                    .and_then(|v| v.as_object().cloned())
                {
                    for (k, v) in remainder {
                        document.insert(k, v);
                    }
                }
                continue;
            }
            if let Some(field) = rest
                .strip_prefix("typed_value.")
                .and_then(|s| s.strip_suffix(".typed_value"))
            {
                typed.push((field.to_string(), value));
            }
            continue;
        }
        document.insert(column, value);
    }

    for (field, value) in typed {
        if !value.is_null() {
            document.insert(field, value);
        }
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::shred::{prepare_shredded_variant_data, typed_value_path};
    use crate::storage::{ColumnType, ColumnValue, TableColumn, TableSchema, WriteOptions};
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Build an entity file with `$id` + a shredded `$data` column, one row
    /// group per row so pruning is observable.
    fn entity_file(documents: &[Map<String, Value>]) -> (Vec<u8>, Vec<ShredConfig>) {
        let shred = vec!["$type".to_string()];
        let variant = prepare_shredded_variant_data(documents, &shred, "$data");

        let mut columns_spec = vec![TableColumn::required("$id", ColumnType::String)];
        let mut columns: Vec<Vec<ColumnValue>> = vec![documents
            .iter()
            .map(|d| {
                ColumnValue::Str(d.get("$id").and_then(|v| v.as_str()).unwrap_or("").to_string())
            })
            .collect()];
        for (name, values) in &variant.column_data {
            columns_spec.push(TableColumn::optional(name, ColumnType::String));
            columns.push(
                values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => ColumnValue::Str(s.clone()),
                        Value::Null => ColumnValue::Null,
                        other => ColumnValue::Str(other.to_string()),
                    })
                    .collect(),
            );
        }

        let schema = TableSchema::new(columns_spec);
        let bytes = ParquetCodec::write_table_opts(
            "entities",
            &schema,
            &columns,
            WriteOptions {
                max_row_group_size: Some(1),
            },
        )
        .unwrap();
        (bytes, vec![ShredConfig::new("$data", shred)])
    }

    fn sample_docs() -> Vec<Map<String, Value>> {
        vec![
            doc(json!({"$id": "posts/p1", "$type": "Post", "title": "One"})),
            doc(json!({"$id": "posts/p2", "$type": "Post", "title": "Two"})),
            doc(json!({"$id": "comments/c1", "$type": "Comment", "title": "Nope"})),
        ]
    }

    #[test]
    fn test_scan_filters_and_prunes() {
        let (bytes, configs) = entity_file(&sample_docs());
        let out = scan_parquet("entities", &bytes, &json!({"$data.$type": "Post"}), &configs)
            .unwrap();

        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.row_groups_total, 3);
        // The Comment row group is provably excluded by its statistics.
        assert_eq!(out.row_groups_scanned, 2);
        assert!(out.rows.iter().all(|r| r["$type"] == json!("Post")));
    }

    #[test]
    fn test_scan_without_pushdown_reads_everything() {
        let (bytes, configs) = entity_file(&sample_docs());
        let out = scan_parquet("entities", &bytes, &json!({"title": "Two"}), &configs).unwrap();

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.row_groups_scanned, 3);
        assert_eq!(out.rows[0]["$id"], json!("posts/p2"));
    }

    #[test]
    fn test_skipped_row_groups_contain_no_matches() {
        let (bytes, configs) = entity_file(&sample_docs());
        let filter = json!({"$data.$type": "Comment"});

        let pruned = scan_parquet("entities", &bytes, &filter, &configs).unwrap();
        let unpruned = scan_parquet("entities", &bytes, &filter, &[]).unwrap();

        assert!(pruned.row_groups_scanned < pruned.row_groups_total);
        assert_eq!(pruned.rows, unpruned.rows);
    }

    #[test]
    fn test_reconstruct_document_round_trip() {
        let row = doc(json!({
            "$id": "posts/p1",
            "$data.metadata": "pqv1",
            "$data.value": "{\"title\":\"One\",\"views\":3}",
            "$data.typed_value.$type.typed_value": "Post",
        }));
        let document = reconstruct_document(row);

        assert_eq!(document["$id"], json!("posts/p1"));
        assert_eq!(document["$type"], json!("Post"));
        assert_eq!(document["title"], json!("One"));
        assert_eq!(document["views"], json!(3));
        assert!(document.get("$data.metadata").is_none());
    }

    #[test]
    fn test_empty_filter_scans_all_rows() {
        let (bytes, configs) = entity_file(&sample_docs());
        let out = scan_parquet("entities", &bytes, &json!({}), &configs).unwrap();
        assert_eq!(out.rows.len(), 3);
    }

    #[test]
    fn test_typed_path_helper() {
        assert_eq!(
            typed_value_path("$data", "status"),
            "$data.typed_value.status.typed_value"
        );
    }
}
