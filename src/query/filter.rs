//! Filter evaluation: JSON filter trees parsed into a typed AST.
//!
//! Bare values in field position are equality matches; sub-documents without
//! operator keys match by deep structural equality; `$`-keyed objects apply
//! typed operator conditions at the leaves.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

use super::QueryError;

/// A parsed filter tree.
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Not(Box<Filter>),
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
    Text(TextQuery),
    Vector(VectorQuery),
    Geo(GeoQuery),
}

/// One typed operator condition on a field.
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(Regex),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    All(Vec<Value>),
    ElemMatch(Box<ElemMatch>),
    Size(u64),
    Exists(bool),
    Type(TypeName),
    Not(Vec<Condition>),
}

/// `$elemMatch` body: either bare conditions applied to each element, or a
/// document filter applied to object elements.
#[derive(Debug, Clone)]
pub enum ElemMatch {
    Conditions(Vec<Condition>),
    Doc(Filter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeName {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
    Date,
}

#[derive(Debug, Clone)]
pub struct TextQuery {
    pub search: String,
    pub language: Option<String>,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub query: Vec<f64>,
    pub field: String,
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct GeoQuery {
    pub field: String,
    pub lat: f64,
    pub lng: f64,
    pub max_distance: Option<f64>,
}

impl Filter {
    /// Parse a JSON filter tree.
    pub fn parse(value: &Value) -> Result<Self, QueryError> {
        let obj = value
            .as_object()
            .ok_or_else(|| QueryError::InvalidFilter("filter must be an object".to_string()))?;

        let mut parts: Vec<Filter> = Vec::new();
        for (key, v) in obj {
            match key.as_str() {
                "$and" => parts.push(Filter::And(parse_filter_list(key, v)?)),
                "$or" => parts.push(Filter::Or(parse_filter_list(key, v)?)),
                "$nor" => parts.push(Filter::Nor(parse_filter_list(key, v)?)),
                "$not" => parts.push(Filter::Not(Box::new(Filter::parse(v)?))),
                "$text" => parts.push(Filter::Text(parse_text(v)?)),
                "$vector" => parts.push(Filter::Vector(parse_vector(v)?)),
                "$geo" => parts.push(Filter::Geo(parse_geo(v)?)),
                _ if key.starts_with('$') => {
                    return Err(QueryError::InvalidFilter(format!(
                        "unknown filter operator '{}'",
                        key
                    )))
                }
                field => parts.push(Filter::Field {
                    path: field.to_string(),
                    conditions: parse_conditions(field, v)?,
                }),
            }
        }

        Ok(match parts.len() {
            0 => Filter::And(Vec::new()),
            1 => parts.remove(0),
            _ => Filter::And(parts),
        })
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        match self {
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
            Filter::Nor(parts) => !parts.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::Field { path, conditions } => {
                let value = lookup_path(doc, path);
                conditions.iter().all(|c| eval_condition(value, c))
            }
            Filter::Text(text) => text_matches(doc, text),
            Filter::Vector(vector) => {
                // Predicate half only; top-K ranking happens in `find`.
                match lookup_path(doc, &vector.field) {
                    Some(v) => as_f64_vec(v)
                        .map(|candidate| candidate.len() == vector.query.len())
                        .unwrap_or(false),
                    None => false,
                }
            }
            Filter::Geo(geo) => match lookup_path(doc, &geo.field) {
                Some(v) => geo_matches(v, geo),
                None => false,
            },
        }
    }

    /// The vector query embedded in this filter, if any (top level or under
    /// `$and`).
    pub fn vector_query(&self) -> Option<&VectorQuery> {
        match self {
            Filter::Vector(v) => Some(v),
            Filter::And(parts) => parts.iter().find_map(|f| f.vector_query()),
            _ => None,
        }
    }
}

/// Parse-and-match convenience for one-shot callers.
pub fn matches_document(filter: &Value, doc: &Map<String, Value>) -> Result<bool, QueryError> {
    Ok(Filter::parse(filter)?.matches(doc))
}

fn parse_filter_list(op: &str, value: &Value) -> Result<Vec<Filter>, QueryError> {
    let items = value.as_array().ok_or_else(|| {
        QueryError::InvalidFilter(format!("'{}' expects an array of filters", op))
    })?;
    items.iter().map(Filter::parse).collect()
}

fn parse_conditions(field: &str, value: &Value) -> Result<Vec<Condition>, QueryError> {
    let Some(obj) = value.as_object() else {
        return Ok(vec![Condition::Eq(value.clone())]);
    };
    if !obj.keys().any(|k| k.starts_with('$')) {
        // Plain sub-document: deep structural equality.
        return Ok(vec![Condition::Eq(value.clone())]);
    }

    let mut conditions = Vec::new();
    let mut regex_pattern: Option<String> = None;
    let mut regex_options: Option<String> = None;
    for (op, v) in obj {
        match op.as_str() {
            "$eq" => conditions.push(Condition::Eq(v.clone())),
            "$ne" => conditions.push(Condition::Ne(v.clone())),
            "$gt" => conditions.push(Condition::Gt(v.clone())),
            "$gte" => conditions.push(Condition::Gte(v.clone())),
            "$lt" => conditions.push(Condition::Lt(v.clone())),
            "$lte" => conditions.push(Condition::Lte(v.clone())),
            "$in" => conditions.push(Condition::In(expect_array(field, op, v)?)),
            "$nin" => conditions.push(Condition::Nin(expect_array(field, op, v)?)),
            "$regex" => {
                regex_pattern = Some(
                    v.as_str()
                        .ok_or_else(|| {
                            QueryError::InvalidFilter(format!(
                                "$regex on '{}' expects a string",
                                field
                            ))
                        })?
                        .to_string(),
                );
            }
            "$options" => {
                regex_options = v.as_str().map(|s| s.to_string());
            }
            "$startsWith" => conditions.push(Condition::StartsWith(expect_str(field, op, v)?)),
            "$endsWith" => conditions.push(Condition::EndsWith(expect_str(field, op, v)?)),
            "$contains" => conditions.push(Condition::Contains(expect_str(field, op, v)?)),
            "$all" => conditions.push(Condition::All(expect_array(field, op, v)?)),
            "$elemMatch" => conditions.push(Condition::ElemMatch(Box::new(parse_elem_match(
                field, v,
            )?))),
            "$size" => {
                let size = v.as_u64().ok_or_else(|| {
                    QueryError::InvalidFilter(format!(
                        "$size on '{}' expects a non-negative integer",
                        field
                    ))
                })?;
                conditions.push(Condition::Size(size));
            }
            "$exists" => {
                let exists = v.as_bool().ok_or_else(|| {
                    QueryError::InvalidFilter(format!(
                        "$exists on '{}' expects a boolean",
                        field
                    ))
                })?;
                conditions.push(Condition::Exists(exists));
            }
            "$type" => conditions.push(Condition::Type(parse_type_name(field, v)?)),
            "$not" => conditions.push(Condition::Not(parse_conditions(field, v)?)),
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "unknown operator '{}' on field '{}'",
                    other, field
                )))
            }
        }
    }

    if let Some(pattern) = regex_pattern {
        conditions.push(Condition::Regex(build_regex(
            field,
            &pattern,
            regex_options.as_deref(),
        )?));
    } else if regex_options.is_some() {
        return Err(QueryError::InvalidFilter(format!(
            "$options on '{}' requires $regex",
            field
        )));
    }

    Ok(conditions)
}

fn parse_elem_match(field: &str, value: &Value) -> Result<ElemMatch, QueryError> {
    let obj = value.as_object().ok_or_else(|| {
        QueryError::InvalidFilter(format!("$elemMatch on '{}' expects an object", field))
    })?;
    if obj.keys().any(|k| k.starts_with('$')) {
        Ok(ElemMatch::Conditions(parse_conditions(field, value)?))
    } else {
        Ok(ElemMatch::Doc(Filter::parse(value)?))
    }
}

fn expect_array(field: &str, op: &str, value: &Value) -> Result<Vec<Value>, QueryError> {
    value.as_array().cloned().ok_or_else(|| {
        QueryError::InvalidFilter(format!("{} on '{}' expects an array", op, field))
    })
}

fn expect_str(field: &str, op: &str, value: &Value) -> Result<String, QueryError> {
    value.as_str().map(|s| s.to_string()).ok_or_else(|| {
        QueryError::InvalidFilter(format!("{} on '{}' expects a string", op, field))
    })
}

fn build_regex(field: &str, pattern: &str, options: Option<&str>) -> Result<Regex, QueryError> {
    let mut flags = String::new();
    if let Some(options) = options {
        for flag in options.chars() {
            match flag {
                'i' => flags.push('i'),
                'm' => flags.push('m'),
                // Global matching is meaningless for a boolean predicate.
                'g' => {}
                other => {
                    return Err(QueryError::InvalidFilter(format!(
                        "unsupported regex flag '{}' on '{}'",
                        other, field
                    )))
                }
            }
        }
    }
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    Regex::new(&full).map_err(|e| {
        QueryError::InvalidFilter(format!("invalid regex on '{}': {}", field, e))
    })
}

fn parse_type_name(field: &str, value: &Value) -> Result<TypeName, QueryError> {
    match value.as_str() {
        Some("null") => Ok(TypeName::Null),
        Some("boolean") => Ok(TypeName::Boolean),
        Some("number") => Ok(TypeName::Number),
        Some("string") => Ok(TypeName::String),
        Some("array") => Ok(TypeName::Array),
        Some("object") => Ok(TypeName::Object),
        Some("date") => Ok(TypeName::Date),
        _ => Err(QueryError::InvalidFilter(format!(
            "$type on '{}' expects one of null/boolean/number/string/array/object/date",
            field
        ))),
    }
}

fn parse_text(value: &Value) -> Result<TextQuery, QueryError> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::InvalidFilter("$text expects an object".to_string()))?;
    let search = obj
        .get("$search")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::InvalidFilter("$text requires $search".to_string()))?;
    Ok(TextQuery {
        search: search.to_string(),
        language: obj
            .get("$language")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        case_sensitive: obj
            .get("$caseSensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

fn parse_vector(value: &Value) -> Result<VectorQuery, QueryError> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::InvalidFilter("$vector expects an object".to_string()))?;

    // Modern shape {query, field, topK}; legacy {$near, $field, $k}.
    let query = obj.get("query").or_else(|| obj.get("$near"));
    let field = obj.get("field").or_else(|| obj.get("$field"));
    let top_k = obj.get("topK").or_else(|| obj.get("$k"));

    let query = query
        .and_then(as_f64_vec)
        .ok_or_else(|| QueryError::InvalidFilter("$vector requires a numeric query".to_string()))?;
    let field = field
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::InvalidFilter("$vector requires a field".to_string()))?;
    Ok(VectorQuery {
        query,
        field: field.to_string(),
        top_k: top_k.and_then(|v| v.as_u64()).unwrap_or(10) as usize,
    })
}

fn parse_geo(value: &Value) -> Result<GeoQuery, QueryError> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::InvalidFilter("$geo expects an object".to_string()))?;
    let near = obj
        .get("$near")
        .and_then(|v| v.as_object())
        .ok_or_else(|| QueryError::InvalidFilter("$geo requires $near".to_string()))?;
    let lat = near.get("lat").and_then(|v| v.as_f64());
    let lng = near.get("lng").and_then(|v| v.as_f64());
    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err(QueryError::InvalidFilter(
            "$geo.$near requires numeric lat and lng".to_string(),
        ));
    };
    Ok(GeoQuery {
        field: obj
            .get("$field")
            .and_then(|v| v.as_str())
            .unwrap_or("location")
            .to_string(),
        lat,
        lng,
        max_distance: obj.get("$maxDistance").and_then(|v| v.as_f64()),
    })
}

/// Resolve a dotted path against a document. A `$data.` prefix aliases the
/// user-field namespace and is stripped.
pub fn lookup_path<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$data.").unwrap_or(path);
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn eval_condition(value: Option<&Value>, condition: &Condition) -> bool {
    // Array fields match when the array itself matches or any element does.
    if let Some(Value::Array(items)) = value {
        let array_specific = matches!(
            condition,
            Condition::All(_)
                | Condition::Size(_)
                | Condition::ElemMatch(_)
                | Condition::Exists(_)
                | Condition::Type(_)
        );
        if !array_specific {
            if eval_scalar_condition(value, condition) {
                return true;
            }
            return items
                .iter()
                .any(|item| eval_scalar_condition(Some(item), condition));
        }
    }
    eval_scalar_condition(value, condition)
}

fn eval_scalar_condition(value: Option<&Value>, condition: &Condition) -> bool {
    let effective = value.unwrap_or(&Value::Null);
    match condition {
        Condition::Eq(expected) => effective == expected,
        Condition::Ne(expected) => effective != expected,
        Condition::Gt(bound) => {
            compare_values(effective, bound) == Some(Ordering::Greater)
        }
        Condition::Gte(bound) => matches!(
            compare_values(effective, bound),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Condition::Lt(bound) => compare_values(effective, bound) == Some(Ordering::Less),
        Condition::Lte(bound) => matches!(
            compare_values(effective, bound),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Condition::In(candidates) => candidates.iter().any(|c| c == effective),
        Condition::Nin(candidates) => !candidates.iter().any(|c| c == effective),
        Condition::Regex(regex) => effective
            .as_str()
            .map(|s| regex.is_match(s))
            .unwrap_or(false),
        Condition::StartsWith(prefix) => effective
            .as_str()
            .map(|s| s.starts_with(prefix.as_str()))
            .unwrap_or(false),
        Condition::EndsWith(suffix) => effective
            .as_str()
            .map(|s| s.ends_with(suffix.as_str()))
            .unwrap_or(false),
        Condition::Contains(needle) => effective
            .as_str()
            .map(|s| s.contains(needle.as_str()))
            .unwrap_or(false),
        Condition::All(required) => match effective {
            Value::Array(items) => required.iter().all(|r| items.contains(r)),
            _ => false,
        },
        Condition::ElemMatch(spec) => match effective {
            Value::Array(items) => items.iter().any(|item| elem_matches(item, spec)),
            _ => false,
        },
        Condition::Size(size) => match effective {
            Value::Array(items) => items.len() as u64 == *size,
            _ => false,
        },
        Condition::Exists(expected) => value.is_some() == *expected,
        Condition::Type(type_name) => type_of(effective) == Some(*type_name) || {
            *type_name == TypeName::Date && is_date_string(effective)
        },
        Condition::Not(inner) => !inner.iter().all(|c| eval_scalar_condition(value, c)),
    }
}

fn elem_matches(item: &Value, spec: &ElemMatch) -> bool {
    match spec {
        ElemMatch::Conditions(conditions) => conditions
            .iter()
            .all(|c| eval_scalar_condition(Some(item), c)),
        ElemMatch::Doc(filter) => match item.as_object() {
            Some(obj) => filter.matches(obj),
            None => false,
        },
    }
}

fn type_of(value: &Value) -> Option<TypeName> {
    match value {
        Value::Null => Some(TypeName::Null),
        Value::Bool(_) => Some(TypeName::Boolean),
        Value::Number(_) => Some(TypeName::Number),
        Value::String(_) => Some(TypeName::String),
        Value::Array(_) => Some(TypeName::Array),
        Value::Object(_) => Some(TypeName::Object),
    }
}

fn is_date_string(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| {
            chrono::DateTime::parse_from_rfc3339(s).is_ok()
                || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        })
        .unwrap_or(false)
}

fn text_matches(doc: &Map<String, Value>, text: &TextQuery) -> bool {
    let needle = if text.case_sensitive {
        text.search.clone()
    } else {
        text.search.to_lowercase()
    };
    any_string_value(doc, &|s| {
        if text.case_sensitive {
            s.contains(&needle)
        } else {
            s.to_lowercase().contains(&needle)
        }
    })
}

fn any_string_value(doc: &Map<String, Value>, pred: &dyn Fn(&str) -> bool) -> bool {
    doc.values().any(|v| value_has_string(v, pred))
}

fn value_has_string(value: &Value, pred: &dyn Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => pred(s),
        Value::Array(items) => items.iter().any(|v| value_has_string(v, pred)),
        Value::Object(map) => map.values().any(|v| value_has_string(v, pred)),
        _ => false,
    }
}

fn geo_matches(value: &Value, geo: &GeoQuery) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let (Some(lat), Some(lng)) = (
        obj.get("lat").and_then(|v| v.as_f64()),
        obj.get("lng").and_then(|v| v.as_f64()),
    ) else {
        return false;
    };
    match geo.max_distance {
        Some(max) => haversine_meters(geo.lat, geo.lng, lat, lng) <= max,
        None => true,
    }
}

fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Comparable-family comparison: numbers with numbers, strings with strings,
/// booleans with booleans. Cross-family comparisons yield `None` (operators
/// using them evaluate false).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order across value families, used where a deterministic sort is
/// required: null < number < string < object < array < boolean.
pub fn total_compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = total_compare(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| total_compare(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Match a `$pull`-style specification against a candidate value: operator
/// objects apply conditions, plain objects apply per-field filters, anything
/// else is structural equality.
pub fn value_matches(spec: &Value, candidate: &Value) -> bool {
    match spec.as_object() {
        Some(obj) if obj.keys().any(|k| k.starts_with('$')) => {
            match parse_conditions("$pull", spec) {
                Ok(conditions) => conditions
                    .iter()
                    .all(|c| eval_scalar_condition(Some(candidate), c)),
                Err(_) => false,
            }
        }
        Some(obj) => match candidate.as_object() {
            Some(candidate_obj) => obj.iter().all(|(key, sub)| {
                value_matches(sub, candidate_obj.get(key).unwrap_or(&Value::Null))
            }),
            None => false,
        },
        None => spec == candidate,
    }
}

/// Cosine similarity between a query vector and a candidate value.
pub fn cosine_similarity(query: &[f64], candidate: &Value) -> Option<f64> {
    let candidate = as_f64_vec(candidate)?;
    if candidate.len() != query.len() || query.is_empty() {
        return None;
    }
    let dot: f64 = query.iter().zip(&candidate).map(|(a, b)| a * b).sum();
    let qn: f64 = query.iter().map(|a| a * a).sum::<f64>().sqrt();
    let cn: f64 = candidate.iter().map(|b| b * b).sum::<f64>().sqrt();
    if qn == 0.0 || cn == 0.0 {
        return None;
    }
    Some(dot / (qn * cn))
}

fn as_f64_vec(value: &Value) -> Option<Vec<f64>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64())
        .collect::<Option<Vec<f64>>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn matches(filter: Value, document: Value) -> bool {
        Filter::parse(&filter).unwrap().matches(&doc(document))
    }

    #[test]
    fn test_bare_value_is_eq() {
        assert!(matches(json!({"status": "open"}), json!({"status": "open"})));
        assert!(!matches(json!({"status": "open"}), json!({"status": "done"})));
    }

    #[test]
    fn test_comparison_operators() {
        let document = json!({"price": 150});
        assert!(matches(json!({"price": {"$gt": 100}}), document.clone()));
        assert!(matches(json!({"price": {"$gte": 150}}), document.clone()));
        assert!(matches(json!({"price": {"$lt": 200}}), document.clone()));
        assert!(matches(json!({"price": {"$lte": 150}}), document.clone()));
        assert!(matches(json!({"price": {"$ne": 100}}), document.clone()));
        assert!(!matches(json!({"price": {"$gt": 150}}), document));
    }

    #[test]
    fn test_cross_type_comparison_is_false() {
        assert!(!matches(json!({"price": {"$gt": 100}}), json!({"price": "hi"})));
    }

    #[test]
    fn test_in_nin() {
        let document = json!({"status": "open"});
        assert!(matches(json!({"status": {"$in": ["open", "held"]}}), document.clone()));
        assert!(!matches(json!({"status": {"$nin": ["open"]}}), document.clone()));
        assert!(matches(json!({"status": {"$nin": ["done"]}}), document));
    }

    #[test]
    fn test_string_operators() {
        let document = json!({"title": "Hello World"});
        assert!(matches(json!({"title": {"$startsWith": "Hello"}}), document.clone()));
        assert!(matches(json!({"title": {"$endsWith": "World"}}), document.clone()));
        assert!(matches(json!({"title": {"$contains": "lo Wo"}}), document.clone()));
        assert!(matches(
            json!({"title": {"$regex": "^hello", "$options": "i"}}),
            document.clone()
        ));
        assert!(!matches(json!({"title": {"$regex": "^World"}}), document));
    }

    #[test]
    fn test_regex_rejects_unknown_flags() {
        assert!(Filter::parse(&json!({"t": {"$regex": "x", "$options": "sx"}})).is_err());
    }

    #[test]
    fn test_array_operators() {
        let document = json!({"tags": ["a", "b", "c"]});
        assert!(matches(json!({"tags": {"$all": ["a", "c"]}}), document.clone()));
        assert!(!matches(json!({"tags": {"$all": ["a", "z"]}}), document.clone()));
        assert!(matches(json!({"tags": {"$size": 3}}), document.clone()));
        // Bare equality on an array matches any element.
        assert!(matches(json!({"tags": "b"}), document));
    }

    #[test]
    fn test_elem_match() {
        let document = json!({"scores": [{"value": 10}, {"value": 90}]});
        assert!(matches(
            json!({"scores": {"$elemMatch": {"value": {"$gt": 50}}}}),
            document.clone()
        ));
        assert!(!matches(
            json!({"scores": {"$elemMatch": {"value": {"$gt": 100}}}}),
            document
        ));

        let numeric = json!({"n": [1, 5, 9]});
        assert!(matches(
            json!({"n": {"$elemMatch": {"$gte": 4, "$lt": 6}}}),
            numeric
        ));
    }

    #[test]
    fn test_exists_and_type() {
        let document = json!({"a": 1, "b": null, "when": "2025-06-15"});
        assert!(matches(json!({"a": {"$exists": true}}), document.clone()));
        assert!(matches(json!({"missing": {"$exists": false}}), document.clone()));
        assert!(matches(json!({"b": {"$type": "null"}}), document.clone()));
        assert!(matches(json!({"a": {"$type": "number"}}), document.clone()));
        assert!(matches(json!({"when": {"$type": "date"}}), document.clone()));
        assert!(matches(json!({"when": {"$type": "string"}}), document));
    }

    #[test]
    fn test_logical_operators() {
        let document = json!({"a": 1, "b": 2});
        assert!(matches(
            json!({"$and": [{"a": 1}, {"b": 2}]}),
            document.clone()
        ));
        assert!(matches(
            json!({"$or": [{"a": 9}, {"b": 2}]}),
            document.clone()
        ));
        assert!(matches(
            json!({"$nor": [{"a": 9}, {"b": 9}]}),
            document.clone()
        ));
        assert!(matches(json!({"$not": {"a": 9}}), document.clone()));
        assert!(!matches(json!({"$not": {"a": 1}}), document));
    }

    #[test]
    fn test_field_level_not() {
        let document = json!({"price": 150});
        assert!(matches(json!({"price": {"$not": {"$gt": 200}}}), document.clone()));
        assert!(!matches(json!({"price": {"$not": {"$gt": 100}}}), document));
    }

    #[test]
    fn test_nested_paths_and_subdocuments() {
        let document = json!({"author": {"name": "Alice", "age": 30}});
        assert!(matches(json!({"author.name": "Alice"}), document.clone()));
        assert!(matches(json!({"author.age": {"$gte": 18}}), document.clone()));
        // Plain sub-document requires deep equality of the whole value.
        assert!(matches(
            json!({"author": {"name": "Alice", "age": 30}}),
            document.clone()
        ));
        assert!(!matches(json!({"author": {"name": "Alice"}}), document));
    }

    #[test]
    fn test_missing_field_semantics() {
        let document = json!({"a": 1});
        assert!(matches(json!({"missing": null}), document.clone()));
        assert!(matches(json!({"missing": {"$ne": 5}}), document.clone()));
        assert!(!matches(json!({"missing": {"$gt": 0}}), document));
    }

    #[test]
    fn test_data_prefix_aliases_user_fields() {
        let document = json!({"$type": "Post", "title": "Hi"});
        assert!(matches(json!({"$data.$type": "Post"}), document.clone()));
        assert!(matches(json!({"$data.title": "Hi"}), document));
    }

    #[test]
    fn test_text_search() {
        let document = json!({"title": "Columnar Storage", "body": {"text": "Parquet rocks"}});
        assert!(matches(json!({"$text": {"$search": "parquet"}}), document.clone()));
        assert!(!matches(
            json!({"$text": {"$search": "parquet", "$caseSensitive": true}}),
            document.clone()
        ));
        assert!(!matches(json!({"$text": {"$search": "duckdb"}}), document));
    }

    #[test]
    fn test_vector_shapes() {
        let document = json!({"embedding": [1.0, 0.0]});
        assert!(matches(
            json!({"$vector": {"query": [0.9, 0.1], "field": "embedding", "topK": 5}}),
            document.clone()
        ));
        // Legacy shape.
        assert!(matches(
            json!({"$vector": {"$near": [0.9, 0.1], "$field": "embedding", "$k": 5}}),
            document.clone()
        ));
        // Dimension mismatch fails the predicate.
        assert!(!matches(
            json!({"$vector": {"query": [1.0, 0.0, 0.0], "field": "embedding"}}),
            document
        ));
    }

    #[test]
    fn test_geo_near() {
        let shard = json!({"location": {"lat": 51.5, "lng": -0.12}});
        // ~1km away with a 10km radius.
        assert!(matches(
            json!({"$geo": {"$near": {"lat": 51.51, "lng": -0.12}, "$maxDistance": 10000.0}}),
            shard.clone()
        ));
        assert!(!matches(
            json!({"$geo": {"$near": {"lat": 48.85, "lng": 2.35}, "$maxDistance": 10000.0}}),
            shard
        ));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches(json!({}), json!({"anything": 1})));
    }

    #[test]
    fn test_unknown_operator_is_error() {
        assert!(Filter::parse(&json!({"$xor": []})).is_err());
        assert!(Filter::parse(&json!({"f": {"$near2": 1}})).is_err());
    }

    #[test]
    fn test_value_matches_for_pull() {
        assert!(value_matches(&json!(5), &json!(5)));
        assert!(value_matches(&json!({"$gte": 5}), &json!(7)));
        assert!(!value_matches(&json!({"$gte": 5}), &json!(3)));
        assert!(value_matches(
            &json!({"status": "done"}),
            &json!({"status": "done", "extra": 1})
        ));
        assert!(!value_matches(&json!({"status": "done"}), &json!("done")));
    }

    #[test]
    fn test_cosine_similarity() {
        let sim = cosine_similarity(&[1.0, 0.0], &json!([1.0, 0.0])).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
        let sim = cosine_similarity(&[1.0, 0.0], &json!([0.0, 1.0])).unwrap();
        assert!(sim.abs() < 1e-9);
        assert!(cosine_similarity(&[1.0], &json!("nope")).is_none());
    }

    #[test]
    fn test_total_compare_is_total() {
        let values = vec![
            json!(null),
            json!(1),
            json!("a"),
            json!({"k": 1}),
            json!([1, 2]),
            json!(true),
        ];
        for a in &values {
            for b in &values {
                // Must never panic, and must be antisymmetric.
                let ab = total_compare(a, b);
                let ba = total_compare(b, a);
                assert_eq!(ab, ba.reverse());
            }
        }
    }
}
