//! The update-operator algebra: a pure function from a document and an
//! update description to a new document, the set of modified fields, and any
//! extracted relationship operations.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::{RelOpKind, RelationshipOp};
use crate::query::filter::{total_compare, value_matches};

use super::path::FieldPath;
use super::MutationError;

/// All recognized update operators.
const KNOWN_OPERATORS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$push",
    "$addToSet",
    "$pop",
    "$pull",
    "$pullAll",
    "$rename",
    "$currentDate",
    "$setOnInsert",
    "$bit",
    "$link",
    "$unlink",
];

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub timestamp: DateTime<Utc>,
    pub is_insert: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            is_insert: false,
        }
    }
}

/// Result of applying an update.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub document: Map<String, Value>,
    pub modified_fields: Vec<String>,
    pub relationship_ops: Vec<RelationshipOp>,
}

/// Reject unknown operators and fields claimed by two mutating operators.
pub fn validate_update_operators(update: &Map<String, Value>) -> Result<(), MutationError> {
    let mut claimed: Vec<String> = Vec::new();
    let mut claim = |field: String| -> Result<(), MutationError> {
        if claimed.contains(&field) {
            return Err(MutationError::InvalidUpdate(format!(
                "field '{}' appears under multiple update operators",
                field
            )));
        }
        claimed.push(field);
        Ok(())
    };

    for (key, value) in update {
        if !key.starts_with('$') {
            // Bare field: shorthand for $set.
            claim(key.clone())?;
            continue;
        }
        if !KNOWN_OPERATORS.contains(&key.as_str()) {
            return Err(MutationError::InvalidUpdate(format!(
                "unknown update operator '{}'",
                key
            )));
        }
        let fields = value.as_object().ok_or_else(|| {
            MutationError::InvalidUpdate(format!("operator '{}' expects an object", key))
        })?;
        for (field, spec) in fields {
            claim(field.clone())?;
            if key == "$rename" {
                // The rename target is mutated too.
                if let Some(target) = spec.as_str() {
                    claim(target.to_string())?;
                }
            }
        }
    }
    Ok(())
}

/// Apply an update to a document. Pure: the input document is not modified.
pub fn apply_operators(
    doc: &Map<String, Value>,
    update: &Map<String, Value>,
    opts: &ApplyOptions,
) -> Result<ApplyOutcome, MutationError> {
    validate_update_operators(update)?;

    // Parse every touched path up front so pollution guards fire before any
    // mutation happens.
    for (key, value) in update {
        if !key.starts_with('$') {
            FieldPath::parse(key)?;
            continue;
        }
        if let Some(fields) = value.as_object() {
            for (field, spec) in fields {
                FieldPath::parse(field)?;
                if key == "$rename" {
                    if let Some(target) = spec.as_str() {
                        FieldPath::parse(target)?;
                    }
                }
            }
        }
    }

    let mut document = doc.clone();
    let mut modified: Vec<String> = Vec::new();
    let mut relationship_ops: Vec<RelationshipOp> = Vec::new();
    let mark = |field: &str, modified: &mut Vec<String>| {
        if !modified.iter().any(|f| f == field) {
            modified.push(field.to_string());
        }
    };

    for (key, value) in update {
        if !key.starts_with('$') {
            let path = FieldPath::parse(key)?;
            path.set(&mut document, value.clone())?;
            mark(key, &mut modified);
            continue;
        }
        match key.as_str() {
            "$set" => {
                for (field, v) in object_fields(key, value)? {
                    FieldPath::parse(field)?.set(&mut document, v.clone())?;
                    mark(field, &mut modified);
                }
            }
            "$setOnInsert" => {
                if opts.is_insert {
                    for (field, v) in object_fields(key, value)? {
                        FieldPath::parse(field)?.set(&mut document, v.clone())?;
                        mark(field, &mut modified);
                    }
                }
            }
            "$unset" => {
                for (field, _) in object_fields(key, value)? {
                    if FieldPath::parse(field)?.remove(&mut document).is_some() {
                        mark(field, &mut modified);
                    }
                }
            }
            "$inc" => {
                for (field, v) in object_fields(key, value)? {
                    apply_arith(&mut document, field, v, ArithOp::Add)?;
                    mark(field, &mut modified);
                }
            }
            "$mul" => {
                for (field, v) in object_fields(key, value)? {
                    apply_arith(&mut document, field, v, ArithOp::Mul)?;
                    mark(field, &mut modified);
                }
            }
            "$min" => {
                for (field, v) in object_fields(key, value)? {
                    let path = FieldPath::parse(field)?;
                    let should_set = match path.get(&document) {
                        None | Some(Value::Null) => true,
                        Some(current) => {
                            total_compare(v, current) == std::cmp::Ordering::Less
                        }
                    };
                    if should_set {
                        path.set(&mut document, v.clone())?;
                        mark(field, &mut modified);
                    }
                }
            }
            "$max" => {
                for (field, v) in object_fields(key, value)? {
                    let path = FieldPath::parse(field)?;
                    let should_set = match path.get(&document) {
                        None | Some(Value::Null) => true,
                        Some(current) => {
                            total_compare(v, current) == std::cmp::Ordering::Greater
                        }
                    };
                    if should_set {
                        path.set(&mut document, v.clone())?;
                        mark(field, &mut modified);
                    }
                }
            }
            "$push" => {
                for (field, v) in object_fields(key, value)? {
                    apply_push(&mut document, field, v)?;
                    mark(field, &mut modified);
                }
            }
            "$addToSet" => {
                for (field, v) in object_fields(key, value)? {
                    if apply_add_to_set(&mut document, field, v)? {
                        mark(field, &mut modified);
                    }
                }
            }
            "$pop" => {
                for (field, v) in object_fields(key, value)? {
                    if apply_pop(&mut document, field, v)? {
                        mark(field, &mut modified);
                    }
                }
            }
            "$pull" => {
                for (field, v) in object_fields(key, value)? {
                    if apply_pull(&mut document, field, |elem| value_matches(v, elem))? {
                        mark(field, &mut modified);
                    }
                }
            }
            "$pullAll" => {
                for (field, v) in object_fields(key, value)? {
                    let candidates = v.as_array().ok_or_else(|| {
                        MutationError::InvalidUpdate(format!(
                            "$pullAll on '{}' expects an array",
                            field
                        ))
                    })?;
                    if apply_pull(&mut document, field, |elem| candidates.contains(elem))? {
                        mark(field, &mut modified);
                    }
                }
            }
            "$rename" => {
                for (field, v) in object_fields(key, value)? {
                    let target = v.as_str().ok_or_else(|| {
                        MutationError::InvalidUpdate(format!(
                            "$rename on '{}' expects a string target path",
                            field
                        ))
                    })?;
                    let source = FieldPath::parse(field)?;
                    let dest = FieldPath::parse(target)?;
                    if let Some(moved) = source.remove(&mut document) {
                        dest.set(&mut document, moved)?;
                        mark(field, &mut modified);
                        mark(target, &mut modified);
                    }
                }
            }
            "$currentDate" => {
                for (field, v) in object_fields(key, value)? {
                    let stamped = current_date_value(field, v, opts.timestamp)?;
                    FieldPath::parse(field)?.set(&mut document, stamped)?;
                    mark(field, &mut modified);
                }
            }
            "$bit" => {
                for (field, v) in object_fields(key, value)? {
                    apply_bit(&mut document, field, v)?;
                    mark(field, &mut modified);
                }
            }
            "$link" | "$unlink" => {
                let kind = if key == "$link" {
                    RelOpKind::Link
                } else {
                    RelOpKind::Unlink
                };
                for (field, v) in object_fields(key, value)? {
                    relationship_ops.push(extract_rel_op(kind, field, v)?);
                    mark(field, &mut modified);
                }
            }
            _ => {
                // validate_update_operators already rejected unknown keys.
                return Err(MutationError::InvalidUpdate(format!(
                    "unknown update operator '{}'",
                    key
                )));
            }
        }
    }

    Ok(ApplyOutcome {
        document,
        modified_fields: modified,
        relationship_ops,
    })
}

fn object_fields<'a>(
    op: &str,
    value: &'a Value,
) -> Result<&'a Map<String, Value>, MutationError> {
    value.as_object().ok_or_else(|| {
        MutationError::InvalidUpdate(format!("operator '{}' expects an object", op))
    })
}

#[derive(Clone, Copy, PartialEq)]
enum ArithOp {
    Add,
    Mul,
}

fn apply_arith(
    document: &mut Map<String, Value>,
    field: &str,
    operand: &Value,
    op: ArithOp,
) -> Result<(), MutationError> {
    let operand_num = as_number(operand).ok_or_else(|| {
        MutationError::InvalidUpdate(format!(
            "numeric operator on '{}' expects a numeric operand",
            field
        ))
    })?;

    let path = FieldPath::parse(field)?;
    let result = match path.get(document) {
        None | Some(Value::Null) => match op {
            // $inc creates the field as the operand; $mul creates it as zero.
            ArithOp::Add => operand_num,
            ArithOp::Mul => Num::Int(0),
        },
        Some(current) => {
            let current_num = as_number(current).ok_or_else(|| {
                MutationError::InvalidUpdate(format!(
                    "field '{}' is not numeric",
                    field
                ))
            })?;
            match op {
                ArithOp::Add => current_num.add(operand_num),
                ArithOp::Mul => current_num.mul(operand_num),
            }
        }
    };
    path.set(document, result.to_json())?;
    Ok(())
}

/// A number that stays integral as long as both operands are integral.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_add(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64)),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_mul(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 * b as f64)),
            (a, b) => Num::Float(a.as_f64() * b.as_f64()),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn to_json(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

fn as_number(value: &Value) -> Option<Num> {
    if let Some(i) = value.as_i64() {
        Some(Num::Int(i))
    } else {
        value.as_f64().map(Num::Float)
    }
}

fn apply_push(
    document: &mut Map<String, Value>,
    field: &str,
    spec: &Value,
) -> Result<(), MutationError> {
    let path = FieldPath::parse(field)?;
    let mut array = match path.get(document) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(MutationError::InvalidUpdate(format!(
                "$push target '{}' is not an array",
                field
            )))
        }
    };

    let (items, position, slice, sort) = parse_push_spec(field, spec)?;

    // Insert, then sort, then slice.
    let position = position
        .map(|p| {
            if p < 0 {
                (array.len() as i64 + p).max(0) as usize
            } else {
                (p as usize).min(array.len())
            }
        })
        .unwrap_or(array.len());
    for (offset, item) in items.into_iter().enumerate() {
        array.insert(position + offset, item);
    }

    if let Some(direction) = sort {
        array.sort_by(|a, b| {
            if direction >= 0 {
                total_compare(a, b)
            } else {
                total_compare(b, a)
            }
        });
    }

    if let Some(slice) = slice {
        array = apply_slice(array, slice);
    }

    path.set(document, Value::Array(array))?;
    Ok(())
}

type PushSpec = (Vec<Value>, Option<i64>, Option<i64>, Option<i64>);

fn parse_push_spec(field: &str, spec: &Value) -> Result<PushSpec, MutationError> {
    let Some(obj) = spec.as_object() else {
        return Ok((vec![spec.clone()], None, None, None));
    };
    if !obj.contains_key("$each") {
        if obj.keys().any(|k| k.starts_with('$')) {
            return Err(MutationError::InvalidUpdate(format!(
                "$push modifiers on '{}' require $each",
                field
            )));
        }
        return Ok((vec![spec.clone()], None, None, None));
    }

    let mut items = Vec::new();
    let mut position = None;
    let mut slice = None;
    let mut sort = None;
    for (modifier, v) in obj {
        match modifier.as_str() {
            "$each" => {
                items = v
                    .as_array()
                    .ok_or_else(|| {
                        MutationError::InvalidUpdate(format!(
                            "$each on '{}' expects an array",
                            field
                        ))
                    })?
                    .clone();
            }
            "$position" => position = v.as_i64(),
            "$slice" => slice = v.as_i64(),
            "$sort" => sort = v.as_i64(),
            other => {
                return Err(MutationError::InvalidUpdate(format!(
                    "unknown $push modifier '{}' on '{}'",
                    other, field
                )))
            }
        }
    }
    Ok((items, position, slice, sort))
}

fn apply_slice(array: Vec<Value>, slice: i64) -> Vec<Value> {
    if slice == 0 {
        return Vec::new();
    }
    if slice > 0 {
        let keep = (slice as usize).min(array.len());
        array.into_iter().take(keep).collect()
    } else {
        let keep = ((-slice) as usize).min(array.len());
        let skip = array.len() - keep;
        array.into_iter().skip(skip).collect()
    }
}

fn apply_add_to_set(
    document: &mut Map<String, Value>,
    field: &str,
    spec: &Value,
) -> Result<bool, MutationError> {
    let path = FieldPath::parse(field)?;
    let mut array = match path.get(document) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(MutationError::InvalidUpdate(format!(
                "$addToSet target '{}' is not an array",
                field
            )))
        }
    };

    let candidates: Vec<Value> = match spec.as_object() {
        Some(obj) if obj.contains_key("$each") => obj
            .get("$each")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                MutationError::InvalidUpdate(format!("$each on '{}' expects an array", field))
            })?
            .clone(),
        _ => vec![spec.clone()],
    };

    let mut changed = false;
    for candidate in candidates {
        if !array.contains(&candidate) {
            array.push(candidate);
            changed = true;
        }
    }
    if changed {
        path.set(document, Value::Array(array))?;
    }
    Ok(changed)
}

fn apply_pop(
    document: &mut Map<String, Value>,
    field: &str,
    spec: &Value,
) -> Result<bool, MutationError> {
    let direction = spec.as_i64().ok_or_else(|| {
        MutationError::InvalidUpdate(format!("$pop on '{}' expects 1 or -1", field))
    })?;
    if direction != 1 && direction != -1 {
        return Err(MutationError::InvalidUpdate(format!(
            "$pop on '{}' expects 1 or -1",
            field
        )));
    }

    let path = FieldPath::parse(field)?;
    let mut array = match path.get(document) {
        None | Some(Value::Null) => return Ok(false),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(MutationError::InvalidUpdate(format!(
                "$pop target '{}' is not an array",
                field
            )))
        }
    };
    if array.is_empty() {
        return Ok(false);
    }
    if direction == 1 {
        array.pop();
    } else {
        array.remove(0);
    }
    path.set(document, Value::Array(array))?;
    Ok(true)
}

fn apply_pull<F: Fn(&Value) -> bool>(
    document: &mut Map<String, Value>,
    field: &str,
    matches: F,
) -> Result<bool, MutationError> {
    let path = FieldPath::parse(field)?;
    let array = match path.get(document) {
        None | Some(Value::Null) => return Ok(false),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(MutationError::InvalidUpdate(format!(
                "$pull target '{}' is not an array",
                field
            )))
        }
    };
    let retained: Vec<Value> = array.iter().filter(|v| !matches(v)).cloned().collect();
    let changed = retained.len() != array.len();
    if changed {
        path.set(document, Value::Array(retained))?;
    }
    Ok(changed)
}

fn current_date_value(
    field: &str,
    spec: &Value,
    timestamp: DateTime<Utc>,
) -> Result<Value, MutationError> {
    match spec {
        Value::Bool(true) => Ok(Value::String(timestamp.to_rfc3339())),
        Value::Object(obj) => match obj.get("$type").and_then(|v| v.as_str()) {
            Some("date") => Ok(Value::String(timestamp.to_rfc3339())),
            Some("timestamp") => Ok(Value::from(timestamp.timestamp_millis())),
            _ => Err(MutationError::InvalidUpdate(format!(
                "$currentDate on '{}' expects true or {{$type: date|timestamp}}",
                field
            ))),
        },
        _ => Err(MutationError::InvalidUpdate(format!(
            "$currentDate on '{}' expects true or {{$type: date|timestamp}}",
            field
        ))),
    }
}

fn apply_bit(
    document: &mut Map<String, Value>,
    field: &str,
    spec: &Value,
) -> Result<(), MutationError> {
    let obj = spec.as_object().ok_or_else(|| {
        MutationError::InvalidUpdate(format!(
            "$bit on '{}' expects {{and|or|xor: int}}",
            field
        ))
    })?;
    if obj.len() != 1 {
        return Err(MutationError::InvalidUpdate(format!(
            "$bit on '{}' expects exactly one of and/or/xor",
            field
        )));
    }

    let path = FieldPath::parse(field)?;
    let current = match path.get(document) {
        None | Some(Value::Null) => 0i64,
        Some(v) => v.as_i64().ok_or_else(|| {
            MutationError::InvalidUpdate(format!("field '{}' is not an integer", field))
        })?,
    };

    let (op, operand) = obj.iter().next().ok_or_else(|| {
        MutationError::InvalidUpdate(format!("$bit on '{}' is empty", field))
    })?;
    let operand = operand.as_i64().ok_or_else(|| {
        MutationError::InvalidUpdate(format!("$bit operand on '{}' must be an integer", field))
    })?;
    let result = match op.as_str() {
        "and" => current & operand,
        "or" => current | operand,
        "xor" => current ^ operand,
        other => {
            return Err(MutationError::InvalidUpdate(format!(
                "unknown $bit operation '{}' on '{}'",
                other, field
            )))
        }
    };
    path.set(document, Value::from(result))?;
    Ok(())
}

fn extract_rel_op(
    kind: RelOpKind,
    field: &str,
    spec: &Value,
) -> Result<RelationshipOp, MutationError> {
    // `$unlink: {field: "$all"}` clears the whole edge set.
    if kind == RelOpKind::Unlink && spec.as_str() == Some("$all") {
        return Ok(RelationshipOp {
            kind,
            predicate: field.to_string(),
            targets: Vec::new(),
        });
    }

    let targets: Vec<String> = match spec {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    MutationError::InvalidUpdate(format!(
                        "relationship targets on '{}' must be strings",
                        field
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(MutationError::InvalidUpdate(format!(
                "relationship operator on '{}' expects a target or array of targets",
                field
            )))
        }
    };
    Ok(RelationshipOp {
        kind,
        predicate: field.to_string(),
        targets,
    })
}
