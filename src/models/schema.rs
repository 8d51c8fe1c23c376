//! Schema definitions: per-type field grammar and `$id`/`$name`/`$shred`
//! directives.
//!
//! A type definition is a JSON-shaped map of field name to grammar token:
//!
//! ```text
//! { "$id": "email", "$name": "displayName",
//!   "email": "string!#", "age": "int?", "role": "enum:admin,member",
//!   "author": "-> User.posts", "tags": "-> Tag.posts[]",
//!   "comments": "<- Comment.post[]" }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use thiserror::Error;

/// Directive keys that are never user fields.
pub const DIRECTIVE_KEYS: &[&str] = &["$id", "$name", "$shred", "$type"];

/// Schema and input-validation errors. Each carries the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("field '{field}': unknown type token '{token}'")]
    UnknownToken { field: String, token: String },

    #[error("directive '{directive}' names undeclared field '{field}'")]
    UndeclaredDirectiveField { directive: String, field: String },

    #[error("directive '{directive}' must not name a directive key '{field}'")]
    DirectiveFieldIsDirective { directive: String, field: String },

    #[error("field '{field}': {message}")]
    Validation { field: String, message: String },
}

/// Primitive field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Int,
    Float,
    Boolean,
    Date,
    DateTime,
    Text,
    Email,
    Markdown,
}

impl ScalarType {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "string" => Some(ScalarType::String),
            "int" => Some(ScalarType::Int),
            "float" => Some(ScalarType::Float),
            "boolean" => Some(ScalarType::Boolean),
            "date" => Some(ScalarType::Date),
            "datetime" => Some(ScalarType::DateTime),
            "text" => Some(ScalarType::Text),
            "email" => Some(ScalarType::Email),
            "markdown" => Some(ScalarType::Markdown),
            _ => None,
        }
    }
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    Enum(Vec<String>),
    /// `-> Type(.inverseField)?([])?`
    OutboundRel {
        target_type: String,
        inverse_field: Option<String>,
        many: bool,
    },
    /// `<- Type.sourceField[]`
    InboundRel {
        target_type: String,
        source_field: String,
    },
}

/// A declared field: kind plus `!` (required) / `#` (indexed) modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub kind: FieldKind,
    pub required: bool,
    pub indexed: bool,
}

impl FieldDef {
    /// Parse a grammar token such as `string!#`, `enum:a,b,c`, `-> User.posts[]`.
    pub fn parse(field: &str, token: &str) -> Result<Self, SchemaError> {
        let token = token.trim();
        if let Some(rest) = token.strip_prefix("->") {
            let (target_type, inverse_field, many) = parse_arrow(field, rest)?;
            return Ok(Self {
                kind: FieldKind::OutboundRel {
                    target_type,
                    inverse_field,
                    many,
                },
                required: false,
                indexed: false,
            });
        }
        if let Some(rest) = token.strip_prefix("<-") {
            let (target_type, source_field, many) = parse_arrow(field, rest)?;
            let source_field = source_field.ok_or_else(|| SchemaError::UnknownToken {
                field: field.to_string(),
                token: token.to_string(),
            })?;
            if !many {
                // Inbound arrows are always multi-valued.
                return Err(SchemaError::UnknownToken {
                    field: field.to_string(),
                    token: token.to_string(),
                });
            }
            return Ok(Self {
                kind: FieldKind::InboundRel {
                    target_type,
                    source_field,
                },
                required: false,
                indexed: false,
            });
        }

        let mut base = token;
        let mut required = false;
        let mut optional = false;
        let mut indexed = false;
        while let Some(last) = base.chars().last() {
            match last {
                '!' => required = true,
                '?' => optional = true,
                '#' => indexed = true,
                _ => break,
            }
            base = &base[..base.len() - 1];
        }
        if required && optional {
            return Err(SchemaError::UnknownToken {
                field: field.to_string(),
                token: token.to_string(),
            });
        }

        let kind = if let Some(variants) = base.strip_prefix("enum:") {
            let variants: Vec<String> = variants
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if variants.is_empty() {
                return Err(SchemaError::UnknownToken {
                    field: field.to_string(),
                    token: token.to_string(),
                });
            }
            FieldKind::Enum(variants)
        } else {
            FieldKind::Scalar(ScalarType::parse(base).ok_or_else(|| {
                SchemaError::UnknownToken {
                    field: field.to_string(),
                    token: token.to_string(),
                }
            })?)
        };

        Ok(Self {
            kind,
            required,
            indexed,
        })
    }

    pub fn is_relationship(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::OutboundRel { .. } | FieldKind::InboundRel { .. }
        )
    }
}

fn parse_arrow(
    field: &str,
    rest: &str,
) -> Result<(String, Option<String>, bool), SchemaError> {
    let mut body = rest.trim();
    let many = body.ends_with("[]");
    if many {
        body = body[..body.len() - 2].trim_end();
    }
    let (target_type, inverse) = match body.split_once('.') {
        Some((t, f)) => (t.trim(), Some(f.trim().to_string())),
        None => (body, None),
    };
    if target_type.is_empty()
        || !target_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || inverse.as_deref() == Some("")
    {
        return Err(SchemaError::UnknownToken {
            field: field.to_string(),
            token: rest.to_string(),
        });
    }
    Ok((target_type.to_string(), inverse, many))
}

/// A parsed type definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    /// `$id` directive: use this field's value as the local id.
    pub id_field: Option<String>,
    /// `$name` directive: derive the entity's display name from this field.
    pub name_field: Option<String>,
    /// Explicit `$shred` list.
    pub shred_fields: Vec<String>,
    /// Declared fields in declaration order.
    pub fields: Vec<(String, FieldDef)>,
}

impl TypeDef {
    /// Parse a definition map. Directive targets are validated against the
    /// declared fields.
    pub fn parse(name: &str, definition: &Map<String, Value>) -> Result<Self, SchemaError> {
        let mut id_field = None;
        let mut name_field = None;
        let mut shred_fields = Vec::new();
        let mut fields = Vec::new();

        for (key, value) in definition {
            match key.as_str() {
                "$id" => {
                    id_field = value.as_str().map(|s| s.to_string());
                }
                "$name" => {
                    name_field = value.as_str().map(|s| s.to_string());
                }
                "$shred" => {
                    if let Some(list) = value.as_array() {
                        shred_fields = list
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect();
                    }
                }
                _ if key.starts_with('$') => {
                    return Err(SchemaError::UnknownToken {
                        field: key.clone(),
                        token: value.to_string(),
                    });
                }
                _ => {
                    let token = value.as_str().ok_or_else(|| SchemaError::UnknownToken {
                        field: key.clone(),
                        token: value.to_string(),
                    })?;
                    fields.push((key.clone(), FieldDef::parse(key, token)?));
                }
            }
        }

        let def = Self {
            name: name.to_string(),
            id_field,
            name_field,
            shred_fields,
            fields,
        };
        def.validate_directives()?;
        Ok(def)
    }

    fn validate_directives(&self) -> Result<(), SchemaError> {
        if let Some(id_field) = &self.id_field {
            if self.field(id_field).is_none() {
                return Err(SchemaError::UndeclaredDirectiveField {
                    directive: "$id".to_string(),
                    field: id_field.clone(),
                });
            }
        }
        if let Some(name_field) = &self.name_field {
            if DIRECTIVE_KEYS.contains(&name_field.as_str()) {
                return Err(SchemaError::DirectiveFieldIsDirective {
                    directive: "$name".to_string(),
                    field: name_field.clone(),
                });
            }
            if self.field(name_field).is_none() {
                return Err(SchemaError::UndeclaredDirectiveField {
                    directive: "$name".to_string(),
                    field: name_field.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, def)| def)
    }

    /// Fields shredded automatically: enums, booleans, dates and anything
    /// indexed, whether or not `$shred` names them.
    pub fn auto_shred_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, def)| {
                def.indexed
                    || matches!(
                        def.kind,
                        FieldKind::Enum(_)
                            | FieldKind::Scalar(ScalarType::Boolean)
                            | FieldKind::Scalar(ScalarType::Date)
                            | FieldKind::Scalar(ScalarType::DateTime)
                    )
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Validate a create/upsert input document against the declared fields.
    pub fn validate_input(&self, input: &Map<String, Value>) -> Result<(), SchemaError> {
        for (name, def) in &self.fields {
            let value = input.get(name);
            match value {
                None | Some(Value::Null) => {
                    if def.required {
                        return Err(SchemaError::Validation {
                            field: name.clone(),
                            message: "required field is missing".to_string(),
                        });
                    }
                }
                Some(value) => self.validate_field_value(name, def, value)?,
            }
        }
        Ok(())
    }

    fn validate_field_value(
        &self,
        name: &str,
        def: &FieldDef,
        value: &Value,
    ) -> Result<(), SchemaError> {
        let fail = |message: &str| SchemaError::Validation {
            field: name.to_string(),
            message: message.to_string(),
        };
        match &def.kind {
            FieldKind::Scalar(ScalarType::String)
            | FieldKind::Scalar(ScalarType::Text)
            | FieldKind::Scalar(ScalarType::Markdown) => {
                if !value.is_string() {
                    return Err(fail("expected a string"));
                }
            }
            FieldKind::Scalar(ScalarType::Email) => {
                let s = value.as_str().ok_or_else(|| fail("expected a string"))?;
                if !s.contains('@') {
                    return Err(fail("expected an email address"));
                }
            }
            FieldKind::Scalar(ScalarType::Int) => {
                if !value.is_i64() && !value.is_u64() {
                    return Err(fail("expected an integer"));
                }
            }
            FieldKind::Scalar(ScalarType::Float) => {
                if !value.is_number() {
                    return Err(fail("expected a number"));
                }
            }
            FieldKind::Scalar(ScalarType::Boolean) => {
                if !value.is_boolean() {
                    return Err(fail("expected a boolean"));
                }
            }
            FieldKind::Scalar(ScalarType::Date) => {
                let s = value.as_str().ok_or_else(|| fail("expected a date string"))?;
                if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err()
                    && DateTime::parse_from_rfc3339(s).is_err()
                {
                    return Err(fail("expected an ISO date"));
                }
            }
            FieldKind::Scalar(ScalarType::DateTime) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail("expected a datetime string"))?;
                if DateTime::parse_from_rfc3339(s).is_err() {
                    return Err(fail("expected an RFC 3339 datetime"));
                }
            }
            FieldKind::Enum(variants) => {
                let s = value.as_str().ok_or_else(|| fail("expected a string"))?;
                if !variants.iter().any(|v| v == s) {
                    return Err(SchemaError::Validation {
                        field: name.to_string(),
                        message: format!("'{}' is not one of {:?}", s, variants),
                    });
                }
            }
            FieldKind::OutboundRel { many, .. } => {
                let shape_ok = if *many {
                    value.is_array() || value.is_string() || value.is_object()
                } else {
                    value.is_string() || value.is_object()
                };
                if !shape_ok {
                    return Err(fail("expected a relationship reference"));
                }
            }
            FieldKind::InboundRel { .. } => {
                // Inbound edges are computed; user-supplied values are rejected.
                return Err(fail("inbound relationship fields are read-only"));
            }
        }
        Ok(())
    }
}

/// All registered type definitions, looked up by `$type`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeDef>,
    namespaces: HashMap<String, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a type to a namespace, overriding the default mapping.
    pub fn map_namespace(&mut self, type_name: &str, namespace: &str) {
        self.namespaces
            .insert(type_name.to_string(), namespace.to_string());
    }

    /// The namespace entities of a type live in. Defaults to the lowercased
    /// type name with an `s` suffix (`User` -> `users`).
    pub fn namespace_for_type(&self, type_name: &str) -> String {
        if let Some(ns) = self.namespaces.get(type_name) {
            return ns.clone();
        }
        let mut ns: String = type_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_lowercase();
        if !ns.ends_with('s') {
            ns.push('s');
        }
        ns
    }

    /// Parse and register a set of type definitions from a JSON-shaped map.
    pub fn parse(definitions: &Map<String, Value>) -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        for (type_name, definition) in definitions {
            let map = definition
                .as_object()
                .ok_or_else(|| SchemaError::UnknownToken {
                    field: type_name.clone(),
                    token: definition.to_string(),
                })?;
            registry.register(TypeDef::parse(type_name, map)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, def: TypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeDef> {
        self.types.get(type_name)
    }

    /// Find the type that declares the given inbound arrow's forward side.
    pub fn forward_field<'a>(
        &'a self,
        source_type: &str,
        source_field: &str,
    ) -> Option<&'a FieldDef> {
        self.get(source_type)?.field(source_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_scalar_tokens() {
        let def = FieldDef::parse("age", "int?").unwrap();
        assert_eq!(def.kind, FieldKind::Scalar(ScalarType::Int));
        assert!(!def.required);
        assert!(!def.indexed);

        let def = FieldDef::parse("email", "email!#").unwrap();
        assert_eq!(def.kind, FieldKind::Scalar(ScalarType::Email));
        assert!(def.required);
        assert!(def.indexed);
    }

    #[test]
    fn test_parse_enum_token() {
        let def = FieldDef::parse("role", "enum:admin,member,guest").unwrap();
        assert_eq!(
            def.kind,
            FieldKind::Enum(vec![
                "admin".to_string(),
                "member".to_string(),
                "guest".to_string()
            ])
        );
    }

    #[test]
    fn test_parse_outbound_arrows() {
        let def = FieldDef::parse("author", "-> User.posts").unwrap();
        assert_eq!(
            def.kind,
            FieldKind::OutboundRel {
                target_type: "User".to_string(),
                inverse_field: Some("posts".to_string()),
                many: false,
            }
        );

        let def = FieldDef::parse("tags", "-> Tag.posts[]").unwrap();
        assert!(matches!(def.kind, FieldKind::OutboundRel { many: true, .. }));

        let def = FieldDef::parse("owner", "-> User").unwrap();
        assert!(matches!(
            def.kind,
            FieldKind::OutboundRel {
                inverse_field: None,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_inbound_arrow() {
        let def = FieldDef::parse("comments", "<- Comment.post[]").unwrap();
        assert_eq!(
            def.kind,
            FieldKind::InboundRel {
                target_type: "Comment".to_string(),
                source_field: "post".to_string(),
            }
        );
    }

    #[test]
    fn test_inbound_arrow_requires_field_and_brackets() {
        assert!(FieldDef::parse("comments", "<- Comment[]").is_err());
        assert!(FieldDef::parse("comments", "<- Comment.post").is_err());
    }

    #[test]
    fn test_unknown_token_carries_field_name() {
        let err = FieldDef::parse("weird", "blob!").unwrap_err();
        match err {
            SchemaError::UnknownToken { field, .. } => assert_eq!(field, "weird"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_type_def_directives() {
        let def = TypeDef::parse(
            "User",
            &obj(json!({
                "$id": "email",
                "$name": "displayName",
                "email": "string!#",
                "displayName": "string",
            })),
        )
        .unwrap();

        assert_eq!(def.id_field.as_deref(), Some("email"));
        assert_eq!(def.name_field.as_deref(), Some("displayName"));
    }

    #[test]
    fn test_id_directive_must_name_declared_field() {
        let err = TypeDef::parse("User", &obj(json!({"$id": "email", "name": "string"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::UndeclaredDirectiveField { .. }));
    }

    #[test]
    fn test_name_directive_rejects_directive_key() {
        let err = TypeDef::parse(
            "User",
            &obj(json!({"$name": "$id", "name": "string"})),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DirectiveFieldIsDirective { .. }));
    }

    #[test]
    fn test_auto_shred_fields() {
        let def = TypeDef::parse(
            "Post",
            &obj(json!({
                "$shred": ["title"],
                "title": "string",
                "status": "enum:draft,published",
                "pinned": "boolean",
                "publishedOn": "date",
                "slug": "string#",
                "body": "text",
            })),
        )
        .unwrap();

        let auto = def.auto_shred_fields();
        assert!(auto.contains(&"status".to_string()));
        assert!(auto.contains(&"pinned".to_string()));
        assert!(auto.contains(&"publishedOn".to_string()));
        assert!(auto.contains(&"slug".to_string()));
        assert!(!auto.contains(&"body".to_string()));
        assert_eq!(def.shred_fields, vec!["title".to_string()]);
    }

    #[test]
    fn test_validate_input_required_field() {
        let def = TypeDef::parse("User", &obj(json!({"email": "email!"}))).unwrap();

        let err = def.validate_input(&obj(json!({}))).unwrap_err();
        assert!(matches!(err, SchemaError::Validation { ref field, .. } if field == "email"));

        def.validate_input(&obj(json!({"email": "a@b.com"}))).unwrap();
    }

    #[test]
    fn test_validate_input_type_mismatch() {
        let def = TypeDef::parse("Post", &obj(json!({"views": "int?"}))).unwrap();
        let err = def.validate_input(&obj(json!({"views": "ten"}))).unwrap_err();
        assert!(matches!(err, SchemaError::Validation { ref field, .. } if field == "views"));
    }

    #[test]
    fn test_validate_input_enum_membership() {
        let def = TypeDef::parse("Post", &obj(json!({"status": "enum:draft,published"}))).unwrap();
        assert!(def
            .validate_input(&obj(json!({"status": "archived"})))
            .is_err());
        assert!(def
            .validate_input(&obj(json!({"status": "draft"})))
            .is_ok());
    }

    #[test]
    fn test_validate_input_rejects_inbound_values() {
        let def = TypeDef::parse("Post", &obj(json!({"comments": "<- Comment.post[]"}))).unwrap();
        assert!(def
            .validate_input(&obj(json!({"comments": ["c1"]})))
            .is_err());
    }

    #[test]
    fn test_registry_parse_and_lookup() {
        let registry = SchemaRegistry::parse(&obj(json!({
            "User": {"$id": "email", "email": "string!#", "posts": "<- Post.author[]"},
            "Post": {"title": "string!", "author": "-> User.posts"},
        })))
        .unwrap();

        assert!(registry.get("User").is_some());
        let forward = registry.forward_field("Post", "author").unwrap();
        assert!(matches!(
            forward.kind,
            FieldKind::OutboundRel { ref target_type, .. } if target_type == "User"
        ));
    }

    #[test]
    fn test_date_validation() {
        let def = TypeDef::parse("E", &obj(json!({"on": "date?"}))).unwrap();
        assert!(def.validate_input(&obj(json!({"on": "2025-06-15"}))).is_ok());
        assert!(def.validate_input(&obj(json!({"on": "June 15"}))).is_err());
    }
}
