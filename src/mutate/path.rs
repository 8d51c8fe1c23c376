//! Dotted-path field access over document maps.
//!
//! Paths are parsed once into a sequence of steps; every step is checked
//! against the prototype-pollution deny-list before any read or write.

use serde_json::{Map, Value};

use super::MutationError;

/// Path components that are rejected outright, anywhere in a path.
const DENY_LIST: &[&str] = &["__proto__", "constructor", "prototype"];

/// A parsed dotted path such as `profile.address.city`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse and validate a path. Fails on empty segments and on any
    /// deny-listed component, before any mutation can happen.
    pub fn parse(path: &str) -> Result<Self, MutationError> {
        if path.is_empty() {
            return Err(MutationError::InvalidUpdate(
                "empty field path".to_string(),
            ));
        }
        let mut segments = Vec::new();
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(MutationError::InvalidUpdate(format!(
                    "empty segment in path '{}'",
                    path
                )));
            }
            if DENY_LIST.contains(&segment) {
                return Err(MutationError::PrototypePollution(segment.to_string()));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// Read the value at this path. Numeric segments index into arrays.
    pub fn get<'a>(&self, doc: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = doc.get(first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write the value at this path, creating intermediate objects as needed.
    /// Traversing through a non-object is an error.
    pub fn set(
        &self,
        doc: &mut Map<String, Value>,
        value: Value,
    ) -> Result<(), MutationError> {
        let mut current = doc;
        for (i, segment) in self.segments.iter().enumerate() {
            if i == self.segments.len() - 1 {
                current.insert(segment.clone(), value);
                return Ok(());
            }
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(map) => map,
                _ => {
                    return Err(MutationError::InvalidUpdate(format!(
                        "cannot traverse through non-object at '{}' in path '{}'",
                        segment,
                        self.dotted()
                    )))
                }
            };
        }
        Ok(())
    }

    /// Remove the value at this path. Missing paths are a no-op.
    pub fn remove(&self, doc: &mut Map<String, Value>) -> Option<Value> {
        let mut current = doc;
        for (i, segment) in self.segments.iter().enumerate() {
            if i == self.segments.len() - 1 {
                return current.remove(segment);
            }
            current = match current.get_mut(segment) {
                Some(Value::Object(map)) => map,
                _ => return None,
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Map<String, Value> {
        json!({
            "title": "Hello",
            "stats": {"views": 10, "likes": 2},
            "tags": ["a", "b", "c"],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_get_top_level_and_nested() {
        let doc = doc();
        let path = FieldPath::parse("title").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("Hello")));

        let path = FieldPath::parse("stats.views").unwrap();
        assert_eq!(path.get(&doc), Some(&json!(10)));

        let path = FieldPath::parse("stats.missing").unwrap();
        assert!(path.get(&doc).is_none());
    }

    #[test]
    fn test_get_array_index() {
        let doc = doc();
        let path = FieldPath::parse("tags.1").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("b")));

        let path = FieldPath::parse("tags.9").unwrap();
        assert!(path.get(&doc).is_none());
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = doc();
        let path = FieldPath::parse("meta.author.name").unwrap();
        path.set(&mut doc, json!("Alice")).unwrap();

        assert_eq!(doc["meta"]["author"]["name"], json!("Alice"));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = doc();
        let path = FieldPath::parse("title.x").unwrap();
        assert!(path.set(&mut doc, json!(1)).is_err());
        // The document is unchanged.
        assert_eq!(doc["title"], json!("Hello"));
    }

    #[test]
    fn test_remove() {
        let mut doc = doc();
        let path = FieldPath::parse("stats.views").unwrap();
        assert_eq!(path.remove(&mut doc), Some(json!(10)));
        assert_eq!(path.remove(&mut doc), None);
        assert!(doc["stats"].get("views").is_none());
    }

    #[test]
    fn test_prototype_pollution_rejected() {
        for bad in ["__proto__", "constructor", "prototype"] {
            let err = FieldPath::parse(bad).unwrap_err();
            assert!(matches!(err, MutationError::PrototypePollution(_)));

            let nested = format!("profile.{}.x", bad);
            let err = FieldPath::parse(&nested).unwrap_err();
            assert!(matches!(err, MutationError::PrototypePollution(_)));
        }
    }

    #[test]
    fn test_empty_paths_rejected() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
    }
}
