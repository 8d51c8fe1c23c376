//! Entity identity and sortable event-id generation.

use std::fmt;

use chrono::Utc;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Crockford base32 alphabet used for event ids and generated local ids.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A stable entity identity: `(namespace, localId)`, written `namespace/localId`.
///
/// The namespace is restricted to lowercase letters, digits and underscores.
/// The local id is any non-empty string that does not contain `/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    namespace: String,
    local_id: String,
}

/// Errors produced when parsing or constructing an [`EntityId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("namespace must be non-empty lowercase letters, digits or underscores: '{0}'")]
    InvalidNamespace(String),

    #[error("local id must be non-empty and must not contain '/': '{0}'")]
    InvalidLocalId(String),

    #[error("entity id must have the form 'namespace/localId': '{0}'")]
    Malformed(String),
}

impl EntityId {
    /// Construct an id from validated parts.
    pub fn new(namespace: &str, local_id: &str) -> Result<Self, IdError> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(IdError::InvalidNamespace(namespace.to_string()));
        }
        if local_id.is_empty() || local_id.contains('/') {
            return Err(IdError::InvalidLocalId(local_id.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            local_id: local_id.to_string(),
        })
    }

    /// Parse the `namespace/localId` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (ns, local) = s
            .split_once('/')
            .ok_or_else(|| IdError::Malformed(s.to_string()))?;
        Self::new(ns, local)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The `namespace:localId` encoding used inside event payloads.
    pub fn target(&self) -> String {
        format!("{}:{}", self.namespace, self.local_id)
    }

    /// Parse the event-payload `namespace:localId` form.
    pub fn from_target(s: &str) -> Result<Self, IdError> {
        let (ns, local) = s
            .split_once(':')
            .ok_or_else(|| IdError::Malformed(s.to_string()))?;
        Self::new(ns, local)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.local_id)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}/{})", self.namespace, self.local_id)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EntityId::parse(&s).map_err(de::Error::custom)
    }
}

/// Encode `bits` into `width` Crockford base32 characters, most significant first.
fn encode_base32(mut bits: u128, width: usize) -> String {
    let mut out = vec![b'0'; width];
    for slot in out.iter_mut().rev() {
        *slot = CROCKFORD[(bits & 0x1F) as usize];
        bits >>= 5;
    }
    String::from_utf8(out).unwrap_or_default()
}

/// Generator for sortable, collision-resistant 26-character event ids.
///
/// Layout follows the ULID convention: 48 bits of millisecond wall time in the
/// first 10 characters, 80 random bits in the remaining 16. Ids produced by one
/// generator are strictly increasing; a same-millisecond tie is broken by
/// incrementing the random component.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last_ts: u64,
    last_random: u128,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id, strictly greater than any previous one.
    pub fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis().max(0) as u64 & 0xFFFF_FFFF_FFFF;
        if now <= self.last_ts {
            // Same or regressed clock tick: bump the random tail instead.
            self.last_random = self.last_random.wrapping_add(1) & 0xFFFF_FFFF_FFFF_FFFF_FFFF;
        } else {
            self.last_ts = now;
            self.last_random = random_80_bits();
        }
        format_event_id(self.last_ts, self.last_random)
    }
}

fn random_80_bits() -> u128 {
    let bytes = Uuid::new_v4().into_bytes();
    let mut bits: u128 = 0;
    for b in &bytes[..10] {
        bits = (bits << 8) | *b as u128;
    }
    bits
}

fn format_event_id(ts: u64, random: u128) -> String {
    let mut id = encode_base32(ts as u128, 10);
    id.push_str(&encode_base32(random, 16));
    id
}

/// Generate a single event id outside any generator. Sortable but without the
/// per-generator monotonic tie-breaking.
pub fn generate_event_id() -> String {
    let ts = Utc::now().timestamp_millis().max(0) as u64 & 0xFFFF_FFFF_FFFF;
    format_event_id(ts, random_80_bits())
}

/// Generate a local id for entities whose type has no `$id` directive.
pub fn generate_local_id() -> String {
    generate_event_id().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::parse("posts/hello-world").unwrap();
        assert_eq!(id.namespace(), "posts");
        assert_eq!(id.local_id(), "hello-world");
        assert_eq!(id.to_string(), "posts/hello-world");
    }

    #[test]
    fn test_entity_id_target_encoding() {
        let id = EntityId::new("users", "a@b").unwrap();
        assert_eq!(id.target(), "users:a@b");

        let back = EntityId::from_target("users:a@b").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_entity_id_rejects_bad_namespace() {
        assert!(EntityId::new("Posts", "x").is_err());
        assert!(EntityId::new("", "x").is_err());
        assert!(EntityId::new("po-sts", "x").is_err());
    }

    #[test]
    fn test_entity_id_rejects_bad_local_id() {
        assert!(EntityId::new("posts", "").is_err());
        assert!(EntityId::new("posts", "a/b").is_err());
    }

    #[test]
    fn test_entity_id_local_id_allows_punctuation() {
        let id = EntityId::new("users", "a@b.com").unwrap();
        assert_eq!(id.local_id(), "a@b.com");
    }

    #[test]
    fn test_entity_id_serde_round_trip() {
        let id = EntityId::new("posts", "p1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"posts/p1\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_entity_id_deserialize_rejects_invalid() {
        let result: Result<EntityId, _> = serde_json::from_str("\"no-slash\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_event_id_length_and_alphabet() {
        let id = generate_event_id();
        assert_eq!(id.len(), 26);
        assert!(id.bytes().all(|b| CROCKFORD.contains(&b)));
    }

    #[test]
    fn test_event_id_generator_strictly_increasing() {
        let mut gen = EventIdGenerator::new();
        let mut prev = gen.next_id();
        for _ in 0..1000 {
            let next = gen.next_id();
            assert!(next > prev, "{} should sort after {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_event_id_timestamp_prefix_sorts() {
        let early = format_event_id(1_000, 0xFFFF);
        let late = format_event_id(2_000, 0);
        assert!(early < late);
    }

    #[test]
    fn test_generate_local_id_is_valid() {
        let local = generate_local_id();
        assert_eq!(local.len(), 26);
        let id = EntityId::new("posts", &local).unwrap();
        assert_eq!(id.local_id(), local);
    }
}
