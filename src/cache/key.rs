//! Cache Keys
//!
//! Every key canonicalizes to one stable string. That string is the memory
//! tier's map key, the passive store key (after the configured prefix) and the
//! `key` field sent to companions. Two keys with the same canonical form are
//! the same entry.

use crate::cache::invalidation::InvalidationRule;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// =============================================================================
// CacheKey Trait
// =============================================================================

/// Application-defined cache identity
pub trait CacheKey: Send + Sync + 'static {
    /// Deterministic canonical form of this key
    fn storage_key(&self) -> String;

    /// Whether an invalidation rule applies to this key
    ///
    /// The default matches built-in rules against the canonical form;
    /// override it to evaluate [`InvalidationRule::Custom`] predicates.
    fn is_invalidated_by(&self, rule: &InvalidationRule) -> bool {
        rule.matches_storage_key(&self.storage_key())
    }
}

impl CacheKey for String {
    fn storage_key(&self) -> String {
        self.clone()
    }
}

impl CacheKey for &'static str {
    fn storage_key(&self) -> String {
        (*self).to_string()
    }
}

// =============================================================================
// Named Key
// =============================================================================

/// Namespaced key with an optional version, rendered as `ns:id[:vN]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedKey {
    /// Namespace (e.g. "users", "catalog")
    pub namespace: String,
    /// Identifier within the namespace
    pub id: String,
    /// Optional version
    pub version: Option<u64>,
}

impl NamedKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version: None,
        }
    }

    pub fn versioned(namespace: impl Into<String>, id: impl Into<String>, version: u64) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version: Some(version),
        }
    }

    /// Rule matching every key of a namespace
    pub fn namespace_rule(namespace: &str) -> InvalidationRule {
        InvalidationRule::prefix(format!("{}:", namespace))
    }

    /// Parse the canonical form back into its parts
    pub fn parse(canonical: &str) -> Option<Self> {
        let mut parts = canonical.splitn(3, ':');
        let namespace = parts.next()?;
        let id = parts.next()?;
        let version = match parts.next() {
            Some(v) => Some(v.strip_prefix('v')?.parse().ok()?),
            None => None,
        };
        if namespace.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            version,
        })
    }
}

impl CacheKey for NamedKey {
    fn storage_key(&self) -> String {
        match self.version {
            Some(v) => format!("{}:{}:v{}", self.namespace, self.id, v),
            None => format!("{}:{}", self.namespace, self.id),
        }
    }
}

impl fmt::Display for NamedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

// =============================================================================
// JSON Key
// =============================================================================

/// Key built from any serializable record
///
/// Object members are emitted in sorted order so field order in the source
/// type never changes the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonKey {
    canonical: String,
}

impl JsonKey {
    pub fn new<K: Serialize + ?Sized>(record: &K) -> Result<Self> {
        Ok(Self {
            canonical: canonical_json(record)?,
        })
    }
}

impl CacheKey for JsonKey {
    fn storage_key(&self) -> String {
        self.canonical.clone()
    }
}

/// Deterministic JSON rendering of a value (sorted object members)
pub fn canonical_json<K: Serialize + ?Sized>(record: &K) -> Result<String> {
    let value = serde_json::to_value(record)?;
    Ok(serde_json::to_string(&sorted(value))?)
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(String, Value)> = map.into_iter().collect();
            members.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(members.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

// =============================================================================
// Key Holder
// =============================================================================

/// A key together with its canonical form, computed once per operation
#[derive(Clone)]
pub struct KeyHolder {
    storage_key: String,
    key: Arc<dyn CacheKey>,
}

impl KeyHolder {
    pub fn new<K: CacheKey>(key: K) -> Self {
        Self {
            storage_key: key.storage_key(),
            key: Arc::new(key),
        }
    }

    /// Holder for a key only known by its canonical form (e.g. from the wire)
    pub fn from_storage_key(storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        Self {
            key: Arc::new(storage_key.clone()),
            storage_key,
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn key(&self) -> &Arc<dyn CacheKey> {
        &self.key
    }

    pub fn is_invalidated_by(&self, rule: &InvalidationRule) -> bool {
        self.key.is_invalidated_by(rule)
    }
}

impl PartialEq for KeyHolder {
    fn eq(&self, other: &Self) -> bool {
        self.storage_key == other.storage_key
    }
}

impl Eq for KeyHolder {}

impl Hash for KeyHolder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.storage_key.hash(state);
    }
}

impl fmt::Debug for KeyHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyHolder").field(&self.storage_key).finish()
    }
}

impl fmt::Display for KeyHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Query {
        tenant: String,
        page: u32,
        filters: std::collections::HashMap<String, String>,
    }

    #[test]
    fn test_named_key_roundtrip() {
        let key = NamedKey::new("users", "42");
        assert_eq!(key.storage_key(), "users:42");
        assert_eq!(NamedKey::parse("users:42"), Some(key));

        let versioned = NamedKey::versioned("catalog", "sku-1", 3);
        assert_eq!(versioned.storage_key(), "catalog:sku-1:v3");
        assert_eq!(NamedKey::parse("catalog:sku-1:v3"), Some(versioned));

        assert_eq!(NamedKey::parse("nonamespace"), None);
        assert_eq!(NamedKey::parse("a:b:3"), None);
    }

    #[test]
    fn test_json_key_ignores_member_order() {
        let mut first = std::collections::HashMap::new();
        first.insert("region".to_string(), "eu".to_string());
        first.insert("tier".to_string(), "gold".to_string());
        let mut second = std::collections::HashMap::new();
        second.insert("tier".to_string(), "gold".to_string());
        second.insert("region".to_string(), "eu".to_string());

        let a = JsonKey::new(&Query {
            tenant: "acme".into(),
            page: 1,
            filters: first,
        })
        .unwrap();
        let b = JsonKey::new(&Query {
            tenant: "acme".into(),
            page: 1,
            filters: second,
        })
        .unwrap();

        assert_eq!(a, b);
        assert_eq!(
            a.storage_key(),
            r#"{"filters":{"region":"eu","tier":"gold"},"page":1,"tenant":"acme"}"#
        );
    }

    #[test]
    fn test_namespace_rule_matches_only_namespace() {
        let rule = NamedKey::namespace_rule("users");
        assert!(NamedKey::new("users", "1").is_invalidated_by(&rule));
        assert!(!NamedKey::new("usersettings", "1").is_invalidated_by(&rule));
    }

    #[test]
    fn test_holder_identity_is_canonical_form() {
        let a = KeyHolder::new(NamedKey::new("users", "7"));
        let b = KeyHolder::from_storage_key("users:7");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "users:7");
    }
}
