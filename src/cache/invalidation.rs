//! Invalidation Rules
//!
//! Rules are broadcast to every companion and evaluated against each key held
//! in memory. Applied rules are also remembered for a retention window so
//! that values created before an invalidation are rejected when they show up
//! later from a peer or a passive store.

use crate::cache::key::{CacheKey, KeyHolder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

// =============================================================================
// Invalidation Rule
// =============================================================================

/// Predicate selecting cache entries to invalidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InvalidationRule {
    /// Exactly one canonical key
    Key { key: String },
    /// Every canonical key starting with `prefix`
    Prefix { prefix: String },
    /// Everything
    All,
    /// Application predicate, evaluated by `CacheKey::is_invalidated_by` overrides
    Custom {
        kind: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl InvalidationRule {
    pub fn key<K: CacheKey + ?Sized>(key: &K) -> Self {
        InvalidationRule::Key {
            key: key.storage_key(),
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        InvalidationRule::Prefix {
            prefix: prefix.into(),
        }
    }

    pub fn custom(kind: impl Into<String>, args: serde_json::Value) -> Self {
        InvalidationRule::Custom {
            kind: kind.into(),
            args,
        }
    }

    /// Match built-in rules against a canonical key. Custom rules never match here.
    pub fn matches_storage_key(&self, storage_key: &str) -> bool {
        match self {
            InvalidationRule::Key { key } => key == storage_key,
            InvalidationRule::Prefix { prefix } => storage_key.starts_with(prefix.as_str()),
            InvalidationRule::All => true,
            InvalidationRule::Custom { .. } => false,
        }
    }

    /// The single key this rule targets, if it is an exact-key rule
    pub fn exact_key(&self) -> Option<&str> {
        match self {
            InvalidationRule::Key { key } => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvalidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationRule::Key { key } => write!(f, "key({})", key),
            InvalidationRule::Prefix { prefix } => write!(f, "prefix({})", prefix),
            InvalidationRule::All => write!(f, "all"),
            InvalidationRule::Custom { kind, .. } => write!(f, "custom({})", kind),
        }
    }
}

// =============================================================================
// Invalidation Log
// =============================================================================

#[derive(Debug)]
struct LoggedRule {
    applied_at: DateTime<Utc>,
    rule: InvalidationRule,
}

/// Recently applied rules, newest last
#[derive(Debug)]
pub struct InvalidationLog {
    rules: Mutex<VecDeque<LoggedRule>>,
    retention: chrono::Duration,
}

impl InvalidationLog {
    pub fn new(retention: Duration) -> Self {
        Self {
            rules: Mutex::new(VecDeque::new()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Remember a rule applied at `applied_at`
    pub fn record(&self, rule: InvalidationRule, applied_at: DateTime<Utc>) {
        if applied_at < Utc::now() - self.retention {
            return;
        }
        let mut rules = self.rules.lock();
        Self::prune(&mut rules, self.retention);
        // Keep the deque ordered by application time
        let position = rules
            .iter()
            .rposition(|logged| logged.applied_at <= applied_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        rules.insert(position, LoggedRule { applied_at, rule });
    }

    /// Oldest creation date a value for `key` may carry to still be valid
    pub fn minimum_creation_date(&self, key: &KeyHolder) -> Option<DateTime<Utc>> {
        let mut rules = self.rules.lock();
        Self::prune(&mut rules, self.retention);
        rules
            .iter()
            .rev()
            .find(|logged| key.is_invalidated_by(&logged.rule))
            .map(|logged| logged.applied_at)
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(rules: &mut VecDeque<LoggedRule>, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        while rules.front().is_some_and(|logged| logged.applied_at < cutoff) {
            rules.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::NamedKey;

    #[test]
    fn test_builtin_rule_matching() {
        assert!(InvalidationRule::key(&"k1").matches_storage_key("k1"));
        assert!(!InvalidationRule::key(&"k1").matches_storage_key("k2"));
        assert!(InvalidationRule::prefix("users:").matches_storage_key("users:9"));
        assert!(InvalidationRule::All.matches_storage_key("anything"));
        assert!(!InvalidationRule::custom("tenant", serde_json::json!({"id": 1}))
            .matches_storage_key("anything"));
    }

    #[test]
    fn test_rule_wire_format() {
        let json = serde_json::to_string(&InvalidationRule::prefix("users:")).unwrap();
        assert_eq!(json, r#"{"type":"prefix","prefix":"users:"}"#);

        let rule: InvalidationRule = serde_json::from_str(r#"{"type":"all"}"#).unwrap();
        assert_eq!(rule, InvalidationRule::All);

        let rule: InvalidationRule =
            serde_json::from_str(r#"{"type":"custom","kind":"tenant"}"#).unwrap();
        assert_eq!(rule, InvalidationRule::custom("tenant", serde_json::Value::Null));
    }

    #[test]
    fn test_log_reports_latest_matching_rule() {
        let log = InvalidationLog::new(Duration::from_secs(60));
        let key = KeyHolder::new(NamedKey::new("users", "1"));
        assert_eq!(log.minimum_creation_date(&key), None);

        let earlier = Utc::now() - chrono::Duration::seconds(10);
        let later = Utc::now();
        log.record(NamedKey::namespace_rule("users"), later);
        log.record(InvalidationRule::key(&NamedKey::new("users", "1")), earlier);
        log.record(InvalidationRule::key(&"other"), Utc::now());

        assert_eq!(log.minimum_creation_date(&key), Some(later));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_log_drops_expired_rules() {
        let log = InvalidationLog::new(Duration::from_secs(5));
        log.record(InvalidationRule::All, Utc::now() - chrono::Duration::seconds(30));
        assert!(log.is_empty());

        let key = KeyHolder::from_storage_key("k");
        assert_eq!(log.minimum_creation_date(&key), None);
    }
}
