//! Memory entry types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single keyed memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique within its tier.
    pub key: String,
    pub value: serde_json::Value,
    /// Free-form tag such as "fact" or "working".
    pub memory_type: String,
    /// Advisory weight. Not used for eviction.
    pub importance: f32,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    /// Unit vector, when an embedding provider is configured.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Insertion sequence, the final eviction tie-breaker.
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Index slot holding this entry's current embedding.
    #[serde(skip)]
    pub(crate) index_slot: Option<usize>,
}

impl MemoryEntry {
    /// Create a fresh entry with no accesses.
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        memory_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            memory_type: memory_type.into(),
            importance: 0.5,
            access_count: 0,
            created_at: Utc::now(),
            last_accessed: None,
            embedding: None,
            tags: BTreeSet::new(),
            seq: 0,
            index_slot: None,
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Record an access and return the value.
    pub fn touch(&mut self) -> &serde_json::Value {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
        &self.value
    }

    /// Eviction order key: least accessed first, then least recently
    /// accessed (never-accessed entries sort as the oldest), then oldest
    /// inserted.
    pub(crate) fn eviction_rank(&self) -> (u64, DateTime<Utc>, u64) {
        (
            self.access_count,
            self.last_accessed.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.seq,
        )
    }

    /// Text used for embedding and keyword matching.
    ///
    /// Strings are used as-is for embedding; everything else is JSON.
    pub fn value_text(&self) -> String {
        value_text(&self.value)
    }
}

pub(crate) fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub key: String,
    pub value: serde_json::Value,
    pub score: f32,
    pub memory_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_counts_accesses() {
        let mut entry = MemoryEntry::new("k", serde_json::json!("v"), "fact");
        assert!(entry.last_accessed.is_none());
        assert_eq!(entry.touch(), &serde_json::json!("v"));
        entry.touch();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed.is_some());
    }

    #[test]
    fn test_eviction_rank_orders_by_access_then_recency() {
        let mut hot = MemoryEntry::new("hot", serde_json::json!(1), "working");
        hot.seq = 0;
        hot.touch();

        let mut cold_old = MemoryEntry::new("cold_old", serde_json::json!(2), "working");
        cold_old.seq = 1;
        let mut cold_new = MemoryEntry::new("cold_new", serde_json::json!(3), "working");
        cold_new.seq = 2;

        let mut entries = [&hot, &cold_new, &cold_old];
        entries.sort_by_key(|e| e.eviction_rank());
        let order: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(order, vec!["cold_old", "cold_new", "hot"]);
    }

    #[test]
    fn test_value_text() {
        let entry = MemoryEntry::new("a", serde_json::json!("hello world"), "fact");
        assert_eq!(entry.value_text(), "hello world");

        let entry = MemoryEntry::new("b", serde_json::json!({"x": 1}), "fact");
        assert_eq!(entry.value_text(), r#"{"x":1}"#);
    }

    #[test]
    fn test_tags_deduplicated() {
        let entry = MemoryEntry::new("a", serde_json::json!(1), "fact").with_tags(["x", "y", "x"]);
        assert_eq!(entry.tags.len(), 2);
    }
}
