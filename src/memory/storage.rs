//! Persistence for long-term memory entries.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::memory::entry::MemoryEntry;

/// On-disk form of one entry. Timestamps serialize as RFC 3339.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub memory_type: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_importance() -> f32 {
    0.5
}

impl From<&MemoryEntry> for PersistedEntry {
    fn from(entry: &MemoryEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            memory_type: entry.memory_type.clone(),
            importance: entry.importance,
            access_count: entry.access_count,
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            tags: entry.tags.clone(),
        }
    }
}

impl From<PersistedEntry> for MemoryEntry {
    fn from(persisted: PersistedEntry) -> Self {
        let mut entry = MemoryEntry::new(persisted.key, persisted.value, persisted.memory_type)
            .with_importance(persisted.importance);
        entry.access_count = persisted.access_count;
        entry.created_at = persisted.created_at;
        entry.last_accessed = persisted.last_accessed;
        entry.tags = persisted.tags;
        entry
    }
}

/// Key-value blob store for long-term entries. Writes overwrite by key.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn write(&self, entry: &PersistedEntry) -> Result<(), MemoryError>;

    async fn load_all(&self) -> Result<Vec<PersistedEntry>, MemoryError>;
}

/// One pretty-printed JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", urlencoding::encode(key)))
    }
}

#[async_trait]
impl MemorySink for JsonDirSink {
    async fn write(&self, entry: &PersistedEntry) -> Result<(), MemoryError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_error(&self.root, e))?;

        let path = self.path_for(&entry.key);
        let body = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| storage_error(&path, e))
    }

    async fn load_all(&self) -> Result<Vec<PersistedEntry>, MemoryError> {
        let mut entries = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(storage_error(&self.root, e)),
        };

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| storage_error(&self.root, e))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| storage_error(&path, e))?;
            match serde_json::from_slice::<PersistedEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable memory file");
                }
            }
        }

        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> MemoryError {
    MemoryError::Storage {
        reason: format!("{}: {}", path.display(), e),
    }
}
