//! Dual-tier memory for the agent.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        MemoryStore                         │
//! │  ┌──────────────┐  ┌─────────────────┐  ┌──────────────┐  │
//! │  │ Working tier │  │ Long-term tier  │  │  Working     │  │
//! │  │ (LFU/LRU     │  │ (embeddings +   │  │  context     │  │
//! │  │  eviction)   │  │  vector index)  │  │  (session)   │  │
//! │  └──────────────┘  └────────┬────────┘  └──────────────┘  │
//! │                             │                              │
//! │                      ┌──────┴──────┐                       │
//! │                      │ MemorySink  │                       │
//! │                      │ (JSON dir)  │                       │
//! │                      └─────────────┘                       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Search uses the vector index when both an index and an embedding
//! provider are configured and falls back to keyword matching otherwise.
//! It never fails.

mod context;
mod embeddings;
mod entry;
mod index;
mod storage;

pub use context::{Decision, FileChange, WorkingContext};
pub use embeddings::{EmbeddingProvider, HashEmbeddings, normalize};
pub use entry::{MemoryEntry, SearchResult};
pub use index::{FlatIndex, VectorIndex};
pub use storage::{JsonDirSink, MemorySink, PersistedEntry};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::MemoryConfig;
use crate::error::MemoryError;

/// Score reported for keyword matches.
pub const KEYWORD_SCORE: f32 = 0.5;

const WORKING_TYPE: &str = "working";

#[derive(Default)]
struct WorkingTier {
    entries: HashMap<String, MemoryEntry>,
    next_seq: u64,
}

/// Long-term entries plus the index and its slot mapping. All three change
/// together under one lock.
#[derive(Default)]
struct LongTermTier {
    entries: HashMap<String, MemoryEntry>,
    index: Option<Box<dyn VectorIndex>>,
    slot_to_key: HashMap<usize, String>,
    next_seq: u64,
}

impl LongTermTier {
    fn insert(&mut self, mut entry: MemoryEntry) -> Result<(), MemoryError> {
        if let Some(previous) = self.entries.get(&entry.key)
            && let Some(slot) = previous.index_slot
        {
            self.slot_to_key.remove(&slot);
        }

        if let (Some(index), Some(embedding)) = (self.index.as_mut(), entry.embedding.as_ref()) {
            let slot = index.add(embedding)?;
            self.slot_to_key.insert(slot, entry.key.clone());
            entry.index_slot = Some(slot);
        }

        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Index slots whose entry was overwritten or removed.
    fn stale_slots(&self) -> usize {
        self.index
            .as_ref()
            .map(|index| index.len().saturating_sub(self.slot_to_key.len()))
            .unwrap_or(0)
    }

    fn entries_by_seq(&self) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }
}

/// Key-indexed memory shared by task handlers.
pub struct MemoryStore {
    config: MemoryConfig,
    working: RwLock<WorkingTier>,
    long_term: RwLock<LongTermTier>,
    context: RwLock<WorkingContext>,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    sink: Option<Arc<dyn MemorySink>>,
    /// Held from insert to sink write so the persisted copy of a key is
    /// always its latest in-memory value.
    persist_order: Mutex<()>,
}

impl MemoryStore {
    /// Create a store with an optional similarity index. Without one,
    /// search is keyword-only.
    pub fn new(config: MemoryConfig, index: Option<Box<dyn VectorIndex>>) -> Self {
        Self {
            config,
            working: RwLock::new(WorkingTier::default()),
            long_term: RwLock::new(LongTermTier {
                index,
                ..LongTermTier::default()
            }),
            context: RwLock::new(WorkingContext::default()),
            embeddings: None,
            sink: None,
            persist_order: Mutex::new(()),
        }
    }

    /// Build the default store for a config: a flat index and hash
    /// embeddings of `embedding_dim`, persisted when `storage_path` is set.
    pub fn from_config(config: MemoryConfig) -> Self {
        let dimension = config.embedding_dim;
        let sink = config.storage_path.clone().map(JsonDirSink::new);

        let mut store = Self::new(config, Some(Box::new(FlatIndex::new(dimension))))
            .with_embeddings(Arc::new(HashEmbeddings::new(dimension)));
        if let Some(sink) = sink {
            store = store.with_sink(Arc::new(sink));
        }
        store
    }

    /// Set the embedding provider used by `store` and `search`.
    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Persist long-term entries to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MemorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ==================== Working tier ====================

    /// Insert or overwrite a working entry, evicting the coldest tenth of
    /// the tier once it grows past `max_short_term`.
    pub async fn set_working(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut tier = self.working.write().await;

        let mut entry = MemoryEntry::new(key, value, WORKING_TYPE);
        entry.seq = tier.next_seq;
        tier.next_seq += 1;
        tier.entries.insert(entry.key.clone(), entry);

        if tier.entries.len() > self.config.max_short_term {
            let evict = tier.entries.len() / 10;
            let mut ranked: Vec<(_, String)> = tier
                .entries
                .values()
                .map(|e| (e.eviction_rank(), e.key.clone()))
                .collect();
            ranked.sort();

            for (_, key) in ranked.into_iter().take(evict) {
                tier.entries.remove(&key);
            }
            tracing::debug!(evicted = evict, remaining = tier.entries.len(), "Evicted working memory");
        }
    }

    /// Read a working entry, counting the access.
    pub async fn get_working(&self, key: &str) -> Option<serde_json::Value> {
        let mut tier = self.working.write().await;
        tier.entries.get_mut(key).map(|entry| entry.touch().clone())
    }

    pub async fn working_len(&self) -> usize {
        self.working.read().await.entries.len()
    }

    // ==================== Long-term tier ====================

    /// Insert or overwrite a long-term entry.
    ///
    /// The value is embedded when a provider is configured; a failed
    /// embedding is logged and the entry is stored without one. The entry is
    /// written to the sink, if any, after it is visible in memory. Sink
    /// writes happen in the same order as the inserts.
    pub async fn store(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        memory_type: impl Into<String>,
        importance: f32,
    ) -> Result<(), MemoryError> {
        let key = key.into();
        let mut entry = MemoryEntry::new(key.clone(), value, memory_type).with_importance(importance);

        if let Some(provider) = &self.embeddings {
            match provider.embed(&entry.value_text()).await {
                Ok(embedding) => entry.embedding = Some(embedding),
                Err(e) => tracing::warn!(key = %key, error = %e, "Storing memory without embedding"),
            }
        }

        let persisted = PersistedEntry::from(&entry);
        let _order = match &self.sink {
            Some(_) => Some(self.persist_order.lock().await),
            None => None,
        };
        {
            let mut tier = self.long_term.write().await;
            tier.insert(entry)?;
            if tier.entries.len() > self.config.max_long_term {
                tracing::warn!(
                    key = %key,
                    entries = tier.entries.len(),
                    capacity = self.config.max_long_term,
                    "Long-term memory over capacity"
                );
            }
        }

        if let Some(sink) = &self.sink {
            sink.write(&persisted).await?;
        }
        tracing::debug!(key = %key, "Stored long-term memory");
        Ok(())
    }

    /// Read a long-term entry, counting the access.
    pub async fn retrieve(&self, key: &str) -> Option<serde_json::Value> {
        let mut tier = self.long_term.write().await;
        tier.entries.get_mut(key).map(|entry| entry.touch().clone())
    }

    /// Drop a long-term entry from memory. Persisted copies are left alone.
    pub async fn remove(&self, key: &str) -> bool {
        let mut tier = self.long_term.write().await;
        match tier.entries.remove(key) {
            Some(entry) => {
                if let Some(slot) = entry.index_slot {
                    tier.slot_to_key.remove(&slot);
                }
                true
            }
            None => false,
        }
    }

    pub async fn long_term_len(&self) -> usize {
        self.long_term.read().await.entries.len()
    }

    /// Find up to `limit` long-term entries relevant to `query`.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        if limit == 0 {
            return Vec::new();
        }

        let has_index = self.long_term.read().await.index.is_some();
        if has_index && let Some(provider) = &self.embeddings {
            match provider.embed(query).await {
                Ok(embedding) => return self.similarity_search(&embedding, limit).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Query embedding failed, using keyword search");
                }
            }
        }

        self.keyword_search(query, limit).await
    }

    async fn similarity_search(&self, embedding: &[f32], limit: usize) -> Vec<SearchResult> {
        let tier = self.long_term.read().await;
        let Some(index) = tier.index.as_ref() else {
            return Vec::new();
        };

        index
            .search(embedding, limit + tier.stale_slots())
            .into_iter()
            .filter_map(|(slot, score)| {
                let key = tier.slot_to_key.get(&slot)?;
                let entry = tier.entries.get(key)?;
                (entry.index_slot == Some(slot)).then(|| SearchResult {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    score,
                    memory_type: entry.memory_type.clone(),
                })
            })
            .take(limit)
            .collect()
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        let needle = query.to_lowercase();
        let tier = self.long_term.read().await;

        tier.entries_by_seq()
            .into_iter()
            .filter(|entry| {
                entry.key.to_lowercase().contains(&needle)
                    || entry.value.to_string().to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|entry| SearchResult {
                key: entry.key.clone(),
                value: entry.value.clone(),
                score: KEYWORD_SCORE,
                memory_type: entry.memory_type.clone(),
            })
            .collect()
    }

    /// Load every persisted entry into the long-term tier.
    ///
    /// Loaded entries carry no embeddings; call
    /// [`rebuild_index`](Self::rebuild_index) before relying on similarity
    /// search.
    pub async fn load_from_storage(&self) -> Result<usize, MemoryError> {
        let Some(sink) = &self.sink else {
            return Ok(0);
        };

        let persisted = sink.load_all().await?;
        let count = persisted.len();

        let mut tier = self.long_term.write().await;
        for entry in persisted {
            tier.insert(MemoryEntry::from(entry))?;
        }
        tracing::info!(count, "Loaded long-term memory from storage");
        Ok(count)
    }

    /// Re-embed every long-term entry and rebuild the index from scratch.
    /// Returns how many entries were indexed.
    ///
    /// Entries stored while the rebuild is embedding keep the embedding they
    /// were stored with.
    pub async fn rebuild_index(&self) -> Result<usize, MemoryError> {
        let Some(provider) = &self.embeddings else {
            return Ok(0);
        };

        let snapshot: Vec<(String, u64, String)> = {
            let tier = self.long_term.read().await;
            if tier.index.is_none() {
                return Ok(0);
            }
            tier.entries_by_seq()
                .into_iter()
                .map(|entry| (entry.key.clone(), entry.seq, entry.value_text()))
                .collect()
        };

        let mut fresh = HashMap::with_capacity(snapshot.len());
        for (key, seq, text) in snapshot {
            fresh.insert(key, (seq, provider.embed(&text).await?));
        }

        let mut tier = self.long_term.write().await;
        let LongTermTier {
            entries,
            index,
            slot_to_key,
            ..
        } = &mut *tier;
        let Some(index) = index.as_mut() else {
            return Ok(0);
        };

        index.clear();
        slot_to_key.clear();

        let mut ordered: Vec<&mut MemoryEntry> = entries.values_mut().collect();
        ordered.sort_by_key(|entry| entry.seq);

        let mut indexed = 0;
        for entry in ordered {
            entry.index_slot = None;
            // A changed seq means the entry was overwritten after the snapshot.
            if let Some((seq, embedding)) = fresh.remove(&entry.key)
                && seq == entry.seq
            {
                entry.embedding = Some(embedding);
            }
            let Some(embedding) = entry.embedding.as_ref() else {
                continue;
            };
            let slot = index.add(embedding)?;
            slot_to_key.insert(slot, entry.key.clone());
            entry.index_slot = Some(slot);
            indexed += 1;
        }

        tracing::info!(indexed, "Rebuilt memory index");
        Ok(indexed)
    }

    // ==================== Working context ====================

    pub async fn set_session(&self, session_id: impl Into<String>) {
        self.context.write().await.session_id = Some(session_id.into());
    }

    pub async fn set_current_task(&self, task: Option<serde_json::Value>) {
        self.context.write().await.current_task = task;
    }

    pub async fn record_file_change(
        &self,
        path: impl Into<String>,
        change_type: impl Into<String>,
        diff: impl Into<String>,
    ) {
        self.context
            .write()
            .await
            .record_file_change(path, change_type, diff);
    }

    pub async fn record_decision(&self, decision: impl Into<String>, reason: impl Into<String>) {
        self.context.write().await.record_decision(decision, reason);
    }

    /// Snapshot of the working context.
    pub async fn working_context(&self) -> WorkingContext {
        self.context.read().await.clone()
    }

    pub async fn clear_working_context(&self) {
        self.context.write().await.clear();
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.config)
            .field("embeddings", &self.embeddings.is_some())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
