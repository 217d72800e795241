//! Long-term memory boundary.
//!
//! Memory backends are external collaborators; the runtime only sees the
//! [`MemoryAdapter`] trait. The orchestrator calls `retrieve` before its
//! first LLM invocation and `write` after a successful reply, and both are
//! strictly best-effort: absence of an adapter, or an adapter error, never
//! changes the correctness of a turn.
//!
//! [`InMemoryStore`] is the process-local backend used by tests and
//! single-process deployments.

use std::error::Error;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::genesis::now_unix_nanos;

/// One remembered item.
#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    /// Promoted items survive pruning.
    pub promoted: bool,
}

/// How `retrieve` ranks candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPolicy {
    /// Most recent first.
    Recency,
    /// Best lexical overlap with the query first.
    Relevance,
}

/// What `prune` removes.
#[derive(Debug, Clone, Default)]
pub struct PruneCriteria {
    /// Keep at most this many items (oldest evicted first).
    pub max_items: Option<usize>,
    /// Remove items created before this instant.
    pub older_than_unix_ns: Option<i64>,
    /// Never remove promoted items.
    pub keep_promoted: bool,
}

/// Adapter interface to a memory backend.
#[async_trait]
pub trait MemoryAdapter: Send + Sync {
    /// Persist one item; returns its id.
    async fn write(
        &self,
        item: &str,
        metadata: serde_json::Value,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Return up to `k` items ranked per `policy`.
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        policy: RetrievalPolicy,
    ) -> Result<Vec<MemoryItem>, Box<dyn Error + Send + Sync>>;

    /// Summarize the most recent `window` items into one string.
    async fn summarize(&self, window: usize) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Mark an item as protected from pruning.
    async fn promote(&self, id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Remove items matching `criteria`; returns the number removed.
    async fn prune(&self, criteria: PruneCriteria) -> Result<usize, Box<dyn Error + Send + Sync>>;
}

/// Process-local [`MemoryAdapter`].
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<Vec<MemoryItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn relevance(query: &str, content: &str) -> usize {
        let content_lower = content.to_lowercase();
        query
            .to_lowercase()
            .split_whitespace()
            .filter(|term| content_lower.contains(*term))
            .count()
    }
}

#[async_trait]
impl MemoryAdapter for InMemoryStore {
    async fn write(
        &self,
        item: &str,
        metadata: serde_json::Value,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let id = Uuid::new_v4().to_string();
        let mut items = self.items.write().await;
        items.push(MemoryItem {
            id: id.clone(),
            content: item.to_string(),
            metadata,
            created_at: now_unix_nanos(),
            promoted: false,
        });
        Ok(id)
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        policy: RetrievalPolicy,
    ) -> Result<Vec<MemoryItem>, Box<dyn Error + Send + Sync>> {
        let items = self.items.read().await;
        let mut candidates: Vec<MemoryItem> = items.clone();
        match policy {
            RetrievalPolicy::Recency => {
                candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            RetrievalPolicy::Relevance => {
                candidates.sort_by(|a, b| {
                    Self::relevance(query, &b.content)
                        .cmp(&Self::relevance(query, &a.content))
                        .then(b.created_at.cmp(&a.created_at))
                });
                candidates.retain(|item| Self::relevance(query, &item.content) > 0);
            }
        }
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn summarize(&self, window: usize) -> Result<String, Box<dyn Error + Send + Sync>> {
        let items = self.items.read().await;
        let start = items.len().saturating_sub(window);
        let lines: Vec<String> = items[start..]
            .iter()
            .map(|item| format!("- {}", item.content))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn promote(&self, id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.promoted = true;
                Ok(())
            }
            None => Err(format!("no memory item '{}'", id).into()),
        }
    }

    async fn prune(&self, criteria: PruneCriteria) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let mut items = self.items.write().await;
        let before = items.len();
        if let Some(cutoff) = criteria.older_than_unix_ns {
            items.retain(|item| {
                item.created_at >= cutoff || (criteria.keep_promoted && item.promoted)
            });
        }
        if let Some(max) = criteria.max_items {
            while items.len() > max {
                let victim = items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| !(criteria.keep_promoted && item.promoted))
                    .min_by_key(|(_, item)| item.created_at)
                    .map(|(idx, _)| idx);
                match victim {
                    Some(idx) => {
                        items.remove(idx);
                    }
                    None => break,
                }
            }
        }
        Ok(before - items.len())
    }
}
