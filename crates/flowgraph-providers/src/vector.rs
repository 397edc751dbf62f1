// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory vector store backing `ctx.vector`.
//!
//! Cosine-similarity search over per-collection record maps. Suitable
//! for tests and small single-node deployments; production installs
//! inject a real vector database behind the same port.

use async_trait::async_trait;
use flowgraph_core::ports::{VectorMatch, VectorRecord, VectorStore};
use flowgraph_sandbox::CapabilityError;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory [`VectorStore`].
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, CapabilityError> {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        let count = records.len();
        for record in records {
            entry.insert(record.id.clone(), record);
        }
        Ok(count)
    }

    async fn query(
        &self,
        collection: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>, CapabilityError> {
        let collections = self.collections.read();
        let Some(records) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<VectorMatch> = records
            .values()
            .map(|record| VectorMatch {
                id: record.id.clone(),
                score: cosine(&record.vector, &vector),
                metadata: record.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<usize, CapabilityError> {
        let mut collections = self.collections.write();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if records.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list_collections(&self) -> Result<Vec<String>, CapabilityError> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            metadata: json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "docs",
                vec![
                    record("aligned", vec![1.0, 0.0]),
                    record("orthogonal", vec![0.0, 1.0]),
                    record("close", vec![0.9, 0.1]),
                ],
            )
            .await
            .unwrap();

        let matches = store.query("docs", vec![1.0, 0.0], 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "aligned");
        assert_eq!(matches[1].id, "close");
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", vec![record("1", vec![1.0])])
            .await
            .unwrap();
        store
            .upsert("b", vec![record("2", vec![1.0])])
            .await
            .unwrap();

        assert_eq!(store.list_collections().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.delete("a", vec!["1".into(), "x".into()]).await.unwrap(), 1);
        let matches = store.query("a", vec![1.0], 10).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_query_missing_collection_is_empty() {
        let store = InMemoryVectorStore::new();
        assert!(store.query("nope", vec![1.0], 5).await.unwrap().is_empty());
    }
}
