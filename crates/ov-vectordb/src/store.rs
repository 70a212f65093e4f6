//! URI-keyed vector store.
//!
//! Sits on top of a [`VectorIndex`], owning the `(uri, source) ↔ label`
//! registry and per-point payloads. Upserts are idempotent on
//! `(uri, source)` and retried on transient failure; searches are never
//! retried.

use crate::index::VectorIndex;
use crate::distance;
use ov_core::error::{OvError, Result};
use ov_core::retry;
use ov_core::types::EmbedSource;
use ov_core::uri::VikingUri;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPoint {
    pub uri: VikingUri,
    pub source: EmbedSource,
    /// Clamped into [0, 1].
    pub score: f32,
    pub payload: Value,
}

/// Options for [`VectorStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Restrict hits to URIs at or under this prefix.
    pub target_uri_prefix: Option<VikingUri>,
    pub limit: usize,
    /// Drop hits scoring below this (after clamping).
    pub score_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointMeta {
    uri: VikingUri,
    source: EmbedSource,
    payload: Value,
}

#[derive(Default)]
struct Registry {
    label_of: HashMap<(String, EmbedSource), u64>,
    points: HashMap<u64, PointMeta>,
    next_label: u64,
}

/// Registry snapshot persisted alongside the vectors.
#[derive(Serialize, Deserialize)]
struct RegistryFile {
    next_label: u64,
    points: Vec<(u64, PointMeta)>,
}

/// The vector database adapter.
pub struct VectorStore {
    index: Box<dyn VectorIndex>,
    registry: RwLock<Registry>,
    persist_dir: Option<PathBuf>,
}

impl VectorStore {
    pub fn new(index: Box<dyn VectorIndex>) -> Self {
        Self {
            index,
            registry: RwLock::new(Registry::default()),
            persist_dir: None,
        }
    }

    /// Store persisting to `dir` on [`VectorStore::save`]; existing
    /// state is loaded immediately.
    pub async fn with_persistence(index: Box<dyn VectorIndex>, dir: PathBuf) -> Result<Self> {
        let mut store = Self::new(index);
        store.persist_dir = Some(dir);
        store.load().await?;
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Total vectors stored.
    pub fn len(&self) -> usize {
        self.registry.read().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_upsert(
        &self,
        uri: &VikingUri,
        source: EmbedSource,
        vector: &[f32],
        payload: Value,
    ) -> Result<()> {
        if vector.is_empty() {
            return Err(OvError::invalid(format!("zero-length vector for {uri}")));
        }
        let mut registry = self.registry.write();
        let key = (uri.as_str().to_string(), source);
        let label = match registry.label_of.get(&key) {
            Some(&l) => l,
            None => {
                let l = registry.next_label;
                registry.next_label += 1;
                l
            }
        };
        self.index.insert(label, vector)?;
        registry.label_of.insert(key, label);
        registry.points.insert(
            label,
            PointMeta { uri: uri.clone(), source, payload },
        );
        Ok(())
    }

    /// Insert or replace the vector for `(uri, source)`. Transient
    /// backend failures back off and retry per the standard schedule.
    pub async fn upsert(
        &self,
        uri: &VikingUri,
        source: EmbedSource,
        vector: &[f32],
        payload: Value,
    ) -> Result<()> {
        retry::with_backoff(|| {
            let payload = payload.clone();
            async move { self.try_upsert(uri, source, vector, payload) }
        })
        .await
    }

    /// Ranked nearest neighbours. Scores are clamped into [0, 1];
    /// equal scores order by URI, then source. Duplicate `(uri, source)`
    /// hits keep the best score. Never retried.
    pub async fn search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<ScoredPoint>> {
        if opts.limit == 0 {
            return Ok(Vec::new());
        }
        let filtered = opts.target_uri_prefix.is_some();
        let fetch = if filtered {
            (opts.limit * 8).max(64)
        } else {
            (opts.limit * 2).max(16)
        }
        .min(self.index.len().max(1));

        let raw = self.index.search(query, fetch)?;
        let registry = self.registry.read();

        let mut best: HashMap<(String, EmbedSource), ScoredPoint> = HashMap::new();
        for (label, raw_score) in raw {
            let Some(meta) = registry.points.get(&label) else { continue };
            if let Some(prefix) = &opts.target_uri_prefix {
                if !meta.uri.is_under(prefix) {
                    continue;
                }
            }
            let score = distance::clamp_score(raw_score);
            if let Some(threshold) = opts.score_threshold {
                if score < threshold {
                    continue;
                }
            }
            let key = (meta.uri.as_str().to_string(), meta.source);
            let candidate = ScoredPoint {
                uri: meta.uri.clone(),
                source: meta.source,
                score,
                payload: meta.payload.clone(),
            };
            match best.get(&key) {
                Some(existing) if existing.score >= score => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        }

        let mut hits: Vec<ScoredPoint> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uri.cmp(&b.uri))
                .then_with(|| a.source.cmp(&b.source))
        });
        hits.truncate(opts.limit);
        Ok(hits)
    }

    /// Remove every point at or under `prefix`; returns how many went.
    pub async fn delete_prefix(&self, prefix: &VikingUri) -> Result<usize> {
        let mut registry = self.registry.write();
        let doomed: Vec<u64> = registry
            .points
            .iter()
            .filter(|(_, meta)| meta.uri.is_under(prefix))
            .map(|(&label, _)| label)
            .collect();
        for label in &doomed {
            self.index.remove(*label)?;
            if let Some(meta) = registry.points.remove(label) {
                registry
                    .label_of
                    .remove(&(meta.uri.as_str().to_string(), meta.source));
            }
        }
        tracing::debug!(prefix = %prefix, removed = doomed.len(), "vectors deleted");
        Ok(doomed.len())
    }

    /// Points at or under `prefix`.
    pub async fn count(&self, prefix: &VikingUri) -> Result<usize> {
        let registry = self.registry.read();
        Ok(registry
            .points
            .values()
            .filter(|meta| meta.uri.is_under(prefix))
            .count())
    }

    /// Persist vectors and registry under the configured directory.
    pub async fn save(&self) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| OvError::dependency(format!("create {}: {e}", dir.display())))?;

        let registry_file = {
            let registry = self.registry.read();
            RegistryFile {
                next_label: registry.next_label,
                points: registry.points.iter().map(|(&l, m)| (l, m.clone())).collect(),
            }
        };
        let registry_json = serde_json::to_vec(&registry_file)?;
        tokio::fs::write(dir.join("registry.json"), registry_json)
            .await
            .map_err(|e| OvError::dependency(format!("write registry: {e}")))?;

        // Vector framing: dim u32 | count u64 | repeated label u64 + f32s.
        let vectors = self.index.export();
        let dim = self.index.dimension();
        let mut buf = Vec::with_capacity(12 + vectors.len() * (8 + dim * 4));
        buf.extend_from_slice(&(dim as u32).to_le_bytes());
        buf.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
        for (label, v) in &vectors {
            buf.extend_from_slice(&label.to_le_bytes());
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        tokio::fs::write(dir.join("vectors.bin"), buf)
            .await
            .map_err(|e| OvError::dependency(format!("write vectors: {e}")))
    }

    async fn load(&mut self) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let registry_path = dir.join("registry.json");
        if !registry_path.exists() {
            return Ok(());
        }
        let registry_json = tokio::fs::read(&registry_path)
            .await
            .map_err(|e| OvError::dependency(format!("read registry: {e}")))?;
        let file: RegistryFile = serde_json::from_slice(&registry_json)?;

        let data = tokio::fs::read(dir.join("vectors.bin"))
            .await
            .map_err(|e| OvError::dependency(format!("read vectors: {e}")))?;
        if data.len() < 12 {
            return Err(OvError::InvariantViolation("truncated vector file".into()));
        }
        let dim = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        if dim != self.index.dimension() {
            return Err(OvError::invalid(format!(
                "persisted dimension {dim} does not match index dimension {}",
                self.index.dimension()
            )));
        }
        let count = u64::from_le_bytes(data[4..12].try_into().unwrap()) as usize;
        let record = 8 + dim * 4;
        if data.len() < 12 + count * record {
            return Err(OvError::InvariantViolation("truncated vector file".into()));
        }
        for i in 0..count {
            let off = 12 + i * record;
            let label = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
            let mut v = Vec::with_capacity(dim);
            for j in 0..dim {
                let p = off + 8 + j * 4;
                v.push(f32::from_le_bytes(data[p..p + 4].try_into().unwrap()));
            }
            self.index.insert(label, &v)?;
        }

        let mut registry = self.registry.write();
        registry.next_label = file.next_label;
        for (label, meta) in file.points {
            registry
                .label_of
                .insert((meta.uri.as_str().to_string(), meta.source), label);
            registry.points.insert(label, meta);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;
    use serde_json::json;

    fn store(dim: usize) -> VectorStore {
        VectorStore::new(Box::new(FlatIndex::new(dim)))
    }

    fn uri(s: &str) -> VikingUri {
        VikingUri::parse(s).unwrap()
    }

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let store = store(4);
        store
            .upsert(&uri("viking://resources/a"), EmbedSource::Abstract, &axis(4, 0), json!({"t": "a"}))
            .await
            .unwrap();
        store
            .upsert(&uri("viking://resources/b"), EmbedSource::Abstract, &axis(4, 1), json!({"t": "b"}))
            .await
            .unwrap();
        let hits = store
            .search(&axis(4, 0), &SearchOptions { limit: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri.as_str(), "viking://resources/a");
        assert_eq!(hits[0].payload["t"], "a");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_upsert_idempotent_on_key() {
        let store = store(2);
        let u = uri("viking://resources/a");
        store.upsert(&u, EmbedSource::Abstract, &[1.0, 0.0], json!({"v": 1})).await.unwrap();
        store.upsert(&u, EmbedSource::Abstract, &[0.0, 1.0], json!({"v": 2})).await.unwrap();
        assert_eq!(store.len(), 1);
        let hits = store
            .search(&[0.0, 1.0], &SearchOptions { limit: 5, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits[0].payload["v"], 2);
    }

    #[tokio::test]
    async fn test_distinct_sources_coexist() {
        let store = store(2);
        let u = uri("viking://resources/a");
        store.upsert(&u, EmbedSource::Abstract, &[1.0, 0.0], Value::Null).await.unwrap();
        store.upsert(&u, EmbedSource::Overview, &[1.0, 0.0], Value::Null).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_length_vector_rejected() {
        let store = store(2);
        let err = store
            .upsert(&uri("viking://resources/a"), EmbedSource::Raw, &[], Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_prefix_filter() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/doc/a"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        store
            .upsert(&uri("viking://user/memories/m"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        let hits = store
            .search(
                &[1.0, 0.0],
                &SearchOptions {
                    target_uri_prefix: Some(uri("viking://resources")),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].uri.as_str().starts_with("viking://resources"));
    }

    #[tokio::test]
    async fn test_prefix_respects_path_boundary() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/doc2/x"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        let hits = store
            .search(
                &[1.0, 0.0],
                &SearchOptions {
                    target_uri_prefix: Some(uri("viking://resources/doc")),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_filters() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/near"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        store
            .upsert(&uri("viking://resources/far"), EmbedSource::Abstract, &[0.0, 1.0], Value::Null)
            .await
            .unwrap();
        let hits = store
            .search(
                &[1.0, 0.1],
                &SearchOptions { limit: 10, score_threshold: Some(0.5), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri.as_str(), "viking://resources/near");
    }

    #[tokio::test]
    async fn test_scores_clamped() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/opp"), EmbedSource::Abstract, &[-1.0, 0.0], Value::Null)
            .await
            .unwrap();
        let hits = store
            .search(
                &[1.0, 0.0],
                &SearchOptions { limit: 10, score_threshold: Some(0.0), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_ties_break_by_uri() {
        let store = store(2);
        for name in ["c", "a", "b"] {
            store
                .upsert(
                    &uri(&format!("viking://resources/{name}")),
                    EmbedSource::Abstract,
                    &[1.0, 0.0],
                    Value::Null,
                )
                .await
                .unwrap();
        }
        let hits = store
            .search(&[1.0, 0.0], &SearchOptions { limit: 3, ..Default::default() })
            .await
            .unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.uri.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_delete_prefix_cascades() {
        let store = store(2);
        for (path, v) in [("viking://resources/doc/a", [1.0, 0.0]), ("viking://resources/doc/b", [0.0, 1.0]), ("viking://resources/other", [1.0, 0.0])] {
            store.upsert(&uri(path), EmbedSource::Abstract, &v, Value::Null).await.unwrap();
        }
        let removed = store.delete_prefix(&uri("viking://resources/doc")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count(&uri("viking://resources")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_prefix() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/d/x"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        store
            .upsert(&uri("viking://resources/d/x"), EmbedSource::Overview, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        store
            .upsert(&uri("viking://user/memories/m"), EmbedSource::Raw, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        assert_eq!(store.count(&uri("viking://resources/d")).await.unwrap(), 2);
        assert_eq!(store.count(&VikingUri::root()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limit_zero() {
        let store = store(2);
        store
            .upsert(&uri("viking://resources/a"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
            .await
            .unwrap();
        let hits = store
            .search(&[1.0, 0.0], &SearchOptions { limit: 0, ..Default::default() })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("vectors");
        {
            let store = VectorStore::with_persistence(Box::new(FlatIndex::new(2)), dir.clone())
                .await
                .unwrap();
            store
                .upsert(&uri("viking://resources/a"), EmbedSource::Abstract, &[1.0, 0.0], json!({"t": "a"}))
                .await
                .unwrap();
            store
                .upsert(&uri("viking://resources/b"), EmbedSource::Raw, &[0.0, 1.0], Value::Null)
                .await
                .unwrap();
            store.save().await.unwrap();
        }
        let store = VectorStore::with_persistence(Box::new(FlatIndex::new(2)), dir)
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
        let hits = store
            .search(&[1.0, 0.0], &SearchOptions { limit: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits[0].uri.as_str(), "viking://resources/a");
        assert_eq!(hits[0].payload["t"], "a");
    }

    #[tokio::test]
    async fn test_persistence_dimension_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("vectors");
        {
            let store = VectorStore::with_persistence(Box::new(FlatIndex::new(2)), dir.clone())
                .await
                .unwrap();
            store
                .upsert(&uri("viking://resources/a"), EmbedSource::Abstract, &[1.0, 0.0], Value::Null)
                .await
                .unwrap();
            store.save().await.unwrap();
        }
        let err = VectorStore::with_persistence(Box::new(FlatIndex::new(3)), dir).await;
        assert!(err.is_err());
    }
}
