//! Hierarchical retrieval: vector search as a routing signal over the
//! semantic tree.
//!
//! Abstracts index directories, so one global shortlist usually routes
//! a query without opening leaves; large roots whose own abstract
//! surfaces in the shortlist get a second, scoped search. Memory hits
//! asserting the same canonical fact collapse onto the best scorer.

use crate::embedding::category_for_uri;
use ov_core::capability::Embedder;
use ov_core::config::OpenVikingConfig;
use ov_core::error::{OvError, Result};
use ov_core::retry::with_timeout;
use ov_core::trace::RequestTrace;
use ov_core::types::{MemoryCategory, Modality};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, LsOptions};
use ov_vectordb::{ScoredPoint, SearchOptions, VectorStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

/// Options for [`HierarchicalRetriever::find`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Restrict the search to this directory.
    pub target_uri: Option<VikingUri>,
    pub limit: usize,
    /// Overrides the configured default threshold.
    pub score_threshold: Option<f32>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self { target_uri: None, limit: 10, score_threshold: None }
    }
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct FindHit {
    pub uri: VikingUri,
    pub score: f32,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<MemoryCategory>,
}

/// Canonical dedup key text: NFKC, lower-case, whitespace runs
/// collapsed, trimmed.
pub fn normalise_abstract(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();
    nfkc.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Query router over the semantic tree.
pub struct HierarchicalRetriever {
    agfs: Arc<dyn Agfs>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: Arc<OpenVikingConfig>,
}

impl HierarchicalRetriever {
    pub fn new(
        agfs: Arc<dyn Agfs>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: Arc<OpenVikingConfig>,
    ) -> Self {
        Self { agfs, vectors, embedder, config }
    }

    /// Answer a natural-language query with a ranked, deduplicated
    /// list of URIs. Dependency failures propagate immediately; a
    /// stale index would mislead.
    pub async fn find(
        &self,
        query: &str,
        opts: &FindOptions,
        trace: Option<&RequestTrace>,
    ) -> Result<Vec<FindHit>> {
        if query.trim().is_empty() {
            return Err(OvError::invalid("query must not be empty"));
        }
        if opts.limit == 0 {
            return Ok(Vec::new());
        }

        // Embed the query once.
        let embed_timeout = self.config.timeouts.embedder();
        let queries = vec![query.to_string()];
        let mut embedded = with_timeout(embed_timeout, "embed query", async {
            self.embedder.embed(&queries, Modality::Text).await
        })
        .await?;
        let q = embedded
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OvError::dependency("embedder returned no query vector"))?;
        if let Some(trace) = trace {
            trace.event("search", "embed_query", "ok", json!({ "query_chars": query.len() }));
        }

        // A target that is not a directory falls back to the whole
        // namespace.
        let scope_prefix = match &opts.target_uri {
            Some(target) if self.agfs.stat(target).await?.is_dir => target.clone(),
            _ => VikingUri::root(),
        };

        // Global shortlist.
        let shortlist_limit = (opts.limit * 4).max(40);
        let shortlist = self
            .search_scoped(&q, &scope_prefix, shortlist_limit, trace)
            .await?;

        // Route: recurse into large roots whose own abstract made the
        // shortlist.
        let mut merged: HashMap<String, ScoredPoint> = HashMap::new();
        for point in &shortlist {
            self.merge_point(&mut merged, point.clone());
        }
        for root in self.routable_roots(&shortlist).await? {
            if let Some(trace) = trace {
                trace.event("search", "route", "ok", json!({ "root": root.as_str() }));
            }
            let scoped = self.search_scoped(&q, &root, shortlist_limit, trace).await?;
            for point in scoped {
                self.merge_point(&mut merged, point);
            }
        }

        // Filter, rank, dedup, truncate.
        let threshold = opts
            .score_threshold
            .unwrap_or(self.config.retrieval.score_threshold);
        let mut candidates: Vec<ScoredPoint> = merged
            .into_values()
            .filter(|p| p.score >= threshold)
            .collect();
        if let Some(trace) = trace {
            trace.incr("vector.candidates_after_threshold", candidates.len() as i64);
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uri.cmp(&b.uri))
        });

        let mut seen_keys: HashMap<String, ()> = HashMap::new();
        let mut hits = Vec::new();
        for point in candidates {
            let abstract_text = point.payload["text"].as_str().unwrap_or_default().to_string();
            let category = category_for_uri(&point.uri);
            let key = match category {
                Some(cat) if !cat.dedup_by_uri() => {
                    format!("{}:{}", cat.as_str(), normalise_abstract(&abstract_text))
                }
                _ => format!("uri:{}", point.uri),
            };
            if seen_keys.insert(key, ()).is_some() {
                continue;
            }
            hits.push(FindHit { uri: point.uri, score: point.score, abstract_text, category });
            if hits.len() >= opts.limit {
                break;
            }
        }
        if let Some(trace) = trace {
            trace.incr("vector.returned", hits.len() as i64);
        }
        Ok(hits)
    }

    /// One vector search restricted to a prefix, collapsed to distinct
    /// URIs (best source wins).
    async fn search_scoped(
        &self,
        q: &[f32],
        prefix: &VikingUri,
        limit: usize,
        trace: Option<&RequestTrace>,
    ) -> Result<Vec<ScoredPoint>> {
        let search_timeout = self.config.timeouts.vector_search();
        let opts = SearchOptions {
            target_uri_prefix: Some(prefix.clone()),
            limit,
            score_threshold: Some(0.0),
        };
        let points = with_timeout(search_timeout, "vector search", async {
            self.vectors.search(q, &opts).await
        })
        .await?;
        if let Some(trace) = trace {
            trace.incr("vector.search_calls", 1);
            trace.incr("vector.candidates_scored", points.len() as i64);
            trace.incr("vector.vectors_scanned", self.vectors.len() as i64);
        }
        // Distinct URIs only.
        let mut best: HashMap<String, ScoredPoint> = HashMap::new();
        for point in points {
            self.merge_point(&mut best, point);
        }
        let mut out: Vec<ScoredPoint> = best.into_values().collect();
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uri.cmp(&b.uri))
        });
        Ok(out)
    }

    fn merge_point(&self, map: &mut HashMap<String, ScoredPoint>, point: ScoredPoint) {
        match map.get(point.uri.as_str()) {
            Some(existing) if existing.score >= point.score => {}
            _ => {
                map.insert(point.uri.as_str().to_string(), point);
            }
        }
    }

    /// Shortlisted scope-level roots that are both populous (more
    /// children than `route_fanout`) and self-describing (their own
    /// abstract is in the shortlist).
    async fn routable_roots(&self, shortlist: &[ScoredPoint]) -> Result<Vec<VikingUri>> {
        let mut roots: Vec<VikingUri> = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::new();
        let shortlisted_dirs: HashMap<&str, ()> = shortlist
            .iter()
            .filter(|p| p.payload["source"] == "abstract")
            .map(|p| (p.uri.as_str(), ()))
            .collect();

        for point in shortlist {
            let Some(root) = scope_level_root(&point.uri) else { continue };
            if seen.insert(root.as_str().to_string(), ()).is_some() {
                continue;
            }
            if !shortlisted_dirs.contains_key(root.as_str()) {
                continue;
            }
            let child_count = match self.agfs.ls(&root, LsOptions::default()).await {
                Ok(children) => children.len(),
                Err(_) => continue,
            };
            if child_count > self.config.retrieval.route_fanout {
                roots.push(root);
            }
        }
        Ok(roots)
    }
}

/// The scope-level root a URI groups under for routing:
/// `viking://resources/<x>`, `viking://user/memories/<x>`, or
/// `viking://agent/skills/<x>`.
fn scope_level_root(uri: &VikingUri) -> Option<VikingUri> {
    let segments: Vec<&str> = uri.segments().collect();
    let depth = match segments.first()? {
        &"resources" => 2,
        &"user" | &"agent" => 3,
        _ => return None,
    };
    if segments.len() < depth {
        return None;
    }
    let mut root = VikingUri::root();
    for seg in &segments[..depth] {
        root = root.join(seg).ok()?;
    }
    Some(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_abstract() {
        assert_eq!(normalise_abstract("  User   prefers\tVIM. "), "user prefers vim.");
        // NFKC folds the fullwidth form.
        assert_eq!(normalise_abstract("Ｕser prefers vim."), "user prefers vim.");
        assert_eq!(normalise_abstract(""), "");
    }

    #[test]
    fn test_scope_level_root() {
        let u = VikingUri::parse("viking://resources/doc/ch1/s2.md").unwrap();
        assert_eq!(scope_level_root(&u).unwrap().as_str(), "viking://resources/doc");

        let m = VikingUri::parse("viking://user/memories/session-1/facts/f.md").unwrap();
        assert_eq!(
            scope_level_root(&m).unwrap().as_str(),
            "viking://user/memories/session-1"
        );

        let s = VikingUri::parse("viking://agent/skills/search").unwrap();
        assert_eq!(scope_level_root(&s).unwrap().as_str(), "viking://agent/skills/search");

        let shallow = VikingUri::parse("viking://resources").unwrap();
        assert!(scope_level_root(&shallow).is_none());

        let system = VikingUri::parse("viking://.system/queues/semantic").unwrap();
        assert!(scope_level_root(&system).is_none());
    }
}
