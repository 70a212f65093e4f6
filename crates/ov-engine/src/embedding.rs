//! The embedding worker: vectorises semantic artefacts.
//!
//! Jobs have no ordering dependency; the worker coalesces up to
//! `embedding_batch_size` same-modality jobs into one provider call
//! and upserts each vector keyed by `(uri, source)`. Zero-length
//! vectors from the provider are rejected.

use crate::queue::JobQueue;
use ov_core::capability::Embedder;
use ov_core::config::OpenVikingConfig;
use ov_core::error::{OvError, Result};
use ov_core::retry::{with_backoff, with_timeout};
use ov_core::types::{EmbedSource, EmbeddingJob, JobStatus, MemoryCategory, Modality};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, ABSTRACT_FILE, OVERVIEW_FILE};
use ov_vectordb::VectorStore;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Raw leaf content is capped at this many characters before
/// embedding.
const RAW_EMBED_MAX_CHARS: usize = 8192;

/// Payload abstract snippets are capped at this many characters.
const PAYLOAD_TEXT_MAX_CHARS: usize = 600;

/// Memory category for a URI under `viking://user/memories`, derived
/// from its path segments.
pub fn category_for_uri(uri: &VikingUri) -> Option<MemoryCategory> {
    let memories = VikingUri::parse("viking://user/memories").ok()?;
    if !uri.is_under(&memories) {
        return None;
    }
    uri.segments().find_map(|s| s.parse::<MemoryCategory>().ok())
}

/// Vectorisation worker.
pub struct EmbeddingWorker {
    agfs: Arc<dyn Agfs>,
    queue: Arc<JobQueue<EmbeddingJob>>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: Arc<OpenVikingConfig>,
    cancel: CancellationToken,
}

impl EmbeddingWorker {
    pub fn new(
        agfs: Arc<dyn Agfs>,
        queue: Arc<JobQueue<EmbeddingJob>>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: Arc<OpenVikingConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self { agfs, queue, vectors, embedder, config, cancel }
    }

    /// One pass: claim a batch of same-modality jobs, embed, upsert.
    /// Returns whether any work happened.
    pub async fn tick(&self) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(OvError::Cancelled);
        }
        self.queue.recover_expired().await?;

        let pending: Vec<EmbeddingJob> = self
            .queue
            .list()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        let Some(first) = pending.first() else {
            return Ok(false);
        };
        let modality = first.modality;
        let batch_size = self.config.queue.embedding_batch_size.max(1);

        let mut claimed = Vec::new();
        for job in pending.iter().filter(|j| j.modality == modality).take(batch_size) {
            if let Some(job) = self.queue.claim(&job.id).await? {
                claimed.push(job);
            }
        }
        if claimed.is_empty() {
            return Ok(false);
        }
        self.process_batch(claimed, modality).await?;
        Ok(true)
    }

    /// Drive ticks until nothing is pending. Test and drain helper.
    pub async fn run_until_idle(&self) -> Result<()> {
        while self.tick().await? {}
        Ok(())
    }

    /// Background loop until cancellation.
    pub async fn run(&self) {
        loop {
            match self.tick().await {
                Err(OvError::Cancelled) => break,
                Err(e) => tracing::warn!(error = %e, "embedding tick failed"),
                Ok(true) => continue,
                Ok(false) => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            }
        }
    }

    async fn process_batch(&self, claimed: Vec<EmbeddingJob>, modality: Modality) -> Result<()> {
        // Resolve each job's text; unresolvable jobs fail individually
        // without sinking the batch.
        let mut ready: Vec<(EmbeddingJob, String)> = Vec::new();
        for job in claimed {
            match self.resolve_text(&job).await {
                Ok(text) => ready.push((job, text)),
                Err(e) => {
                    self.queue.fail(job, e.to_string()).await?;
                }
            }
        }
        if ready.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = ready.iter().map(|(_, t)| t.clone()).collect();
        let timeout = self.config.timeouts.embedder();
        let embedded = with_backoff(|| {
            let texts = texts.clone();
            with_timeout(timeout, "embed", async move {
                self.embedder.embed(&texts, modality).await
            })
        })
        .await;

        let vectors = match embedded {
            Ok(vectors) => vectors,
            Err(e) => {
                // Retries exhausted: record the error on every job.
                for (job, _) in ready {
                    self.queue.fail(job, e.to_string()).await?;
                }
                return Ok(());
            }
        };
        if vectors.len() != ready.len() {
            let msg = format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                ready.len()
            );
            for (job, _) in ready {
                self.queue.fail(job, msg.clone()).await?;
            }
            return Ok(());
        }

        for ((job, text), vector) in ready.into_iter().zip(vectors) {
            if vector.is_empty() {
                self.queue.fail(job, "embedder returned zero-length vector").await?;
                continue;
            }
            let uri = VikingUri::parse(&job.uri)?;
            let payload = self.payload_for(&uri, &job, &text);
            match self.vectors.upsert(&uri, job.source, &vector, payload).await {
                Ok(()) => self.queue.complete(job).await?,
                Err(e) => self.queue.fail(job, e.to_string()).await?,
            }
        }
        Ok(())
    }

    /// The text an embedding job vectorises, read fresh from AGFS.
    async fn resolve_text(&self, job: &EmbeddingJob) -> Result<String> {
        let uri = VikingUri::parse(&job.uri)?;
        match job.source {
            EmbedSource::Abstract => self.agfs.read_string(&uri.join(ABSTRACT_FILE)?).await,
            EmbedSource::Overview => self.agfs.read_string(&uri.join(OVERVIEW_FILE)?).await,
            EmbedSource::Raw => {
                let bytes = self.agfs.read(&uri).await?;
                match String::from_utf8(bytes) {
                    Ok(text) => Ok(text.chars().take(RAW_EMBED_MAX_CHARS).collect()),
                    // Binary leaf: embed its cached description instead.
                    Err(_) => {
                        let name = uri
                            .name()
                            .ok_or_else(|| OvError::invalid("raw job on root"))?;
                        let parent = uri
                            .parent()
                            .ok_or_else(|| OvError::invalid("raw job on root"))?;
                        self.agfs
                            .read_string(&parent.join(&format!(".{name}.abstract.md"))?)
                            .await
                            .map_err(|_| {
                                OvError::UnsupportedFormat(format!(
                                    "binary leaf {uri} has no cached description"
                                ))
                            })
                    }
                }
            }
        }
    }

    fn payload_for(&self, uri: &VikingUri, job: &EmbeddingJob, text: &str) -> serde_json::Value {
        let snippet: String = text.chars().take(PAYLOAD_TEXT_MAX_CHARS).collect();
        json!({
            "uri": uri.as_str(),
            "source": job.source.as_str(),
            "modality": job.modality.as_str(),
            "text": snippet,
            "category": category_for_uri(uri).map(|c| c.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_for_uri() {
        let uri = VikingUri::parse("viking://user/memories/session-1/facts/f.md").unwrap();
        assert_eq!(category_for_uri(&uri), Some(MemoryCategory::Facts));

        let dir = VikingUri::parse("viking://user/memories/session-1/preferences").unwrap();
        assert_eq!(category_for_uri(&dir), Some(MemoryCategory::Preferences));

        let none = VikingUri::parse("viking://user/memories/session-1").unwrap();
        assert_eq!(category_for_uri(&none), None);

        let resource = VikingUri::parse("viking://resources/facts/x.md").unwrap();
        assert_eq!(category_for_uri(&resource), None);
    }
}
