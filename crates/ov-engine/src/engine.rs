//! The engine handle: every public operation of the context engine
//! hangs off [`ContextEngine`], which owns the two stores, the queues,
//! the workers, and the session machinery. No hidden globals; callers
//! thread the handle explicitly.

use crate::builder::{PromoteOutcome, TreeBuilder};
use crate::embedding::EmbeddingWorker;
use crate::queue::{JobQueue, QueueCounts};
use crate::retriever::{FindHit, FindOptions, HierarchicalRetriever};
use crate::semantic::SemanticWorker;
use globset::GlobBuilder;
use ov_core::capability::{Embedder, Summarizer};
use ov_core::config::OpenVikingConfig;
use ov_core::error::{OvError, Result};
use ov_core::trace::RequestTrace;
use ov_core::types::{EmbeddingJob, SemanticJob};
use ov_core::uri::{new_scratch_root, IngestScope, VikingUri};
use ov_parser::{ParseContext, ParserRegistry};
use ov_session::{CommitResult, CommitState, MemoryExtractor, Role, SessionStore};
use ov_storage::{Agfs, Entry, LeaseRegistry, LocalAgfs, LsOptions, StatInfo, TreeNode, TreeOptions, WriteOptions};
use ov_vectordb::{open_store, VectorStore};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Upper bound on matches a single `grep` returns.
const GREP_MATCH_CAP: usize = 1000;

/// Options for [`ContextEngine::add_resource`].
#[derive(Debug, Clone, Default)]
pub struct AddResourceOptions {
    /// Free-form note recorded in the trace.
    pub reason: Option<String>,
    /// Block until the whole pipeline drains.
    pub wait: bool,
    /// Collect and return a request trace.
    pub trace: bool,
}

/// What [`ContextEngine::add_resource`] returns.
#[derive(Debug, Clone)]
pub struct AddResourceOutcome {
    pub target_uri: VikingUri,
    pub job_id: String,
    pub trace: Option<Value>,
}

/// One `grep` hit.
#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    pub uri: VikingUri,
    pub line_number: usize,
    pub line: String,
}

/// Queue totals after [`ContextEngine::wait`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DrainReport {
    pub pending: usize,
    pub in_progress: usize,
    pub processed: usize,
    pub errors: usize,
}

/// Component probes from [`ContextEngine::ready`].
#[derive(Debug, Clone, Serialize)]
pub struct ReadyReport {
    pub status: String,
    pub checks: BTreeMap<String, String>,
}

/// The engine.
pub struct ContextEngine {
    config: Arc<OpenVikingConfig>,
    agfs: Arc<dyn Agfs>,
    vectors: Arc<VectorStore>,
    registry: ParserRegistry,
    semantic_queue: Arc<JobQueue<SemanticJob>>,
    embedding_queue: Arc<JobQueue<EmbeddingJob>>,
    semantic_worker: Arc<SemanticWorker>,
    embedding_worker: Arc<EmbeddingWorker>,
    builder: TreeBuilder,
    sessions: SessionStore,
    extractor: MemoryExtractor,
    retriever: HierarchicalRetriever,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    commit_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ContextEngine {
    /// Open an engine on the configured workspace root with local
    /// backends.
    pub async fn open(
        config: OpenVikingConfig,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        let root = config.storage.workspace_root.clone();
        let agfs: Arc<dyn Agfs> = Arc::new(LocalAgfs::open(root.join("agfs")).await?);
        let vectors = Arc::new(
            open_store(&config.vectordb.backend, embedder.dimension(), Some(root.join("vectors")))
                .await?,
        );
        Self::with_parts(config, agfs, vectors, summarizer, embedder).await
    }

    /// Assemble an engine from explicit parts (tests, alternate
    /// backends).
    pub async fn with_parts(
        config: OpenVikingConfig,
        agfs: Arc<dyn Agfs>,
        vectors: Arc<VectorStore>,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let lease_secs = config.queue.lease_timeout_secs;
        let semantic_queue =
            Arc::new(JobQueue::<SemanticJob>::open(agfs.clone(), "semantic", lease_secs).await?);
        let embedding_queue =
            Arc::new(JobQueue::<EmbeddingJob>::open(agfs.clone(), "embedding", lease_secs).await?);

        let semantic_worker = Arc::new(SemanticWorker::new(
            agfs.clone(),
            semantic_queue.clone(),
            embedding_queue.clone(),
            summarizer.clone(),
            config.clone(),
            cancel.child_token(),
        ));
        let embedding_worker = Arc::new(EmbeddingWorker::new(
            agfs.clone(),
            embedding_queue.clone(),
            vectors.clone(),
            embedder.clone(),
            config.clone(),
            cancel.child_token(),
        ));
        let leases = LeaseRegistry::new();
        let builder = TreeBuilder::new(agfs.clone(), semantic_queue.clone(), leases.clone());
        let sessions = SessionStore::new(agfs.clone());
        let extractor = MemoryExtractor::new(summarizer.clone());
        let retriever = HierarchicalRetriever::new(
            agfs.clone(),
            vectors.clone(),
            embedder.clone(),
            config.clone(),
        );

        let engine = Arc::new(Self {
            config,
            agfs,
            vectors,
            registry: ParserRegistry::with_defaults(),
            semantic_queue,
            embedding_queue,
            semantic_worker,
            embedding_worker,
            builder,
            sessions,
            extractor,
            retriever,
            summarizer,
            embedder,
            commit_locks: Mutex::new(HashMap::new()),
            cancel,
            workers: Mutex::new(Vec::new()),
        });
        crate::namespace::seed_namespace(&engine.agfs).await?;
        engine.recover().await?;
        Ok(engine)
    }

    /// Spawn the background worker loops.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        let semantic = self.semantic_worker.clone();
        workers.push(tokio::spawn(async move { semantic.run().await }));
        let embedding = self.embedding_worker.clone();
        workers.push(tokio::spawn(async move { embedding.run().await }));
    }

    /// Cancel outstanding work and stop the workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        if let Err(e) = self.vectors.save().await {
            tracing::warn!(error = %e, "vector store save on shutdown failed");
        }
    }

    /// Startup recovery: revert expired leases, resume half-finished
    /// commits, sweep expired scratch trees.
    pub async fn recover(&self) -> Result<()> {
        self.semantic_queue.recover_expired().await?;
        self.embedding_queue.recover_expired().await?;

        for id in self.sessions.committing_sessions().await? {
            tracing::info!(session_id = %id, "resuming interrupted commit");
            if let Err(e) = self.session_commit(&id, false).await {
                tracing::warn!(session_id = %id, error = %e, "commit resume failed");
            }
        }

        self.sweep_scratch().await
    }

    /// Delete scratch roots older than the configured grace period.
    async fn sweep_scratch(&self) -> Result<()> {
        let temp_root = VikingUri::parse("viking://temp")?;
        if !self.agfs.exists(&temp_root).await? {
            return Ok(());
        }
        let grace = chrono::Duration::seconds(self.config.queue.scratch_gc_grace_secs as i64);
        let cutoff = chrono::Utc::now() - grace;
        for entry in self.agfs.ls(&temp_root, LsOptions::default()).await? {
            if entry.mtime.map(|t| t < cutoff).unwrap_or(false) {
                tracing::info!(uri = %entry.uri, "collecting expired scratch tree");
                let _ = self.agfs.delete(&entry.uri, true).await;
            }
        }
        Ok(())
    }

    fn parse_uri(uri: &str) -> Result<VikingUri> {
        VikingUri::parse(uri)
    }

    // ================= Filesystem =================

    pub async fn ls(&self, uri: &str, opts: LsOptions) -> Result<Vec<Entry>> {
        self.agfs.ls(&Self::parse_uri(uri)?, opts).await
    }

    pub async fn tree(&self, uri: &str, opts: TreeOptions) -> Result<TreeNode> {
        self.agfs.tree(&Self::parse_uri(uri)?, opts).await
    }

    pub async fn stat(&self, uri: &str) -> Result<StatInfo> {
        self.agfs.stat(&Self::parse_uri(uri)?).await
    }

    pub async fn read(&self, uri: &str, offset: Option<usize>, limit: Option<usize>) -> Result<Vec<u8>> {
        let bytes = self.agfs.read(&Self::parse_uri(uri)?).await?;
        let start = offset.unwrap_or(0).min(bytes.len());
        let end = limit.map(|l| (start + l).min(bytes.len())).unwrap_or(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    pub async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let uri = Self::parse_uri(uri)?;
        if uri.scope_root().is_none() {
            return Err(OvError::invalid(format!("unsupported scope: {uri}")));
        }
        self.agfs.write(&uri, data, WriteOptions::default()).await
    }

    pub async fn delete(&self, uri: &str, recursive: bool) -> Result<()> {
        self.remove_subtree(&Self::parse_uri(uri)?, recursive).await
    }

    pub async fn abstract_of(&self, uri: &str) -> Result<String> {
        self.agfs.abstract_of(&Self::parse_uri(uri)?).await
    }

    pub async fn overview_of(&self, uri: &str) -> Result<String> {
        self.agfs.overview_of(&Self::parse_uri(uri)?).await
    }

    // ================= Ingest =================

    pub async fn add_resource(
        &self,
        path_or_url: &str,
        opts: AddResourceOptions,
    ) -> Result<AddResourceOutcome> {
        let trace = opts
            .trace
            .then(|| RequestTrace::new(self.config.trace.max_events));
        if let (Some(trace), Some(reason)) = (&trace, &opts.reason) {
            trace.event("ingest", "reason", "ok", json!({ "reason": reason }));
        }

        let parse_ctx = ParseContext {
            agfs: self.agfs.clone(),
            config: self.config.parser.clone(),
        };
        let parsed = self.registry.parse_input(path_or_url, &parse_ctx).await?;
        if let Some(trace) = &trace {
            trace.event(
                "ingest",
                "parse",
                "ok",
                json!({
                    "parser": parsed.parser_name,
                    "format": parsed.source_format,
                    "duration_ms": parsed.parse_duration_ms,
                }),
            );
        }

        let PromoteOutcome { target_uri, job_id } = self
            .builder
            .promote(&parsed.temp_dir_uri, IngestScope::Resources)
            .await?;

        if opts.wait {
            self.semantic_worker.set_trace(trace.clone());
            let drained = self.wait(Duration::from_secs(600)).await;
            self.semantic_worker.set_trace(None);
            drained?;
        }

        let trace_doc = match trace {
            Some(trace) => {
                self.record_queue_gauges(&trace).await?;
                Some(trace.finish())
            }
            None => None,
        };
        Ok(AddResourceOutcome { target_uri, job_id, trace: trace_doc })
    }

    pub async fn add_skill(&self, name: &str, content: &str) -> Result<VikingUri> {
        if name.trim().is_empty() {
            return Err(OvError::invalid("skill name must not be empty"));
        }
        if content.is_empty() {
            return Err(OvError::invalid("skill content must not be empty"));
        }
        let scratch = new_scratch_root();
        let doc_root = scratch.join(&ov_session::slugify_text(name))?;
        self.agfs.mkdir(&doc_root).await?;
        self.agfs
            .write_string(&doc_root.join("skill.md")?, content, WriteOptions::default())
            .await?;
        let outcome = self.builder.promote(&scratch, IngestScope::Agent).await?;
        Ok(outcome.target_uri)
    }

    pub async fn remove(&self, uri: &str, recursive: bool) -> Result<()> {
        self.remove_subtree(&Self::parse_uri(uri)?, recursive).await
    }

    /// Delete from AGFS, then cascade: vectors and queued jobs under
    /// the prefix go too.
    async fn remove_subtree(&self, uri: &VikingUri, recursive: bool) -> Result<()> {
        self.agfs.delete(uri, recursive).await?;
        let removed = self.vectors.delete_prefix(uri).await?;
        let prefix = uri.clone();
        let purged_semantic = self
            .semantic_queue
            .purge(|j: &SemanticJob| {
                VikingUri::parse(&j.uri).map(|u| u.is_under(&prefix)).unwrap_or(false)
            })
            .await?;
        let purged_embedding = self
            .embedding_queue
            .purge(|j: &EmbeddingJob| {
                VikingUri::parse(&j.uri).map(|u| u.is_under(&prefix)).unwrap_or(false)
            })
            .await?;
        tracing::info!(
            uri = %uri,
            vectors = removed,
            semantic_jobs = purged_semantic,
            embedding_jobs = purged_embedding,
            "subtree removed"
        );
        Ok(())
    }

    // ================= Search =================

    pub async fn find(
        &self,
        query: &str,
        opts: &FindOptions,
        with_trace: bool,
    ) -> Result<(Vec<FindHit>, Option<Value>)> {
        let trace = with_trace.then(|| RequestTrace::new(self.config.trace.max_events));
        let hits = self.retriever.find(query, opts, trace.as_ref()).await?;
        Ok((hits, trace.map(|t| t.finish())))
    }

    /// Substring/regex scan over leaf contents. Not indexed; streams
    /// the subtree and caps the match count.
    pub async fn grep(&self, pattern: &str, target_uri: Option<&str>) -> Result<Vec<GrepMatch>> {
        let re = Regex::new(pattern)
            .map_err(|e| OvError::invalid(format!("bad pattern: {e}")))?;
        let root = match target_uri {
            Some(uri) => Self::parse_uri(uri)?,
            None => VikingUri::root(),
        };
        let entries = self
            .agfs
            .ls(&root, LsOptions { recursive: true, ..Default::default() })
            .await?;
        let mut matches = Vec::new();
        'outer: for entry in entries.iter().filter(|e| !e.is_dir) {
            let Ok(bytes) = self.agfs.read(&entry.uri).await else { continue };
            let Ok(text) = String::from_utf8(bytes) else { continue };
            for (idx, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(GrepMatch {
                        uri: entry.uri.clone(),
                        line_number: idx + 1,
                        line: line.to_string(),
                    });
                    if matches.len() >= GREP_MATCH_CAP {
                        break 'outer;
                    }
                }
            }
        }
        Ok(matches)
    }

    /// Path-pattern enumeration under a required target.
    pub async fn glob(&self, pattern: &str, target_uri: &str) -> Result<Vec<VikingUri>> {
        let root = Self::parse_uri(target_uri)?;
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| OvError::invalid(format!("bad glob: {e}")))?
            .compile_matcher();
        let entries = self
            .agfs
            .ls(&root, LsOptions { recursive: true, ..Default::default() })
            .await?;
        let mut out = Vec::new();
        for entry in entries {
            let rel = if root.is_root() {
                entry.uri.path().to_string()
            } else {
                entry.uri.as_str()[root.as_str().len()..]
                    .trim_start_matches('/')
                    .to_string()
            };
            if matcher.is_match(&rel) {
                out.push(entry.uri);
            }
        }
        out.sort();
        Ok(out)
    }

    // ================= Sessions =================

    pub async fn session_create(&self) -> Result<String> {
        self.sessions.create().await
    }

    pub async fn session_add_message(&self, id: &str, role: &str, content: &str) -> Result<()> {
        let role: Role = role.parse()?;
        self.sessions.append(id, role, content).await?;
        Ok(())
    }

    pub async fn session_messages(&self, id: &str) -> Result<Vec<ov_session::Message>> {
        self.sessions.list(id).await
    }

    pub async fn session_delete(&self, id: &str) -> Result<()> {
        self.sessions.delete(id).await
    }

    /// Commit a session: distil memories, promote them under
    /// `viking://user/memories/`, cache the result. Serialised per
    /// session; recommitting returns the cached result.
    pub async fn session_commit(&self, id: &str, with_trace: bool) -> Result<(CommitResult, Option<Value>)> {
        let lock = {
            let mut locks = self.commit_locks.lock().await;
            locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        let trace = with_trace.then(|| RequestTrace::new(self.config.trace.max_events));
        match self.sessions.begin_commit(id).await? {
            CommitState::AlreadyCommitted(result) => {
                let doc = trace.map(|t| t.finish());
                return Ok((result, doc));
            }
            CommitState::Started | CommitState::Resumed => {}
        }

        let messages = self.sessions.list(id).await?;
        let candidates = self.extractor.distil(&messages).await?;
        let extracted = candidates.len();
        if let Some(trace) = &trace {
            trace.gauge("memory.memories_extracted", extracted as i64);
            trace.event("commit", "distil", "ok", json!({ "candidates": extracted }));
        }

        let target_uri = match self
            .extractor
            .write_candidates(&self.agfs, id, &candidates)
            .await?
        {
            Some(scratch) => {
                let outcome = self.builder.promote(&scratch, IngestScope::User).await?;
                Some(outcome.target_uri.as_str().to_string())
            }
            None => None,
        };

        let result = CommitResult { session_id: id.to_string(), target_uri, extracted };
        self.sessions.finish_commit(id, result.clone()).await?;
        let doc = trace.map(|t| t.finish());
        Ok((result, doc))
    }

    // ================= System =================

    /// Process liveness. Always ok.
    pub fn health(&self) -> Value {
        json!({ "status": "ok" })
    }

    /// Probe AGFS, VectorDB, and both model capabilities.
    pub async fn ready(&self) -> ReadyReport {
        let mut checks = BTreeMap::new();
        checks.insert(
            "agfs".to_string(),
            match self.agfs.stat(&VikingUri::root()).await {
                Ok(_) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            },
        );
        checks.insert(
            "vectordb".to_string(),
            match self.vectors.count(&VikingUri::root()).await {
                Ok(_) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            },
        );
        checks.insert(
            "summarizer".to_string(),
            match self.summarizer.ready().await {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            },
        );
        checks.insert(
            "embedder".to_string(),
            match self.embedder.ready().await {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            },
        );
        let status = if checks.values().all(|v| v == "ok") { "ok" } else { "error" };
        ReadyReport { status: status.to_string(), checks }
    }

    /// Drive both workers until the queues drain or the timeout
    /// passes.
    pub async fn wait(&self, timeout: Duration) -> Result<DrainReport> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(OvError::Cancelled);
            }
            let semantic_progress = self.semantic_worker.tick().await?;
            let embedding_progress = self.embedding_worker.tick().await?;
            let counts = self.queue_counts().await?;
            if counts.drained() {
                return Ok(Self::report(counts));
            }
            if !semantic_progress && !embedding_progress {
                // A failed job can block its ancestors forever; report
                // instead of spinning out the whole timeout.
                if counts.in_progress == 0 && counts.failed > 0 {
                    return Ok(Self::report(counts));
                }
                if Instant::now() >= deadline {
                    return Ok(Self::report(counts));
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    async fn queue_counts(&self) -> Result<QueueCounts> {
        Ok(self
            .semantic_queue
            .counts()
            .await?
            .merge(self.embedding_queue.counts().await?))
    }

    fn report(counts: QueueCounts) -> DrainReport {
        DrainReport {
            pending: counts.pending,
            in_progress: counts.in_progress,
            processed: counts.done,
            errors: counts.failed,
        }
    }

    async fn record_queue_gauges(&self, trace: &RequestTrace) -> Result<()> {
        let counts = self.semantic_queue.counts().await?;
        trace.gauge(
            "semantic_nodes.total",
            (counts.pending + counts.in_progress + counts.done + counts.failed) as i64,
        );
        trace.gauge("semantic_nodes.done", counts.done as i64);
        trace.gauge("semantic_nodes.pending", counts.pending as i64);
        trace.gauge("semantic_nodes.in_progress", counts.in_progress as i64);
        Ok(())
    }

    /// Manual `failed → pending` re-enqueue of a semantic job.
    pub async fn retry_semantic_job(&self, job_id: &str) -> Result<()> {
        self.semantic_queue.retry(job_id).await
    }

    /// Shared AGFS handle, for collaborators embedding the engine.
    pub fn agfs(&self) -> &Arc<dyn Agfs> {
        &self.agfs
    }

    /// Shared vector store handle.
    pub fn vectors(&self) -> &Arc<VectorStore> {
        &self.vectors
    }
}
