//! The semantic worker: bottom-up directory summarisation.
//!
//! Scheduling: a directory job is eligible only once every child
//! directory carries its own `.abstract.md` or a `done` job; pending
//! jobs whose children lack both get child jobs fanned out first.
//! Processing a directory produces file abstracts (cached in hidden
//! sidecars, AST-short-circuited for large code files), asks the
//! summariser for the L1 overview, derives the L0 abstract
//! deterministically, writes `.overview.md` then `.abstract.md` in
//! that order, and enqueues embedding work.

use crate::queue::JobQueue;
use async_recursion::async_recursion;
use futures::stream::{self, StreamExt};
use ov_core::capability::Summarizer;
use ov_core::config::{CodeSummaryMode, OpenVikingConfig};
use ov_core::error::{OvError, Result};
use ov_core::retry::{with_backoff, with_timeout};
use ov_core::trace::RequestTrace;
use ov_core::types::{EmbedSource, EmbeddingJob, JobKind, JobStatus, Modality, SemanticJob};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, Entry, LsOptions, WriteOptions, ABSTRACT_FILE, OVERVIEW_FILE};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "bmp"];

fn is_image_name(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derive the L0 abstract from an L1 overview: the first paragraph,
/// truncated to 200 words. Deterministic given the same overview.
pub fn derive_abstract(overview: &str) -> String {
    let first_para = overview
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("");
    let words: Vec<&str> = first_para.split_whitespace().take(200).collect();
    words.join(" ")
}

/// Bottom-up semantic pipeline worker.
pub struct SemanticWorker {
    agfs: Arc<dyn Agfs>,
    queue: Arc<JobQueue<SemanticJob>>,
    embed_queue: Arc<JobQueue<EmbeddingJob>>,
    summarizer: Arc<dyn Summarizer>,
    config: Arc<OpenVikingConfig>,
    llm_slots: Arc<Semaphore>,
    cancel: CancellationToken,
    trace: Mutex<Option<RequestTrace>>,
}

impl SemanticWorker {
    pub fn new(
        agfs: Arc<dyn Agfs>,
        queue: Arc<JobQueue<SemanticJob>>,
        embed_queue: Arc<JobQueue<EmbeddingJob>>,
        summarizer: Arc<dyn Summarizer>,
        config: Arc<OpenVikingConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let llm_slots = Arc::new(Semaphore::new(config.queue.max_concurrent_llm));
        Self {
            agfs,
            queue,
            embed_queue,
            summarizer,
            config,
            llm_slots,
            cancel,
            trace: Mutex::new(None),
        }
    }

    /// Attach (or detach) the per-request trace the worker reports
    /// into while a traced request drains.
    pub fn set_trace(&self, trace: Option<RequestTrace>) {
        *self.trace.lock().unwrap() = trace;
    }

    fn trace_handle(&self) -> Option<RequestTrace> {
        self.trace.lock().unwrap().clone()
    }

    /// One scheduling pass: recover leases, fan out discovered child
    /// directories, claim and process every eligible job. Returns
    /// whether any work happened.
    pub async fn tick(&self) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(OvError::Cancelled);
        }
        self.queue.recover_expired().await?;
        let jobs = self.queue.list().await?;
        let mut progress = false;

        let mut status_by_uri: HashMap<String, JobStatus> = HashMap::new();
        for job in &jobs {
            status_by_uri.insert(job.uri.clone(), job.status);
        }

        // Discovery: child directories without artefacts or jobs get
        // their own jobs, parent_uri pointing back up.
        let mut eligible: Vec<String> = Vec::new();
        let mut known: HashSet<String> = status_by_uri.keys().cloned().collect();
        for job in jobs.iter().filter(|j| j.status == JobStatus::Pending) {
            let uri = match VikingUri::parse(&job.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    self.queue.fail(job.clone(), e.to_string()).await?;
                    progress = true;
                    continue;
                }
            };
            let children = match self.agfs.ls(&uri, LsOptions::default()).await {
                Ok(children) => children,
                Err(OvError::NotFound(_)) => {
                    self.queue
                        .fail(job.clone(), format!("directory vanished: {uri}"))
                        .await?;
                    progress = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut ready = true;
            for child in children.iter().filter(|c| c.is_dir) {
                let child_uri = child.uri.as_str();
                let processed = child.abstract_text.is_some()
                    || status_by_uri.get(child_uri) == Some(&JobStatus::Done);
                if processed {
                    continue;
                }
                ready = false;
                if !known.contains(child_uri) {
                    let child_job =
                        SemanticJob::new(child_uri, job.kind, Some(job.uri.clone()));
                    self.queue.enqueue(child_job).await?;
                    known.insert(child_uri.to_string());
                    progress = true;
                }
            }
            if ready {
                eligible.push(job.id.clone());
            }
        }

        // Claim and process eligible jobs concurrently.
        let mut claimed = Vec::new();
        for id in eligible {
            if let Some(job) = self.queue.claim(&id).await? {
                claimed.push(job);
            }
        }
        if !claimed.is_empty() {
            progress = true;
            let cap = self.config.queue.max_concurrent_semantic_jobs;
            stream::iter(claimed)
                .for_each_concurrent(cap, |job| async move {
                    self.process_claimed(job).await;
                })
                .await;
        }
        Ok(progress)
    }

    /// Drive ticks until the queue stops moving. Test and drain helper.
    pub async fn run_until_idle(&self) -> Result<()> {
        while self.tick().await? {}
        Ok(())
    }

    /// Background loop until cancellation.
    pub async fn run(&self) {
        loop {
            match self.tick().await {
                Err(OvError::Cancelled) => break,
                Err(e) => tracing::warn!(error = %e, "semantic tick failed"),
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

    async fn process_claimed(&self, job: SemanticJob) {
        let uri = match VikingUri::parse(&job.uri) {
            Ok(uri) => uri,
            Err(e) => {
                let _ = self.queue.fail(job, e.to_string()).await;
                return;
            }
        };
        match self.process_directory(&uri, job.kind).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job).await {
                    tracing::warn!(error = %e, "failed to complete job record");
                }
            }
            Err(OvError::Cancelled) => {
                let _ = self.queue.release(job).await;
            }
            Err(e) => {
                let _ = self.queue.fail(job, e.to_string()).await;
            }
        }
    }

    /// Produce both semantic artefacts for one directory. Recurses
    /// inline into unprocessed child directories that have no job of
    /// their own (the leaf-inline case).
    #[async_recursion]
    pub async fn process_directory(&self, dir: &VikingUri, kind: JobKind) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OvError::Cancelled);
        }
        let children = self.agfs.ls(dir, LsOptions::default()).await?;
        let (dirs, files): (Vec<Entry>, Vec<Entry>) =
            children.into_iter().partition(|e| e.is_dir);

        // Child abstracts must exist before ours. A missing one with no
        // backing job is handled inline; a missing one with an
        // unfinished job is a scheduling bug.
        let mut child_dir_abstracts: Vec<(String, String)> = Vec::new();
        for entry in &dirs {
            let child_abstract = match &entry.abstract_text {
                Some(text) => text.clone(),
                None => {
                    let status = self.job_status_for(entry.uri.as_str()).await?;
                    match status {
                        None => {
                            self.process_directory(&entry.uri, kind).await?;
                            self.agfs.abstract_of(&entry.uri).await?
                        }
                        Some(JobStatus::Done) => self.agfs.abstract_of(&entry.uri).await?,
                        Some(other) => {
                            return Err(OvError::InvariantViolation(format!(
                                "child {} not processed (job {other}) while summarising {dir}",
                                entry.uri
                            )))
                        }
                    }
                }
            };
            let name = entry.uri.name().unwrap_or_default().to_string();
            child_dir_abstracts.push((name, child_abstract));
        }

        let file_abstracts = self.file_abstracts(dir, &files).await?;

        // Assemble the overview input: every child with its abstract.
        let mut lines = Vec::new();
        for (name, text) in &child_dir_abstracts {
            lines.push(format!("- {name} (directory): {}", first_words(text, 60)));
        }
        for (name, text) in &file_abstracts {
            lines.push(format!("- {name} (file): {}", first_words(text, 60)));
        }
        lines.sort();

        let dir_name = dir.name().unwrap_or("root");
        let prompt = format!(
            "Write a structured overview of directory '{dir_name}'. Begin with a one-paragraph \
purpose statement, then list every child with a one-line role.\nChildren:\n{}",
            lines.join("\n")
        );
        let overview = self
            .call_summarizer(&prompt, None, &[dir.as_str().to_string()])
            .await?;
        let abstract_text = derive_abstract(&overview);

        // Overview first so any reader of the abstract also finds the
        // overview.
        self.agfs
            .write_string(&dir.join(OVERVIEW_FILE)?, &overview, WriteOptions::default())
            .await?;
        self.agfs
            .write_string(&dir.join(ABSTRACT_FILE)?, &abstract_text, WriteOptions::default())
            .await?;

        self.enqueue_embeddings(dir, &files).await?;
        tracing::info!(dir = %dir, files = files.len(), subdirs = dirs.len(), "directory summarised");
        Ok(())
    }

    async fn job_status_for(&self, uri: &str) -> Result<Option<JobStatus>> {
        Ok(self
            .queue
            .list()
            .await?
            .into_iter()
            .filter(|j| j.uri == uri)
            .map(|j| j.status)
            .next_back())
    }

    /// Abstracts for every visible file child, cache-first, with
    /// bounded summariser concurrency.
    async fn file_abstracts(&self, dir: &VikingUri, files: &[Entry]) -> Result<Vec<(String, String)>> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut need_llm_text: Vec<(String, String)> = Vec::new();
        let mut images: Vec<String> = Vec::new();

        for entry in files {
            let name = entry.uri.name().unwrap_or_default().to_string();
            if let Some(cached) = self.read_sidecar(dir, &name).await? {
                out.push((name, cached));
                continue;
            }
            if is_image_name(&name) {
                images.push(name);
                continue;
            }
            let bytes = self.agfs.read(&entry.uri).await?;
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let mode = self.config.parser.code_summary_mode;
            let skeleton = match mode {
                CodeSummaryMode::Llm => None,
                _ => ov_parser::code::skeleton_for_file(&name, &content),
            };
            match (mode, skeleton) {
                (CodeSummaryMode::Ast, Some(skeleton)) => {
                    self.trace_event("skeleton", &name, json!({"file": entry.uri.as_str()}));
                    self.write_sidecar(dir, &name, &skeleton).await?;
                    out.push((name, skeleton));
                }
                (CodeSummaryMode::AstLlm, Some(skeleton)) => {
                    let prompt = format!(
                        "Summarise this file in one paragraph using its structural skeleton \
and docstrings.\nFile: {name}\nSkeleton:\n{skeleton}"
                    );
                    let summary = self
                        .call_summarizer(&prompt, None, &[name.clone()])
                        .await?;
                    self.write_sidecar(dir, &name, &summary).await?;
                    out.push((name, summary));
                }
                _ => {
                    let max_chars = self.config.parser.split_max_tokens * 4;
                    let content: String = content.chars().take(max_chars).collect();
                    need_llm_text.push((name, content));
                }
            }
        }

        // Text sections batch into one call each, capped per call.
        let batches: Vec<Vec<(String, String)>> = need_llm_text
            .chunks(self.config.parser.max_sections_per_call.max(1))
            .map(|c| c.to_vec())
            .collect();
        let batch_results = stream::iter(batches)
            .map(|batch| async move { self.summarise_text_batch(dir, batch).await })
            .buffer_unordered(self.config.queue.max_concurrent_llm.max(1))
            .collect::<Vec<_>>()
            .await;
        for result in batch_results {
            out.extend(result?);
        }

        for batch in images.chunks(self.config.parser.max_images_per_call.max(1)) {
            out.extend(self.summarise_image_batch(dir, batch).await?);
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// One summariser call covering several text sections; the
    /// response is split back per section on `### name` markers, with
    /// a per-file fallback when the shape does not come back.
    async fn summarise_text_batch(
        &self,
        dir: &VikingUri,
        batch: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut prompt = String::from(
            "Summarise each section below in one paragraph. Answer with one '### <name>' \
heading per section followed by its summary.\n",
        );
        for (name, content) in &batch {
            prompt.push_str(&format!("\n### {name}\n{content}\n"));
        }
        let names: Vec<String> = batch.iter().map(|(n, _)| n.clone()).collect();
        let response = self.call_summarizer(&prompt, None, &names).await?;

        let parsed = parse_batch_response(&response, &names);
        let mut out = Vec::new();
        match parsed {
            Some(summaries) => {
                for (name, summary) in summaries {
                    self.write_sidecar(dir, &name, &summary).await?;
                    out.push((name, summary));
                }
            }
            None => {
                // Shape mismatch: fall back to one call per section.
                for (name, content) in batch {
                    let prompt =
                        format!("Summarise the following file in one paragraph.\nFile: {name}\n\n{content}");
                    let summary = self.call_summarizer(&prompt, None, &[name.clone()]).await?;
                    self.write_sidecar(dir, &name, &summary).await?;
                    out.push((name, summary));
                }
            }
        }
        Ok(out)
    }

    async fn summarise_image_batch(
        &self,
        dir: &VikingUri,
        names: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut payloads = Vec::new();
        for name in names {
            payloads.push(self.agfs.read(&dir.join(name)?).await?);
        }
        let prompt = format!(
            "Describe each image in one line, formatted as '### <name>' followed by the \
description.\nImages: {}",
            names.join(", ")
        );
        let response = self
            .call_summarizer(&prompt, Some(&payloads), names)
            .await?;
        let parsed = parse_batch_response(&response, names);
        let mut out = Vec::new();
        for name in names {
            let summary = parsed
                .as_ref()
                .and_then(|m| m.iter().find(|(n, _)| n == name).map(|(_, s)| s.clone()))
                .unwrap_or_else(|| format!("Image asset {name}."));
            self.write_sidecar(dir, name, &summary).await?;
            out.push((name.clone(), summary));
        }
        Ok(out)
    }

    async fn read_sidecar(&self, dir: &VikingUri, name: &str) -> Result<Option<String>> {
        let uri = dir.join(&format!(".{name}.abstract.md"))?;
        match self.agfs.read_string(&uri).await {
            Ok(text) => Ok(Some(text)),
            Err(OvError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_sidecar(&self, dir: &VikingUri, name: &str, text: &str) -> Result<()> {
        let uri = dir.join(&format!(".{name}.abstract.md"))?;
        self.agfs.write_string(&uri, text, WriteOptions::default()).await
    }

    /// Summariser call under the shared concurrency cap, with the
    /// standard timeout and transient-failure backoff.
    async fn call_summarizer(
        &self,
        prompt: &str,
        images: Option<&[Vec<u8>]>,
        subjects: &[String],
    ) -> Result<String> {
        let _permit = self
            .llm_slots
            .acquire()
            .await
            .map_err(|_| OvError::Cancelled)?;
        if self.cancel.is_cancelled() {
            return Err(OvError::Cancelled);
        }
        let timeout = self.config.timeouts.summarizer();
        let response = with_backoff(|| {
            with_timeout(timeout, "summarise", self.summarizer.summarise(prompt, images))
        })
        .await?;

        if let Some(trace) = self.trace_handle() {
            trace.event(
                "summarise",
                subjects.first().map(String::as_str).unwrap_or("batch"),
                "ok",
                json!({ "files": subjects }),
            );
            let input_tokens = (prompt.chars().count() / 4) as i64;
            let output_tokens = (response.chars().count() / 4) as i64;
            trace.incr("token_usage.input_tokens", input_tokens);
            trace.incr("token_usage.output_tokens", output_tokens);
            trace.incr("token_usage.total_tokens", input_tokens + output_tokens);
        }
        Ok(response)
    }

    async fn enqueue_embeddings(&self, dir: &VikingUri, files: &[Entry]) -> Result<()> {
        self.embed_queue
            .enqueue(EmbeddingJob::new(dir.as_str(), Modality::Text, EmbedSource::Abstract))
            .await?;
        self.embed_queue
            .enqueue(EmbeddingJob::new(dir.as_str(), Modality::Text, EmbedSource::Overview))
            .await?;
        for entry in files {
            let name = entry.uri.name().unwrap_or_default();
            let modality = if is_image_name(name) {
                Modality::Multimodal
            } else {
                Modality::Text
            };
            self.embed_queue
                .enqueue(EmbeddingJob::new(entry.uri.as_str(), modality, EmbedSource::Raw))
                .await?;
        }
        Ok(())
    }

    fn trace_event(&self, stage: &str, name: &str, attrs: serde_json::Value) {
        if let Some(trace) = self.trace_handle() {
            trace.event(stage, name, "ok", attrs);
        }
    }
}

fn first_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// Split a `### name` delimited batch response; `None` when any
/// section is missing.
fn parse_batch_response(response: &str, names: &[String]) -> Option<Vec<(String, String)>> {
    let mut out = Vec::new();
    for name in names {
        let marker = format!("### {name}");
        let start = response.find(&marker)? + marker.len();
        let rest = &response[start..];
        let end = rest.find("\n### ").unwrap_or(rest.len());
        let summary = rest[..end].trim().to_string();
        if summary.is_empty() {
            return None;
        }
        out.push((name.clone(), summary));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_abstract_first_paragraph() {
        let overview = "Purpose paragraph right here.\n\n- a: role\n- b: role";
        assert_eq!(derive_abstract(overview), "Purpose paragraph right here.");
    }

    #[test]
    fn test_derive_abstract_truncates_to_200_words() {
        let long = "word ".repeat(500);
        let overview = format!("{long}\n\nrest");
        let derived = derive_abstract(&overview);
        assert_eq!(derived.split_whitespace().count(), 200);
    }

    #[test]
    fn test_derive_abstract_skips_blank_leading_paragraphs() {
        assert_eq!(derive_abstract("\n\n  \n\nActual start.\n\nMore."), "Actual start.");
        assert_eq!(derive_abstract(""), "");
    }

    #[test]
    fn test_derive_abstract_deterministic() {
        let overview = "Same input.\n\nSame children.";
        assert_eq!(derive_abstract(overview), derive_abstract(overview));
    }

    #[test]
    fn test_parse_batch_response_roundtrip() {
        let names = vec!["A.md".to_string(), "B.md".to_string()];
        let response = "### A.md\nSummary of A.\n\n### B.md\nSummary of B.";
        let parsed = parse_batch_response(response, &names).unwrap();
        assert_eq!(parsed[0], ("A.md".into(), "Summary of A.".into()));
        assert_eq!(parsed[1], ("B.md".into(), "Summary of B.".into()));
    }

    #[test]
    fn test_parse_batch_response_missing_section() {
        let names = vec!["A.md".to_string(), "B.md".to_string()];
        assert!(parse_batch_response("### A.md\nOnly A.", &names).is_none());
        assert!(parse_batch_response("", &names).is_none());
    }

    #[test]
    fn test_is_image_name() {
        assert!(is_image_name("diagram.png"));
        assert!(is_image_name("PHOTO.JPEG"));
        assert!(!is_image_name("notes.md"));
        assert!(!is_image_name("archive"));
    }

    #[test]
    fn test_first_words() {
        assert_eq!(first_words("a b c d", 2), "a b");
        assert_eq!(first_words("a", 10), "a");
    }
}
