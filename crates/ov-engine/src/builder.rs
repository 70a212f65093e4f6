//! Promotion of scratch trees into the stable namespace.
//!
//! The only path by which external content enters `resources`,
//! `user/memories`, or `agent/skills`. A promote validates the scratch
//! tree, picks a collision-free target name, moves the subtree under a
//! directory lease, deletes the scratch root, and enqueues the root
//! semantic job; the queue fans out to descendants on its own.

use crate::queue::JobQueue;
use ov_core::error::{OvError, Result};
use ov_core::types::{JobKind, SemanticJob};
use ov_core::uri::{IngestScope, VikingUri};
use ov_storage::{Agfs, LeaseRegistry, LsOptions, PENDING_CLEANUP_MARKER, WriteOptions};
use std::sync::Arc;

/// What a successful promote produced.
#[derive(Debug, Clone)]
pub struct PromoteOutcome {
    pub target_uri: VikingUri,
    pub job_id: String,
}

/// Moves scratch trees into their permanent scope.
pub struct TreeBuilder {
    agfs: Arc<dyn Agfs>,
    semantic_queue: Arc<JobQueue<SemanticJob>>,
    leases: LeaseRegistry,
}

impl TreeBuilder {
    pub fn new(
        agfs: Arc<dyn Agfs>,
        semantic_queue: Arc<JobQueue<SemanticJob>>,
        leases: LeaseRegistry,
    ) -> Self {
        Self { agfs, semantic_queue, leases }
    }

    fn kind_for(scope: IngestScope) -> JobKind {
        match scope {
            IngestScope::Resources => JobKind::Resource,
            IngestScope::User => JobKind::Memory,
            IngestScope::Agent => JobKind::Skill,
        }
    }

    /// Promote `temp_dir_uri` into `scope`.
    pub async fn promote(&self, temp_dir_uri: &VikingUri, scope: IngestScope) -> Result<PromoteOutcome> {
        // The scratch root must hold exactly one directory, the
        // document root.
        let children = self.agfs.ls(temp_dir_uri, LsOptions::default()).await?;
        if children.len() != 1 || !children[0].is_dir {
            return Err(OvError::InvariantViolation(format!(
                "scratch tree {temp_dir_uri} must hold exactly one top-level directory, found {}",
                children.len()
            )));
        }
        let doc_root = &children[0].uri;
        let doc_name = doc_root
            .name()
            .ok_or_else(|| OvError::InvariantViolation("unnamed document root".into()))?;

        let base = scope.base_uri();
        self.agfs.mkdir(&base).await?;
        let target = self.unique_target(&base, doc_name).await?;

        let _lease = self.leases.acquire(&target).await;
        if let Err(move_err) = self.agfs.mv(doc_root, &target).await {
            return self.rollback(doc_root, &target, move_err).await;
        }

        // The scratch root is empty now; losing the cleanup race is
        // harmless (the GC sweep catches stragglers).
        if let Err(e) = self.agfs.delete(temp_dir_uri, true).await {
            tracing::warn!(uri = %temp_dir_uri, error = %e, "scratch root cleanup failed");
        }

        let job = SemanticJob::new(target.as_str(), Self::kind_for(scope), None);
        let job_id = job.id.clone();
        self.semantic_queue.enqueue(job).await?;
        tracing::info!(target = %target, job_id, "scratch tree promoted");
        Ok(PromoteOutcome { target_uri: target, job_id })
    }

    /// Smallest positive integer suffix making the target unique.
    async fn unique_target(&self, base: &VikingUri, doc_name: &str) -> Result<VikingUri> {
        let plain = base.join(doc_name)?;
        if !self.agfs.exists(&plain).await? {
            return Ok(plain);
        }
        let mut i = 1usize;
        loop {
            let candidate = base.join(&format!("{doc_name}-{i}"))?;
            if !self.agfs.exists(&candidate).await? {
                return Ok(candidate);
            }
            i += 1;
        }
    }

    /// Best-effort rollback of a half-finished move; a rollback that
    /// itself fails leaves a `.pending_cleanup` marker for operators.
    async fn rollback(
        &self,
        doc_root: &VikingUri,
        target: &VikingUri,
        move_err: OvError,
    ) -> Result<PromoteOutcome> {
        tracing::warn!(target = %target, error = %move_err, "promote move failed, rolling back");
        if self.agfs.exists(target).await.unwrap_or(false) {
            if let Err(rollback_err) = self.agfs.delete(target, true).await {
                let marker = target.join(PENDING_CLEANUP_MARKER)?;
                let note = format!(
                    "promote of {doc_root} failed ({move_err}); rollback failed ({rollback_err})"
                );
                let _ = self
                    .agfs
                    .write(&marker, note.as_bytes(), WriteOptions::default())
                    .await;
                return Err(OvError::dependency(format!(
                    "partial promote failure at {target}, marker left at {}",
                    marker
                )));
            }
        }
        Err(move_err)
    }
}
