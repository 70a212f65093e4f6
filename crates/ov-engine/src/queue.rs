//! Persistent job queues over AGFS.
//!
//! Each job is one JSON file under
//! `viking://.system/queues/<name>/<id>.json`. Claims transition
//! `pending → in_progress` under an in-process lock (single writer per
//! workspace) and stamp a lease; a job whose lease expires reverts to
//! `pending`, which is how crashed workers recover.

use chrono::{DateTime, Duration, Utc};
use ov_core::error::{OvError, Result};
use ov_core::types::{EmbeddingJob, JobStatus, SemanticJob};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, LsOptions, WriteOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Record behaviour the queue needs from a job type.
pub trait JobRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn status(&self) -> JobStatus;
    fn set_status(&mut self, status: JobStatus);
    fn enqueued_at(&self) -> DateTime<Utc>;
    fn touch(&mut self);
    fn attempts(&self) -> u32;
    fn incr_attempts(&mut self);
    fn set_error(&mut self, error: Option<String>);
    fn lease_expires_at(&self) -> Option<DateTime<Utc>>;
    fn set_lease(&mut self, until: Option<DateTime<Utc>>);
}

macro_rules! impl_job_record {
    ($ty:ty) => {
        impl JobRecord for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn status(&self) -> JobStatus {
                self.status
            }
            fn set_status(&mut self, status: JobStatus) {
                self.status = status;
            }
            fn enqueued_at(&self) -> DateTime<Utc> {
                self.enqueued_at
            }
            fn touch(&mut self) {
                self.updated_at = Utc::now();
            }
            fn attempts(&self) -> u32 {
                self.attempts
            }
            fn incr_attempts(&mut self) {
                self.attempts += 1;
            }
            fn set_error(&mut self, error: Option<String>) {
                self.last_error = error;
            }
            fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
                self.lease_expires_at
            }
            fn set_lease(&mut self, until: Option<DateTime<Utc>>) {
                self.lease_expires_at = until;
            }
        }
    };
}

impl_job_record!(SemanticJob);
impl_job_record!(EmbeddingJob);

/// Queue population snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn merge(self, other: QueueCounts) -> QueueCounts {
        QueueCounts {
            pending: self.pending + other.pending,
            in_progress: self.in_progress + other.in_progress,
            done: self.done + other.done,
            failed: self.failed + other.failed,
        }
    }
}

/// A persistent FIFO of jobs of one type.
pub struct JobQueue<T: JobRecord> {
    agfs: Arc<dyn Agfs>,
    root: VikingUri,
    lease_timeout: Duration,
    claim_lock: Mutex<()>,
    notify: Notify,
    _marker: PhantomData<T>,
}

impl<T: JobRecord> JobQueue<T> {
    /// Open (creating if needed) the queue directory.
    pub async fn open(agfs: Arc<dyn Agfs>, name: &str, lease_timeout_secs: u64) -> Result<Self> {
        let root = VikingUri::parse("viking://.system/queues")?.join(name)?;
        agfs.mkdir(&root).await?;
        Ok(Self {
            agfs,
            root,
            lease_timeout: Duration::seconds(lease_timeout_secs as i64),
            claim_lock: Mutex::new(()),
            notify: Notify::new(),
            _marker: PhantomData,
        })
    }

    fn job_uri(&self, id: &str) -> Result<VikingUri> {
        self.root.join(&format!("{id}.json"))
    }

    async fn write_job(&self, job: &T, create_only: bool) -> Result<()> {
        let uri = self.job_uri(job.id())?;
        let bytes = serde_json::to_vec_pretty(job)?;
        self.agfs.write(&uri, &bytes, WriteOptions { create_only }).await
    }

    /// Add a new job. Ids are unique, so re-enqueueing the same record
    /// is an error.
    pub async fn enqueue(&self, job: T) -> Result<()> {
        self.write_job(&job, true).await?;
        tracing::debug!(job_id = job.id(), queue = %self.root, "job enqueued");
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<T> {
        let bytes = self.agfs.read(&self.job_uri(id)?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Result<Vec<T>> {
        let opts = LsOptions { include_hidden: false, ..Default::default() };
        let entries = match self.agfs.ls(&self.root, opts).await {
            Ok(entries) => entries,
            Err(OvError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut jobs = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_dir) {
            match self.agfs.read(&entry.uri).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::warn!(uri = %entry.uri, error = %e, "skipping corrupt job record")
                    }
                },
                // Claimed-and-rewritten concurrently; next pass sees it.
                Err(OvError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by_key(|j| (j.enqueued_at(), j.id().to_string()));
        Ok(jobs)
    }

    /// Revert expired `in_progress` leases to `pending`; returns how
    /// many were recovered.
    pub async fn recover_expired(&self) -> Result<usize> {
        let _guard = self.claim_lock.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for mut job in self.list().await? {
            if job.status() == JobStatus::InProgress
                && job.lease_expires_at().map(|t| t < now).unwrap_or(true)
            {
                tracing::warn!(job_id = job.id(), "lease expired, reverting to pending");
                job.set_status(JobStatus::Pending);
                job.set_lease(None);
                job.touch();
                self.write_job(&job, false).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    /// Claim a specific job if it is still pending.
    pub async fn claim(&self, id: &str) -> Result<Option<T>> {
        let _guard = self.claim_lock.lock().await;
        let mut job = match self.get(id).await {
            Ok(job) => job,
            Err(OvError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if job.status() != JobStatus::Pending {
            return Ok(None);
        }
        job.set_status(JobStatus::InProgress);
        job.set_lease(Some(Utc::now() + self.lease_timeout));
        job.incr_attempts();
        job.touch();
        self.write_job(&job, false).await?;
        Ok(Some(job))
    }

    /// Mark a claimed job done.
    pub async fn complete(&self, mut job: T) -> Result<()> {
        job.set_status(JobStatus::Done);
        job.set_lease(None);
        job.set_error(None);
        job.touch();
        self.write_job(&job, false).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark a claimed job failed, recording the error.
    pub async fn fail(&self, mut job: T, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        tracing::warn!(job_id = job.id(), error = %error, "job failed");
        job.set_status(JobStatus::Failed);
        job.set_lease(None);
        job.set_error(Some(error));
        job.touch();
        self.write_job(&job, false).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return a claimed job to `pending` (cancellation, lost race).
    pub async fn release(&self, mut job: T) -> Result<()> {
        job.set_status(JobStatus::Pending);
        job.set_lease(None);
        job.touch();
        self.write_job(&job, false).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Manual `failed → pending` re-enqueue.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let _guard = self.claim_lock.lock().await;
        let mut job = self.get(id).await?;
        if job.status() != JobStatus::Failed {
            return Err(OvError::invalid(format!("job {id} is not failed")));
        }
        job.set_status(JobStatus::Pending);
        job.set_error(None);
        job.touch();
        self.write_job(&job, false).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.list().await? {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::InProgress => counts.in_progress += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Drop every job whose summary matches `pred` (used when subtrees
    /// are removed).
    pub async fn purge<F: Fn(&T) -> bool>(&self, pred: F) -> Result<usize> {
        let _guard = self.claim_lock.lock().await;
        let mut purged = 0;
        for job in self.list().await? {
            if pred(&job) {
                self.agfs.delete(&self.job_uri(job.id())?, false).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Wait until something changes in the queue.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Queue gauge snapshot for traces.
    pub async fn gauges(&self) -> Result<serde_json::Value> {
        let counts = self.counts().await?;
        Ok(json!({
            "pending": counts.pending,
            "in_progress": counts.in_progress,
            "done": counts.done,
            "failed": counts.failed,
        }))
    }
}
