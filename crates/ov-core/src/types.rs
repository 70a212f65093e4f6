//! Job records and shared enums for the two persistent queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again (except a manual
    /// `failed → pending` re-enqueue).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of tree a semantic job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Resource,
    Memory,
    Skill,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Memory => "memory",
            Self::Skill => "skill",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding input modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Multimodal,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Multimodal => "multimodal",
        }
    }
}

/// Which artefact an embedding vector was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedSource {
    Abstract,
    Overview,
    Raw,
}

impl EmbedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::Overview => "overview",
            Self::Raw => "raw",
        }
    }
}

impl std::fmt::Display for EmbedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory category a distilled fact is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Preferences,
    Facts,
    Events,
    Cases,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 4] = [
        Self::Preferences,
        Self::Facts,
        Self::Events,
        Self::Cases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preferences => "preferences",
            Self::Facts => "facts",
            Self::Events => "events",
            Self::Cases => "cases",
        }
    }

    /// Event and case memories dedupe by URI, everything else by
    /// normalised abstract.
    pub fn dedup_by_uri(&self) -> bool {
        matches!(self, Self::Events | Self::Cases)
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = crate::error::OvError;
    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "preferences" => Ok(Self::Preferences),
            "facts" => Ok(Self::Facts),
            "events" => Ok(Self::Events),
            "cases" => Ok(Self::Cases),
            _ => Err(crate::error::OvError::invalid(format!("unknown memory category: {s}"))),
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of semantic work: produce `.overview.md` and `.abstract.md`
/// for one directory, bottom-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticJob {
    pub id: String,
    pub uri: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Enforces bottom-up ordering: the parent becomes eligible only
    /// once this job is done.
    pub parent_uri: Option<String>,
    /// Set while `in_progress`; an expired lease reverts the job to
    /// `pending`.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl SemanticJob {
    pub fn new(uri: impl Into<String>, kind: JobKind, parent_uri: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sem_{}", Uuid::new_v4().simple()),
            uri: uri.into(),
            kind,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            parent_uri,
            lease_expires_at: None,
        }
    }
}

/// A unit of embedding work: vectorise one artefact of one URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: String,
    pub uri: String,
    pub modality: Modality,
    pub source: EmbedSource,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl EmbeddingJob {
    pub fn new(uri: impl Into<String>, modality: Modality, source: EmbedSource) -> Self {
        let now = Utc::now();
        Self {
            id: format!("emb_{}", Uuid::new_v4().simple()),
            uri: uri.into(),
            modality,
            source,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            lease_expires_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_serde() {
        assert_eq!(serde_json::to_string(&JobStatus::InProgress).unwrap(), r#""in_progress""#);
        let s: JobStatus = serde_json::from_str(r#""pending""#).unwrap();
        assert_eq!(s, JobStatus::Pending);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_semantic_job_new() {
        let job = SemanticJob::new("viking://resources/doc", JobKind::Resource, None);
        assert!(job.id.starts_with("sem_"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        assert!(job.lease_expires_at.is_none());
    }

    #[test]
    fn test_semantic_job_serde_roundtrip() {
        let job = SemanticJob::new(
            "viking://resources/doc/ch1",
            JobKind::Resource,
            Some("viking://resources/doc".into()),
        );
        let json = serde_json::to_string(&job).unwrap();
        let job2: SemanticJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job2.id, job.id);
        assert_eq!(job2.parent_uri.as_deref(), Some("viking://resources/doc"));
        assert_eq!(job2.kind, JobKind::Resource);
    }

    #[test]
    fn test_embedding_job_new() {
        let job = EmbeddingJob::new("viking://resources/doc", Modality::Text, EmbedSource::Abstract);
        assert!(job.id.starts_with("emb_"));
        assert_eq!(job.source, EmbedSource::Abstract);
        assert_eq!(job.modality, Modality::Text);
    }

    #[test]
    fn test_embed_source_display() {
        assert_eq!(EmbedSource::Abstract.to_string(), "abstract");
        assert_eq!(EmbedSource::Overview.to_string(), "overview");
        assert_eq!(EmbedSource::Raw.to_string(), "raw");
    }

    #[test]
    fn test_memory_category_roundtrip() {
        for cat in MemoryCategory::ALL {
            let parsed: MemoryCategory = cat.as_str().parse().unwrap();
            assert_eq!(parsed, cat);
        }
        assert!("bogus".parse::<MemoryCategory>().is_err());
    }

    #[test]
    fn test_memory_category_dedup_rule() {
        assert!(MemoryCategory::Events.dedup_by_uri());
        assert!(MemoryCategory::Cases.dedup_by_uri());
        assert!(!MemoryCategory::Preferences.dedup_by_uri());
        assert!(!MemoryCategory::Facts.dedup_by_uri());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(JobKind::Resource.to_string(), "resource");
        assert_eq!(JobKind::Memory.to_string(), "memory");
        assert_eq!(JobKind::Skill.to_string(), "skill");
    }
}
