//! Append-only session persistence over AGFS.
//!
//! Layout per session under `viking://.system/sessions/<id>/`:
//! `log.jsonl` (one message per line, append-only before commit) and
//! `state.json` (the [`SessionRecord`]). All operations are O(1)
//! except [`SessionStore::list`].

use crate::session::{CommitResult, Message, Role, SessionRecord, SessionState};
use ov_core::error::{OvError, Result};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, WriteOptions};
use std::sync::Arc;
use uuid::Uuid;

const SESSIONS_ROOT: &str = "viking://.system/sessions";

/// What [`SessionStore::begin_commit`] found.
#[derive(Debug)]
pub enum CommitState {
    /// Fresh `open → committing` transition; run the pipeline.
    Started,
    /// Restart found a half-finished commit; re-run the pipeline.
    Resumed,
    /// Already committed; return the cached result.
    AlreadyCommitted(CommitResult),
}

/// Session persistence.
#[derive(Clone)]
pub struct SessionStore {
    agfs: Arc<dyn Agfs>,
}

impl SessionStore {
    pub fn new(agfs: Arc<dyn Agfs>) -> Self {
        Self { agfs }
    }

    fn session_dir(id: &str) -> Result<VikingUri> {
        VikingUri::parse(SESSIONS_ROOT)?.join(id)
    }

    fn log_uri(id: &str) -> Result<VikingUri> {
        Self::session_dir(id)?.join("log.jsonl")
    }

    fn state_uri(id: &str) -> Result<VikingUri> {
        Self::session_dir(id)?.join("state.json")
    }

    async fn write_record(&self, record: &SessionRecord) -> Result<()> {
        let uri = Self::state_uri(&record.session_id)?;
        let json = serde_json::to_vec_pretty(record)?;
        self.agfs.write(&uri, &json, WriteOptions::default()).await
    }

    /// Create a fresh session, returning its id.
    pub async fn create(&self) -> Result<String> {
        let id = format!("sess_{}", Uuid::new_v4().simple());
        self.agfs.mkdir(&Self::session_dir(&id)?).await?;
        self.write_record(&SessionRecord::new(&id)).await?;
        Ok(id)
    }

    /// Load a session record.
    pub async fn record(&self, id: &str) -> Result<SessionRecord> {
        let uri = Self::state_uri(id)?;
        match self.agfs.read(&uri).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(OvError::NotFound(_)) => Err(OvError::not_found(format!("session {id}"))),
            Err(e) => Err(e),
        }
    }

    /// Append one message. Sessions are append-only before commit.
    pub async fn append(&self, id: &str, role: Role, content: &str) -> Result<Message> {
        let record = self.record(id).await?;
        if record.state != SessionState::Open {
            return Err(OvError::invalid(format!(
                "session {id} is {:?}, not open",
                record.state
            )));
        }
        let message = Message::new(role, content);
        self.agfs
            .append(&Self::log_uri(id)?, message.to_jsonl()?.as_bytes())
            .await?;
        Ok(message)
    }

    /// All messages, in append order.
    pub async fn list(&self, id: &str) -> Result<Vec<Message>> {
        // Record lookup first so a missing session errors cleanly.
        self.record(id).await?;
        let uri = Self::log_uri(id)?;
        let text = match self.agfs.read_string(&uri).await {
            Ok(text) => text,
            Err(OvError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(Message::from_jsonl)
            .collect()
    }

    /// Delete a session and its log.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.record(id).await?;
        self.agfs.delete(&Self::session_dir(id)?, true).await
    }

    /// Transition toward commit. Exactly one of the three
    /// [`CommitState`]s comes back; `Started`/`Resumed` mean the caller
    /// owns the distillation run.
    pub async fn begin_commit(&self, id: &str) -> Result<CommitState> {
        let mut record = self.record(id).await?;
        match record.state {
            SessionState::Committed => {
                let result = record.commit_result.ok_or_else(|| {
                    OvError::InvariantViolation(format!("session {id} committed without result"))
                })?;
                Ok(CommitState::AlreadyCommitted(result))
            }
            SessionState::Committing => Ok(CommitState::Resumed),
            SessionState::Open => {
                record.state = SessionState::Committing;
                record.updated_at = chrono::Utc::now();
                self.write_record(&record).await?;
                Ok(CommitState::Started)
            }
        }
    }

    /// Record the commit outcome; the session becomes immutable.
    pub async fn finish_commit(&self, id: &str, result: CommitResult) -> Result<()> {
        let mut record = self.record(id).await?;
        record.state = SessionState::Committed;
        record.updated_at = chrono::Utc::now();
        record.commit_result = Some(result);
        self.write_record(&record).await
    }

    /// Ids of sessions stuck in `committing`, for crash recovery.
    pub async fn committing_sessions(&self) -> Result<Vec<String>> {
        let root = VikingUri::parse(SESSIONS_ROOT)?;
        if !self.agfs.exists(&root).await? {
            return Ok(Vec::new());
        }
        let entries = self.agfs.ls(&root, Default::default()).await?;
        let mut stuck = Vec::new();
        for entry in entries.iter().filter(|e| e.is_dir) {
            let Some(id) = entry.uri.name() else { continue };
            if let Ok(record) = self.record(id).await {
                if record.state == SessionState::Committing {
                    stuck.push(id.to_string());
                }
            }
        }
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ov_storage::LocalAgfs;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SessionStore) {
        let tmp = TempDir::new().unwrap();
        let agfs: Arc<dyn Agfs> =
            Arc::new(LocalAgfs::open(tmp.path().join("agfs")).await.unwrap());
        (tmp, SessionStore::new(agfs))
    }

    #[tokio::test]
    async fn test_create_append_list() {
        let (_tmp, store) = store().await;
        let id = store.create().await.unwrap();
        assert!(id.starts_with("sess_"));
        store.append(&id, Role::User, "I live in Berlin.").await.unwrap();
        store.append(&id, Role::Assistant, "Noted.").await.unwrap();
        let messages = store.list(&id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "I live in Berlin.");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_list_empty_session() {
        let (_tmp, store) = store().await;
        let id = store.create().await.unwrap();
        assert!(store.list(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_not_found() {
        let (_tmp, store) = store().await;
        assert_eq!(store.record("ghost").await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(store.list("ghost").await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(
            store.append("ghost", Role::User, "x").await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let (_tmp, store) = store().await;
        let id = store.create().await.unwrap();
        store.delete(&id).await.unwrap();
        assert_eq!(store.record(&id).await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_commit_lifecycle() {
        let (_tmp, store) = store().await;
        let id = store.create().await.unwrap();
        store.append(&id, Role::User, "hello").await.unwrap();

        match store.begin_commit(&id).await.unwrap() {
            CommitState::Started => {}
            other => panic!("expected Started, got {other:?}"),
        }
        // Appending mid-commit is rejected.
        assert_eq!(
            store.append(&id, Role::User, "late").await.unwrap_err().code(),
            "INVALID_ARGUMENT"
        );

        let result = CommitResult {
            session_id: id.clone(),
            target_uri: Some("viking://user/memories/session-x".into()),
            extracted: 2,
        };
        store.finish_commit(&id, result.clone()).await.unwrap();

        match store.begin_commit(&id).await.unwrap() {
            CommitState::AlreadyCommitted(cached) => assert_eq!(cached, result),
            other => panic!("expected AlreadyCommitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_resume_after_crash() {
        let (_tmp, store) = store().await;
        let id = store.create().await.unwrap();
        match store.begin_commit(&id).await.unwrap() {
            CommitState::Started => {}
            other => panic!("unexpected {other:?}"),
        }
        // Simulated restart: begin again without finishing.
        match store.begin_commit(&id).await.unwrap() {
            CommitState::Resumed => {}
            other => panic!("expected Resumed, got {other:?}"),
        }
        assert_eq!(store.committing_sessions().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_committing_sessions_empty_without_root() {
        let (_tmp, store) = store().await;
        assert!(store.committing_sessions().await.unwrap().is_empty());
    }
}
