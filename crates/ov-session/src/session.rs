//! Session records and messages.

use chrono::{DateTime, Utc};
use ov_core::error::{OvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = OvError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(OvError::invalid(format!("unknown role: {s}"))),
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), ts: Utc::now() }
    }

    /// One JSONL line, newline included.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_jsonl(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Session lifecycle. `Committed` and `Deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Committing,
    Committed,
}

/// Outcome of a commit, cached for idempotent re-commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub session_id: String,
    /// Root the distilled memories landed under; empty when nothing
    /// was extracted.
    pub target_uri: Option<String>,
    pub extracted: usize,
}

/// Persisted session state (`state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_result: Option<CommitResult>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: SessionState::Open,
            created_at: now,
            updated_at: now,
            commit_result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), r#""assistant""#);
        let r: Role = serde_json::from_str(r#""user""#).unwrap();
        assert_eq!(r, Role::User);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("system".parse::<Role>().unwrap(), Role::System);
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn test_message_jsonl_roundtrip() {
        let msg = Message::new(Role::User, "I live in Berlin.");
        let line = msg.to_jsonl().unwrap();
        assert!(line.ends_with('\n'));
        let back = Message::from_jsonl(line.trim_end()).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.content, "I live in Berlin.");
        assert_eq!(back.ts, msg.ts);
    }

    #[test]
    fn test_message_jsonl_rejects_garbage() {
        assert!(Message::from_jsonl("{not json").is_err());
    }

    #[test]
    fn test_record_starts_open() {
        let rec = SessionRecord::new("s1");
        assert_eq!(rec.state, SessionState::Open);
        assert!(rec.commit_result.is_none());
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&SessionState::Committing).unwrap(), r#""committing""#);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let mut rec = SessionRecord::new("s2");
        rec.state = SessionState::Committed;
        rec.commit_result = Some(CommitResult {
            session_id: "s2".into(),
            target_uri: Some("viking://user/memories/session-s2".into()),
            extracted: 3,
        });
        let json = serde_json::to_string(&rec).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, SessionState::Committed);
        assert_eq!(back.commit_result.unwrap().extracted, 3);
    }
}
