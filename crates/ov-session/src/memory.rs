//! Memory distillation from committed sessions.
//!
//! The summariser is asked to distil, not transcribe: a conversation
//! becomes categorised memory candidates, written as markdown
//! leaves in a scratch tree for the tree builder to promote under
//! `viking://user/memories/`.

use crate::session::Message;
use ov_core::capability::Summarizer;
use ov_core::error::Result;
use ov_core::types::MemoryCategory;
use ov_core::uri::{new_scratch_root, VikingUri};
use ov_storage::{Agfs, WriteOptions};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// One distilled memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCandidate {
    pub category: MemoryCategory,
    pub text: String,
}

#[derive(Deserialize)]
struct RawCandidate {
    category: String,
    text: String,
}

const DISTIL_PROMPT: &str = "Distil durable memories from the conversation below. \
Do not transcribe; extract only facts worth remembering across sessions. \
Respond with a JSON array of objects {\"category\": one of \
\"preferences\" | \"facts\" | \"events\" | \"cases\", \"text\": one self-contained \
sentence}. Respond with [] when nothing is worth keeping.\n\nConversation:\n";

/// Distils conversations into memory candidates.
pub struct MemoryExtractor {
    summarizer: Arc<dyn Summarizer>,
}

impl MemoryExtractor {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Ask the summariser for candidates. An empty result is a valid
    /// outcome; so is an unparseable response (logged, treated as
    /// empty).
    pub async fn distil(&self, messages: &[Message]) -> Result<Vec<MemoryCandidate>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut prompt = String::from(DISTIL_PROMPT);
        for message in messages {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        let response = self.summarizer.summarise(&prompt, None).await?;
        Ok(parse_candidates(&response))
    }

    /// Write candidates as a scratch tree
    /// `temp/<uuid>/session-<id>/<category>/<slug>.md`; `None` when
    /// there is nothing to write.
    pub async fn write_candidates(
        &self,
        agfs: &Arc<dyn Agfs>,
        session_id: &str,
        candidates: &[MemoryCandidate],
    ) -> Result<Option<VikingUri>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let scratch = new_scratch_root();
        let doc_root = scratch.join(&format!("session-{session_id}"))?;
        agfs.mkdir(&doc_root).await?;

        let extracted_at = chrono::Utc::now().to_rfc3339();
        let mut used: HashSet<String> = HashSet::new();
        for candidate in candidates {
            let dir = doc_root.join(candidate.category.as_str())?;
            agfs.mkdir(&dir).await?;
            let slug = unique_slug(&candidate.text, &mut used);
            let body = format!(
                "---\nsession_id: {session_id}\nextracted_at: {extracted_at}\ncategory: {}\n---\n\n{}\n",
                candidate.category, candidate.text
            );
            agfs.write_string(&dir.join(&format!("{slug}.md"))?, &body, WriteOptions::default())
                .await?;
        }
        Ok(Some(scratch))
    }
}

fn parse_candidates(response: &str) -> Vec<MemoryCandidate> {
    let Some(start) = response.find('[') else {
        tracing::warn!("distillation response carries no JSON array");
        return Vec::new();
    };
    let Some(end) = response.rfind(']') else {
        tracing::warn!("distillation response carries no JSON array");
        return Vec::new();
    };
    let raw: Vec<RawCandidate> = match serde_json::from_str(&response[start..=end]) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable distillation response");
            return Vec::new();
        }
    };
    raw.into_iter()
        .filter_map(|c| {
            let text = c.text.trim().to_string();
            if text.is_empty() {
                return None;
            }
            match c.category.parse::<MemoryCategory>() {
                Ok(category) => Some(MemoryCandidate { category, text }),
                Err(_) => {
                    tracing::warn!(category = %c.category, "dropping candidate with unknown category");
                    None
                }
            }
        })
        .collect()
}

/// Slug from the leading words of the memory text.
fn unique_slug(text: &str, used: &mut HashSet<String>) -> String {
    let head: String = text.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
    let mut base = crate::slugify_text(&head);
    base.truncate(48);
    let base = base.trim_end_matches('-').to_string();
    if used.insert(base.clone()) {
        return base;
    }
    let mut i = 2;
    loop {
        let candidate = format!("{base}-{i}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use async_trait::async_trait;
    use ov_storage::{LocalAgfs, LsOptions};
    use tempfile::TempDir;

    struct CannedSummarizer(String);

    #[async_trait]
    impl Summarizer for CannedSummarizer {
        async fn summarise(&self, _prompt: &str, _images: Option<&[Vec<u8>]>) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::new(Role::User, "I live in Berlin."),
            Message::new(Role::Assistant, "Good to know!"),
        ]
    }

    #[test]
    fn test_parse_candidates_plain_array() {
        let parsed = parse_candidates(
            r#"[{"category": "facts", "text": "User lives in Berlin."},
                {"category": "preferences", "text": "User prefers vim."}]"#,
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].category, MemoryCategory::Facts);
        assert_eq!(parsed[1].category, MemoryCategory::Preferences);
    }

    #[test]
    fn test_parse_candidates_with_prose_wrapper() {
        let parsed = parse_candidates(
            "Here you go:\n[{\"category\": \"events\", \"text\": \"User moved in 2024.\"}]\nDone.",
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].category, MemoryCategory::Events);
    }

    #[test]
    fn test_parse_candidates_tolerates_garbage() {
        assert!(parse_candidates("no json here").is_empty());
        assert!(parse_candidates("[{broken").is_empty());
        assert!(parse_candidates("[]").is_empty());
    }

    #[test]
    fn test_parse_candidates_drops_unknown_category_and_empty_text() {
        let parsed = parse_candidates(
            r#"[{"category": "moods", "text": "grumpy"},
                {"category": "facts", "text": "   "},
                {"category": "facts", "text": "Keeps cats."}]"#,
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].text, "Keeps cats.");
    }

    #[tokio::test]
    async fn test_distil_empty_conversation() {
        let extractor = MemoryExtractor::new(Arc::new(CannedSummarizer("[]".into())));
        assert!(extractor.distil(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distil_parses_response() {
        let extractor = MemoryExtractor::new(Arc::new(CannedSummarizer(
            r#"[{"category": "facts", "text": "User lives in Berlin."}]"#.into(),
        )));
        let candidates = extractor.distil(&messages()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].text, "User lives in Berlin.");
    }

    #[tokio::test]
    async fn test_write_candidates_layout() {
        let tmp = TempDir::new().unwrap();
        let agfs: Arc<dyn Agfs> =
            Arc::new(LocalAgfs::open(tmp.path().join("agfs")).await.unwrap());
        let extractor = MemoryExtractor::new(Arc::new(CannedSummarizer(String::new())));
        let candidates = vec![
            MemoryCandidate { category: MemoryCategory::Facts, text: "User lives in Berlin.".into() },
            MemoryCandidate { category: MemoryCategory::Preferences, text: "User prefers vim.".into() },
        ];
        let scratch = extractor
            .write_candidates(&agfs, "s1", &candidates)
            .await
            .unwrap()
            .unwrap();

        let doc_root = scratch.join("session-s1").unwrap();
        let dirs = agfs.ls(&doc_root, LsOptions::default()).await.unwrap();
        let names: Vec<_> = dirs.iter().map(|e| e.uri.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["facts", "preferences"]);

        let facts = agfs
            .ls(&doc_root.join("facts").unwrap(), LsOptions::default())
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        let body = agfs.read_string(&facts[0].uri).await.unwrap();
        assert!(body.starts_with("---\n"));
        assert!(body.contains("session_id: s1"));
        assert!(body.contains("category: facts"));
        assert!(body.contains("extracted_at: "));
        assert!(body.trim_end().ends_with("User lives in Berlin."));
    }

    #[tokio::test]
    async fn test_write_candidates_empty_is_none() {
        let tmp = TempDir::new().unwrap();
        let agfs: Arc<dyn Agfs> =
            Arc::new(LocalAgfs::open(tmp.path().join("agfs")).await.unwrap());
        let extractor = MemoryExtractor::new(Arc::new(CannedSummarizer(String::new())));
        assert!(extractor.write_candidates(&agfs, "s1", &[]).await.unwrap().is_none());
    }

    #[test]
    fn test_unique_slug() {
        let mut used = HashSet::new();
        let a = unique_slug("User lives in Berlin.", &mut used);
        assert_eq!(a, "user-lives-in-berlin");
        let b = unique_slug("User lives in Berlin.", &mut used);
        assert_eq!(b, "user-lives-in-berlin-2");
    }
}
