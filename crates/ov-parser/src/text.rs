//! Plain-text parser and UTF-8 sniffing fallback.
//!
//! Registered last: it claims `.txt` by extension and any input whose
//! bytes look like text, so unknown-but-textual formats still ingest.

use crate::registry::{timed_parse, write_scratch_tree, ParseContext, ParseRequest, ParseResult, Parser};
use crate::splitter::Splitter;
use async_trait::async_trait;
use ov_core::error::Result;
use serde_json::json;
use std::path::Path;

const EXTENSIONS: [&str; 4] = ["txt", "text", "log", "rst"];

/// Plain-text format parser.
pub struct TextParser;

impl TextParser {
    pub fn new() -> Self {
        Self
    }

    /// Magic sniff: valid UTF-8 with no NUL bytes in the prefix.
    fn looks_like_text(bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let prefix = &bytes[..bytes.len().min(4096)];
        !prefix.contains(&0) && std::str::from_utf8(prefix).is_ok()
    }
}

#[async_trait]
impl Parser for TextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_handle(&self, name: &str, bytes: &[u8]) -> bool {
        let by_extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        by_extension || (!bytes.is_empty() && Self::looks_like_text(bytes))
    }

    async fn parse(&self, req: &ParseRequest, ctx: &ParseContext) -> Result<ParseResult> {
        let content = String::from_utf8_lossy(&req.bytes).into_owned();
        let splitter = Splitter::new(ctx.config.split_max_tokens, ctx.config.merge_min_tokens);
        let nodes = splitter.split_document(&content);
        let doc_root_name = req.doc_root_name();
        let section_count = nodes.len();

        timed_parse("text", "text", || async {
            let scratch = write_scratch_tree(&ctx.agfs, &doc_root_name, &nodes).await?;
            Ok((scratch, json!({ "sections": section_count })))
        })
        .await
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}
