//! Parser selection and dispatch.
//!
//! Parsers are consulted in registration order; the first one claiming
//! an input (by extension, URL scheme, or magic-byte sniff) wins.
//! Every parser produces a canonical scratch tree with exactly one
//! top-level directory under a fresh `viking://temp/<uuid>/` root.

use crate::splitter::SplitNode;
use async_trait::async_trait;
use ov_core::config::ParserConfig;
use ov_core::error::{OvError, Result};
use ov_core::uri::{new_scratch_root, VikingUri};
use ov_storage::{Agfs, WriteOptions};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// What every parser returns.
#[derive(Debug, Clone)]
pub struct ParseResult {
    /// Scratch root holding the document tree.
    pub temp_dir_uri: VikingUri,
    pub source_format: String,
    pub parser_name: String,
    pub parse_duration_ms: u64,
    pub meta: Value,
}

/// One input handed to a parser.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    /// File name or URL the input came from.
    pub name: String,
    pub bytes: Vec<u8>,
    /// Directory of the source file, for resolving relative assets.
    pub origin_dir: Option<PathBuf>,
}

impl ParseRequest {
    /// Extension of the input name, lower-cased, without the dot.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Stem of the input name, slug-safe, used as the document root
    /// directory name.
    pub fn doc_root_name(&self) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        crate::splitter::slugify(stem)
    }
}

/// Shared services a parser needs.
#[derive(Clone)]
pub struct ParseContext {
    pub agfs: Arc<dyn Agfs>,
    pub config: ParserConfig,
}

/// A format parser.
#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this parser claims the input. `name` may be a file name
    /// or a URL; `bytes` are available for magic sniffing.
    fn can_handle(&self, name: &str, bytes: &[u8]) -> bool;

    /// Produce the scratch tree.
    async fn parse(&self, req: &ParseRequest, ctx: &ParseContext) -> Result<ParseResult>;
}

/// Ordered parser registry.
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: Vec::new() }
    }

    /// Registry with the built-in parser set: markdown, code, then the
    /// plain-text sniffing fallback.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::markdown::MarkdownParser::new()));
        registry.register(Arc::new(crate::code::CodeParser::new()));
        registry.register(Arc::new(crate::text::TextParser::new()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Parse a local path or URL.
    pub async fn parse_input(&self, path_or_url: &str, ctx: &ParseContext) -> Result<ParseResult> {
        if let Some(scheme) = url_scheme(path_or_url) {
            // No bytes yet; a parser claiming the scheme fetches itself.
            let req = ParseRequest {
                name: path_or_url.to_string(),
                bytes: Vec::new(),
                origin_dir: None,
            };
            for parser in &self.parsers {
                if parser.can_handle(&req.name, &req.bytes) {
                    return parser.parse(&req, ctx).await;
                }
            }
            return Err(OvError::UnsupportedFormat(format!(
                "no parser registered for scheme {scheme}: {path_or_url}"
            )));
        }

        let path = Path::new(path_or_url);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => OvError::not_found(path_or_url),
                _ => OvError::dependency(format!("read {path_or_url}: {e}")),
            })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path_or_url)
            .to_string();
        let req = ParseRequest {
            name,
            bytes,
            origin_dir: path.parent().map(|p| p.to_path_buf()),
        };
        self.dispatch(&req, ctx).await
    }

    /// Parse in-memory bytes under a given name.
    pub async fn parse_bytes(
        &self,
        name: &str,
        bytes: Vec<u8>,
        ctx: &ParseContext,
    ) -> Result<ParseResult> {
        let req = ParseRequest { name: name.to_string(), bytes, origin_dir: None };
        self.dispatch(&req, ctx).await
    }

    async fn dispatch(&self, req: &ParseRequest, ctx: &ParseContext) -> Result<ParseResult> {
        for parser in &self.parsers {
            if parser.can_handle(&req.name, &req.bytes) {
                tracing::debug!(parser = parser.name(), input = %req.name, "parser selected");
                return parser.parse(req, ctx).await;
            }
        }
        Err(OvError::UnsupportedFormat(format!("no parser matches input: {}", req.name)))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn url_scheme(input: &str) -> Option<&str> {
    let (scheme, rest) = input.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
        .then_some(scheme)
}

/// Write a document root plus its split children into a fresh scratch
/// root; returns the scratch root URI.
pub async fn write_scratch_tree(
    agfs: &Arc<dyn Agfs>,
    doc_root_name: &str,
    nodes: &[SplitNode],
) -> Result<VikingUri> {
    let scratch = new_scratch_root();
    let doc_root = scratch.join(doc_root_name)?;
    agfs.mkdir(&doc_root).await?;
    write_nodes(agfs, &doc_root, nodes).await?;
    Ok(scratch)
}

async fn write_nodes(agfs: &Arc<dyn Agfs>, dir: &VikingUri, nodes: &[SplitNode]) -> Result<()> {
    // Iterative so the recursion depth of a pathological document does
    // not become stack depth.
    let mut stack: Vec<(VikingUri, &SplitNode)> = nodes.iter().map(|n| (dir.clone(), n)).collect();
    while let Some((parent, node)) = stack.pop() {
        match node {
            SplitNode::File { name, content } => {
                let uri = parent.join(name)?;
                agfs.write_string(&uri, content, WriteOptions::default()).await?;
            }
            SplitNode::Dir { name, children } => {
                let sub = parent.join(name)?;
                agfs.mkdir(&sub).await?;
                for child in children {
                    stack.push((sub.clone(), child));
                }
            }
        }
    }
    Ok(())
}

/// Time a parse body and assemble the [`ParseResult`].
pub async fn timed_parse<F, Fut>(
    parser_name: &'static str,
    source_format: &str,
    body: F,
) -> Result<ParseResult>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(VikingUri, Value)>>,
{
    let started = Instant::now();
    let (temp_dir_uri, meta) = body().await?;
    Ok(ParseResult {
        temp_dir_uri,
        source_format: source_format.to_string(),
        parser_name: parser_name.to_string(),
        parse_duration_ms: started.elapsed().as_millis() as u64,
        meta,
    })
}
