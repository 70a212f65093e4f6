//! Markdown parser: frontmatter extraction, structure-aware splitting,
//! and relative-asset relocation into the scratch tree.

use crate::registry::{timed_parse, write_scratch_tree, ParseContext, ParseRequest, ParseResult, Parser};
use crate::splitter::{SplitNode, Splitter};
use async_trait::async_trait;
use ov_core::error::Result;
use ov_storage::WriteOptions;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 4] = ["md", "markdown", "mdown", "mkd"];

/// Markdown format parser.
pub struct MarkdownParser {
    frontmatter_re: Regex,
    image_re: Regex,
}

impl MarkdownParser {
    pub fn new() -> Self {
        Self {
            frontmatter_re: Regex::new(r"(?s)\A---\n(.*?)\n---\n").unwrap(),
            image_re: Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").unwrap(),
        }
    }

    /// Split leading `--- ... ---` frontmatter off the body.
    pub fn extract_frontmatter<'a>(&self, content: &'a str) -> (&'a str, Option<Map<String, Value>>) {
        let Some(m) = self.frontmatter_re.captures(content) else {
            return (content, None);
        };
        let whole = m.get(0).unwrap();
        let mut fm = Map::new();
        for line in m[1].lines() {
            if let Some((k, v)) = line.split_once(':') {
                fm.insert(k.trim().to_string(), json!(v.trim()));
            }
        }
        (&content[whole.end()..], Some(fm))
    }

    /// Rewrite relative image references to sibling paths, returning
    /// the assets to copy: `(relative dir, file name, source path)`.
    fn relocate_assets(
        &self,
        nodes: &mut [SplitNode],
        origin: &Path,
    ) -> Vec<(Vec<String>, String, PathBuf)> {
        let mut assets = Vec::new();
        let mut stack: Vec<(Vec<String>, &mut SplitNode)> =
            nodes.iter_mut().map(|n| (Vec::new(), n)).collect();
        while let Some((dir, node)) = stack.pop() {
            match node {
                SplitNode::File { content, .. } => {
                    let mut replaced = content.clone();
                    for cap in self.image_re.captures_iter(content) {
                        let target = &cap[2];
                        if target.contains("://") || target.starts_with('/') {
                            continue;
                        }
                        let source = origin.join(target);
                        if !source.is_file() {
                            continue;
                        }
                        let file_name = source
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("asset")
                            .to_string();
                        let old = cap.get(0).unwrap().as_str();
                        let new = format!("![{}](./{file_name})", &cap[1]);
                        replaced = replaced.replace(old, &new);
                        assets.push((dir.clone(), file_name, source));
                    }
                    *content = replaced;
                }
                SplitNode::Dir { name, children } => {
                    let mut sub = dir.clone();
                    sub.push(name.clone());
                    for child in children.iter_mut() {
                        stack.push((sub.clone(), child));
                    }
                }
            }
        }
        assets
    }
}

#[async_trait]
impl Parser for MarkdownParser {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn can_handle(&self, name: &str, _bytes: &[u8]) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    async fn parse(&self, req: &ParseRequest, ctx: &ParseContext) -> Result<ParseResult> {
        let content = String::from_utf8_lossy(&req.bytes).into_owned();
        let (body, frontmatter) = self.extract_frontmatter(&content);

        let splitter = Splitter::new(ctx.config.split_max_tokens, ctx.config.merge_min_tokens);
        let mut nodes = splitter.split_document(body);

        let assets = match &req.origin_dir {
            Some(origin) => self.relocate_assets(&mut nodes, origin),
            None => Vec::new(),
        };

        let doc_root_name = req.doc_root_name();
        let section_count = nodes.len();
        let asset_count = assets.len();

        timed_parse("markdown", "markdown", || async {
            let scratch = write_scratch_tree(&ctx.agfs, &doc_root_name, &nodes).await?;
            let doc_root = scratch.join(&doc_root_name)?;
            for (rel_dir, file_name, source) in &assets {
                let mut dir = doc_root.clone();
                for seg in rel_dir {
                    dir = dir.join(seg)?;
                }
                let bytes = tokio::fs::read(source).await.map_err(|e| {
                    ov_core::error::OvError::dependency(format!(
                        "read asset {}: {e}",
                        source.display()
                    ))
                })?;
                ctx.agfs
                    .write(&dir.join(file_name)?, &bytes, WriteOptions::default())
                    .await?;
            }
            let meta = json!({
                "frontmatter": frontmatter.map(Value::Object).unwrap_or(Value::Null),
                "sections": section_count,
                "assets": asset_count,
            });
            Ok((scratch, meta))
        })
        .await
    }
}

impl Default for MarkdownParser {
    fn default() -> Self {
        Self::new()
    }
}
