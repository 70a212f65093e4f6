//! Code parser and structural skeleton extraction.
//!
//! Code files ingest verbatim (no section splitting); under
//! `code_summary_mode = ast` the semantic worker uses the skeleton
//! produced here as the file's abstract instead of calling the LLM.
//! Eligibility: a supported language and at least [`AST_MIN_LINES`]
//! lines; anything else falls back to LLM summarisation.

use crate::registry::{timed_parse, write_scratch_tree, ParseContext, ParseRequest, ParseResult, Parser};
use crate::splitter::SplitNode;
use async_trait::async_trait;
use ov_core::error::Result;
use regex::Regex;
use serde_json::json;
use std::path::Path;

/// Files below this line count skip the skeleton path.
pub const AST_MIN_LINES: usize = 100;

/// Languages with skeleton support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLanguage {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
    C,
    Cpp,
}

impl CodeLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }
}

const CODE_EXTENSIONS: [(&str, CodeLanguage); 13] = [
    ("py", CodeLanguage::Python),
    ("js", CodeLanguage::JavaScript),
    ("mjs", CodeLanguage::JavaScript),
    ("jsx", CodeLanguage::JavaScript),
    ("ts", CodeLanguage::TypeScript),
    ("tsx", CodeLanguage::TypeScript),
    ("rs", CodeLanguage::Rust),
    ("go", CodeLanguage::Go),
    ("java", CodeLanguage::Java),
    ("c", CodeLanguage::C),
    ("h", CodeLanguage::C),
    ("cpp", CodeLanguage::Cpp),
    ("hpp", CodeLanguage::Cpp),
];

/// Language for a file name, by extension.
pub fn language_for_name(name: &str) -> Option<CodeLanguage> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    CODE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// Skeleton for a file, when eligible (supported language, at least
/// [`AST_MIN_LINES`] lines, non-empty extraction).
pub fn skeleton_for_file(name: &str, content: &str) -> Option<String> {
    let lang = language_for_name(name)?;
    if content.lines().count() < AST_MIN_LINES {
        return None;
    }
    extract_skeleton(lang, content)
}

/// Structural skeleton: module doc first line, imports, type/class
/// declarations with bases, and function/method signatures with
/// first-line docstrings. `None` when nothing structural is found.
pub fn extract_skeleton(lang: CodeLanguage, content: &str) -> Option<String> {
    let lines = match lang {
        CodeLanguage::Python => python_skeleton(content),
        CodeLanguage::Rust => rust_skeleton(content),
        CodeLanguage::JavaScript | CodeLanguage::TypeScript => js_skeleton(content),
        CodeLanguage::Go => go_skeleton(content),
        CodeLanguage::Java => java_skeleton(content),
        CodeLanguage::C | CodeLanguage::Cpp => c_skeleton(content),
    };
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn trim_block_opener(line: &str) -> String {
    line.trim_end().trim_end_matches('{').trim_end().to_string()
}

fn python_skeleton(content: &str) -> Vec<String> {
    let def_re = Regex::new(r"^(\s*)(?:async\s+)?def\s+\w+").unwrap();
    let class_re = Regex::new(r"^class\s+\w+").unwrap();
    let mut out = Vec::new();
    let lines: Vec<&str> = content.lines().collect();

    // Module docstring first line.
    if let Some(first) = lines.iter().find(|l| !l.trim().is_empty()) {
        let t = first.trim();
        if t.starts_with("\"\"\"") || t.starts_with("'''") {
            let doc = t.trim_matches(|c| c == '"' || c == '\'').trim();
            if !doc.is_empty() {
                out.push(format!("# {doc}"));
            }
        }
    }

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            if line.trim_start() == *line {
                out.push(line.to_string());
            }
            continue;
        }
        if class_re.is_match(line) || def_re.is_match(line) {
            out.push(line.trim_end().to_string());
            // First-line docstring directly under the signature.
            if let Some(next) = lines[i + 1..].iter().find(|l| !l.trim().is_empty()) {
                let t = next.trim();
                if t.starts_with("\"\"\"") || t.starts_with("'''") {
                    let doc = t.trim_matches(|c| c == '"' || c == '\'').trim();
                    if !doc.is_empty() {
                        let indent: String =
                            line.chars().take_while(|c| c.is_whitespace()).collect();
                        out.push(format!("{indent}    \"\"\"{doc}\"\"\""));
                    }
                }
            }
        }
    }
    out
}

fn rust_skeleton(content: &str) -> Vec<String> {
    let sig_re = Regex::new(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:use\s|mod\s|struct\s|enum\s|trait\s|impl[\s<]|(?:async\s+)?fn\s|const\s|static\s|type\s)",
    )
    .unwrap();
    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if i == 0 && line.starts_with("//!") {
            out.push(line.to_string());
            continue;
        }
        if sig_re.is_match(line) {
            out.push(trim_block_opener(line));
        }
    }
    out
}

fn js_skeleton(content: &str) -> Vec<String> {
    let sig_re = Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?(?:class\s+\w+|interface\s+\w+|type\s+\w+\s*=|enum\s+\w+|(?:async\s+)?function\s*\*?\s*\w+|const\s+\w+\s*=\s*(?:async\s+)?(?:\(|function))",
    )
    .unwrap();
    let import_re = Regex::new(r#"^\s*(?:import\s|export\s+\{|const\s+\w+\s*=\s*require\()"#).unwrap();
    let mut out = Vec::new();
    for line in content.lines() {
        if import_re.is_match(line) || sig_re.is_match(line) {
            out.push(trim_block_opener(line));
        }
    }
    out
}

fn go_skeleton(content: &str) -> Vec<String> {
    let sig_re = Regex::new(r"^(?:package\s|import\s|func\s|type\s)").unwrap();
    let mut out = Vec::new();
    for line in content.lines() {
        if sig_re.is_match(line) {
            out.push(trim_block_opener(line));
        }
    }
    out
}

fn java_skeleton(content: &str) -> Vec<String> {
    let decl_re = Regex::new(
        r"^\s*(?:public\s+|private\s+|protected\s+)?(?:static\s+|final\s+|abstract\s+)*(?:class|interface|enum)\s+\w+",
    )
    .unwrap();
    let method_re = Regex::new(
        r"^\s*(?:public|private|protected)\s+(?:static\s+|final\s+|abstract\s+|synchronized\s+)*[\w<>\[\],\s]+\s+\w+\s*\([^;]*\)",
    )
    .unwrap();
    let import_re = Regex::new(r"^(?:package\s|import\s)").unwrap();
    let mut out = Vec::new();
    for line in content.lines() {
        if import_re.is_match(line) || decl_re.is_match(line) || method_re.is_match(line) {
            out.push(trim_block_opener(line));
        }
    }
    out
}

fn c_skeleton(content: &str) -> Vec<String> {
    let directive_re = Regex::new(r"^#\s*(?:include|define)\b").unwrap();
    let type_re = Regex::new(r"^\s*(?:typedef\s|struct\s+\w+|class\s+\w+|enum\s+\w+|union\s+\w+|namespace\s+\w+)").unwrap();
    let func_re = Regex::new(r"^[A-Za-z_][\w\s\*:&<>,]*\s[\w:~]+\s*\([^;{}]*\)\s*\{?\s*$").unwrap();
    let mut out = Vec::new();
    for line in content.lines() {
        if directive_re.is_match(line) || type_re.is_match(line) || func_re.is_match(line) {
            out.push(trim_block_opener(line));
        }
    }
    out
}

/// Code format parser: ingests the file verbatim as the document
/// root's single child.
pub struct CodeParser;

impl CodeParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Parser for CodeParser {
    fn name(&self) -> &'static str {
        "code"
    }

    fn can_handle(&self, name: &str, _bytes: &[u8]) -> bool {
        language_for_name(name).is_some()
    }

    async fn parse(&self, req: &ParseRequest, ctx: &ParseContext) -> Result<ParseResult> {
        let content = String::from_utf8_lossy(&req.bytes).into_owned();
        let language = language_for_name(&req.name).map(|l| l.as_str()).unwrap_or("unknown");
        let line_count = content.lines().count();
        let nodes = vec![SplitNode::File { name: req.name.clone(), content }];
        let doc_root_name = req.doc_root_name();

        timed_parse("code", "code", || async {
            let scratch = write_scratch_tree(&ctx.agfs, &doc_root_name, &nodes).await?;
            Ok((scratch, json!({ "language": language, "lines": line_count })))
        })
        .await
    }
}

impl Default for CodeParser {
    fn default() -> Self {
        Self::new()
    }
}
