//! Structure-aware document splitting.
//!
//! Policy, applied after any format-specific conversion to
//! markdown-like text:
//! - at or under `max_tokens` the document stays one file;
//! - otherwise it splits at the highest heading level that yields more
//!   than one section;
//! - consecutive sections whose combined size stays under `min_tokens`
//!   merge greedily left-to-right;
//! - any section still over `max_tokens` recurses into a subdirectory;
//! - documents without headings fall back to paragraph packing.
//!
//! Token counting defaults to the deterministic `chars / 4` estimate so
//! splits reproduce across machines; the counter is pluggable.

use regex::Regex;
use std::collections::HashSet;

/// Pluggable token counter.
pub type TokenCounter = fn(&str) -> usize;

/// Deterministic default: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A node of the split result: the contents of the document root
/// directory before it is written to the scratch tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitNode {
    File { name: String, content: String },
    Dir { name: String, children: Vec<SplitNode> },
}

impl SplitNode {
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } => name,
            Self::Dir { name, .. } => name,
        }
    }
}

/// Name of the single file emitted for unsplit documents.
pub const SINGLE_FILE_NAME: &str = "content.md";

#[derive(Debug, Clone)]
struct Section {
    title: String,
    body: String,
}

/// Structure-aware splitter.
pub struct Splitter {
    max_tokens: usize,
    min_tokens: usize,
    counter: TokenCounter,
    heading_re: Regex,
    fence_re: Regex,
}

impl Splitter {
    pub fn new(max_tokens: usize, min_tokens: usize) -> Self {
        Self::with_counter(max_tokens, min_tokens, estimate_tokens)
    }

    pub fn with_counter(max_tokens: usize, min_tokens: usize, counter: TokenCounter) -> Self {
        Self {
            max_tokens,
            min_tokens,
            counter,
            heading_re: Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap(),
            fence_re: Regex::new(r"(?s)```.*?(```|\z)").unwrap(),
        }
    }

    /// Split a whole document into the children of its root directory.
    pub fn split_document(&self, content: &str) -> Vec<SplitNode> {
        if (self.counter)(content) <= self.max_tokens {
            return vec![SplitNode::File {
                name: SINGLE_FILE_NAME.into(),
                content: content.to_string(),
            }];
        }
        self.split_oversized(content, 0)
    }

    fn split_oversized(&self, content: &str, level_floor: usize) -> Vec<SplitNode> {
        let sections = self.sectionise(content, level_floor);
        match sections {
            Some((level, sections)) if sections.len() > 1 => {
                let merged = self.merge_small(sections);
                let mut used = HashSet::new();
                merged
                    .into_iter()
                    .map(|s| self.emit_section(s, level, &mut used))
                    .collect()
            }
            _ => self.paragraph_pack(content),
        }
    }

    /// Find the highest heading level (fewest `#`) strictly below
    /// `level_floor` that produces more than one section.
    fn sectionise(&self, content: &str, level_floor: usize) -> Option<(usize, Vec<Section>)> {
        let headings = self.find_headings(content);
        let mut levels: Vec<usize> = headings
            .iter()
            .map(|h| h.level)
            .filter(|&l| l > level_floor)
            .collect();
        levels.sort_unstable();
        levels.dedup();

        for level in levels {
            let marks: Vec<&Heading> = headings.iter().filter(|h| h.level == level).collect();
            let mut sections = Vec::new();
            let first_start = marks[0].start;
            let preamble = content[..first_start].trim();
            if !preamble.is_empty() {
                sections.push(Section { title: "intro".into(), body: preamble.to_string() });
            }
            for (i, mark) in marks.iter().enumerate() {
                let end = marks.get(i + 1).map(|m| m.start).unwrap_or(content.len());
                sections.push(Section {
                    title: mark.title.clone(),
                    body: content[mark.start..end].trim().to_string(),
                });
            }
            if sections.len() > 1 {
                return Some((level, sections));
            }
        }
        None
    }

    /// Greedy left-to-right merge of undersized neighbours.
    fn merge_small(&self, sections: Vec<Section>) -> Vec<Section> {
        let mut out: Vec<Section> = Vec::new();
        let mut iter = sections.into_iter();
        let mut acc = match iter.next() {
            Some(s) => s,
            None => return out,
        };
        for next in iter {
            let combined = (self.counter)(&acc.body) + (self.counter)(&next.body);
            if combined < self.min_tokens {
                acc.body.push_str("\n\n");
                acc.body.push_str(&next.body);
            } else {
                out.push(acc);
                acc = next;
            }
        }
        out.push(acc);
        out
    }

    fn emit_section(&self, section: Section, level: usize, used: &mut HashSet<String>) -> SplitNode {
        let base = slugify(&section.title);
        let name = dedupe_name(&base, used);
        if (self.counter)(&section.body) > self.max_tokens {
            SplitNode::Dir {
                name,
                children: self.split_oversized(&section.body, level),
            }
        } else {
            SplitNode::File {
                name: format!("{name}.md"),
                content: section.body,
            }
        }
    }

    /// Headerless fallback: pack paragraphs into parts within the size
    /// cap. A single paragraph over the cap splits at character
    /// boundaries.
    fn paragraph_pack(&self, content: &str) -> Vec<SplitNode> {
        let max_chars = self.max_tokens * 4;
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        for para in content.split("\n\n") {
            let para = para.trim();
            if para.is_empty() {
                continue;
            }
            if (self.counter)(para) > self.max_tokens {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                let chars: Vec<char> = para.chars().collect();
                for chunk in chars.chunks(max_chars) {
                    parts.push(chunk.iter().collect());
                }
                continue;
            }
            let candidate_tokens = (self.counter)(&current) + (self.counter)(para);
            if candidate_tokens > self.max_tokens && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        if parts.is_empty() {
            parts.push(content.to_string());
        }
        parts
            .into_iter()
            .enumerate()
            .map(|(i, content)| SplitNode::File {
                name: format!("part-{:02}.md", i + 1),
                content,
            })
            .collect()
    }

    /// Headings outside fenced code blocks.
    fn find_headings(&self, content: &str) -> Vec<Heading> {
        let fences: Vec<(usize, usize)> = self
            .fence_re
            .find_iter(content)
            .map(|m| (m.start(), m.end()))
            .collect();
        self.heading_re
            .captures_iter(content)
            .filter_map(|cap| {
                let m = cap.get(0)?;
                let pos = m.start();
                if fences.iter().any(|&(s, e)| pos >= s && pos < e) {
                    return None;
                }
                Some(Heading {
                    start: pos,
                    level: cap[1].len(),
                    title: cap[2].trim().to_string(),
                })
            })
            .collect()
    }
}

struct Heading {
    start: usize,
    level: usize,
    title: String,
}

/// Turn a heading title into a filesystem-safe name.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "section".into()
    } else {
        slug
    }
}

fn dedupe_name(base: &str, used: &mut HashSet<String>) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
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
