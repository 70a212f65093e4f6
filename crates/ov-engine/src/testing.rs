//! Deterministic in-process capability doubles.
//!
//! No test touches the network: embedding is a hashed bag-of-words
//! projection (token overlap approximates semantic similarity), and
//! summarisation is a scripted sketch of the prompts the workers send.

use async_trait::async_trait;
use ov_core::capability::{Embedder, Summarizer};
use ov_core::error::{OvError, Result};
use ov_core::types::Modality;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic bag-of-words embedder: each lower-cased token hashes
/// to one dimension, counts are accumulated and L2-normalised. Texts
/// sharing tokens land close in cosine space.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            v[fnv1a(token) as usize % self.dimension] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String], _modality: Modality) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Scripted summariser mirroring the worker prompts: overview prompts
/// get a purpose paragraph naming every child, batch prompts get
/// `### name` sections, distillation prompts turn user lines into
/// `facts` candidates. Calls are recorded for assertions; an optional
/// artificial delay simulates slow models.
pub struct SketchSummarizer {
    pub delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl SketchSummarizer {
    pub fn new() -> Self {
        Self { delay: None, calls: Mutex::new(Vec::new()) }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), calls: Mutex::new(Vec::new()) }
    }

    /// Every prompt received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn sketch(prompt: &str) -> String {
        if prompt.starts_with("Write a structured overview") {
            return Self::sketch_overview(prompt);
        }
        if prompt.starts_with("Distil durable memories") {
            return Self::sketch_distillation(prompt);
        }
        if let Some(names) = Self::batch_names(prompt) {
            return names
                .into_iter()
                .map(|(name, body)| format!("### {name}\nCovers {}.", head_words(&body, 24)))
                .collect::<Vec<_>>()
                .join("\n\n");
        }
        // Single-file summary: echo the leading content.
        format!("Covers {}.", head_words(prompt, 32))
    }

    fn sketch_overview(prompt: &str) -> String {
        let mut names = Vec::new();
        let mut lines = Vec::new();
        for line in prompt.lines().filter(|l| l.starts_with("- ")) {
            if let Some((head, abstract_text)) = line[2..].split_once(':') {
                let name = head.split_whitespace().next().unwrap_or("child");
                names.push(name.to_string());
                lines.push(format!("- {name}: {}", head_words(abstract_text, 16)));
            }
        }
        let dir = prompt
            .split('\'')
            .nth(1)
            .unwrap_or("directory");
        format!(
            "Contents of {dir}: {}. {}\n\n{}",
            names.join(", "),
            lines
                .iter()
                .map(|l| head_words(l, 10))
                .collect::<Vec<_>>()
                .join(" "),
            lines.join("\n")
        )
    }

    fn sketch_distillation(prompt: &str) -> String {
        let mut items = Vec::new();
        for line in prompt.lines() {
            if let Some(content) = line.strip_prefix("user: ") {
                let content = content.trim();
                if !content.is_empty() {
                    items.push(serde_json::json!({ "category": "facts", "text": content }));
                }
            }
        }
        serde_json::to_string(&items).unwrap_or_else(|_| "[]".into())
    }

    /// Parse `### name` sections out of a batch prompt.
    fn batch_names(prompt: &str) -> Option<Vec<(String, String)>> {
        if !prompt.contains("\n### ") {
            return None;
        }
        let mut out = Vec::new();
        for chunk in prompt.split("\n### ").skip(1) {
            let (name, body) = chunk.split_once('\n').unwrap_or((chunk, ""));
            out.push((name.trim().to_string(), body.to_string()));
        }
        (!out.is_empty()).then_some(out)
    }
}

impl Default for SketchSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for SketchSummarizer {
    async fn summarise(&self, prompt: &str, _images: Option<&[Vec<u8>]>) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(prompt.to_string());
        Ok(Self::sketch(prompt))
    }
}

/// Summariser that fails transiently `failures` times, then delegates
/// to [`SketchSummarizer`]. Exercises the backoff path.
pub struct FlakySummarizer {
    remaining: AtomicU32,
    inner: SketchSummarizer,
}

impl FlakySummarizer {
    pub fn new(failures: u32) -> Self {
        Self { remaining: AtomicU32::new(failures), inner: SketchSummarizer::new() }
    }
}

#[async_trait]
impl Summarizer for FlakySummarizer {
    async fn summarise(&self, prompt: &str, images: Option<&[Vec<u8>]>) -> Result<String> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(OvError::dependency("simulated transient failure"));
        }
        self.inner.summarise(prompt, images).await
    }
}

fn head_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}
