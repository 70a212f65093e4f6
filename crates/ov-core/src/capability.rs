//! Model capabilities the engine depends on but does not implement.
//!
//! Summarisation and embedding are opaque two-method providers; the
//! engine only ever sees these traits.

use crate::error::Result;
use crate::types::Modality;
use async_trait::async_trait;

/// A summarisation capability (LLM/VLM behind one method).
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce text for a prompt, optionally grounded on images.
    async fn summarise(&self, prompt: &str, images: Option<&[Vec<u8>]>) -> Result<String>;

    /// Liveness probe for readiness checks.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }
}

/// An embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts of one modality. Must return one vector
    /// per input, in order.
    async fn embed(&self, texts: &[String], modality: Modality) -> Result<Vec<Vec<f32>>>;

    /// Liveness probe for readiness checks.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }
}
