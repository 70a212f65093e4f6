//! Core types for the OpenViking context engine: the `viking://`
//! namespace, error taxonomy, configuration, queue job records, request
//! tracing, and the model capability traits.

pub mod capability;
pub mod config;
pub mod error;
pub mod retry;
pub mod trace;
pub mod types;
pub mod uri;

pub use capability::{Embedder, Summarizer};
pub use config::{CodeSummaryMode, OpenVikingConfig};
pub use error::{OvError, Result};
pub use trace::RequestTrace;
pub use types::{EmbedSource, EmbeddingJob, JobKind, JobStatus, MemoryCategory, Modality, SemanticJob};
pub use uri::{IngestScope, VikingUri};
