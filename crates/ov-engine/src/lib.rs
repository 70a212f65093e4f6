//! The OpenViking context engine: ingest pipeline, semantic tree,
//! vector coupling, and hierarchical retrieval over AGFS.

pub mod builder;
pub mod embedding;
pub mod engine;
pub mod namespace;
pub mod queue;
pub mod response;
pub mod retriever;
pub mod semantic;
pub mod testing;

pub use builder::{PromoteOutcome, TreeBuilder};
pub use embedding::EmbeddingWorker;
pub use engine::{
    AddResourceOptions, AddResourceOutcome, ContextEngine, DrainReport, GrepMatch, ReadyReport,
};
pub use queue::{JobQueue, JobRecord, QueueCounts};
pub use retriever::{FindHit, FindOptions, HierarchicalRetriever};
pub use semantic::SemanticWorker;
