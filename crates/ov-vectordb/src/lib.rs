//! Vector database layer of the OpenViking context engine.
//!
//! Two local index backends (exact flat scan and an HNSW graph) behind
//! one trait, wrapped by a URI-keyed store that owns payloads and the
//! `(uri, source)` registry.

pub mod distance;
pub mod hnsw;
pub mod index;
pub mod store;

pub use hnsw::HnswIndex;
pub use index::{FlatIndex, VectorIndex};
pub use store::{ScoredPoint, SearchOptions, VectorStore};

use ov_core::error::Result;
use std::path::PathBuf;

/// Build a store from the configured backend name.
pub async fn open_store(
    backend: &str,
    dimension: usize,
    persist_dir: Option<PathBuf>,
) -> Result<VectorStore> {
    let index: Box<dyn VectorIndex> = match backend {
        "flat" => Box::new(FlatIndex::new(dimension)),
        _ => Box::new(HnswIndex::new(dimension)),
    };
    match persist_dir {
        Some(dir) => VectorStore::with_persistence(index, dir).await,
        None => Ok(VectorStore::new(index)),
    }
}
