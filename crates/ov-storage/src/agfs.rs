//! The agent filesystem contract: a uniform hierarchical, object-
//! addressed store under the `viking://` namespace, pluggable across
//! backends.
//!
//! Well-known per-directory artefacts: `.abstract.md` (L0) and
//! `.overview.md` (L1). Dot-prefixed entries are hidden from listings
//! by default and never count as semantic children.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ov_core::error::{OvError, Result};
use ov_core::uri::VikingUri;
use serde::{Deserialize, Serialize};

/// Well-known L0 file name.
pub const ABSTRACT_FILE: &str = ".abstract.md";
/// Well-known L1 file name.
pub const OVERVIEW_FILE: &str = ".overview.md";
/// Marker present while a directory move is in flight.
pub const MOVING_MARKER: &str = ".moving";
/// Marker left behind when a failed promote could not be rolled back.
pub const PENDING_CLEANUP_MARKER: &str = ".pending_cleanup";

/// Options for [`Agfs::write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fail with `ALREADY_EXISTS` instead of overwriting.
    pub create_only: bool,
}

/// Options for [`Agfs::ls`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LsOptions {
    pub recursive: bool,
    pub include_hidden: bool,
    /// Stop after this many entries.
    pub node_limit: Option<usize>,
}

/// Options for [`Agfs::tree`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeOptions {
    /// Maximum depth below the root (`None` = unlimited).
    pub depth: Option<usize>,
    pub node_limit: Option<usize>,
}

/// One listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub uri: VikingUri,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// The directory's own L0 abstract, when already processed, so one
    /// listing call is enough to navigate.
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
}

/// Result of [`Agfs::stat`]. Absence is a value, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfo {
    pub exists: bool,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

impl StatInfo {
    pub fn missing() -> Self {
        Self { exists: false, is_dir: false, size: 0, mtime: None }
    }
}

/// A node of a hierarchical [`Agfs::tree`] listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub entry: Entry,
    pub children: Vec<TreeNode>,
}

/// The filesystem contract all backends implement.
///
/// Reads are read-your-writes within the process; writes are atomic at
/// node granularity (readers see old or new content, never partial).
#[async_trait]
pub trait Agfs: Send + Sync {
    /// Raw content of a file node.
    async fn read(&self, uri: &VikingUri) -> Result<Vec<u8>>;

    /// Write a file node. The parent directory must already exist.
    async fn write(&self, uri: &VikingUri, data: &[u8], opts: WriteOptions) -> Result<()>;

    /// Append to a file node, creating it if absent.
    async fn append(&self, uri: &VikingUri, data: &[u8]) -> Result<()>;

    /// Create a directory (and parents).
    async fn mkdir(&self, uri: &VikingUri) -> Result<()>;

    /// List children, ordered lexicographically by URI.
    async fn ls(&self, uri: &VikingUri, opts: LsOptions) -> Result<Vec<Entry>>;

    /// Node metadata; `exists: false` rather than an error for absent
    /// URIs.
    async fn stat(&self, uri: &VikingUri) -> Result<StatInfo>;

    /// Hierarchical listing rooted at `uri`.
    async fn tree(&self, uri: &VikingUri, opts: TreeOptions) -> Result<TreeNode>;

    /// Delete a node. Directories require `recursive` unless empty.
    async fn delete(&self, uri: &VikingUri, recursive: bool) -> Result<()>;

    /// Move a node. Single-file moves are atomic; directory moves are
    /// copy-then-delete behind a [`MOVING_MARKER`] readers can consult.
    async fn mv(&self, src: &VikingUri, dst: &VikingUri) -> Result<()>;

    async fn exists(&self, uri: &VikingUri) -> Result<bool> {
        Ok(self.stat(uri).await?.exists)
    }

    async fn read_string(&self, uri: &VikingUri) -> Result<String> {
        let bytes = self.read(uri).await?;
        String::from_utf8(bytes)
            .map_err(|_| OvError::invalid(format!("not valid UTF-8: {uri}")))
    }

    async fn write_string(&self, uri: &VikingUri, content: &str, opts: WriteOptions) -> Result<()> {
        self.write(uri, content.as_bytes(), opts).await
    }

    /// The directory's L0 abstract, or `NOT_PROCESSED`.
    async fn abstract_of(&self, dir: &VikingUri) -> Result<String> {
        self.read_artefact(dir, ABSTRACT_FILE).await
    }

    /// The directory's L1 overview, or `NOT_PROCESSED`.
    async fn overview_of(&self, dir: &VikingUri) -> Result<String> {
        self.read_artefact(dir, OVERVIEW_FILE).await
    }

    /// Internal: read a well-known artefact, mapping absence to
    /// `NOT_PROCESSED` when the directory itself exists.
    async fn read_artefact(&self, dir: &VikingUri, name: &str) -> Result<String> {
        let stat = self.stat(dir).await?;
        if !stat.exists {
            return Err(OvError::not_found(dir.as_str()));
        }
        if !stat.is_dir {
            return Err(OvError::invalid(format!("not a directory: {dir}")));
        }
        let artefact = dir.join(name)?;
        match self.read_string(&artefact).await {
            Ok(text) => Ok(text),
            Err(OvError::NotFound(_)) => Err(OvError::NotProcessed(dir.as_str().to_string())),
            Err(e) => Err(e),
        }
    }
}
