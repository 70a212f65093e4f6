//! The `viking://` namespace: parsing, normalisation, and scope mapping.
//!
//! Two URIs are equal iff their normalised forms are byte-identical, so
//! [`VikingUri`] stores only the normalised string. Normalisation removes
//! `./` segments, collapses repeated slashes, and strips the trailing
//! slash (the bare scheme `viking://` is the root).

use crate::error::{OvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// URI scheme prefix for the whole namespace.
pub const SCHEME: &str = "viking://";

/// Maximum byte length of a whole URI.
pub const MAX_URI_BYTES: usize = 2048;

/// Maximum byte length of a single path segment.
pub const MAX_SEGMENT_BYTES: usize = 255;

/// Reserved top-level scope roots.
pub const RESERVED_ROOTS: [&str; 5] = ["resources", "user", "agent", "temp", ".system"];

/// A validated, normalised `viking://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VikingUri(String);

impl VikingUri {
    /// Parse and normalise a URI string.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| OvError::invalid(format!("URI must start with {SCHEME}: {s}")))?;

        let mut segments: Vec<&str> = Vec::new();
        for seg in rest.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            if seg == ".." {
                return Err(OvError::invalid(format!("URI segment '..' not allowed: {s}")));
            }
            if seg.contains('\0') {
                return Err(OvError::invalid(format!("URI segment contains NUL: {s}")));
            }
            if seg.len() > MAX_SEGMENT_BYTES {
                return Err(OvError::invalid(format!(
                    "URI segment exceeds {MAX_SEGMENT_BYTES} bytes: {s}"
                )));
            }
            segments.push(seg);
        }

        let normalised = if segments.is_empty() {
            SCHEME.to_string()
        } else {
            format!("{SCHEME}{}", segments.join("/"))
        };
        if normalised.len() > MAX_URI_BYTES {
            return Err(OvError::invalid(format!("URI exceeds {MAX_URI_BYTES} bytes")));
        }
        Ok(Self(normalised))
    }

    /// The namespace root, `viking://`.
    pub fn root() -> Self {
        Self(SCHEME.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == SCHEME
    }

    /// Path portion after the scheme (empty for the root).
    pub fn path(&self) -> &str {
        &self.0[SCHEME.len()..]
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path().split('/').filter(|s| !s.is_empty())
    }

    /// Final path segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Strip the trailing segment. `None` for the root.
    pub fn parent(&self) -> Option<VikingUri> {
        if self.is_root() {
            return None;
        }
        match self.path().rsplit_once('/') {
            Some((head, _)) => Some(Self(format!("{SCHEME}{head}"))),
            None => Some(Self::root()),
        }
    }

    /// Append one segment, validating it.
    pub fn join(&self, segment: &str) -> Result<VikingUri> {
        if segment.is_empty() || segment.contains('/') || segment.contains('\0') {
            return Err(OvError::invalid(format!("bad URI segment: {segment:?}")));
        }
        if segment == "." || segment == ".." {
            return Err(OvError::invalid(format!("bad URI segment: {segment:?}")));
        }
        if segment.len() > MAX_SEGMENT_BYTES {
            return Err(OvError::invalid(format!(
                "URI segment exceeds {MAX_SEGMENT_BYTES} bytes"
            )));
        }
        let joined = if self.is_root() {
            format!("{SCHEME}{segment}")
        } else {
            format!("{}/{segment}", self.0)
        };
        if joined.len() > MAX_URI_BYTES {
            return Err(OvError::invalid(format!("URI exceeds {MAX_URI_BYTES} bytes")));
        }
        Ok(Self(joined))
    }

    /// Append a relative path of one or more segments.
    pub fn join_path(&self, rel: &str) -> Result<VikingUri> {
        let mut uri = self.clone();
        for seg in rel.split('/').filter(|s| !s.is_empty()) {
            uri = uri.join(seg)?;
        }
        Ok(uri)
    }

    /// Path-boundary-aware prefix test: `viking://a/b` is under
    /// `viking://a` but `viking://ab` is not.
    pub fn is_under(&self, prefix: &VikingUri) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes()[prefix.0.len()] == b'/')
    }

    /// Whether the final segment is hidden (dot-prefixed).
    pub fn is_hidden(&self) -> bool {
        self.name().map(|n| n.starts_with('.')).unwrap_or(false)
    }

    /// Top-level scope of this URI, if it sits under a reserved root.
    pub fn scope_root(&self) -> Option<ScopeRoot> {
        match self.segments().next() {
            Some("resources") => Some(ScopeRoot::Resources),
            Some("user") => Some(ScopeRoot::User),
            Some("agent") => Some(ScopeRoot::Agent),
            Some("temp") => Some(ScopeRoot::Temp),
            Some(".system") => Some(ScopeRoot::System),
            _ => None,
        }
    }
}

impl fmt::Display for VikingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VikingUri {
    type Error = OvError;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VikingUri> for String {
    fn from(u: VikingUri) -> String {
        u.0
    }
}

impl std::str::FromStr for VikingUri {
    type Err = OvError;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Reserved top-level partitions of the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeRoot {
    Resources,
    User,
    Agent,
    Temp,
    System,
}

/// Target scope for ingest: where a promoted tree lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestScope {
    /// `viking://resources`
    Resources,
    /// `viking://user/memories`
    User,
    /// `viking://agent/skills`
    Agent,
}

impl IngestScope {
    /// Base URI this scope promotes into.
    pub fn base_uri(&self) -> VikingUri {
        let base = match self {
            Self::Resources => "viking://resources",
            Self::User => "viking://user/memories",
            Self::Agent => "viking://agent/skills",
        };
        VikingUri::parse(base).expect("scope base URIs are valid")
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resources => "resources",
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl std::str::FromStr for IngestScope {
    type Err = OvError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resources" => Ok(Self::Resources),
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            _ => Err(OvError::invalid(format!("unknown scope: {s}"))),
        }
    }
}

/// Mint a fresh scratch root `viking://temp/<uuid>`.
pub fn new_scratch_root() -> VikingUri {
    VikingUri::root()
        .join("temp")
        .and_then(|t| t.join(&uuid::Uuid::new_v4().to_string()))
        .expect("uuid segments are valid")
}
