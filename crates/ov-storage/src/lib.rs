//! AGFS: the agent filesystem layer of the OpenViking context engine.

pub mod agfs;
pub mod lease;
pub mod local_fs;

pub use agfs::{
    Agfs, Entry, LsOptions, StatInfo, TreeNode, TreeOptions, WriteOptions, ABSTRACT_FILE,
    MOVING_MARKER, OVERVIEW_FILE, PENDING_CLEANUP_MARKER,
};
pub use lease::{LeaseGuard, LeaseRegistry};
pub use local_fs::LocalAgfs;
