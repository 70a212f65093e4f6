//! Preset namespace scaffolding.
//!
//! The scope roots carry static L0/L1 artefacts so agents can navigate
//! an empty workspace. Scaffolding is written once at engine start,
//! outside the semantic pipeline, and stays out of the vector index:
//! it describes the namespace, not ingested content.

use ov_core::error::Result;
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, WriteOptions, ABSTRACT_FILE, OVERVIEW_FILE};
use std::sync::Arc;

struct PresetDir {
    path: &'static str,
    abstract_text: &'static str,
    overview: &'static str,
}

const PRESETS: [PresetDir; 5] = [
    PresetDir {
        path: "viking://resources",
        abstract_text: "Resource scope. Stores ingested documents, code, and other reference material as semantic trees.",
        overview: "Resource-level storage. Each child directory is one ingested document tree; descend by abstract to locate relevant material.",
    },
    PresetDir {
        path: "viking://user",
        abstract_text: "User scope. Stores the user's long-term memory, persisted across sessions.",
        overview: "User-level persistent storage for profiles and private memories.",
    },
    PresetDir {
        path: "viking://user/memories",
        abstract_text: "The user's long-term memory storage, distilled from committed sessions.",
        overview: "Access this directory for the user's personalised memories: preferences, facts, events, and cases.",
    },
    PresetDir {
        path: "viking://agent",
        abstract_text: "Agent scope. Stores the agent's skills and learned material.",
        overview: "Agent-level global storage.",
    },
    PresetDir {
        path: "viking://agent/skills",
        abstract_text: "The agent's skill library.",
        overview: "Each child directory is one skill; consult a skill before executing a task it covers.",
    },
];

/// Write the preset scaffolding for any scope root that lacks it.
pub async fn seed_namespace(agfs: &Arc<dyn Agfs>) -> Result<()> {
    for preset in &PRESETS {
        let dir = VikingUri::parse(preset.path)?;
        agfs.mkdir(&dir).await?;
        let abstract_uri = dir.join(ABSTRACT_FILE)?;
        if !agfs.exists(&abstract_uri).await? {
            agfs.write_string(&dir.join(OVERVIEW_FILE)?, preset.overview, WriteOptions::default())
                .await?;
            agfs.write_string(&abstract_uri, preset.abstract_text, WriteOptions::default())
                .await?;
        }
    }
    Ok(())
}
