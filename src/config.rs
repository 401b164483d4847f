//! Configuration for weir
//!
//! A graph of named nodes, each naming its `kind` (resolved through a
//! [`crate::chain::StageRegistry`]) and its `next` hop:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "name": "in",    "kind": "chan-source", "next": "obf" },
//!     { "name": "obf",   "kind": "passthrough", "next": "hop" },
//!     { "name": "hop",   "kind": "handoff", "settings": { "worker": 1 }, "next": "out" },
//!     { "name": "out",   "kind": "chan-sink" }
//!   ]
//! }
//! ```
//!
//! Stage-specific options ride in `settings` as raw JSON; each factory
//! interprets its own. The schema stops here on purpose: weir defines
//! the chain contract, not every stage's option surface.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One node of the configuration graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name, referenced by other nodes' `next`.
    pub name: String,

    /// Stage kind, resolved through the registry.
    pub kind: String,

    /// Next hop toward the chain tail; absent on the tail node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    /// Stage-specific options, passed to the factory untouched.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// The full node graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl GraphConfig {
    /// Load a graph from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse a graph from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}
