//! Wire messages between the socket façade and a backend.
//!
//! The core only understands subscribe requests and path-tagged pushes.
//! Paths are opaque cache keys; payloads are never interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the socket façade sends on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SocketRequest {
    /// Ask the backend to push updates for `path`.
    Subscribe { path: String },
}

/// Server push carrying the latest data for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub path: String,
    pub data: Value,
}

impl Push {
    pub fn new(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}
