// ABOUTME: Core data models for gateway sessions, agents, and project directories

pub mod session;

pub use session::{Agent, SessionInfo};

use serde::{Deserialize, Serialize};

/// A candidate project directory offered to the client for selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub name: String,
    pub path: String,
}
