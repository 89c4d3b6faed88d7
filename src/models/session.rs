// ABOUTME: Session data model binding one client directory selection to one backend process

use serde::{Deserialize, Serialize};
use url::Url;

/// An assistant agent exposed by a backend instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub built_in: bool,
}

/// Everything the client needs to drive a freshly bootstrapped session.
///
/// The `session_id` is authoritative: it is assigned by the backend itself
/// when the upstream work session is created, never by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub url: Url,
    pub directory: String,
    pub share_url: String,
    pub session_id: String,
    pub current_model: String,
    pub current_agent: String,
    pub models: Vec<String>,
    pub agents: Vec<Agent>,
}
