// ABOUTME: Bootstrap client for freshly spawned backends: config, agents, session and share
// Populates SessionInfo from the backend's HTTP API before the client is told it is ready

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::models::{Agent, SessionInfo};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const SHARE_SETTLE_DELAY: Duration = Duration::from_secs(2);
const SHARE_PROBE_ATTEMPTS: u32 = 5;
const SHARE_PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid backend address: {0}")]
    Address(#[from] url::ParseError),

    #[error("failed to fetch backend config: {0}")]
    Config(#[source] reqwest::Error),

    #[error("failed to fetch backend agents: {0}")]
    Agents(#[source] reqwest::Error),

    #[error("failed to create upstream session: {0}")]
    CreateSession(#[source] reqwest::Error),

    #[error("failed to share upstream session: {0}")]
    Share(#[source] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    agent: AgentToggles,
}

#[derive(Debug, Deserialize, Default)]
struct AgentToggles {
    #[serde(default)]
    general: Toggle,
    #[serde(default)]
    plan: Toggle,
    #[serde(default)]
    build: Toggle,
}

#[derive(Debug, Deserialize, Default)]
struct Toggle {
    #[serde(default)]
    disable: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ShareResponse {
    share: ShareDetails,
}

#[derive(Debug, Deserialize)]
struct ShareDetails {
    url: String,
}

/// HTTP client for the bootstrap conversation with a backend instance.
///
/// Every call here is short-lived and bounded by [`HTTP_TIMEOUT`]; the
/// unbounded long-running traffic goes through the proxy router instead.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }

    /// Query a freshly started backend and establish the upstream work
    /// session. Config and agent lookups are best-effort; session creation
    /// and sharing are required and abort the bootstrap on failure.
    pub async fn bootstrap(
        &self,
        address: &Url,
        directory: &Path,
        models: Vec<String>,
    ) -> Result<SessionInfo, BootstrapError> {
        let config = match self.fetch_config(address).await {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("could not fetch backend config: {e}");
                None
            }
        };

        let current_model = config
            .as_ref()
            .and_then(|config| config.model.clone())
            .unwrap_or_else(|| models.first().cloned().unwrap_or_default());

        let agents = match self.fetch_agents(address).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!("could not fetch backend agents: {e}");
                Vec::new()
            }
        };

        // Without a config payload no toggle can resolve; fall straight
        // through to the first fetched agent.
        let current_agent = match &config {
            Some(config) => current_agent(&config.agent, &agents),
            None => agents
                .first()
                .map(|agent| agent.name.clone())
                .unwrap_or_default(),
        };

        let session_id = self.create_session(address).await?;
        let share_url = self.share_session(address, &session_id).await?;
        self.await_share_url(&share_url).await;

        Ok(SessionInfo {
            url: address.clone(),
            directory: directory.to_string_lossy().into_owned(),
            share_url,
            session_id,
            current_model,
            current_agent,
            models,
            agents,
        })
    }

    async fn fetch_config(&self, address: &Url) -> Result<ConfigResponse, BootstrapError> {
        let url = address.join("config")?;
        self.http
            .get(url)
            .send()
            .await
            .map_err(BootstrapError::Config)?
            .error_for_status()
            .map_err(BootstrapError::Config)?
            .json()
            .await
            .map_err(BootstrapError::Config)
    }

    async fn fetch_agents(&self, address: &Url) -> Result<Vec<Agent>, BootstrapError> {
        let url = address.join("agent")?;
        self.http
            .get(url)
            .send()
            .await
            .map_err(BootstrapError::Agents)?
            .error_for_status()
            .map_err(BootstrapError::Agents)?
            .json()
            .await
            .map_err(BootstrapError::Agents)
    }

    async fn create_session(&self, address: &Url) -> Result<String, BootstrapError> {
        let url = address.join("session")?;
        let created: CreatedSession = self
            .http
            .post(url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(BootstrapError::CreateSession)?
            .error_for_status()
            .map_err(BootstrapError::CreateSession)?
            .json()
            .await
            .map_err(BootstrapError::CreateSession)?;
        Ok(created.id)
    }

    async fn share_session(
        &self,
        address: &Url,
        session_id: &str,
    ) -> Result<String, BootstrapError> {
        let url = address.join(&format!("session/{session_id}/share"))?;
        let shared: ShareResponse = self
            .http
            .post(url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(BootstrapError::Share)?
            .error_for_status()
            .map_err(BootstrapError::Share)?
            .json()
            .await
            .map_err(BootstrapError::Share)?;
        Ok(shared.share.url)
    }

    /// Best-effort wait for the share link to become reachable. Any
    /// non-success response or transport error counts as "not yet ready";
    /// after the final attempt we give up silently.
    async fn await_share_url(&self, share_url: &str) {
        tokio::time::sleep(SHARE_SETTLE_DELAY).await;

        for attempt in 1..=SHARE_PROBE_ATTEMPTS {
            match self.http.get(share_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("share URL reachable after {attempt} attempt(s)");
                    return;
                }
                Ok(resp) => debug!("share URL not ready yet (status {})", resp.status()),
                Err(e) => debug!("share URL not ready yet: {e}"),
            }
            if attempt < SHARE_PROBE_ATTEMPTS {
                tokio::time::sleep(SHARE_PROBE_INTERVAL).await;
            }
        }
        warn!("share URL never became reachable: {share_url}");
    }
}

fn current_agent(toggles: &AgentToggles, agents: &[Agent]) -> String {
    if !toggles.general.disable {
        return "general".to_string();
    }
    if !toggles.plan.disable {
        return "plan".to_string();
    }
    if !toggles.build.disable {
        return "build".to_string();
    }
    agents
        .first()
        .map(|agent| agent.name.clone())
        .unwrap_or_default()
}

/// Run the backend's model listing command in `directory`, dropping blank
/// lines and progress output. Failures yield an empty list; the bootstrap
/// falls back to the backend config for the current model.
pub async fn list_models(command: Option<&[String]>, directory: &Path) -> Vec<String> {
    let Some(command) = command else {
        return Vec::new();
    };
    let Some((program, args)) = command.split_first() else {
        return Vec::new();
    };

    let output = match tokio::process::Command::new(program)
        .args(args)
        .current_dir(directory)
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!("model listing command exited with {}", output.status);
            return Vec::new();
        }
        Err(e) => {
            warn!("failed to run model listing command: {e}");
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('█'))
        .map(ToString::to_string)
        .collect()
}
