// ABOUTME: Gateway configuration assembled from CLI flags and environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

/// Environment variable pointing at a frontend dev server. When set, all
/// non-API traffic is proxied there instead of the embedded bundle.
pub const FRONTEND_DEV_URL: &str = "FRONTEND_DEV_URL";
/// Overrides the backend serve command line (parsed with shell word rules).
pub const BACKEND_CMD: &str = "PORTICO_BACKEND_CMD";
/// Overrides the backend model listing command line.
pub const MODELS_CMD: &str = "PORTICO_MODELS_CMD";

const DEFAULT_SERVE_CMD: &[&str] = &["opencode", "serve", "--port", "0", "--hostname", "0.0.0.0"];
const DEFAULT_MODELS_CMD: &[&str] = &["opencode", "models"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
    #[error("invalid {name}: {source}")]
    InvalidCommand {
        name: &'static str,
        source: shell_words::ParseError,
    },
    #[error("{name} must not be empty")]
    EmptyCommand { name: &'static str },
    #[error("could not determine a home directory for the projects root")]
    NoHomeDir,
}

#[derive(Debug, Parser)]
#[command(name = "portico", about = "Local web gateway for per-project opencode sessions")]
pub struct Cli {
    /// Address the gateway listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Root directory scanned for candidate projects (defaults to $HOME)
    #[arg(long)]
    pub projects_root: Option<PathBuf>,
}

/// Command lines used to run and query the backend.
#[derive(Debug, Clone)]
pub struct BackendCommand {
    /// Full argv for launching a backend server rooted at a project.
    pub serve: Vec<String>,
    /// Full argv for listing available models, if any.
    pub models: Option<Vec<String>>,
}

impl Default for BackendCommand {
    fn default() -> Self {
        Self {
            serve: DEFAULT_SERVE_CMD.iter().map(ToString::to_string).collect(),
            models: Some(DEFAULT_MODELS_CMD.iter().map(ToString::to_string).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub projects_root: PathBuf,
    pub backend: BackendCommand,
    pub frontend_dev_url: Option<Url>,
    pub discovery_timeout: Duration,
}

impl GatewayConfig {
    /// Merge CLI flags with the process environment.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let projects_root = match cli.projects_root {
            Some(root) => root,
            None => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?,
        };

        let frontend_dev_url = match std::env::var(FRONTEND_DEV_URL) {
            Ok(raw) => Some(Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
                name: FRONTEND_DEV_URL,
                source,
            })?),
            Err(_) => None,
        };

        let mut backend = BackendCommand::default();
        if let Ok(raw) = std::env::var(BACKEND_CMD) {
            backend.serve = parse_command(BACKEND_CMD, &raw)?;
        }
        if let Ok(raw) = std::env::var(MODELS_CMD) {
            backend.models = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_command(MODELS_CMD, &raw)?)
            };
        }

        Ok(Self {
            listen_addr: cli.listen,
            projects_root,
            backend,
            frontend_dev_url,
            discovery_timeout: Duration::from_secs(30),
        })
    }
}

fn parse_command(name: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let words =
        shell_words::split(raw).map_err(|source| ConfigError::InvalidCommand { name, source })?;
    if words.is_empty() {
        return Err(ConfigError::EmptyCommand { name });
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_command_targets_opencode() {
        let backend = BackendCommand::default();
        assert_eq!(backend.serve[0], "opencode");
        assert!(backend.serve.contains(&"--port".to_string()));
        assert_eq!(backend.models.unwrap()[1], "models");
    }

    #[test]
    fn parse_command_honors_shell_quoting() {
        let words = parse_command(BACKEND_CMD, "sh -c 'echo hi'").unwrap();
        assert_eq!(words, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn parse_command_rejects_empty_input() {
        assert!(matches!(
            parse_command(BACKEND_CMD, "  "),
            Err(ConfigError::EmptyCommand { .. })
        ));
    }
}
