// ABOUTME: HTTP server assembly: shared state, routing, and the serve loop

pub mod assets;
pub mod control;
pub mod proxy;
pub mod tunnel;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tracing::info;

use crate::backend::BackendClient;
use crate::config::GatewayConfig;
use crate::registry::SessionRegistry;

const DEV_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: SessionRegistry,
    pub backend: BackendClient,
    /// Deliberately unbounded: proxied backend operations may run for as
    /// long as the backend needs.
    pub api_client: reqwest::Client,
    pub dev_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            backend: BackendClient::new()?,
            api_client: reqwest::Client::new(),
            dev_client: reqwest::Client::builder()
                .timeout(DEV_PROXY_TIMEOUT)
                .build()?,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(control::ws_handler))
        .route("/api", any(proxy::missing_session))
        .route("/api/", any(proxy::missing_session))
        .route("/api/{session_id}", any(proxy::forward_root))
        .route("/api/{session_id}/{*rest}", any(proxy::forward_path));

    let router = if state.config.frontend_dev_url.is_some() {
        router.fallback(tunnel::dev_passthrough)
    } else {
        router.fallback(assets::serve)
    };

    router.with_state(state)
}

/// Bind and serve until `shutdown` resolves; in-flight connections are then
/// drained (the caller bounds the grace period).
pub async fn serve(
    config: GatewayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = AppState::new(config)?;
    let addr = state.config.listen_addr;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
