// ABOUTME: Integration tests for the API proxy surface: routing, error codes, passthrough

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::RawQuery;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use pretty_assertions::assert_eq;
use url::Url;

use portico::config::{BackendCommand, GatewayConfig};
use portico::server::{build_router, AppState};

fn test_config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        projects_root: std::env::temp_dir(),
        backend: BackendCommand::default(),
        frontend_dev_url: None,
        discovery_timeout: Duration::from_secs(1),
    }
}

async fn spawn_router(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());
    addr
}

fn stub_backend() -> Router {
    Router::new().route(
        "/messages",
        get(|RawQuery(query): RawQuery, headers: HeaderMap| async move {
            let echoed = headers
                .get("x-echo")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            (
                [("x-backend", "stub")],
                format!("messages q={} echo={echoed}", query.unwrap_or_default()),
            )
        })
        .post(|body: String| async move { format!("posted:{body}") }),
    )
}

async fn gateway_with_session(session_id: &str, backend: Url) -> (SocketAddr, AppState) {
    let state = AppState::new(test_config()).unwrap();
    state.registry.insert(session_id, backend);
    let addr = spawn_router(build_router(state.clone())).await;
    (addr, state)
}

#[tokio::test]
async fn missing_session_id_is_a_400() {
    let state = AppState::new(test_config()).unwrap();
    let addr = spawn_router(build_router(state)).await;

    for path in ["/api", "/api/"] {
        let resp = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "path {path}");
    }
}

#[tokio::test]
async fn unknown_session_id_is_a_404_not_a_502() {
    let state = AppState::new(test_config()).unwrap();
    let addr = spawn_router(build_router(state)).await;

    let resp = reqwest::get(format!("http://{addr}/api/ses_missing/messages"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn requests_are_forwarded_with_method_headers_query_and_response_headers() {
    let backend_addr = spawn_router(stub_backend()).await;
    let backend = Url::parse(&format!("http://{backend_addr}")).unwrap();
    let (addr, _state) = gateway_with_session("ses_abc", backend).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/api/ses_abc/messages?cursor=42"))
        .header("x-echo", "hello")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-backend").unwrap(), "stub");
    assert_eq!(
        resp.text().await.unwrap(),
        "messages q=cursor=42 echo=hello"
    );
}

#[tokio::test]
async fn request_bodies_stream_through_to_the_backend() {
    let backend_addr = spawn_router(stub_backend()).await;
    let backend = Url::parse(&format!("http://{backend_addr}")).unwrap();
    let (addr, _state) = gateway_with_session("ses_abc", backend).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/ses_abc/messages"))
        .body("a prompt")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "posted:a prompt");
}

#[tokio::test]
async fn unreachable_backend_is_a_502() {
    // Grab a port that nothing listens on anymore.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let backend = Url::parse(&format!("http://{dead_addr}")).unwrap();
    let (addr, _state) = gateway_with_session("ses_dead", backend).await;

    let resp = reqwest::get(format!("http://{addr}/api/ses_dead/messages"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn removing_a_session_turns_it_into_a_404() {
    let backend_addr = spawn_router(stub_backend()).await;
    let backend = Url::parse(&format!("http://{backend_addr}")).unwrap();
    let (addr, state) = gateway_with_session("ses_gone", backend).await;

    let resp = reqwest::get(format!("http://{addr}/api/ses_gone/messages"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    state.registry.remove("ses_gone");
    let resp = reqwest::get(format!("http://{addr}/api/ses_gone/messages"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
