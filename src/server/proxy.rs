// ABOUTME: Stateless API proxy forwarding /api/{sessionId}/... to the registered backend
// Errors surface as status codes: 400 missing id, 404 unknown id, 502 unreachable backend

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::AppState;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing session id in path")]
    MissingSession,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("backend unreachable: {0}")]
    UpstreamUnavailable(#[source] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::MissingSession => StatusCode::BAD_REQUEST,
            ProxyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// `/api` and `/api/` carry no session id at all.
pub async fn missing_session() -> ProxyError {
    ProxyError::MissingSession
}

pub async fn forward_root(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request,
) -> Result<Response, ProxyError> {
    forward(&state, &session_id, "", req).await
}

pub async fn forward_path(
    State(state): State<AppState>,
    Path((session_id, _rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ProxyError> {
    // Take the remainder from the raw URI rather than the decoded capture so
    // percent-encoded segments reach the backend untouched.
    let rest = req
        .uri()
        .path()
        .splitn(4, '/')
        .nth(3)
        .unwrap_or("")
        .to_string();
    forward(&state, &session_id, &rest, req).await
}

/// Look the session up and forward the call verbatim. The proxy itself is
/// stateless; the registry lookup is the only shared-state access.
async fn forward(
    state: &AppState,
    session_id: &str,
    rest: &str,
    req: Request,
) -> Result<Response, ProxyError> {
    if session_id.is_empty() {
        return Err(ProxyError::MissingSession);
    }
    let base = state
        .registry
        .lookup(session_id)
        .ok_or_else(|| ProxyError::SessionNotFound(session_id.to_string()))?;

    let mut target = base;
    target.set_path(&format!("/{rest}"));
    target.set_query(req.uri().query());

    debug!("proxying {} {} -> {target}", req.method(), req.uri().path());
    forward_http(&state.api_client, target, req)
        .await
        .map_err(ProxyError::UpstreamUnavailable)
}

/// Forward a request to `target` preserving method, headers and body stream,
/// and hand the upstream response back unbuffered. Shared by the API proxy
/// and the development passthrough.
pub(crate) async fn forward_http(
    client: &reqwest::Client,
    target: Url,
    req: Request,
) -> Result<Response, reqwest::Error> {
    let (parts, body) = req.into_parts();

    let mut headers = parts.headers;
    headers.remove(header::HOST);

    let upstream = client
        .request(parts.method, target)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = upstream.status();
    for (name, value) in upstream.headers() {
        // The body is re-framed by our server; its old framing headers
        // must not survive the hop.
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }
    *response.body_mut() = Body::from_stream(upstream.bytes_stream());
    Ok(response)
}
