// ABOUTME: Development passthrough and raw tunnel for protocol-upgraded connections
// Upgraded requests are relayed byte-for-byte between the client and the dev server

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use super::proxy::forward_http;
use super::AppState;

const MAX_RESPONSE_HEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("request cannot be upgraded")]
    NotUpgradable,

    #[error("upgrade target has no host")]
    MissingHost,

    #[error("failed to dial upgrade target: {0}")]
    Dial(#[source] std::io::Error),

    #[error("target handshake failed: {0}")]
    Handshake(String),
}

/// Fallback handler when a frontend dev server is configured: buffered
/// forwarding for plain requests, a raw tunnel for protocol upgrades.
pub async fn dev_passthrough(State(state): State<AppState>, req: Request) -> Response {
    let Some(target) = state.config.frontend_dev_url.clone() else {
        // Router wiring guarantees a configured dev URL; degrade to the
        // bundle rather than panicking if that ever changes.
        return super::assets::serve_path(req.uri().path());
    };

    if req.headers().contains_key(header::UPGRADE) {
        return match tunnel_upgrade(req, &target).await {
            Ok(response) => response,
            Err(e) => {
                warn!("upgrade tunnel failed: {e}");
                (StatusCode::BAD_GATEWAY, "failed to connect to dev server").into_response()
            }
        };
    }

    let mut upstream = target;
    upstream.set_path(req.uri().path());
    upstream.set_query(req.uri().query());
    match forward_http(&state.dev_client, upstream, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("dev passthrough failed: {e}");
            (StatusCode::BAD_GATEWAY, "dev server unreachable").into_response()
        }
    }
}

/// Dial the target, replay the client's upgrade request, relay the target's
/// handshake response, then hand both connections to the byte relay.
///
/// Dial failures surface as an error before any upgrade happens; once the
/// handshake is relayed, failures just close both connections.
async fn tunnel_upgrade(mut req: Request, target: &Url) -> Result<Response, TunnelError> {
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(TunnelError::NotUpgradable)?;

    let authority = target_authority(target)?;
    let mut upstream = TcpStream::connect(&authority)
        .await
        .map_err(TunnelError::Dial)?;

    let head = encode_request_head(&req, &authority);
    upstream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    let (response_head, pending) = read_response_head(&mut upstream).await?;
    let response = decode_response_head(&response_head)?;

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                relay(TokioIo::new(upgraded), upstream, pending).await;
            }
            Err(e) => debug!("client upgrade did not complete: {e}"),
        }
    });

    Ok(response)
}

/// Pure byte relay between two upgraded connections. Two copy loops run
/// concurrently; whichever finishes first (EOF or error) wins and both
/// directions are force-closed so the other loop cannot block on a
/// half-open peer.
pub async fn relay<C, U>(client: C, upstream: U, pending: Vec<u8>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    // Bytes the target sent right behind its handshake response.
    if !pending.is_empty() && client_wr.write_all(&pending).await.is_err() {
        return;
    }

    let to_upstream = tokio::io::copy(&mut client_rd, &mut upstream_wr);
    let to_client = tokio::io::copy(&mut upstream_rd, &mut client_wr);

    tokio::select! {
        result = to_upstream => debug!("client side of tunnel finished: {result:?}"),
        result = to_client => debug!("target side of tunnel finished: {result:?}"),
    }

    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
}

fn target_authority(target: &Url) -> Result<String, TunnelError> {
    let host = target.host_str().ok_or(TunnelError::MissingHost)?;
    let port = target.port_or_known_default().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

/// Re-serialize the client's upgrade request for the target, swapping the
/// Host header for the target's authority.
fn encode_request_head(req: &Request, authority: &str) -> String {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);
    head.push_str(&format!("Host: {authority}\r\n"));
    for (name, value) in req.headers() {
        if name == header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("\r\n");
    head
}

/// Read the target's response up to the blank line. Returns the head bytes
/// and anything already read past it.
async fn read_response_head(upstream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), TunnelError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = upstream
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::Handshake(e.to_string()))?;
        if n == 0 {
            return Err(TunnelError::Handshake(
                "connection closed before response head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let pending = buf.split_off(end);
            return Ok((buf, pending));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(TunnelError::Handshake("response head too large".to_string()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Turn the target's raw handshake response into one we can return through
/// the serving layer; a 101 status makes hyper complete the client upgrade.
fn decode_response_head(head: &[u8]) -> Result<Response, TunnelError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TunnelError::Handshake("non-utf8 response head".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| TunnelError::Handshake("empty response head".to_string()))?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TunnelError::Handshake(format!("bad status line: {status_line}")))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| TunnelError::Handshake(format!("bad status code: {code}")))?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_switching_protocols_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let response = decode_response_head(head).unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().get(header::UPGRADE).unwrap(), "websocket");
    }

    #[test]
    fn rejects_garbage_heads() {
        assert!(decode_response_head(b"totally not http\r\n\r\n").is_err());
    }

    #[test]
    fn head_end_detection_splits_pending_bytes() {
        let buf = b"HTTP/1.1 101 X\r\n\r\nleftover";
        let end = find_head_end(buf).unwrap();
        assert_eq!(&buf[end..], b"leftover");
    }

    #[test]
    fn request_head_rewrites_the_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/ws?token=abc")
            .header(header::HOST, "localhost:8080")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();

        let head = encode_request_head(&req, "127.0.0.1:5173");
        assert!(head.starts_with("GET /ws?token=abc HTTP/1.1\r\n"));
        assert!(head.contains("Host: 127.0.0.1:5173\r\n"));
        assert!(!head.contains("localhost:8080"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn relay_moves_bytes_both_ways_and_closes_together() {
        let (client_near, client_far) = tokio::io::duplex(64);
        let (upstream_near, upstream_far) = tokio::io::duplex(64);

        let task = tokio::spawn(relay(client_far, upstream_near, Vec::new()));

        let (mut client, mut upstream) = (client_near, upstream_far);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side must terminate the relay and release the other.
        drop(client);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("relay did not stop after close")
            .unwrap();

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn relay_flushes_pending_bytes_first() {
        let (client_near, client_far) = tokio::io::duplex(64);
        let (upstream_near, _upstream_far) = tokio::io::duplex(64);

        let _task = tokio::spawn(relay(client_far, upstream_near, b"early".to_vec()));

        let mut client = client_near;
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }
}
