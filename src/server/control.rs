// ABOUTME: Per-connection control channel: directory selection, bootstrap, passive relay
// Owns session cleanup so every close path tears down exactly once

use std::path::Path;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{self, BootstrapError};
use crate::discovery;
use crate::models::{DirectoryInfo, SessionInfo};
use crate::supervisor::{ProcessHandle, ProcessSupervisor, SupervisorError};

use super::AppState;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: String,
        source: serde_json::Error,
    },

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

/// Tagged `{type, data}` envelope used in both directions on the channel.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct SelectDirectoryData {
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SelectDirectory { path: String },
}

/// Decode an inbound envelope, validating the payload for its type. Unknown
/// and malformed messages are distinct, non-fatal error kinds.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)?;
    match envelope.kind.as_str() {
        "selectDirectory" => {
            let data: SelectDirectoryData =
                serde_json::from_value(envelope.data).map_err(|source| {
                    ProtocolError::MalformedPayload {
                        kind: envelope.kind,
                        source,
                    }
                })?;
            Ok(ClientMessage::SelectDirectory { path: data.path })
        }
        _ => Err(ProtocolError::UnknownType(envelope.kind)),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
enum ServerMessage<'a> {
    DirectoryList { directories: &'a [DirectoryInfo] },
    ServerReady(&'a SessionInfo),
}

/// The four channel states. `Closed` is terminal and reached from every
/// disconnect path exactly once, at the bottom of `drive_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    AwaitingSelection,
    Bootstrapping,
    Relaying,
    Closed,
}

struct LiveSession {
    session_id: String,
    handle: ProcessHandle,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| drive_channel(socket, state))
}

async fn drive_channel(mut socket: WebSocket, state: AppState) {
    if let Err(e) = send_directory_list(&mut socket, &state).await {
        warn!("could not send directory list: {e}");
        return;
    }

    let mut channel_state = ChannelState::AwaitingSelection;
    let mut live: Option<LiveSession> = None;

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("control channel read error: {e}");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong and binary frames are liveness noise.
            _ => continue,
        };

        match channel_state {
            ChannelState::AwaitingSelection => {
                let path = match decode_client_message(&text) {
                    Ok(ClientMessage::SelectDirectory { path }) => path,
                    Err(e) => {
                        warn!("ignoring control message: {e}");
                        continue;
                    }
                };

                channel_state = ChannelState::Bootstrapping;
                match establish_session(&state, Path::new(&path)).await {
                    Ok((handle, info)) => {
                        // Registry first, then the ready notification: the
                        // client may fire API calls the moment it sees it.
                        state
                            .registry
                            .insert(info.session_id.clone(), info.url.clone());
                        live = Some(LiveSession {
                            session_id: info.session_id.clone(),
                            handle,
                        });
                        if send_message(&mut socket, &ServerMessage::ServerReady(&info))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        info!("session {} ready for {}", info.session_id, info.directory);
                        channel_state = ChannelState::Relaying;
                    }
                    Err(e) => {
                        error!("session bootstrap for {path} failed: {e}");
                        break;
                    }
                }
            }
            // First selection wins; anything else is drained as keep-alive.
            ChannelState::Bootstrapping | ChannelState::Relaying => {
                debug!("draining control message in {channel_state:?} state");
            }
            ChannelState::Closed => break,
        }
    }

    channel_state = ChannelState::Closed;
    debug!("control channel reached {channel_state:?}");
    close_channel(&state, live).await;
}

/// Spawn the backend and bootstrap it. The process is torn down before
/// returning an error, so a failed bootstrap never leaks a child process
/// and the caller never writes a registry entry for it.
async fn establish_session(
    state: &AppState,
    directory: &Path,
) -> Result<(ProcessHandle, SessionInfo), SessionError> {
    let supervisor = ProcessSupervisor::new(
        state.config.backend.serve.clone(),
        state.config.discovery_timeout,
    );
    let (mut handle, address) = supervisor.spawn(directory).await?;

    let models = backend::list_models(state.config.backend.models.as_deref(), directory).await;

    match state.backend.bootstrap(&address, directory, models).await {
        Ok(info) => Ok((handle, info)),
        Err(e) => {
            handle.shutdown().await;
            Err(e.into())
        }
    }
}

/// Deterministic teardown, in order: registry entry out, process cancelled
/// and reaped, connection released (by drop). Safe when no session exists.
async fn close_channel(state: &AppState, live: Option<LiveSession>) {
    if let Some(mut live) = live {
        state.registry.remove(&live.session_id);
        live.handle.shutdown().await;
        info!("session {} closed", live.session_id);
    }
}

async fn send_directory_list(socket: &mut WebSocket, state: &AppState) -> anyhow::Result<()> {
    let root = state.config.projects_root.clone();
    let directories = tokio::task::spawn_blocking(move || discovery::scan_projects(&root)).await?;
    send_message(
        socket,
        &ServerMessage::DirectoryList {
            directories: &directories,
        },
    )
    .await
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage<'_>) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    socket.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_a_directory_selection() {
        let msg =
            decode_client_message(r#"{"type":"selectDirectory","data":{"path":"/home/u/proj"}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SelectDirectory {
                path: "/home/u/proj".to_string()
            }
        );
    }

    #[test]
    fn unknown_types_are_a_distinct_error() {
        let err = decode_client_message(r#"{"type":"dance","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(kind) if kind == "dance"));
    }

    #[test]
    fn payload_validation_happens_at_decode_time() {
        let err = decode_client_message(r#"{"type":"selectDirectory","data":{"nope":1}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }

    #[test]
    fn invalid_json_is_a_malformed_envelope() {
        let err = decode_client_message("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn missing_data_defaults_to_null_and_fails_payload_validation() {
        let err = decode_client_message(r#"{"type":"selectDirectory"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }

    #[test]
    fn server_messages_use_the_tagged_envelope() {
        let directories = vec![DirectoryInfo {
            name: "proj".to_string(),
            path: "/home/u/proj".to_string(),
        }];
        let json = serde_json::to_value(ServerMessage::DirectoryList {
            directories: &directories,
        })
        .unwrap();
        assert_eq!(json["type"], "directoryList");
        assert_eq!(json["data"]["directories"][0]["name"], "proj");
    }
}
