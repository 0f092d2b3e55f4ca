use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use libttyhub::hub::OUTBOUND_QUEUE;
use libttyhub::{ConnectionHub, ConnectionId, SessionRegistry};
use ttyhub_protocol::{ClientMessage, ErrorCode, ServerMessage, SessionId};
use ttyhub_supervisor::{ScreenClient, Supervisor};

use crate::auth::AuthService;

/// Shared handler state, injected rather than reached for globally.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<Supervisor<ScreenClient>>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
}

/// POST /api/login: exchange credentials for a short-lived token usable in
/// the WebSocket handshake.
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<LoginRequest>,
) -> Response {
    if !state.auth.allow_attempt(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "too many login attempts").into_response();
    }
    if !state
        .auth
        .check_credentials(&request.username, &request.password)
    {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    Json(LoginResponse {
        token: state.auth.issue_token(),
    })
    .into_response()
}

/// GET /ws: upgrade to the viewer protocol.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection state machine: unauthenticated → idle → attached to zero
/// or more sessions → closed.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake: the first message must authenticate, by credentials or
    // token. Anything else terminates the connection.
    let authenticated = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                break match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Auth {
                        username,
                        password,
                        token,
                    }) => check_auth(&state.auth, username, password, token),
                    _ => false,
                };
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };
    if !authenticated {
        let refusal = ServerMessage::Error {
            id: None,
            data: "authentication failed".to_string(),
            code: ErrorCode::AuthFailed,
        };
        if let Ok(json) = serde_json::to_string(&refusal) {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        let _ = ws_tx.close().await;
        return;
    }

    // All outbound traffic for this viewer flows through one queue, which
    // keeps per-connection delivery FIFO.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let conn = state.hub.register(tx);
    state.hub.send(conn, ServerMessage::AuthOk);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "unserializable server message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection_id = conn, error = %e, "ws read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => dispatch(&state, conn, client_msg).await,
                Err(e) => state.hub.send(
                    conn,
                    ServerMessage::Error {
                        id: None,
                        data: format!("invalid message: {e}"),
                        code: ErrorCode::InvalidRequest,
                    },
                ),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Closed: drop the connection from every fan-out set it may still be in
    // and stop delivering.
    state.registry.detach_everywhere(conn).await;
    state.hub.unregister(conn);
    let _ = write_task.await;
    debug!(connection_id = conn, "viewer connection closed");
}

fn check_auth(
    auth: &AuthService,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
) -> bool {
    if let Some(token) = token {
        return auth.validate_token(&token);
    }
    match (username, password) {
        (Some(user), Some(pass)) => auth.check_credentials(&user, &pass),
        _ => false,
    }
}

/// Typed dispatch over the viewer protocol. Every reply goes through the
/// hub, so failures degrade the same way as any other delivery fault.
pub async fn dispatch(state: &AppState, conn: ConnectionId, msg: ClientMessage) {
    match msg {
        ClientMessage::Auth { .. } => {
            // Re-authenticating an authenticated connection is meaningless.
            send_error_message(
                state,
                conn,
                None,
                ErrorCode::InvalidRequest,
                "already authenticated".to_string(),
            );
        }

        ClientMessage::Attach { id } => match state.registry.attach(id, conn).await {
            Ok(outcome) => {
                if outcome.rejoined {
                    send_error_message(
                        state,
                        conn,
                        Some(id),
                        ErrorCode::AlreadyAttached,
                        format!("already attached to session {id}"),
                    );
                }
                for chunk in outcome.replay {
                    state.hub.send(
                        conn,
                        ServerMessage::Output {
                            id,
                            data: chunk.data,
                        },
                    );
                }
                state.hub.send(
                    conn,
                    ServerMessage::Connected {
                        id,
                        pid: outcome.info.pid,
                        program_name: outcome.info.program_name,
                        created_at: outcome.info.created_at,
                        title_note: outcome.info.title_note,
                    },
                );
            }
            Err(e) => send_hub_error(state, conn, Some(id), e),
        },

        ClientMessage::Input { id, data } => {
            if let Err(e) = state.registry.write_input(id, conn, &data).await {
                send_hub_error(state, conn, Some(id), e);
            }
        }

        ClientMessage::Refresh { id } => match state.registry.replay(id).await {
            Ok(chunks) => {
                for chunk in chunks {
                    state.hub.send(
                        conn,
                        ServerMessage::Output {
                            id,
                            data: chunk.data,
                        },
                    );
                }
            }
            Err(e) => send_hub_error(state, conn, Some(id), e),
        },

        ClientMessage::Detach { id } => match state.registry.detach(id, conn).await {
            Ok(()) => state.hub.send(conn, ServerMessage::Detached { id }),
            Err(e) => send_hub_error(state, conn, Some(id), e),
        },

        ClientMessage::Resize { id, cols, rows } => {
            if let Err(e) = state.registry.resize(id, cols, rows).await {
                send_hub_error(state, conn, Some(id), e);
            }
        }

        ClientMessage::CreateTerminal {
            shell,
            title_note,
            rpc_id,
        } => match state.registry.create(&shell, title_note).await {
            Ok(info) => rpc_ok(state, conn, rpc_id, &info),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::ListTerminals { rpc_id } => {
            let sessions = state.registry.list().await;
            rpc_ok(state, conn, rpc_id, &sessions);
        }

        ClientMessage::GetTerminalInfo { id, rpc_id } => match state.registry.get(id).await {
            Ok(info) => rpc_ok(state, conn, rpc_id, &info),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::CloseTerminal { id, rpc_id } => match state.registry.close(id).await {
            Ok(()) => rpc_ok(state, conn, rpc_id, &serde_json::json!({ "success": true })),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::ListPrograms { rpc_id } => {
            let programs = state.supervisor.list().await;
            rpc_ok(state, conn, rpc_id, &programs);
        }

        ClientMessage::CreateProgram { program, rpc_id } => {
            match state.supervisor.add(program).await {
                Ok(info) => rpc_ok(state, conn, rpc_id, &info),
                Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
            }
        }

        ClientMessage::UpdateProgram { program, rpc_id } => {
            match state.supervisor.update(program).await {
                Ok(info) => rpc_ok(state, conn, rpc_id, &info),
                Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
            }
        }

        ClientMessage::DeleteProgram { id, rpc_id } => match state.supervisor.remove(id).await {
            Ok(()) => rpc_ok(state, conn, rpc_id, &serde_json::json!({ "success": true })),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::StartProgram { id, rpc_id } => match state.supervisor.start(id).await {
            Ok(info) => rpc_ok(state, conn, rpc_id, &info),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::StopProgram { id, rpc_id } => match state.supervisor.stop(id).await {
            Ok(stopped) => rpc_ok(
                state,
                conn,
                rpc_id,
                &serde_json::json!({ "success": stopped }),
            ),
            Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
        },

        ClientMessage::TerminateProgram { id, rpc_id } => {
            match state.supervisor.terminate(id).await {
                Ok(info) => rpc_ok(state, conn, rpc_id, &info),
                Err(e) => rpc_err(state, conn, rpc_id, e.to_string()),
            }
        }
    }
}

fn send_hub_error(state: &AppState, conn: ConnectionId, id: Option<SessionId>, e: libttyhub::HubError) {
    let (code, message) = e.to_error_code();
    send_error_message(state, conn, id, code, message);
}

fn send_error_message(
    state: &AppState,
    conn: ConnectionId,
    id: Option<SessionId>,
    code: ErrorCode,
    data: String,
) {
    state.hub.send(conn, ServerMessage::Error { id, data, code });
}

fn rpc_ok<T: Serialize>(state: &AppState, conn: ConnectionId, rpc_id: String, value: &T) {
    let data = match serde_json::to_value(value) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "unserializable rpc payload");
            None
        }
    };
    state.hub.send(
        conn,
        ServerMessage::RpcResult {
            rpc_id,
            ok: true,
            data,
            error: None,
        },
    );
}

fn rpc_err(state: &AppState, conn: ConnectionId, rpc_id: String, error: String) {
    state.hub.send(
        conn,
        ServerMessage::RpcResult {
            rpc_id,
            ok: false,
            data: None,
            error: Some(error),
        },
    );
}
