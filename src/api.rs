//! Control Plane Adapter: HTTP + WebSocket façade over the Supervisor.
//!
//! Route shapes follow the teacher's `api.rs` (`Json(...)` handlers,
//! `(StatusCode, Json(ErrorResponse))` error bodies); the routes themselves
//! are the spec §6 surface, not the teacher's search/history/settings API.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BotError;
use crate::AppState;

#[derive(RustEmbed)]
#[folder = "web/dist"]
struct Asset;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/join", post(join))
        .route("/part", post(part))
        .route("/msg", post(msg))
        .route("/cancel", post(cancel))
        .route("/shutdown", post(shutdown))
        .route("/info", get(info))
        .route("/ws", get(ws_upgrade))
        .fallback(static_handler)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    server: String,
    channel: String,
}

async fn join(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<impl IntoResponse, BotError> {
    state.supervisor.join(&req.server, &req.channel).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct PartRequest {
    server: String,
    channel: String,
}

async fn part(
    State(state): State<AppState>,
    Json(req): Json<PartRequest>,
) -> Result<impl IntoResponse, BotError> {
    state.supervisor.part(&req.server, &req.channel).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct MsgRequest {
    server: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    message: String,
}

async fn msg(
    State(state): State<AppState>,
    Json(req): Json<MsgRequest>,
) -> Result<impl IntoResponse, BotError> {
    let target = req.user.or(req.channel).ok_or_else(|| {
        BotError::ConfigInvalid("msg request requires either user or channel".to_string())
    })?;
    state.supervisor.msg(&req.server, &target, &req.message).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    server: String,
    nick: String,
    filename: String,
}

async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    if state
        .supervisor
        .cancel(&req.server, &req.nick, &req.filename)
        .await
    {
        Json(StatusResponse { status: "ok" }).into_response()
    } else {
        BotError::Internal("no cancellable transfer for that key".to_string()).into_response()
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        supervisor.shutdown().await;
        std::process::exit(0);
    });
    Json(StatusResponse { status: "shutting down" })
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.info().await)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutbound<'a> {
    Log {
        timestamp: chrono::DateTime<chrono::Utc>,
        level: &'a str,
        message: &'a str,
    },
    Transfers {
        transfers: Vec<crate::dcc::registry::TransferRecord>,
    },
    Echo {
        message: &'a str,
    },
}

/// Streams `{type:"log",...}` records as they're emitted and a
/// `{type:"transfers",...}` snapshot every second; accepts a textual
/// `/echo <text>` diagnostic command from the client.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut log_rx = state.log_sink.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = log_rx.recv() => {
                let Ok(record) = record else { break };
                let payload = WsOutbound::Log {
                    timestamp: record.timestamp,
                    level: &record.level,
                    message: &record.message,
                };
                if send_json(&mut sender, &payload).await.is_err() {
                    break;
                }
            }
            _ = tick.tick() => {
                let transfers = state.supervisor.registry().snapshot().await;
                let payload = WsOutbound::Transfers { transfers };
                if send_json(&mut sender, &payload).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(rest) = text.strip_prefix("/echo ") {
                            let payload = WsOutbound::Echo { message: rest };
                            if send_json(&mut sender, &payload).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    payload: &WsOutbound<'_>,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(payload).unwrap_or_default();
    sender.send(WsMessage::Text(text.into())).await
}

async fn static_handler(uri: Uri) -> impl IntoResponse {
    let path = match uri.path().trim_start_matches('/') {
        "" => "info.html",
        other => other,
    };

    match Asset::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], content.data).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
