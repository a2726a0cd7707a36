// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// WebSocket hub server. Connections identify themselves by a role path
// segment and an id (`/ws/worker/<id>`), or by `type`/`id` query
// parameters on the bare `/ws` route. Auth is a shared token checked
// before upgrade. Each accepted socket gets its own task that owns the
// sink: inbound frames, queued outbound frames and heartbeat ticks are
// multiplexed with select.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::hub::handler::{self, ConnectionContext};
use crate::hub::messages::{ConnectionRole, OutboundFrame};
use crate::hub::HubState;
use crate::types;

pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws/:role/:id", get(ws_by_path))
        .route("/ws", get(ws_by_query))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<HubState>) -> anyhow::Result<()> {
    let address = state.config.hub_listen_address.clone();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("hub listening on {}", address);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn healthz(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.count().await,
        "server_time": types::now_ms(),
    }))
}

async fn ws_by_path(
    ws: WebSocketUpgrade,
    Path((role, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<HubState>>,
) -> Response {
    accept(ws, state, &role, &id, &params, &headers)
}

async fn ws_by_query(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<HubState>>,
) -> Response {
    let role = params.get("type").cloned().unwrap_or_default();
    let id = params.get("id").cloned().unwrap_or_default();
    accept(ws, state, &role, &id, &params, &headers)
}

fn accept(
    ws: WebSocketUpgrade,
    state: Arc<HubState>,
    role: &str,
    id: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let Some(role) = ConnectionRole::parse(role) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("unknown connection role: {:?}", role),
        )
            .into_response();
    };
    if id.is_empty() {
        return (StatusCode::BAD_REQUEST, "connection id is required").into_response();
    }
    if let Err(e) = check_auth(&state, params, headers) {
        warn!(role = role.as_str(), id, "rejected connection: {}", e);
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let id = id.to_string();
    ws.on_upgrade(move |socket| handle_socket(state, socket, role, id))
}

/// Token from the `token` query parameter or the Authorization header
/// (with or without a Bearer prefix).
fn check_auth(
    state: &HubState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(), BrokerError> {
    let Some(expected) = &state.config.auth_token else {
        return Ok(());
    };
    let provided = params
        .get("token")
        .cloned()
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string())
        });
    match provided {
        Some(token) if &token == expected => Ok(()),
        Some(_) => Err(BrokerError::Auth("invalid token".to_string())),
        None => Err(BrokerError::Auth("missing token".to_string())),
    }
}

async fn handle_socket(state: Arc<HubState>, socket: WebSocket, role: ConnectionRole, id: String) {
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundFrame>();
    let connection_id = match state.registry.register(role, &id, out_tx).await {
        Ok(connection_id) => connection_id,
        Err(e) => {
            let mut socket = socket;
            let _ = socket.send(Message::Text(OutboundFrame::error(&e).to_text())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let ctx = ConnectionContext {
        connection_id: connection_id.clone(),
        role,
        bound_id: id.clone(),
    };

    // Welcome frame: assigned connection id, role, server time.
    let welcome = OutboundFrame::system_status(&connection_id, role);
    if sink.send(Message::Text(welcome.to_text())).await.is_err() {
        cleanup(&state, &ctx).await;
        return;
    }

    let send_timeout = state.config.connection_timeout;
    let idle_ms = state.config.connection_timeout.as_millis() as i64;
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { break };
                let text = frame.to_text();
                match tokio::time::timeout(send_timeout, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection_id = %connection_id, "send failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        warn!(connection_id = %connection_id, "send timed out, dropping connection");
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        state.registry.record_received(&connection_id).await;
                        let replies = handler::dispatch(&state, &ctx, &text).await;
                        for frame in replies {
                            state.registry.send(&connection_id, frame).await;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        state.registry.record_received(&connection_id).await;
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = %connection_id, "connection closing");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, "receive error: {}", e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let last = state.registry.last_activity(&connection_id).await.unwrap_or(0);
                if types::now_ms() - last > idle_ms {
                    info!(connection_id = %connection_id, "closing idle connection");
                    break;
                }
                state.registry.send(&connection_id, OutboundFrame::heartbeat()).await;
            }
        }
    }

    cleanup(&state, &ctx).await;
}

async fn cleanup(state: &Arc<HubState>, ctx: &ConnectionContext) {
    state.registry.remove(&ctx.connection_id).await;
    state.broadcaster.detach_monitor(&ctx.connection_id).await;
    if ctx.role == ConnectionRole::Worker {
        if let Err(e) = state
            .broker
            .disconnect_worker(&ctx.bound_id, "connection closed")
            .await
        {
            warn!(worker_id = %ctx.bound_id, "disconnect handling failed: {}", e);
        }
    }
}
