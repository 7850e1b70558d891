//! HTTP API and connector WebSocket endpoint
//!
//! - `GET  /connectors/:id/ws?token=...` connector socket (token may also be
//!   sent as `Authorization: Bearer`)
//! - `POST /connectors/:id/commands` dispatch `{type, payload}` and return the reply
//! - `POST /connectors/:id/invalidate` bump the connector's token version
//! - `GET  /connectors/:id` where the connector is served from
//! - `GET  /health`, `GET /metrics`

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::borrow::Cow;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::common::auth::bearer_token;
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::utils::validate_connector_id;
use crate::common::Error;
use crate::coordinator::connection::{CloseCode, Connection, ConnectorInfo, Outbound};
use crate::coordinator::registry::Coordinator;
use crate::coordinator::transport::Command;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub coordinator: Coordinator,
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/connectors/:id/ws", get(connector_ws))
        .route("/connectors/:id/commands", post(dispatch_command))
        .route("/connectors/:id/invalidate", post(invalidate_credentials))
        .route("/connectors/:id", get(connector_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    let status = err.to_http_status();
    let body = match &err {
        Error::CommandFailed(details) => json!({ "error": "command failed", "details": details }),
        _ => json!({ "error": err.to_string() }),
    };
    (status, Json(body)).into_response()
}

fn check_id(connector_id: &str) -> Result<(), Response> {
    validate_connector_id(connector_id).map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn connector_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(connector_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_id(&connector_id) {
        return response;
    }
    let token = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(str::to_string)
    });
    ws.on_upgrade(move |socket| serve_connector(socket, state.coordinator, connector_id, token))
}

fn close_message(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: Cow::Borrowed(code.reason()),
    }))
}

async fn serve_connector(
    mut socket: WebSocket,
    coordinator: Coordinator,
    connector_id: String,
    token: Option<String>,
) {
    let (token_hash, version) = match coordinator.authenticate(&connector_id, token.as_deref()).await {
        Ok(accepted) => accepted,
        Err(Error::InvalidCredentials(reason)) => {
            tracing::info!(connector_id = %connector_id, reason = %reason, "Rejecting connector with invalid token");
            let _ = socket.send(close_message(CloseCode::InvalidToken)).await;
            return;
        }
        Err(e) => {
            tracing::warn!(connector_id = %connector_id, error = %e, "Connector authentication failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (conn, mut outbound) = Connection::new(token_hash, version);
    match coordinator
        .register_connection(ConnectorInfo::new(&connector_id), conn.clone())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            // The rejection close is already queued
            if let Ok(Outbound::Close(code)) = outbound.try_recv() {
                let _ = socket.send(close_message(code)).await;
            }
            return;
        }
        Err(e) => {
            tracing::warn!(connector_id = %connector_id, error = %e, "Connector registration failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let (mut sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let _ = sink.send(close_message(code)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = coordinator.handle_message(&connector_id, conn.id(), &text).await {
                        tracing::warn!(connector_id = %connector_id, connection_id = conn.id(), error = %e, "Bad connector frame");
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    if let Err(e) = coordinator
        .unregister_connection(&connector_id, Some(conn.id()))
        .await
    {
        tracing::warn!(connector_id = %connector_id, error = %e, "Unregister failed");
    }
}

async fn dispatch_command(
    State(state): State<GatewayState>,
    Path(connector_id): Path<String>,
    Json(command): Json<Command>,
) -> Response {
    if let Err(response) = check_id(&connector_id) {
        return response;
    }
    match state.coordinator.dispatch_command(&connector_id, command).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(e),
    }
}

async fn invalidate_credentials(
    State(state): State<GatewayState>,
    Path(connector_id): Path<String>,
) -> Response {
    if let Err(response) = check_id(&connector_id) {
        return response;
    }
    match state.coordinator.invalidate_credentials(&connector_id).await {
        Ok(version) => Json(json!({
            "connectorId": connector_id,
            "tokenVersion": version,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn connector_status(
    State(state): State<GatewayState>,
    Path(connector_id): Path<String>,
) -> Response {
    if let Err(response) = check_id(&connector_id) {
        return response;
    }
    match state.coordinator.connector_status(&connector_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    Json(json!({
        "status": "healthy",
        "instanceId": coordinator.instance_id(),
        "distributed": coordinator.transport().is_some(),
        "connectors": coordinator.local_connectors().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
