//! Sync Gateway: HTTP routes and the WebSocket connection lifecycle.
//!
//! A connection is authenticated before the upgrade. Rejected attempts get a
//! plain HTTP error and never reach the sync engine.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthVerifier, CollabContext};
use crate::sync::protocol::{ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION};
use crate::sync::server::Session;
use crate::sync::{SyncError, SyncServer};

/// Shared application state
pub struct AppState {
    pub sync: Arc<SyncServer>,
    pub auth: Arc<AuthVerifier>,
    started_at: Instant,
}

impl AppState {
    pub fn new(sync: Arc<SyncServer>, auth: Arc<AuthVerifier>) -> Self {
        Self {
            sync,
            auth,
            started_at: Instant::now(),
        }
    }
}

/// Errors returned by the REST endpoints
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) => e.into_response(),
            ApiError::Sync(e) => {
                let status = match &e {
                    SyncError::DocumentFull(_) => StatusCode::SERVICE_UNAVAILABLE,
                    SyncError::InvalidUpdate(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string()).into_response()
            }
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_documents: usize,
    connected_peers: usize,
    dirty_documents: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    pub document_id: String,
    pub changed: bool,
}

/// Build the gateway router
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/:document_id", get(ws_handler))
        .route("/api/documents/:document_id/content", put(replace_content))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_documents: stats.active_documents,
        connected_peers: stats.connected_peers,
        dirty_documents: stats.dirty_documents,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Token from `?token=` or the `Authorization` header
fn session_token(query: &TokenQuery, headers: &HeaderMap) -> Result<String, AuthError> {
    query
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers))
        .ok_or(AuthError::MissingToken)
}

async fn authenticate(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
    document_id: &str,
) -> Result<CollabContext, AuthError> {
    let token = session_token(query, headers)?;
    state.auth.authenticate(&token, document_id).await.map_err(|e| {
        warn!("Rejected connection to {}: {}", document_id, e);
        e
    })
}

/// WebSocket upgrade handler
async fn ws_handler(
    Path(document_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let context = match authenticate(&state, &query, &headers, &document_id).await {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade").into_response();
    };

    info!("WebSocket upgrade for document {} by {}", document_id, context.identity.uid);
    ws.on_upgrade(move |socket| handle_websocket(socket, context, state))
}

/// Rewrite a document's markdown from outside a sync connection
async fn replace_content(
    Path(document_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ContentRequest>,
) -> Result<Json<ContentResponse>, ApiError> {
    let context = authenticate(&state, &TokenQuery::default(), &headers, &document_id).await?;
    let changed = state.sync.replace_content(context, &body.content).await?;

    Ok(Json(ContentResponse {
        document_id,
        changed,
    }))
}

/// Drive one authenticated connection until the transport closes
async fn handle_websocket(socket: WebSocket, context: CollabContext, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let Session {
        peer_id,
        document_id,
        state: initial_state,
    } = match state.sync.connect(context, tx.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to join document: {}", e);
            let msg = SyncProtocol::error_response(ErrorCode::ServerError, e.to_string());
            let _ = send_server_message(&mut ws_sender, &msg).await;
            return;
        }
    };

    let welcome = match welcome_frame(&document_id, &peer_id, initial_state) {
        Ok(frame) => frame,
        Err(rejection) => {
            let _ = send_server_message(&mut ws_sender, &rejection).await;
            state.sync.disconnect(&document_id, &peer_id);
            return;
        }
    };

    if let Err(e) = ws_sender.send(Message::Binary(welcome.to_vec())).await {
        error!("Failed to send welcome for {}: {}", document_id, e);
        state.sync.disconnect(&document_id, &peer_id);
        return;
    }

    let peer_id_send = peer_id.clone();
    let peer_id_recv = peer_id.clone();
    let document_id_recv = document_id.clone();
    let state_recv = state.clone();

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match SyncProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for peer {}", peer_id_send);
    });

    // Task to handle incoming WebSocket messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match SyncProtocol::decode_client(&data) {
                    Ok(client_msg) => {
                        handle_client_message(client_msg, &peer_id_recv, &document_id_recv, &state_recv, &tx);
                    }
                    Err(e) => {
                        warn!("Failed to decode binary message: {}", e);
                        let _ = tx.send(SyncProtocol::error_response(e.error_code(), e.to_string()));
                    }
                },
                Message::Text(_) => {
                    debug!("Rejecting text frame from {}", peer_id_recv);
                    let _ = tx.send(SyncProtocol::error_response(
                        ErrorCode::InvalidMessage,
                        "expected a binary frame",
                    ));
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", peer_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    // The engine flushes on its own task once the last peer is gone
    state.sync.disconnect(&document_id, &peer_id);
    info!("Peer {} disconnected from document {}", peer_id, document_id);
}

/// Handle a decoded client message
fn handle_client_message(
    msg: ClientMessage,
    peer_id: &str,
    document_id: &str,
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::Update { update } => {
            if let Err(e) = state.sync.apply_update(document_id, peer_id, update) {
                warn!("Rejected update from {} on {}: {}", peer_id, document_id, e);
                let _ = tx.send(SyncProtocol::error_response(ErrorCode::UpdateRejected, e.to_string()));
            }
        }

        ClientMessage::SyncRequest => match state.sync.full_state(document_id) {
            Ok(full) => {
                let _ = tx.send(ServerMessage::Update {
                    update: full,
                    from_peer: None,
                });
            }
            Err(e) => {
                let _ = tx.send(SyncProtocol::error_response(ErrorCode::ServerError, e.to_string()));
            }
        },

        ClientMessage::Awareness { payload } => {
            if let Err(e) = state.sync.relay_awareness(document_id, peer_id, payload) {
                debug!("Dropped awareness from {}: {}", peer_id, e);
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp_millis(),
            });
        }
    }
}

/// Encoded welcome, or the error to send instead when the state does not
/// fit in one frame
fn welcome_frame(document_id: &str, peer_id: &str, state: Vec<u8>) -> Result<Bytes, ServerMessage> {
    let state_len = state.len();
    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        document_id: document_id.to_string(),
        peer_id: peer_id.to_string(),
        state,
    };

    SyncProtocol::encode_server(&welcome).map_err(|e| {
        error!(
            "Cannot send {} bytes of state for {} to {}: {}",
            state_len, document_id, peer_id, e
        );
        SyncProtocol::error_response(ErrorCode::ServerError, format!("document state not sendable: {}", e))
    })
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = SyncProtocol::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}
