//! HTTP and WebSocket surface.
//!
//! - `GET /ws/:document_id` upgrades to the binary sync protocol
//! - `GET /health` reports uptime and registry counters
//! - `GET /api/documents/:document_id/state` shows a live actor's state

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::storage::DocumentKind;
use crate::sync::{AccessResolver, ActorRegistry, DocumentHandle, Permission, RegistryStats, UserId};

/// Header carrying the authenticated user id, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    registry: Arc<ActorRegistry>,
    access: Arc<dyn AccessResolver>,
    started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<ActorRegistry>, access: Arc<dyn AccessResolver>) -> Self {
        Self {
            registry,
            access,
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    #[serde(flatten)]
    registry: RegistryStats,
}

#[derive(Debug, Serialize)]
struct DocumentStateResponse {
    document_id: String,
    kind: DocumentKind,
    observers: usize,
    /// Base64 of the v1-encoded state vector
    state_vector: String,
    meta: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: "not found" }),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal error",
        }),
    )
        .into_response()
}

fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(UserId::new)
}

/// Resolve the caller's permission; `Err` is the response to send instead
async fn authorize(
    state: &AppState,
    document_id: &str,
    user_id: Option<&UserId>,
) -> Result<Permission, Response> {
    match state.access.resolve(document_id, user_id).await {
        Ok(access) => access.permission().ok_or_else(|| {
            debug!("Access to {} refused", document_id);
            not_found()
        }),
        Err(e) => {
            error!("Access check for {} failed: {}", document_id, e);
            Err(internal_error())
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        registry: state.registry.stats(),
    })
}

/// Diagnostic view of a live actor; never starts one
async fn document_state(
    Path(document_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = user_from_headers(&headers);
    if let Err(response) = authorize(&state, &document_id, user_id.as_ref()).await {
        return response;
    }

    let Some(handle) = state.registry.get(&document_id) else {
        return not_found();
    };
    match handle.snapshot().await {
        Ok(snapshot) => Json(DocumentStateResponse {
            document_id: snapshot.document_id,
            kind: snapshot.kind,
            observers: snapshot.observers,
            state_vector: BASE64.encode(&snapshot.state_vector),
            meta: snapshot.meta,
            channels: snapshot.program.map(|program| program.channels().len()),
        })
        .into_response(),
        // Terminated between lookup and query
        Err(_) => not_found(),
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = user_from_headers(&headers);
    let permission = match authorize(&state, &document_id, user_id.as_ref()).await {
        Ok(permission) => permission,
        Err(response) => return response,
    };

    info!(
        "WebSocket upgrade for document {} (user={:?}, permission={:?})",
        document_id, user_id, permission
    );
    ws.on_upgrade(move |socket| handle_websocket(socket, document_id, user_id, permission, state))
}

/// Handle WebSocket connection
async fn handle_websocket(
    socket: WebSocket,
    document_id: String,
    user_id: Option<UserId>,
    permission: Permission,
    state: Arc<AppState>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Frames from the actor to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let (handle, registration) = match state
        .registry
        .connect(&document_id, tx, user_id, permission)
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Failed to register observer on {}: {}", document_id, e);
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };
    let observer_id = registration.observer_id;

    // Task to forward frames from the actor to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Task to forward incoming WebSocket frames to the actor
    let recv_handle: DocumentHandle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    if recv_handle
                        .send_frame(observer_id, Bytes::from(data))
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Text(_) => {
                    debug!("Ignoring text frame from {}", observer_id);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by observer {}", observer_id);
                    break;
                }
                // Pong is handled automatically
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    handle.deregister(observer_id);
    info!("Observer {} disconnected from {}", observer_id, document_id);
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/documents/:document_id/state", get(document_state))
        .route("/ws/:document_id", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActorConfig;
    use crate::storage::{DocumentRecord, DocumentRepository, MemoryRepository, UpdateLog};
    use crate::sync::RecordAccessPolicy;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<AppState>) {
        let repo = Arc::new(MemoryRepository::new());
        repo.put_document(
            &DocumentRecord::new("deck", DocumentKind::Presentation, "Deck")
                .with_owner("alice")
                .with_meta(serde_json::json!({"title": "Seeded"})),
        )
        .await
        .unwrap();

        let registry = Arc::new(ActorRegistry::new(
            UpdateLog::new(repo.clone()),
            ActorConfig::default(),
        ));
        let access = Arc::new(RecordAccessPolicy::new(repo));
        let state = Arc::new(AppState::new(registry, access));
        (router(state.clone()), state)
    }

    async fn get_json(app: Router, uri: &str, user: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(user) = user {
            request = request.header(USER_ID_HEADER, user);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_actors"], 0);
        assert_eq!(body["persistence_failures"], 0);
    }

    #[tokio::test]
    async fn test_state_requires_live_actor() {
        let (app, _) = app().await;
        let (status, _) = get_json(app, "/api/documents/deck/state", Some("alice")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_state_of_live_actor() {
        let (app, state) = app().await;
        state.registry().find_or_start("deck").await;

        let (status, body) = get_json(app, "/api/documents/deck/state", Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["document_id"], "deck");
        assert_eq!(body["kind"], "presentation");
        assert_eq!(body["observers"], 0);
        assert_eq!(body["meta"]["title"], "Seeded");
        assert!(BASE64
            .decode(body["state_vector"].as_str().unwrap())
            .is_ok());
    }

    #[tokio::test]
    async fn test_state_hides_private_documents() {
        let (app, state) = app().await;
        state.registry().find_or_start("deck").await;

        let (status, body) = get_json(app.clone(), "/api/documents/deck/state", Some("mallory")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");

        let (status, _) = get_json(app, "/api/documents/deck/state", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_user_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(user_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, "  ".parse().unwrap());
        assert!(user_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, "alice".parse().unwrap());
        assert_eq!(user_from_headers(&headers).unwrap().as_str(), "alice");
    }
}
