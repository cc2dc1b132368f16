//! HTTP and WebSocket routes for the awaitful server.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use tokio::sync::Mutex as TokioMutex;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::todos::TodoHub;

/// Delay before `/items` answers.
pub const ITEMS_DELAY: Duration = Duration::from_secs(1);

/// Delay before `/items3` answers.
pub const ITEMS3_DELAY: Duration = Duration::from_secs(5);

/// Application state shared across handlers.
pub struct AppState {
    /// Todo list behind the `/wss` socket.
    pub todos: TodoHub,
    /// Directory static files are served from.
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(static_dir: impl Into<PathBuf>) -> Self {
        Self {
            todos: TodoHub::new(),
            static_dir: static_dir.into(),
        }
    }
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/items", get(items_handler))
        .route("/items2", get(items2_handler))
        .route("/items3", get(items3_handler))
        .route("/itemUrls", get(item_urls_handler))
        .route("/wss", get(ws_handler))
        .fallback(static_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn items_handler() -> Json<Value> {
    tokio::time::sleep(ITEMS_DELAY).await;
    Json(json!(["test", "test2"]))
}

async fn items2_handler() -> Json<Value> {
    Json(json!(["test3", "test4"]))
}

async fn items3_handler() -> Json<Value> {
    tokio::time::sleep(ITEMS3_DELAY).await;
    Json(json!(["test", "test2", "test3", "test4"]))
}

async fn item_urls_handler() -> Json<Value> {
    Json(json!(["/items", "/items2", "/items3"]))
}

/// Map a request path to a file under the static root.
///
/// Paths whose last segment has no extension are pages: a trailing slash
/// gets `index.html`, anything else gets `.html`. Parent-directory segments
/// are refused.
pub fn static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut path = request_path.to_string();
    let slash = path.rfind('/');
    let dot = path.rfind('.');
    let has_extension = matches!((dot, slash), (Some(d), Some(s)) if d > s)
        || matches!((dot, slash), (Some(_), None));
    if !has_extension {
        if path.ends_with('/') || path.is_empty() {
            path.push_str("index.html");
        } else {
            path.push_str(".html");
        }
    }

    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

/// Serve a file from the static root.
async fn static_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let Some(file) = static_path(&state.static_dir, request.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    tracing::debug!(path = %file.display(), "static file");

    match ServeFile::new(file).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

type Sender = Arc<TokioMutex<SplitSink<WebSocket, Message>>>;
type Subscriptions = Arc<Mutex<FxHashSet<String>>>;

/// Handle WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(TokioMutex::new(sender));
    let subscriptions: Subscriptions = Arc::default();

    // Forward hub pushes for subscribed paths.
    let mut rx = state.todos.subscribe();
    let forward_sender = sender.clone();
    let forward_paths = subscriptions.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "socket client lagging; pushes dropped");
                    continue;
                }
                Err(_) => break,
            };
            let wanted = forward_paths
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&msg.path);
            if wanted && !send_message(&forward_sender, &msg).await {
                break;
            }
        }
    });

    // Handle incoming client messages
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(msg, &state, &sender, &subscriptions).await,
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {} (input: {})", e, text);
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    forward_task.abort();
}

/// Send a push through the WebSocket. Returns `false` once the peer is gone.
async fn send_message(sender: &Sender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let mut sender = sender.lock().await;
            sender.send(Message::Text(json.into())).await.is_ok()
        }
        Err(e) => {
            tracing::error!("Failed to serialize push: {}", e);
            true
        }
    }
}

/// Handle a client message.
async fn handle_client_message(
    msg: ClientMessage,
    state: &Arc<AppState>,
    sender: &Sender,
    subscriptions: &Subscriptions,
) {
    let outcome = match msg {
        ClientMessage::CreateTodo { text } => state.todos.create(text).map(|_| ()),
        ClientMessage::RemoveTodo { id } => state.todos.remove(id).map(|_| ()),
        ClientMessage::UpdateTodo { todo } => state.todos.update(todo).map(|_| ()),
        ClientMessage::Subscribe { path } => {
            subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.clone());
            tracing::debug!(%path, "client subscribed");
            match state.todos.snapshot(&path) {
                Ok(Some(current)) => {
                    send_message(sender, &current).await;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = outcome {
        tracing::error!("Failed to handle client message: {}", e);
    }
}
