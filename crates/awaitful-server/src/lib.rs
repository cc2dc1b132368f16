//! Reference backend for awaitful components.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Routes**: JSON item endpoints, health check and static files
//! - **Todos**: In-memory todo list pushing changes over `/wss`
//! - **Protocol**: Client messages and path-tagged pushes

pub mod error;
pub mod protocol;
pub mod routes;
pub mod todos;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;

pub use error::{ServerError, ServerResult};
pub use protocol::{ClientMessage, ServerMessage, Todo};
pub use routes::{AppState, create_router};
pub use todos::TodoHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Directory static files are served from.
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: PathBuf::from("serve"),
        }
    }
}

impl ServerConfig {
    /// Socket address built from `host` and `port`.
    pub fn addr(&self) -> ServerResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

/// Start the server and run until Ctrl+C.
pub async fn serve(config: ServerConfig) -> ServerResult<()> {
    let addr = config.addr()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Starting awaitful server at http://{}", addr);
    tracing::info!("Serving static files from {}", config.static_dir.display());

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // Handle Ctrl+C for graceful shutdown
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    let state = Arc::new(AppState::new(config.static_dir));
    run(listener, state, async move {
        let _ = shutdown_rx.await;
    })
    .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ServerResult<()> {
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
