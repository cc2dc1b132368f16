//! Websocket subscriptions.
//!
//! One [`AsyncSocket`] exists per URL per runtime. Every subscribed path maps
//! to an externally settled cell; a push `{path, data}` from the backend is a
//! write to that cell, which wakes whichever render loops read it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::cell::{CellError, CellId, CellStatus, Producer};
use crate::context::Context;
use crate::error::{Error, Result, lock_error};
use crate::protocol::{Push, SocketRequest};
use crate::registry::Registry;

/// Text-frame duplex channel to a backend.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Connection {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens connections for `ws(url)`.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection>>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
///
/// Relative URLs such as `/wss` are resolved against `base_url`, with the
/// `http` scheme mapped to `ws`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    base_url: Option<String>,
}

impl WsConnector {
    pub fn new(base_url: Option<String>) -> Self {
        Self { base_url }
    }

    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return url.to_string();
        }
        let Some(base) = &self.base_url else {
            return url.to_string();
        };
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.clone()
        };
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection>> {
        let target = self.resolve(url);
        Box::pin(async move {
            let (stream, _) = tokio_tungstenite::connect_async(target.as_str())
                .await
                .map_err(|e| Error::Socket(format!("connect {target}: {e}")))?;
            tracing::debug!(url = %target, "socket open");

            let (mut sink, mut source) = stream.split();
            let (client, server) = Connection::pair();
            let Connection {
                outgoing: inbound,
                incoming: mut outbound,
            } = server;

            tokio::spawn(async move {
                while let Some(text) = outbound.recv().await {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text.as_str().to_owned(),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "socket read failed");
                            break;
                        }
                    };
                    if inbound.send(text).is_err() {
                        break;
                    }
                }
            });

            Ok(client)
        })
    }
}

/// An open socket and its path table.
pub struct AsyncSocket {
    url: String,
    outgoing: mpsc::UnboundedSender<String>,
    paths: Mutex<FxHashMap<String, CellId>>,
    registry: Registry,
    closed: AtomicBool,
}

impl AsyncSocket {
    /// Wrap an established connection and start routing its pushes.
    pub(crate) fn open(url: &str, connection: Connection, registry: Registry) -> Arc<Self> {
        let Connection {
            outgoing,
            mut incoming,
        } = connection;
        let socket = Arc::new(Self {
            url: url.to_string(),
            outgoing,
            paths: Mutex::new(FxHashMap::default()),
            registry,
            closed: AtomicBool::new(false),
        });

        let reader = socket.clone();
        tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                reader.handle_message(&text);
            }
            reader.close();
        });

        socket
    }

    fn paths(&self) -> Result<MutexGuard<'_, FxHashMap<String, CellId>>> {
        self.paths.lock().map_err(lock_error)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cell subscribed under `path`, if any.
    pub fn subscribed(&self, path: &str) -> Result<Option<CellId>> {
        Ok(self.paths()?.get(path).copied())
    }

    /// Send one text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| Error::Socket(format!("{} is closed", self.url)))
    }

    /// Cell for `path`, plus whether this call created it.
    fn path_cell(&self, path: &str) -> Result<(CellId, bool)> {
        let mut paths = self.paths()?;
        if let Some(&id) = paths.get(path) {
            return Ok((id, false));
        }
        let id = self.registry.create(Producer::External)?;
        paths.insert(path.to_string(), id);
        Ok((id, true))
    }

    /// Drop `path` from the table so the next subscription sends again.
    /// Readers already waiting on its cell see it rejected.
    fn unsubscribe(&self, path: &str, id: CellId) -> Result<()> {
        self.paths()?.remove(path);
        self.registry
            .reject(id, &CellError::Closed(self.url.clone()))
    }

    fn handle_message(&self, text: &str) {
        let push: Push = match serde_json::from_str(text) {
            Ok(push) => push,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "ignoring malformed push");
                return;
            }
        };

        let id = match self.subscribed(&push.path) {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::trace!(path = %push.path, "push for unsubscribed path");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "socket path table unavailable");
                return;
            }
        };

        if let Err(e) = self.registry.write(id, push.data) {
            tracing::error!(%id, error = %e, "failed to apply push");
        }
    }

    /// Reject every subscribed cell that never got data.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::debug!(url = %self.url, "socket closed");

        let ids: Vec<CellId> = match self.paths() {
            Ok(paths) => paths.values().copied().collect(),
            Err(_) => return,
        };
        let error = CellError::Closed(self.url.clone());
        for id in ids {
            if matches!(self.registry.status(id), Ok(CellStatus::Pending)) {
                let _ = self.registry.reject(id, &error);
            }
        }
    }
}

/// A socket as seen from one render context.
#[derive(Clone)]
pub struct SocketContext {
    socket: Arc<AsyncSocket>,
    ctx: Context,
}

impl SocketContext {
    pub(crate) fn new(socket: Arc<AsyncSocket>, ctx: Context) -> Self {
        Self { socket, ctx }
    }

    pub fn socket(&self) -> &Arc<AsyncSocket> {
        &self.socket
    }

    /// Current data for `path`, tracked as a dependency of the pass.
    ///
    /// The first subscription to a path sends the subscribe request; later
    /// calls only read.
    pub async fn subscribe<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let id = self.subscribe_cell(path)?;
        let value = self.ctx.read_cell(id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Cell for `path`, sending the subscribe request on first use.
    pub fn subscribe_cell(&self, path: &str) -> Result<CellId> {
        let (id, created) = self.socket.path_cell(path)?;
        if created {
            tracing::debug!(url = %self.socket.url, path, "subscribing");
            let sent = self.send(&SocketRequest::Subscribe {
                path: path.to_string(),
            });
            if let Err(e) = sent {
                self.socket.unsubscribe(path, id)?;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Serialize and send a payload.
    pub fn send<P: Serialize>(&self, payload: &P) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.socket.send_text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_maps_scheme() {
        let connector = WsConnector::new(Some("http://127.0.0.1:3000".into()));
        assert_eq!(connector.resolve("/wss"), "ws://127.0.0.1:3000/wss");

        let secure = WsConnector::new(Some("https://example.com/".into()));
        assert_eq!(secure.resolve("wss"), "wss://example.com/wss");
    }

    #[test]
    fn test_resolve_absolute() {
        let connector = WsConnector::new(Some("http://127.0.0.1:3000".into()));
        assert_eq!(connector.resolve("ws://other/wss"), "ws://other/wss");
    }

    #[tokio::test]
    async fn test_connection_pair() {
        let (a, mut b) = Connection::pair();
        a.outgoing.send("hello".into()).unwrap();
        assert_eq!(b.incoming.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_push_routes_to_path_cell() {
        let registry = Registry::new();
        let (client, mut server) = Connection::pair();
        let socket = AsyncSocket::open("/wss", client, registry.clone());

        let (id, created) = socket.path_cell("/todos").unwrap();
        assert!(created);
        assert_eq!(socket.path_cell("/todos").unwrap(), (id, false));

        server
            .outgoing
            .send(r#"{"path":"/todos","data":[1,2]}"#.into())
            .unwrap();
        let mut rx = registry.watch(id).unwrap();
        rx.wait_for(|v| *v > 0).await.unwrap();
        assert_eq!(
            registry.value(id).unwrap(),
            Some(serde_json::json!([1, 2]))
        );

        socket.send_text("ping".into()).unwrap();
        assert_eq!(server.incoming.recv().await.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_paths() {
        let registry = Registry::new();
        let (client, server) = Connection::pair();
        let socket = AsyncSocket::open("/wss", client, registry.clone());
        let (id, _) = socket.path_cell("/todos").unwrap();

        let mut rx = registry.watch(id).unwrap();
        drop(server);
        rx.wait_for(|v| *v > 0).await.unwrap();

        assert!(socket.is_closed());
        assert_eq!(registry.status(id).unwrap(), CellStatus::Rejected);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_not_registered() {
        let runtime = crate::Runtime::default();
        let (client, server) = Connection::pair();
        let socket = AsyncSocket::open("/wss", client, runtime.registry().clone());
        let Connection {
            outgoing: _open,
            incoming,
        } = server;
        drop(incoming);

        let ws = SocketContext::new(socket.clone(), runtime.context());
        assert!(matches!(ws.subscribe_cell("/todos"), Err(Error::Socket(_))));
        assert_eq!(socket.subscribed("/todos").unwrap(), None);

        // A later attempt tries to send again instead of reusing the cell.
        assert!(ws.subscribe_cell("/todos").is_err());
    }
}
