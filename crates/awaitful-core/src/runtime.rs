//! Runtime: the registry plus the transports and settings every context
//! shares.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as TokioMutex;

use crate::cell::Handle;
use crate::context::{Context, ResourceTables};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::registry::Registry;
use crate::scheduler::{LoopHandle, RenderLoop};
use crate::scope::Scope;
use crate::session::ReadSession;
use crate::socket::{AsyncSocket, Connector, WsConnector};

/// Delay before a rejected producer is run again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Backoff before retrying a rejected cell.
    pub retry_delay: Duration,
    /// Base URL for relative `fetch` and `ws` targets.
    pub base_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            base_url: None,
        }
    }
}

/// Shared state behind every [`Context`].
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    registry: Registry,
    config: RuntimeConfig,
    fetcher: Arc<dyn Fetcher>,
    connector: Arc<dyn Connector>,
    /// Open sockets by URL. Held across connect so each URL opens once.
    sockets: TokioMutex<FxHashMap<String, Arc<AsyncSocket>>>,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    connector: Option<Arc<dyn Connector>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn build(self) -> Runtime {
        let base_url = self.config.base_url.clone();
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new(base_url.clone())));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(base_url)));
        Runtime {
            inner: Arc::new(RuntimeInner {
                registry: Registry::new(),
                config: self.config,
                fetcher,
                connector,
                sockets: TokioMutex::new(FxHashMap::default()),
            }),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    /// Runtime with HTTP and websocket transports from `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            fetcher: None,
            connector: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.inner.fetcher.clone()
    }

    /// Context for a new component instance: fresh key tables, root scope.
    pub fn context(&self) -> Context {
        self.context_in(Scope::new())
    }

    /// Context for a new component instance living under `scope`.
    pub fn context_in(&self, scope: Scope) -> Context {
        Context::new(
            self.clone(),
            Arc::new(ResourceTables::default()),
            ReadSession::new(),
            scope,
        )
    }

    /// Run `render` as a new component instance's render loop.
    pub fn spawn_loop<R, F, Fut, S>(&self, label: &str, render: F, sink: S) -> LoopHandle
    where
        R: Send + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        S: FnMut(R) + Send + 'static,
    {
        let ctx = self.context();
        RenderLoop::new(label, &ctx).spawn(render, sink)
    }

    /// Anonymous externally settled cell holding `value`.
    pub fn global<T: Serialize>(&self, value: T) -> Result<Handle<T>> {
        let id = self.registry().create_resolved(serde_json::to_value(value)?)?;
        Ok(Handle::from_id(id))
    }

    /// Current value of a handle, untracked.
    pub fn get<T: DeserializeOwned>(&self, handle: Handle<T>) -> Result<T> {
        let value = self
            .registry()
            .value(handle.id())?
            .ok_or(Error::CellNotFound(handle.id()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Write a handle. Returns `false` if the value was unchanged.
    pub fn set<T: Serialize>(&self, handle: Handle<T>, value: T) -> Result<bool> {
        self.registry()
            .write(handle.id(), serde_json::to_value(value)?)
    }

    /// The socket for `url`, connecting on first use.
    pub(crate) async fn socket(&self, url: &str) -> Result<Arc<AsyncSocket>> {
        let mut sockets = self.inner.sockets.lock().await;
        if let Some(socket) = sockets.get(url)
            && !socket.is_closed()
        {
            return Ok(socket.clone());
        }

        let connection = self.inner.connector.connect(url).await?;
        let socket = AsyncSocket::open(url, connection, self.registry().clone());
        sockets.insert(url.to_string(), socket.clone());
        Ok(socket)
    }
}
