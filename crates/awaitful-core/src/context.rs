//! Named-resource façade.
//!
//! A [`Context`] is what a render function receives for one pass. Every
//! keyed read (`state`, `prop`, `fetch`, socket `subscribe`) goes through it,
//! creating or reusing a cell and recording the read in the pass's
//! [`ReadSession`]. Nothing is tracked through ambient globals.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cell::{CellError, CellId, Handle, Producer};
use crate::error::{Error, Result, lock_error};
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::scheduler::{LoopHandle, RenderLoop};
use crate::scope::Scope;
use crate::session::ReadSession;
use crate::socket::SocketContext;

/// Keyed cells of one component instance.
///
/// Shared by `Arc` with every nested renderable of the instance, so a key
/// resolves to the same cell however deep the read happens.
#[derive(Default)]
pub struct ResourceTables {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    states: FxHashMap<String, CellId>,
    properties: FxHashMap<String, CellId>,
    /// Last `initial` argument seen per state key.
    initial_vals: FxHashMap<String, Value>,
}

impl ResourceTables {
    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.inner.lock().map_err(lock_error)
    }

    pub fn state_cell(&self, key: &str) -> Result<Option<CellId>> {
        Ok(self.lock()?.states.get(key).copied())
    }

    pub fn prop_cell(&self, name: &str) -> Result<Option<CellId>> {
        Ok(self.lock()?.properties.get(name).copied())
    }
}

/// Façade handed to render functions, listeners and derived computations.
#[derive(Clone)]
pub struct Context {
    runtime: Runtime,
    tables: Arc<ResourceTables>,
    session: ReadSession,
    scope: Scope,
}

impl Context {
    pub(crate) fn new(
        runtime: Runtime,
        tables: Arc<ResourceTables>,
        session: ReadSession,
        scope: Scope,
    ) -> Self {
        Self {
            runtime,
            tables,
            session,
            scope,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn registry(&self) -> &Registry {
        self.runtime.registry()
    }

    pub fn session(&self) -> &ReadSession {
        &self.session
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn tables(&self) -> &Arc<ResourceTables> {
        &self.tables
    }

    /// Same instance and scope, fresh session.
    pub(crate) fn with_session(&self, session: ReadSession) -> Context {
        Self::new(
            self.runtime.clone(),
            self.tables.clone(),
            session,
            self.scope.clone(),
        )
    }

    /// Same instance, fresh session, living under `scope`.
    pub fn with_scope(&self, scope: Scope) -> Context {
        Self::new(
            self.runtime.clone(),
            self.tables.clone(),
            ReadSession::new(),
            scope,
        )
    }

    /// Context for an event listener.
    ///
    /// Every cell this context's pass has read is frozen at its current
    /// state, reads never join a dependency set, and writes made by the
    /// listener only wake the loops watching those cells for their next pass.
    pub fn listener(&self) -> Result<Context> {
        let registry = self.registry();
        let mut frozen = Vec::new();
        for id in self.session.touched()? {
            frozen.push((id, registry.freeze(id)?));
        }
        Ok(self.with_session(ReadSession::frozen(frozen)))
    }

    /// Read a cell through this pass's session.
    pub async fn read_cell(&self, id: CellId) -> Result<Value> {
        if self.scope.is_aborted() {
            return Err(Error::Aborted);
        }
        self.registry().read(id, &self.session).await
    }

    /// Read a typed handle, tracking it.
    pub async fn read<T: DeserializeOwned>(&self, handle: Handle<T>) -> Result<T> {
        let value = self.read_cell(handle.id()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Local state under `key`.
    ///
    /// The first call creates the cell holding `initial`. A later call with
    /// a different `initial` than the previous call overwrites the state, as
    /// if `set` had been called.
    pub async fn state<T>(&self, key: &str, initial: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let initial = serde_json::to_value(initial)?;
        let (id, overwrite) = {
            let mut tables = self.tables.lock()?;
            match tables.states.get(key).copied() {
                Some(id) => {
                    let changed = tables.initial_vals.get(key) != Some(&initial);
                    if changed {
                        tables.initial_vals.insert(key.to_string(), initial.clone());
                    }
                    (id, changed.then_some(initial))
                }
                None => {
                    let id = self.registry().create_resolved(initial.clone())?;
                    tables.states.insert(key.to_string(), id);
                    tables.initial_vals.insert(key.to_string(), initial);
                    (id, None)
                }
            }
        };

        if let Some(value) = overwrite {
            tracing::trace!(key, "state re-keyed with a new initial value");
            self.registry().write(id, value)?;
        }

        let value = self.read_cell(id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Overwrite local state. Returns `false` when the value is unchanged.
    ///
    /// An unknown key is created holding `value`.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let mut tables = self.tables.lock()?;
        match tables.states.get(key).copied() {
            Some(id) => {
                drop(tables);
                self.registry().write(id, value)
            }
            None => {
                let id = self.registry().create_resolved(value.clone())?;
                tables.states.insert(key.to_string(), id);
                tables.initial_vals.insert(key.to_string(), value);
                Ok(true)
            }
        }
    }

    /// Current local state under `key`, untracked.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.peek(self.tables.state_cell(key)?)
    }

    /// Observed attribute `name`, defaulting to `default` on first use.
    pub async fn prop<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let id = {
            let mut tables = self.tables.lock()?;
            match tables.properties.get(name).copied() {
                Some(id) => id,
                None => {
                    let id = self
                        .registry()
                        .create_resolved(serde_json::to_value(default)?)?;
                    tables.properties.insert(name.to_string(), id);
                    id
                }
            }
        };
        let value = self.read_cell(id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Push an attribute value, creating the property if needed.
    pub fn set_prop<T: Serialize>(&self, name: &str, value: T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let mut tables = self.tables.lock()?;
        match tables.properties.get(name).copied() {
            Some(id) => {
                drop(tables);
                self.registry().write(id, value)
            }
            None => {
                let id = self.registry().create_resolved(value)?;
                tables.properties.insert(name.to_string(), id);
                Ok(true)
            }
        }
    }

    /// Current attribute value, untracked.
    pub fn get_prop<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.peek(self.tables.prop_cell(name)?)
    }

    fn peek<T: DeserializeOwned>(&self, id: Option<CellId>) -> Result<Option<T>> {
        let Some(id) = id else {
            return Ok(None);
        };
        match self.registry().value(id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// JSON document at `url`, cached for the whole runtime.
    ///
    /// The first call anywhere starts the request; every other caller, in
    /// any component, shares that cell. A fetched document is not requested
    /// again unless the request failed.
    pub async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let fetcher = self.runtime.fetcher();
        let target = url.to_string();
        let id = self.registry().resource(url, move || {
            Producer::load(move || fetcher.fetch(&target))
        })?;
        let value = self.read_cell(id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Socket for `url`, opened once per runtime.
    pub async fn ws(&self, url: &str) -> Result<SocketContext> {
        let socket = self.runtime.socket(url).await?;
        Ok(SocketContext::new(socket, self.clone()))
    }

    /// Anonymous externally settled cell.
    pub fn global<T: Serialize>(&self, value: T) -> Result<Handle<T>> {
        self.runtime.global(value)
    }

    /// Value computed by its own render loop.
    ///
    /// `compute` runs in a child scope with its own sessions, sharing this
    /// instance's key tables. Its result is stored in an anonymous cell that
    /// readers track like any other; equal results do not wake them. A failed
    /// computation rejects the cell until the next success.
    pub fn derive<T, F, Fut>(&self, label: &str, compute: F) -> Result<Derived<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.registry().create(Producer::External)?;
        let scope = self.scope.child();
        let owner = self.with_scope(scope.clone());

        let output = self.registry().clone();
        let failure = self.registry().clone();
        let handle = RenderLoop::new(label, &owner)
            .on_failure(move |err| {
                if let Err(e) = failure.reject(id, &CellError::Failed(err.to_string())) {
                    tracing::error!(%id, error = %e, "failed to reject derived cell");
                }
            })
            .spawn(compute, move |value: T| {
                let written = serde_json::to_value(value)
                    .map_err(Error::from)
                    .and_then(|value| output.write(id, value));
                if let Err(e) = written {
                    tracing::error!(%id, error = %e, "failed to store derived value");
                }
            });

        Ok(Derived {
            handle: Handle::from_id(id),
            task: Arc::new(handle),
        })
    }

    /// Run a render loop as a nested renderable of this instance.
    pub fn spawn_child<R, F, Fut, S>(&self, label: &str, render: F, sink: S) -> LoopHandle
    where
        R: Send + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        S: FnMut(R) + Send + 'static,
    {
        let child = self.with_scope(self.scope.child());
        RenderLoop::new(label, &child).spawn(render, sink)
    }
}

/// Handle to a derived value.
pub struct Derived<T> {
    handle: Handle<T>,
    task: Arc<LoopHandle>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            task: self.task.clone(),
        }
    }
}

impl<T: DeserializeOwned> Derived<T> {
    /// Current derived value, tracked by `ctx`'s pass.
    pub async fn read(&self, ctx: &Context) -> Result<T> {
        ctx.read(self.handle).await
    }

    pub fn handle(&self) -> Handle<T> {
        self.handle
    }

    /// The loop computing this value.
    pub fn task(&self) -> &LoopHandle {
        &self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_creates_once() {
        let ctx = Runtime::default().context();
        assert_eq!(ctx.state("k", 1).await.unwrap(), 1);

        let id = ctx.tables().state_cell("k").unwrap().unwrap();
        assert!(ctx.session().is_touched(id).unwrap());

        // Same initial value again: same cell, no write.
        let version = ctx.registry().freeze(id).unwrap().version;
        assert_eq!(ctx.state("k", 1).await.unwrap(), 1);
        assert_eq!(ctx.registry().freeze(id).unwrap().version, version);
    }

    #[tokio::test]
    async fn test_state_changed_initial_overwrites() {
        let ctx = Runtime::default().context();
        assert_eq!(ctx.state("sel", "a".to_string()).await.unwrap(), "a");

        let next = ctx.with_session(ReadSession::new());
        assert_eq!(next.state("sel", "b".to_string()).await.unwrap(), "b");
        assert_eq!(ctx.get::<String>("sel").unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_set_creates_missing_key() {
        let ctx = Runtime::default().context();
        assert!(ctx.set("fresh", 5).unwrap());
        assert_eq!(ctx.get::<i32>("fresh").unwrap(), Some(5));
        assert!(!ctx.set("fresh", 5).unwrap());
        // Creating through `set` does not touch the session.
        assert!(ctx.session().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_prop_default_only_on_creation() {
        let ctx = Runtime::default().context();
        assert_eq!(
            ctx.prop("items-url", "/items".to_string()).await.unwrap(),
            "/items"
        );

        let next = ctx.with_session(ReadSession::new());
        assert_eq!(
            next.prop("items-url", "/other".to_string()).await.unwrap(),
            "/items"
        );
    }

    #[tokio::test]
    async fn test_set_prop_before_prop() {
        let ctx = Runtime::default().context();
        assert!(ctx.set_prop("todo-id", "7").unwrap());
        assert_eq!(ctx.prop("todo-id", "0".to_string()).await.unwrap(), "7");
        assert_eq!(ctx.get_prop::<String>("todo-id").unwrap().as_deref(), Some("7"));
        assert_eq!(ctx.get_prop::<String>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_listener_context_is_frozen() {
        let ctx = Runtime::default().context();
        ctx.state("count", 1).await.unwrap();

        let listener = ctx.listener().unwrap();
        listener.set("count", 2).unwrap();
        // The listener still sees the value frozen when it started.
        assert_eq!(listener.state("count", 1).await.unwrap(), 1);
        assert!(listener.session().thaw().unwrap().is_empty());
        assert_eq!(ctx.get::<i32>("count").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_read_after_abort() {
        let ctx = Runtime::default().context();
        let handle = ctx.global(1).unwrap();
        ctx.scope().abort();
        assert!(matches!(ctx.read(handle).await, Err(Error::Aborted)));
    }
}
