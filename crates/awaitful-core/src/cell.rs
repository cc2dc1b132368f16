//! Deferred value cells.
//!
//! A cell is one reactive slot: the last resolved value, a resolution
//! status, and a version counter published over a [`watch`] channel. Readers
//! that need the next value wait for the version to move instead of holding
//! on to a particular future, so a cell can be re-armed any number of times.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::watch;

/// Stable handle of a cell inside a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub(crate) usize);

impl CellId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell_{}", self.0)
    }
}

/// Resolution status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Waiting for its producer or for an external push.
    Pending,
    /// Holds a value.
    Fulfilled,
    /// The producer failed; a retry may be scheduled.
    Rejected,
}

/// Failure reported by a producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Failed(String),
}

/// Async computation backing a [`Producer::Load`] cell.
pub type LoadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, CellError>> + Send + Sync>;

/// How a cell obtains new values.
#[derive(Clone)]
pub enum Producer {
    /// Settled only by pushes through the registry (`write`, `reject`).
    External,
    /// Computed once at creation and again only to retry after a rejection.
    Load(LoadFn),
}

impl Producer {
    /// Wrap an async closure as a load producer.
    pub fn load<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CellError>> + Send + 'static,
    {
        Self::Load(Arc::new(move || f().boxed()))
    }

    pub(crate) fn loader(&self) -> Option<LoadFn> {
        match self {
            Self::External => None,
            Self::Load(f) => Some(f.clone()),
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => f.write_str("External"),
            Self::Load(_) => f.write_str("Load(..)"),
        }
    }
}

/// Frozen view of a cell at one point of a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub status: CellStatus,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl Snapshot {
    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }
}

/// Registry-owned record of one cell.
pub(crate) struct CellRecord {
    pub(crate) value: Option<Value>,
    pub(crate) status: CellStatus,
    pub(crate) version: u64,
    pub(crate) error: Option<String>,
    pub(crate) producer: Producer,
    pub(crate) retrying: bool,
    pub(crate) changed: watch::Sender<u64>,
}

impl CellRecord {
    pub(crate) fn new(producer: Producer) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            value: None,
            status: CellStatus::Pending,
            version: 0,
            error: None,
            producer,
            retrying: false,
            changed,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
        }
    }

    /// Store a value. Returns `false` when the cell already holds an equal one.
    pub(crate) fn fulfil(&mut self, value: Value) -> bool {
        if self.status == CellStatus::Fulfilled && self.value.as_ref() == Some(&value) {
            return false;
        }
        self.value = Some(value);
        self.status = CellStatus::Fulfilled;
        self.error = None;
        self.bump();
        true
    }

    pub(crate) fn reject(&mut self, error: &CellError) {
        self.status = CellStatus::Rejected;
        self.error = Some(error.to_string());
        self.bump();
    }

    fn bump(&mut self) {
        self.version += 1;
        self.changed.send_replace(self.version);
    }
}

/// Typed handle to an anonymous cell.
///
/// Serializes as the bare integer id, so handles can be stored inside other
/// cell payloads (a row list holding per-row text cells, for instance).
pub struct Handle<T> {
    id: CellId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn from_id(id: CellId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id).finish()
    }
}

impl<T> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Handle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        CellId::deserialize(deserializer).map(Self::from_id)
    }
}
