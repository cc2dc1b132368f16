//! Value registry.
//!
//! Process-wide arena of every cell, addressed by bump-allocated [`CellId`]s.
//! The registry owns the resolver operations (`resolve`, `reject`, `write`)
//! that push values into cells from outside a render pass, and the keyed
//! resource table that makes `fetch(url)` a cache shared by every component
//! instance.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;

use crate::cell::{CellError, CellId, CellRecord, CellStatus, LoadFn, Producer, Snapshot};
use crate::error::{Error, Result, lock_error};
use crate::session::ReadSession;

/// Shared cell arena. Cloning yields another handle to the same arena.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    cells: Vec<CellRecord>,
    /// Globally keyed cells (fetch URLs).
    resources: FxHashMap<String, CellId>,
}

impl RegistryState {
    fn cell_mut(&mut self, id: CellId) -> Result<&mut CellRecord> {
        self.cells.get_mut(id.0).ok_or(Error::CellNotFound(id))
    }

    fn push(&mut self, producer: Producer) -> (CellId, Option<LoadFn>) {
        let id = CellId::new(self.cells.len());
        let loader = producer.loader();
        self.cells.push(CellRecord::new(producer));
        (id, loader)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(lock_error)
    }

    fn with_cell<R>(&self, id: CellId, f: impl FnOnce(&mut CellRecord) -> R) -> Result<R> {
        let mut state = self.lock()?;
        Ok(f(state.cell_mut(id)?))
    }

    /// Number of cells ever created.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.cells.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Allocate a cell. A [`Producer::Load`] starts running immediately.
    pub fn create(&self, producer: Producer) -> Result<CellId> {
        let (id, loader) = self.lock()?.push(producer);
        if let Some(loader) = loader {
            self.spawn_load(id, loader, None);
        }
        tracing::trace!(%id, "cell created");
        Ok(id)
    }

    /// Allocate an externally settled cell already holding `value`.
    pub fn create_resolved(&self, value: Value) -> Result<CellId> {
        let mut state = self.lock()?;
        let (id, _) = state.push(Producer::External);
        state.cell_mut(id)?.fulfil(value);
        Ok(id)
    }

    /// Look up the cell for a global resource key, creating it on first use.
    ///
    /// Creation and lookup happen under one lock, so concurrent first calls
    /// share a single producer run.
    pub fn resource(&self, key: &str, producer: impl FnOnce() -> Producer) -> Result<CellId> {
        let (id, loader) = {
            let mut state = self.lock()?;
            if let Some(&id) = state.resources.get(key) {
                return Ok(id);
            }
            let (id, loader) = state.push(producer());
            state.resources.insert(key.to_string(), id);
            (id, loader)
        };
        tracing::debug!(%id, key, "resource cell created");
        if let Some(loader) = loader {
            self.spawn_load(id, loader, None);
        }
        Ok(id)
    }

    /// Cell registered under a global resource key, if any.
    pub fn lookup(&self, key: &str) -> Result<Option<CellId>> {
        Ok(self.lock()?.resources.get(key).copied())
    }

    /// Capture the cell's current version, status and value.
    pub fn freeze(&self, id: CellId) -> Result<Snapshot> {
        self.with_cell(id, |cell| cell.snapshot())
    }

    pub fn status(&self, id: CellId) -> Result<CellStatus> {
        self.with_cell(id, |cell| cell.status)
    }

    /// Current value without touching any session.
    pub fn value(&self, id: CellId) -> Result<Option<Value>> {
        self.with_cell(id, |cell| cell.value.clone())
    }

    pub fn is_retrying(&self, id: CellId) -> Result<bool> {
        self.with_cell(id, |cell| cell.retrying)
    }

    /// Push a value into a cell.
    ///
    /// Returns `false` without waking anyone when the cell already holds an
    /// equal value.
    pub fn write(&self, id: CellId, value: Value) -> Result<bool> {
        let changed = self.with_cell(id, |cell| cell.fulfil(value))?;
        if changed {
            tracing::trace!(%id, "cell written");
        }
        Ok(changed)
    }

    /// Settle a cell with a produced value, ending any retry in flight.
    ///
    /// Same change rules as [`write`](Self::write).
    pub fn resolve(&self, id: CellId, value: Value) -> Result<bool> {
        self.with_cell(id, |cell| {
            cell.retrying = false;
            cell.fulfil(value)
        })
    }

    /// Mark a cell as failed, ending any retry in flight.
    pub fn reject(&self, id: CellId, error: &CellError) -> Result<()> {
        self.with_cell(id, |cell| {
            cell.retrying = false;
            cell.reject(error)
        })?;
        tracing::debug!(%id, %error, "cell rejected");
        Ok(())
    }

    /// Receiver that observes every version change of a cell.
    pub(crate) fn watch(&self, id: CellId) -> Result<watch::Receiver<u64>> {
        self.with_cell(id, |cell| cell.changed.subscribe())
    }

    /// Read a cell on behalf of a session.
    ///
    /// A cell the session already touched answers from its snapshot, so every
    /// read within one pass agrees. Otherwise an initialized cell answers with
    /// its current value at once, and an uninitialized one is awaited until
    /// its first settle. The observed state becomes the session's snapshot.
    pub async fn read(&self, id: CellId, session: &ReadSession) -> Result<Value> {
        if let Some(snapshot) = session.snapshot(id)? {
            return snapshot_value(id, snapshot);
        }

        let mut rx = self.watch(id)?;
        loop {
            let snapshot = self.freeze(id)?;
            if snapshot.status == CellStatus::Rejected || snapshot.is_initialized() {
                let snapshot = session.touch(id, snapshot)?;
                return snapshot_value(id, snapshot);
            }

            let seen = snapshot.version;
            if rx.wait_for(|version| *version != seen).await.is_err() {
                return Err(Error::CellNotFound(id));
            }
        }
    }

    /// Schedule one more run of a rejected cell's producer after `delay`.
    ///
    /// Returns `false` if the cell is not rejected, has no load producer, or
    /// already has a retry in flight.
    pub fn schedule_retry(&self, id: CellId, delay: Duration) -> Result<bool> {
        let loader = self.with_cell(id, |cell| {
            if cell.status != CellStatus::Rejected || cell.retrying {
                return None;
            }
            let loader = cell.producer.loader()?;
            cell.retrying = true;
            Some(loader)
        })?;

        match loader {
            Some(loader) => {
                tracing::debug!(%id, ?delay, "retry scheduled");
                self.spawn_load(id, loader, Some(delay));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn spawn_load(&self, id: CellId, loader: LoadFn, delay: Option<Duration>) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = loader().await;
            registry.settle(id, result);
        });
    }

    fn settle(&self, id: CellId, result: std::result::Result<Value, CellError>) {
        let settled = match result {
            Ok(value) => self.resolve(id, value).map(|_| ()),
            Err(error) => {
                tracing::warn!(%id, %error, "producer rejected");
                self.reject(id, &error)
            }
        };
        if let Err(err) = settled {
            tracing::error!(%id, %err, "failed to settle cell");
        }
    }
}

fn snapshot_value(id: CellId, snapshot: Snapshot) -> Result<Value> {
    match snapshot.status {
        CellStatus::Rejected => Err(Error::Rejected {
            cell: id,
            message: snapshot.error.unwrap_or_default(),
        }),
        _ => snapshot.value.ok_or(Error::CellNotFound(id)),
    }
}
