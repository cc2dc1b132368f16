//! Read sessions.
//!
//! A session records which cells one render pass read and the snapshot it
//! observed for each. At the end of the pass the session is thawed into a
//! [`WaitSet`], which the scheduler races to find the next change.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use rustc_hash::FxHashMap;

use crate::cell::{CellId, CellStatus, Snapshot};
use crate::error::{Result, lock_error};
use crate::registry::Registry;
use crate::scope::Scope;

/// Whether reads of a session feed a render loop's dependency set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Reads are dependencies of the current pass.
    Tracking,
    /// Reads are answered from frozen snapshots and never tracked.
    /// Used while an event listener runs.
    Frozen,
}

/// Per-pass record of touched cells.
#[derive(Clone)]
pub struct ReadSession {
    inner: Arc<Mutex<SessionState>>,
    mode: SessionMode,
}

#[derive(Default)]
struct SessionState {
    order: Vec<CellId>,
    touched: FxHashMap<CellId, Snapshot>,
}

impl Default for ReadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadSession {
    /// Start a tracking session for a new pass.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState::default())),
            mode: SessionMode::Tracking,
        }
    }

    /// Start a frozen session pre-seeded with snapshots.
    pub fn frozen(snapshots: impl IntoIterator<Item = (CellId, Snapshot)>) -> Self {
        let mut state = SessionState::default();
        for (id, snapshot) in snapshots {
            if state.touched.insert(id, snapshot).is_none() {
                state.order.push(id);
            }
        }
        Self {
            inner: Arc::new(Mutex::new(state)),
            mode: SessionMode::Frozen,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.inner.lock().map_err(lock_error)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Record a read. The first snapshot of a pass wins; the stored one is
    /// returned.
    pub fn touch(&self, id: CellId, snapshot: Snapshot) -> Result<Snapshot> {
        let mut state = self.lock()?;
        if let Some(existing) = state.touched.get(&id) {
            return Ok(existing.clone());
        }
        state.order.push(id);
        state.touched.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    pub fn snapshot(&self, id: CellId) -> Result<Option<Snapshot>> {
        Ok(self.lock()?.touched.get(&id).cloned())
    }

    pub fn is_touched(&self, id: CellId) -> Result<bool> {
        Ok(self.lock()?.touched.contains_key(&id))
    }

    /// Touched cells in first-read order.
    pub fn touched(&self) -> Result<Vec<CellId>> {
        Ok(self.lock()?.order.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.order.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// End the pass: every touched cell becomes a wait-set entry at the
    /// version this pass observed. A cell that settled again during the pass
    /// is therefore already due when the scheduler starts waiting.
    ///
    /// Frozen sessions thaw into an empty set.
    pub fn thaw(&self) -> Result<WaitSet> {
        if self.mode == SessionMode::Frozen {
            return Ok(WaitSet::default());
        }
        let state = self.lock()?;
        let entries = state
            .order
            .iter()
            .map(|id| (*id, state.touched[id].version))
            .collect();
        Ok(WaitSet { entries })
    }
}

/// Outcome of waiting on a [`WaitSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Changed,
    Aborted,
}

/// Cells a render loop is waiting on, each with the version last observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSet {
    entries: Vec<(CellId, u64)>,
}

impl WaitSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    /// Fold `other` into this set. Cells present in both take the version
    /// observed by `other`, which is the later observation.
    pub fn merge(&mut self, other: WaitSet) {
        for (id, version) in other.entries {
            match self.entries.iter_mut().find(|(entry, _)| *entry == id) {
                Some(entry) => entry.1 = version,
                None => self.entries.push((id, version)),
            }
        }
    }

    /// Entries whose cell moved past the observed version, with their
    /// current snapshot.
    pub fn changed(&self, registry: &Registry) -> Result<Vec<(CellId, Snapshot)>> {
        let mut changed = Vec::new();
        for &(id, seen) in &self.entries {
            let snapshot = registry.freeze(id)?;
            if snapshot.version != seen {
                changed.push((id, snapshot));
            }
        }
        Ok(changed)
    }

    /// Accept the given snapshots as observed, so they no longer count as
    /// changes.
    pub fn observe(&mut self, snapshots: &[(CellId, Snapshot)]) {
        for (id, snapshot) in snapshots {
            if let Some(entry) = self.entries.iter_mut().find(|(entry, _)| entry == id) {
                entry.1 = snapshot.version;
            }
        }
    }

    /// Watched cells currently in `Rejected` status.
    pub fn rejected(&self, registry: &Registry) -> Result<Vec<CellId>> {
        let mut rejected = Vec::new();
        for &(id, _) in &self.entries {
            if registry.status(id)? == CellStatus::Rejected {
                rejected.push(id);
            }
        }
        Ok(rejected)
    }

    /// Wait until any watched cell moves past its observed version, or the
    /// scope is aborted. An empty set waits for the abort only.
    pub async fn next_change(&self, registry: &Registry, scope: &Scope) -> Result<Wake> {
        let mut waits: Vec<BoxFuture<'static, ()>> = Vec::with_capacity(self.entries.len());
        for &(id, seen) in &self.entries {
            let mut rx = registry.watch(id)?;
            waits.push(
                async move {
                    if rx.wait_for(|version| *version != seen).await.is_err() {
                        future::pending::<()>().await;
                    }
                }
                .boxed(),
            );
        }

        let any_change = async move {
            if waits.is_empty() {
                future::pending::<()>().await;
            } else {
                future::select_all(waits).await;
            }
        };

        tokio::select! {
            biased;
            _ = scope.aborted() => Ok(Wake::Aborted),
            _ = any_change => Ok(Wake::Changed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(version: u64) -> Snapshot {
        Snapshot {
            version,
            status: CellStatus::Fulfilled,
            value: Some(json!(version)),
            error: None,
        }
    }

    #[test]
    fn test_first_touch_wins() {
        let session = ReadSession::new();
        let id = CellId::new(0);
        assert_eq!(session.touch(id, snap(1)).unwrap().version, 1);
        assert_eq!(session.touch(id, snap(2)).unwrap().version, 1);
        assert_eq!(session.touched().unwrap(), vec![id]);
    }

    #[test]
    fn test_thaw_keeps_read_order() {
        let session = ReadSession::new();
        session.touch(CellId::new(3), snap(1)).unwrap();
        session.touch(CellId::new(1), snap(4)).unwrap();

        let wait = session.thaw().unwrap();
        let ids: Vec<_> = wait.ids().collect();
        assert_eq!(ids, vec![CellId::new(3), CellId::new(1)]);
    }

    #[test]
    fn test_frozen_session_thaws_empty() {
        let session = ReadSession::frozen([(CellId::new(0), snap(1))]);
        assert_eq!(session.mode(), SessionMode::Frozen);
        assert!(session.is_touched(CellId::new(0)).unwrap());
        assert!(session.thaw().unwrap().is_empty());
    }

    #[test]
    fn test_merge_takes_later_versions() {
        let mut a = WaitSet {
            entries: vec![(CellId::new(0), 1)],
        };
        let b = WaitSet {
            entries: vec![(CellId::new(0), 5), (CellId::new(1), 2)],
        };
        a.merge(b);
        assert_eq!(a.entries, vec![(CellId::new(0), 5), (CellId::new(1), 2)]);
    }

    #[test]
    fn test_changed_and_observe() {
        let registry = Registry::new();
        let a = registry.create_resolved(json!(1)).unwrap();
        let b = registry.create_resolved(json!(1)).unwrap();

        let session = ReadSession::new();
        session.touch(a, registry.freeze(a).unwrap()).unwrap();
        session.touch(b, registry.freeze(b).unwrap()).unwrap();
        let mut wait = session.thaw().unwrap();
        assert!(wait.changed(&registry).unwrap().is_empty());

        registry.write(b, json!(2)).unwrap();
        let changed = wait.changed(&registry).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, b);

        wait.observe(&changed);
        assert!(wait.changed(&registry).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_change_wakes_on_single_write() {
        let registry = Registry::new();
        let a = registry.create_resolved(json!("a")).unwrap();
        let b = registry.create_resolved(json!("b")).unwrap();
        let session = ReadSession::new();
        session.touch(a, registry.freeze(a).unwrap()).unwrap();
        session.touch(b, registry.freeze(b).unwrap()).unwrap();
        let wait = session.thaw().unwrap();

        let writer = registry.clone();
        tokio::spawn(async move {
            writer.write(b, json!("b2")).unwrap();
        });

        let wake = wait.next_change(&registry, &Scope::new()).await.unwrap();
        assert_eq!(wake, Wake::Changed);
    }

    #[tokio::test]
    async fn test_next_change_aborts() {
        let registry = Registry::new();
        let scope = Scope::new();
        let wait = WaitSet::default();

        let aborter = scope.clone();
        tokio::spawn(async move {
            aborter.abort();
        });

        let wake = wait.next_change(&registry, &scope).await.unwrap();
        assert_eq!(wake, Wake::Aborted);
    }
}
