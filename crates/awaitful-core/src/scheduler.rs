//! Render loops.
//!
//! A render loop invokes an async render function, thaws the pass's read
//! session into a wait set, waits for the first watched cell to change and
//! renders again, until its scope is aborted. Rejected cells are retried
//! from here with a fixed backoff.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cell::CellStatus;
use crate::context::{Context, ResourceTables};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::scope::Scope;
use crate::session::{ReadSession, WaitSet, Wake};

/// Where a loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Spawned, first pass not started.
    Initial,
    /// Running the render function.
    Rendering,
    /// Waiting for a watched cell to change.
    Waiting,
    /// Scheduling retries for rejected cells.
    Erroring,
    /// Ended; will not render again.
    Aborted,
}

/// Counters of one loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    passes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

impl LoopStats {
    /// Render passes started.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Passes whose render function returned an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Producer retries this loop scheduled.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }
}

type FailureFn = Box<dyn FnMut(&Error) + Send>;

/// Builder and driver for one render loop.
pub struct RenderLoop {
    label: String,
    runtime: Runtime,
    tables: Arc<ResourceTables>,
    scope: Scope,
    on_failure: Option<FailureFn>,
}

impl RenderLoop {
    /// Loop rendering for the instance and scope of `ctx`.
    pub fn new(label: &str, ctx: &Context) -> Self {
        Self {
            label: label.to_string(),
            runtime: ctx.runtime().clone(),
            tables: ctx.tables().clone(),
            scope: ctx.scope().clone(),
            on_failure: None,
        }
    }

    /// Called with every render error, after it is logged.
    pub fn on_failure(mut self, callback: impl FnMut(&Error) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Start the loop on the tokio runtime. Every successful pass hands its
    /// output to `sink`.
    pub fn spawn<R, F, Fut, S>(self, render: F, sink: S) -> LoopHandle
    where
        R: Send + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        S: FnMut(R) + Send + 'static,
    {
        let label = self.label.clone();
        let scope = self.scope.clone();
        let stats = Arc::new(LoopStats::default());
        let (state_tx, state_rx) = watch::channel(LoopState::Initial);

        let task = tokio::spawn(self.run(render, sink, stats.clone(), state_tx));

        LoopHandle {
            label,
            scope,
            stats,
            state: state_rx,
            task,
        }
    }

    async fn run<R, F, Fut, S>(
        mut self,
        render: F,
        mut sink: S,
        stats: Arc<LoopStats>,
        state: watch::Sender<LoopState>,
    ) where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = Result<R>>,
        S: FnMut(R),
    {
        let label = self.label.clone();
        tracing::debug!(label = %label, "render loop started");

        if let Err(e) = self.drive(&render, &mut sink, &stats, &state).await {
            tracing::error!(label = %label, error = %e, "render loop failed");
        }

        state.send_replace(LoopState::Aborted);
        tracing::debug!(label = %label, passes = stats.passes(), "render loop ended");
    }

    async fn drive<R, F, Fut, S>(
        &mut self,
        render: &F,
        sink: &mut S,
        stats: &LoopStats,
        state: &watch::Sender<LoopState>,
    ) -> Result<()>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = Result<R>>,
        S: FnMut(R),
    {
        let registry = self.runtime.registry().clone();
        let retry_delay = self.runtime.config().retry_delay;
        let mut watching = WaitSet::default();

        loop {
            if self.scope.is_aborted() {
                return Ok(());
            }

            state.send_replace(LoopState::Rendering);
            let pass = stats.passes.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::trace!(label = %self.label, pass, "rendering");

            let session = ReadSession::new();
            let ctx = Context::new(
                self.runtime.clone(),
                self.tables.clone(),
                session.clone(),
                self.scope.clone(),
            );

            let result = tokio::select! {
                biased;
                _ = self.scope.aborted() => return Ok(()),
                result = render(ctx) => result,
            };
            if self.scope.is_aborted() {
                return Ok(());
            }

            let touched = session.thaw()?;
            let failed = match result {
                Ok(output) => {
                    watching = touched;
                    sink(output);
                    false
                }
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!(label = %self.label, pass, error = %err, "render failed");
                    if let Some(callback) = self.on_failure.as_mut() {
                        callback(&err);
                    }
                    watching.merge(touched);
                    true
                }
            };

            // Failed with nothing to retry: render again after the backoff.
            let mut rerender_after = None;
            if failed && watching.rejected(&registry)?.is_empty() {
                rerender_after = Some(retry_delay);
            }

            loop {
                let rejected = watching.rejected(&registry)?;
                if !rejected.is_empty() {
                    state.send_replace(LoopState::Erroring);
                    for id in rejected {
                        if registry.schedule_retry(id, retry_delay)? {
                            stats.retries.fetch_add(1, Ordering::AcqRel);
                        } else if !registry.is_retrying(id)? {
                            // Externally settled: only a new pass replaces it.
                            rerender_after = Some(retry_delay);
                        }
                    }
                }

                state.send_replace(LoopState::Waiting);
                tracing::trace!(label = %self.label, watching = watching.len(), "waiting");

                match wait(&watching, &registry, &self.scope, rerender_after).await? {
                    Wake::Aborted => return Ok(()),
                    Wake::Changed => {}
                }
                if rerender_after.is_some() && watching.changed(&registry)?.is_empty() {
                    tracing::debug!(label = %self.label, "retrying failed render");
                    break;
                }

                let changed = watching.changed(&registry)?;
                if changed
                    .iter()
                    .any(|(_, snapshot)| snapshot.status != CellStatus::Rejected)
                {
                    break;
                }
                // Only rejections: keep waiting on the refreshed versions.
                watching.observe(&changed);
            }
        }
    }
}

/// Race the wait set against an optional timer.
async fn wait(
    watching: &WaitSet,
    registry: &Registry,
    scope: &Scope,
    timeout: Option<Duration>,
) -> Result<Wake> {
    let Some(timeout) = timeout else {
        return watching.next_change(registry, scope).await;
    };
    tokio::select! {
        wake = watching.next_change(registry, scope) => wake,
        _ = tokio::time::sleep(timeout) => Ok(Wake::Changed),
    }
}

/// Running loop.
pub struct LoopHandle {
    label: String,
    scope: Scope,
    stats: Arc<LoopStats>,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Abort the loop's scope and everything under it.
    pub fn abort(&self) {
        self.scope.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the loop reaches `target`.
    pub async fn reached(&self, target: LoopState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Wait for the loop task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(label = %self.label, error = %e, "render loop panicked");
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("passes", &self.stats.passes())
            .finish()
    }
}
