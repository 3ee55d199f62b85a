//! Worker supervision: spawning a step's callable in isolation, polling it,
//! and forcibly terminating it.
//!
//! Each worker runs as its own `tokio` task, wrapped so that a panicking
//! callable cannot take the evaluator down with it — the wrapper always
//! sends exactly one `(return_value, exception)` pair on the result channel,
//! whether the callable returned, errored, or panicked (§4.4: "the wrapper
//! guarantees a send on every exit path").

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::instrument;

use crate::errors::{WorkerError, WorkerErrorKind};
use crate::step::{StepContext, StepFn};
use crate::types::StepId;

/// The classification `check_worker` returns, matching the automated
/// resolver's `action -> success_value` table (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Success,
    Failure,
    Tempfail,
}

type WorkerResult = (Option<Value>, Option<WorkerError>);

/// A running (or just-finished) step worker.
pub struct WorkerHandle {
    step_id: StepId,
    join: tokio::task::JoinHandle<()>,
    result_rx: flume::Receiver<WorkerResult>,
    memoized: Option<WorkerResult>,
}

impl WorkerHandle {
    /// Spawn `callable` as an isolated task. `ctx` carries the channel
    /// endpoints the callable itself will use to talk to the operator.
    #[instrument(skip(callable, ctx), fields(step = %step_id))]
    pub fn spawn(step_id: StepId, callable: Arc<dyn StepFn>, ctx: StepContext) -> Self {
        let (result_tx, result_rx) = flume::bounded(1);

        let join = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(callable.call(ctx)).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(value)) => (Some(value), None),
                Ok(Err(err)) => (None, Some(err)),
                Err(panic) => (None, Some(WorkerError::failure(panic_message(panic)))),
            };
            // A closed receiver only happens if the handle itself was
            // dropped without interrupting; best-effort, never panics.
            let _ = result_tx.send(result);
        });

        WorkerHandle {
            step_id,
            join,
            result_rx,
            memoized: None,
        }
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    pub fn is_alive(&self) -> bool {
        self.memoized.is_none() && !self.join.is_finished()
    }

    /// Non-blocking: returns the `(return_value, exception)` pair once the
    /// worker has finished, memoized across calls; `None` while still
    /// running.
    pub fn get_result(&mut self) -> Option<&WorkerResult> {
        if self.memoized.is_none() {
            if let Ok(result) = self.result_rx.try_recv() {
                self.memoized = Some(result);
            }
        }
        self.memoized.as_ref()
    }

    /// Classify the worker's state for the automated resolver, recording
    /// nothing itself — the caller is responsible for writing the result
    /// into the [`crate::context::Context`] on first observing completion.
    pub fn check_worker(&mut self) -> WorkerStatus {
        match self.get_result() {
            None => WorkerStatus::Running,
            Some((_, None)) => WorkerStatus::Success,
            Some((_, Some(err))) => match err.kind {
                WorkerErrorKind::Failure => WorkerStatus::Failure,
                WorkerErrorKind::Tempfail => WorkerStatus::Tempfail,
            },
        }
    }

    /// Forcibly terminate the worker task.
    pub fn interrupt(&self) {
        self.join.abort();
    }
}

impl WorkerHandle {
    /// The current result as plain JSON, suitable for writing into the
    /// context without exposing [`WorkerError`] outside this module.
    pub fn result_as_json(&mut self) -> Option<(Option<Value>, Option<Value>)> {
        self.get_result()
            .map(|(value, err)| (value.clone(), err.as_ref().map(WorkerError::to_json)))
    }
}

/// Shared table of live worker handles, one entry per step that has ever
/// been started. The automated resolver (spawn/check) and the API handler
/// (interrupt) both need to reach into it, so it is owned behind a single
/// async mutex rather than threaded through both call paths separately.
#[derive(Default)]
pub struct WorkerTable {
    inner: tokio::sync::Mutex<rustc_hash::FxHashMap<StepId, WorkerHandle>>,
}

impl WorkerTable {
    #[must_use]
    pub fn new() -> Self {
        WorkerTable::default()
    }

    /// Spawn a fresh worker for `step_id`, replacing any previous handle (a
    /// rerun discards the old handle's memoized result, per §8's round-trip
    /// property — the context's logs are untouched).
    pub async fn spawn(&self, step_id: StepId, callable: Arc<dyn StepFn>, ctx: StepContext) {
        let handle = WorkerHandle::spawn(step_id, callable, ctx);
        self.inner.lock().await.insert(step_id, handle);
    }

    pub async fn is_alive(&self, step_id: StepId) -> bool {
        self.inner
            .lock()
            .await
            .get(&step_id)
            .map(WorkerHandle::is_alive)
            .unwrap_or(false)
    }

    pub async fn check(&self, step_id: StepId) -> Option<WorkerStatus> {
        self.inner
            .lock()
            .await
            .get_mut(&step_id)
            .map(WorkerHandle::check_worker)
    }

    pub async fn result_as_json(&self, step_id: StepId) -> Option<(Option<Value>, Option<Value>)> {
        self.inner
            .lock()
            .await
            .get_mut(&step_id)
            .and_then(WorkerHandle::result_as_json)
    }

    /// Forcibly terminate a step's worker, if it has one. Returns `true` iff
    /// a worker existed to terminate.
    pub async fn interrupt(&self, step_id: StepId) -> bool {
        match self.inner.lock().await.get(&step_id) {
            Some(handle) => {
                handle.interrupt();
                true
            }
            None => false,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "step callable panicked".to_string()
    }
}
