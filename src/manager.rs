//! Assembles steps, DAG, context, and configuration into a running engine
//! (§4.8): builds the rule/precondition table, wires the callback pipeline,
//! and owns the evaluator and control-socket tasks' lifecycle.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::api::{ApiHandler, ApiRequest, ApiResponse};
use crate::callbacks::{ActionMap, CallbackPipeline, SharedSnapshots, StatesMap};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::control::ControlServer;
use crate::dag::Dag;
use crate::errors::{ManagerError, PersistenceError};
use crate::evaluator::Evaluator;
use crate::persistence;
use crate::rules::PreconditionTable;
use crate::step::StepRegistry;
use crate::types::{Action, StepId};

#[derive(Clone, Debug, Default)]
pub struct ManagerConfig {
    pub engine: EngineConfig,
}

/// Owns the assembled engine and the two long-running tasks (evaluator,
/// control server) plus an optional periodic backup task.
pub struct Manager {
    registry: Arc<StepRegistry>,
    dag: Arc<Dag>,
    context: Context,
    config: ManagerConfig,
    injected_tx: flume::Sender<ActionMap>,
    request_tx: flume::Sender<(ApiRequest, flume::Sender<ApiResponse>)>,
    snapshots: SharedSnapshots,
    preconditions: Option<PreconditionTable>,
    pipeline: Option<CallbackPipeline>,
    initial_states: Option<StatesMap>,
    control_server: Option<ControlServer>,
    evaluator_handle: Option<tokio::task::JoinHandle<Result<StatesMap, ManagerError>>>,
    api_handle: Option<tokio::task::JoinHandle<()>>,
    backup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Manager {
    /// Validate the edge sets against the registry, build the precondition
    /// table, and wire the callback pipeline — but do not yet spawn any
    /// task; call [`Manager::restore`] (optional) then [`Manager::start`].
    pub fn new(
        registry: StepRegistry,
        success_edges: Vec<(StepId, StepId)>,
        failure_edges: Vec<(StepId, StepId)>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        registry.validate_edges(&success_edges)?;
        registry.validate_edges(&failure_edges)?;
        reject_duplicate_names(&registry)?;

        let dag = Dag::new(success_edges, failure_edges);
        let preconditions = dag.build_preconditions();
        let registry = Arc::new(registry);
        let dag = Arc::new(dag);
        let context = Context::new();
        for step in registry.ids_in_order() {
            context.ensure_slot_sync(*step);
        }

        let snapshots = SharedSnapshots::default();
        let (injected_tx, injected_rx) = flume::unbounded();
        let (request_tx, request_rx) = flume::unbounded();

        let workers = Arc::new(crate::worker::WorkerTable::new());
        let api = ApiHandler::new(registry.clone(), dag.clone(), request_rx);
        let control_server = ControlServer::bind(
            &config.engine.socket_path,
            config.engine.accept_timeout,
            request_tx.clone(),
        )?;

        let pipeline = CallbackPipeline::new(
            registry.clone(),
            workers,
            context.clone(),
            snapshots.clone(),
            injected_rx,
            api,
            config.engine.tick_delay,
        );

        Ok(Manager {
            registry,
            dag,
            context,
            config,
            injected_tx,
            request_tx,
            snapshots,
            preconditions: Some(preconditions),
            pipeline: Some(pipeline),
            initial_states: None,
            control_server: Some(control_server),
            evaluator_handle: None,
            api_handle: None,
            backup_handle: None,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// The sending half of the in-process API channel, for embedders that
    /// want to issue operator operations without going through the control
    /// socket (e.g. driving the engine from an in-process test harness).
    #[must_use]
    pub fn request_sender(&self) -> flume::Sender<(ApiRequest, flume::Sender<ApiResponse>)> {
        self.request_tx.clone()
    }

    /// Inject an action outside the control socket (§4.3 stage 6) —
    /// typically used to kick off the run with `Start` on the root steps.
    pub fn inject(&self, step: StepId, action: Action) {
        let mut actions = ActionMap::default();
        actions.insert(step, action);
        let _ = self.injected_tx.send(actions);
    }

    /// Restore a prior run's state from `path` (§6, §12): seeds the context's
    /// per-step logs/return values and overrides the states the evaluator
    /// starts from. Must be called before [`Manager::start`] — restoring
    /// after the evaluator task has started has no effect on it.
    pub async fn restore(&mut self, path: &str) -> Result<(), PersistenceError> {
        let states = persistence::restore(path, &self.registry, &self.context, &self.dag).await?;
        self.initial_states = Some(states);
        Ok(())
    }

    /// Snapshot the current run to `path` (§6, §12), using the evaluator's
    /// last-published states. A no-op-safe call before `start()` (empty
    /// states map) and usable at any point afterward.
    pub async fn backup(&self, path: &str) -> Result<(), PersistenceError> {
        let states = self.snapshots.states.read().await.clone();
        persistence::backup(path, &self.registry, &states, &self.context, &self.dag).await
    }

    /// Spawn the evaluator and control-server tasks, and — if configured —
    /// a periodic backup task. Calling this twice is a no-op on the second
    /// call (the evaluator/control server are each taken exactly once).
    #[instrument(skip(self))]
    pub fn start(&mut self) {
        if let (Some(preconditions), Some(pipeline)) = (self.preconditions.take(), self.pipeline.take()) {
            let evaluator = match self.initial_states.take() {
                Some(initial) => Evaluator::with_initial_states(self.registry.clone(), preconditions, pipeline, initial),
                None => Evaluator::new(self.registry.clone(), preconditions, pipeline),
            };
            self.evaluator_handle = Some(tokio::spawn(evaluator.run()));
        }
        if let Some(control_server) = self.control_server.take() {
            self.api_handle = Some(tokio::spawn(control_server.run()));
        }
        if let (Some(path), Some(interval)) = (
            self.config.engine.backup_path.clone(),
            self.config.engine.backup_interval,
        ) {
            let registry = self.registry.clone();
            let dag = self.dag.clone();
            let context = self.context.clone();
            let snapshots = self.snapshots.clone();
            self.backup_handle = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let states = snapshots.states.read().await.clone();
                    if let Err(error) = persistence::backup(&path, &registry, &states, &context, &dag).await {
                        warn!(%error, %path, "periodic backup failed");
                    } else {
                        info!(%path, "periodic backup written");
                    }
                }
            }));
        }
    }

    pub fn terminate_evaluator(&mut self) {
        if let Some(handle) = self.evaluator_handle.take() {
            handle.abort();
        }
    }

    pub fn terminate_api(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.abort();
        }
    }

    pub fn terminate(&mut self) {
        self.terminate_evaluator();
        self.terminate_api();
        if let Some(handle) = self.backup_handle.take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn is_alive_evaluator(&self) -> bool {
        self.evaluator_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    #[must_use]
    pub fn is_alive_api(&self) -> bool {
        self.api_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Await the evaluator task to completion, returning its final states.
    pub async fn join(&mut self) -> Result<StatesMap, ManagerError> {
        match self.evaluator_handle.take() {
            Some(handle) => handle.await.map_err(|e| ManagerError::EvaluatorJoin(e.to_string()))?,
            None => Ok(StatesMap::default()),
        }
    }

    /// Remove the control socket file, ignoring its absence.
    pub fn cleanup(&self) {
        match std::fs::remove_file(&self.config.engine.socket_path) {
            Ok(()) | Err(_) => {}
        }
    }
}

fn reject_duplicate_names(registry: &StepRegistry) -> Result<(), ManagerError> {
    let mut seen = rustc_hash::FxHashSet::default();
    for def in registry.iter() {
        if !seen.insert(def.name.clone()) {
            return Err(ManagerError::DuplicateStepName(def.name.clone()));
        }
    }
    Ok(())
}
