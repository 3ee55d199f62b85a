//! The callback pipeline: nine ordered stages that turn a tick's
//! `(states, transitions)` into the `actions` map the evaluator applies.
//!
//! Later stages may override earlier stages' decision for the same step id
//! (§4.3, "Merge rule") — this is deliberate, so the API handler can
//! override an automated decision within the same tick (Design Notes,
//! "Merge order in the callback pipeline"), and the implementation here
//! preserves that by running the stages strictly in order and always
//! `insert`-ing (never `entry().or_insert()`) into the shared action map.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::api::{ApiHandler, Relay};
use crate::context::Context;
use crate::step::{StepContext, StepRegistry};
use crate::types::{Action, State, StepId};
use crate::worker::{WorkerStatus, WorkerTable};

pub type StatesMap = FxHashMap<StepId, State>;
pub type TransitionsMap = FxHashMap<StepId, Vec<Action>>;
pub type ActionMap = FxHashMap<StepId, Action>;

/// Shared, API-readable snapshots the evaluator publishes every tick.
#[derive(Clone, Default)]
pub struct SharedSnapshots {
    pub states: Arc<RwLock<StatesMap>>,
    pub transitions: Arc<RwLock<TransitionsMap>>,
}

/// What the tick should do after the pipeline runs.
pub struct PipelineOutcome {
    pub actions: ActionMap,
    pub shutdown_requested: bool,
}

/// Everything the callback pipeline needs across ticks, owned by the
/// evaluator and handed a `(states, transitions)` view each tick.
pub struct CallbackPipeline {
    registry: Arc<StepRegistry>,
    workers: Arc<WorkerTable>,
    context: Context,
    snapshots: SharedSnapshots,
    injected_rx: flume::Receiver<ActionMap>,
    api: ApiHandler,
    final_callback: Option<Box<dyn Fn(&StatesMap) + Send + Sync>>,
    tick_delay: Duration,
    quiesced_once: bool,
}

impl CallbackPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StepRegistry>,
        workers: Arc<WorkerTable>,
        context: Context,
        snapshots: SharedSnapshots,
        injected_rx: flume::Receiver<ActionMap>,
        api: ApiHandler,
        tick_delay: Duration,
    ) -> Self {
        CallbackPipeline {
            registry,
            workers,
            context,
            snapshots,
            injected_rx,
            api,
            final_callback: None,
            tick_delay,
            quiesced_once: false,
        }
    }

    pub fn set_final_callback<F>(&mut self, callback: F)
    where
        F: Fn(&StatesMap) + Send + Sync + 'static,
    {
        self.final_callback = Some(Box::new(callback));
    }

    /// Run all nine stages for one tick.
    #[instrument(skip_all)]
    pub async fn run(&mut self, states: &StatesMap, transitions: &TransitionsMap) -> PipelineOutcome {
        let mut actions = ActionMap::default();

        // 1. Automated resolver.
        for (step, action) in automated_resolver_stage(&self.registry, &self.workers, &self.context, transitions).await {
            actions.insert(step, action);
        }

        // 2. States recorder.
        *self.snapshots.states.write().await = states.clone();

        // 3. Transitions recorder.
        *self.snapshots.transitions.write().await = transitions.clone();

        // 4. Step-object serializer: alive flags, cheap and always-on here
        //    since there is no separate consumer-facing "step object" type
        //    to snapshot beyond worker liveness.
        // (folded into context serialization below; no separate state kept)

        // 5. Context serializer: drain each step's channels into its logs.
        // Non-blocking so a quiet, still-running worker never stalls a tick;
        // a step awaiting a reply is surfaced via `awaiting_reply` instead.
        for step in self.registry.ids_in_order() {
            self.context.drain_step(*step).await;
        }

        // 6. Injected-action reader.
        while let Ok(injected) = self.injected_rx.try_recv() {
            for (step, action) in injected {
                actions.insert(step, action);
            }
        }

        // 7. API server tick.
        let outcome = self
            .api
            .tick(&self.snapshots, &self.workers, &self.context)
            .await;
        let mut shutdown_requested = false;
        if let Some(outcome) = outcome {
            match outcome.relay {
                Relay::None => {}
                Relay::Actions(relay_actions) => {
                    for (step, action) in relay_actions {
                        actions.insert(step, action);
                    }
                }
                Relay::Shutdown(relay_actions) => {
                    for (step, action) in relay_actions {
                        actions.insert(step, action);
                    }
                    shutdown_requested = true;
                }
            }
        }

        // 8. Final callback: only at quiescence, only once.
        let quiescent = transitions.values().all(Vec::is_empty);
        if quiescent && !self.quiesced_once {
            self.quiesced_once = true;
            if let Some(callback) = &self.final_callback {
                callback(states);
            }
        } else if !quiescent {
            self.quiesced_once = false;
        }

        // 9. Delay.
        if !self.tick_delay.is_zero() {
            tokio::time::sleep(self.tick_delay).await;
        }

        PipelineOutcome {
            actions,
            shutdown_requested,
        }
    }
}

/// What the automated resolver compares an evaluator function's result
/// against, per the static `action -> (evaluator_fn, success_value)` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum AutomatedFn {
    SpawnWorker,
    CheckWorker,
    Noop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FnOutcome {
    Spawned,
    Noop,
    Classification(WorkerStatus),
}

fn automated_table(action: Action) -> Option<(AutomatedFn, FnOutcome)> {
    match action {
        Action::Run => Some((AutomatedFn::SpawnWorker, FnOutcome::Spawned)),
        Action::Succeed => Some((AutomatedFn::CheckWorker, FnOutcome::Classification(WorkerStatus::Success))),
        Action::Fail => Some((AutomatedFn::CheckWorker, FnOutcome::Classification(WorkerStatus::Failure))),
        Action::Error => Some((AutomatedFn::CheckWorker, FnOutcome::Classification(WorkerStatus::Tempfail))),
        Action::Skip => Some((AutomatedFn::Noop, FnOutcome::Noop)),
        _ => None,
    }
}

/// Stage 1. For every step with at least one available action, walk the
/// available actions in declared order; the same evaluator function is
/// invoked at most once per step per tick (memoized in `cache`), and the
/// first action whose function result matches its expected success value
/// wins.
async fn automated_resolver_stage(
    registry: &StepRegistry,
    workers: &WorkerTable,
    context: &Context,
    transitions: &TransitionsMap,
) -> Vec<(StepId, Action)> {
    let mut selected = Vec::new();

    for (step, available) in transitions {
        if available.is_empty() {
            continue;
        }
        let mut cache: FxHashMap<AutomatedFn, FnOutcome> = FxHashMap::default();

        for action in available {
            let Some((kind, expected)) = automated_table(*action) else {
                continue;
            };
            let outcome = match cache.get(&kind) {
                Some(cached) => *cached,
                None => {
                    let computed = evaluate_automated_fn(kind, *step, registry, workers, context).await;
                    cache.insert(kind, computed);
                    computed
                }
            };
            if outcome == expected {
                selected.push((*step, *action));
                break;
            }
        }
    }

    selected
}

async fn evaluate_automated_fn(
    kind: AutomatedFn,
    step: StepId,
    registry: &StepRegistry,
    workers: &WorkerTable,
    context: &Context,
) -> FnOutcome {
    match kind {
        AutomatedFn::SpawnWorker => {
            if let Some(def) = registry.get(step) {
                let (io_worker, output_worker, io_host, output_host) = crate::step::new_channel_pair();
                context.attach_channels(step, io_host, output_host).await;
                let ctx = StepContext {
                    step_id: step,
                    io: io_worker,
                    output: output_worker,
                };
                workers.spawn(step, def.callable.clone(), ctx).await;
            }
            FnOutcome::Spawned
        }
        AutomatedFn::CheckWorker => {
            let status = workers.check(step).await.unwrap_or(WorkerStatus::Running);
            if status != WorkerStatus::Running {
                if let Some((value, error)) = workers.result_as_json(step).await {
                    context.record_result(step, value, error).await;
                }
            }
            FnOutcome::Classification(status)
        }
        AutomatedFn::Noop => FnOutcome::Noop,
    }
}
