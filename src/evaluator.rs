//! The tick loop (§4.2): the sole writer of the authoritative states map.
//!
//! Each tick computes every step's available actions from the states as
//! they stood at the start of the tick, hands `(states, transitions)` to the
//! callback pipeline, and applies whatever actions come back — but only the
//! ones still present in that tick's `transitions[step]` (§7, "unavailable
//! action injected: silently ignored").

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::callbacks::{ActionMap, CallbackPipeline, StatesMap, TransitionsMap};
use crate::errors::ManagerError;
use crate::rules::{PreconditionTable, RuleTable};
use crate::step::StepRegistry;
use crate::types::State;

pub struct Evaluator {
    registry: Arc<StepRegistry>,
    preconditions: PreconditionTable,
    states: StatesMap,
    pipeline: CallbackPipeline,
}

impl Evaluator {
    #[must_use]
    pub fn new(registry: Arc<StepRegistry>, preconditions: PreconditionTable, pipeline: CallbackPipeline) -> Self {
        let states = registry.ids_in_order().iter().map(|id| (*id, State::Ready)).collect();
        Evaluator {
            registry,
            preconditions,
            states,
            pipeline,
        }
    }

    /// Like [`Evaluator::new`], but seeded from a restored states map
    /// (`persistence::restore`) instead of defaulting every step to `Ready`.
    /// Steps absent from `initial_states` (should not happen once
    /// `persistence::restore` has validated completeness) fall back to
    /// `Ready`.
    #[must_use]
    pub fn with_initial_states(
        registry: Arc<StepRegistry>,
        preconditions: PreconditionTable,
        pipeline: CallbackPipeline,
        initial_states: StatesMap,
    ) -> Self {
        let states = registry
            .ids_in_order()
            .iter()
            .map(|id| (*id, initial_states.get(id).copied().unwrap_or(State::Ready)))
            .collect();
        Evaluator {
            registry,
            preconditions,
            states,
            pipeline,
        }
    }

    /// Run until every step's transitions are empty (quiescence) or the API
    /// handler relays a shutdown. Any error from a stage of the pipeline is
    /// fatal and propagated (§4.2, "Failure semantics").
    #[instrument(skip(self), fields(steps = self.registry.len()))]
    pub async fn run(mut self) -> Result<StatesMap, ManagerError> {
        loop {
            let transitions = self.compute_transitions();
            let quiescent = transitions.values().all(Vec::is_empty);

            let outcome = self.pipeline.run(&self.states, &transitions).await;

            self.apply_actions(outcome.actions, &transitions);

            if quiescent {
                info!("evaluator reached quiescence");
                break;
            }
            if outcome.shutdown_requested {
                info!("evaluator shutting down on operator request");
                break;
            }
        }
        Ok(self.states)
    }

    fn compute_transitions(&self) -> TransitionsMap {
        self.registry
            .ids_in_order()
            .iter()
            .map(|id| {
                let state = self.states.get(id).copied().unwrap_or(State::Ready);
                let available = RuleTable::available_actions(*id, state, &self.preconditions, &self.states);
                (*id, available)
            })
            .collect()
    }

    fn apply_actions(&mut self, actions: ActionMap, transitions: &TransitionsMap) {
        for (step, action) in actions {
            let Some(available) = transitions.get(&step) else {
                continue;
            };
            if !available.contains(&action) {
                continue;
            }
            let Some(current) = self.states.get(&step).copied() else {
                continue;
            };
            match RuleTable::transition(current, action) {
                Some(next) => {
                    self.states.insert(step, next);
                }
                None => warn!(step = step.value(), ?action, ?current, "rule table has no transition defined"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiHandler;
    use crate::callbacks::SharedSnapshots;
    use crate::context::Context;
    use crate::dag::Dag;
    use crate::step::{StepContext, StepFn, StepOutcome};
    use crate::worker::WorkerTable;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Returns(serde_json::Value);

    #[async_trait]
    impl StepFn for Returns {
        async fn call(&self, _ctx: StepContext) -> StepOutcome {
            Ok(self.0.clone())
        }
    }

    fn make_pipeline(registry: Arc<StepRegistry>) -> (CallbackPipeline, flume::Sender<ActionMap>) {
        let workers = Arc::new(WorkerTable::new());
        let context = Context::new();
        let snapshots = SharedSnapshots::default();
        let (injected_tx, injected_rx) = flume::unbounded();
        let (_req_tx, req_rx) = flume::unbounded();
        let dag = Arc::new(Dag::default());
        let api = ApiHandler::new(registry.clone(), dag, req_rx);
        let pipeline = CallbackPipeline::new(
            registry,
            workers,
            context,
            snapshots,
            injected_rx,
            api,
            Duration::from_millis(10),
            Duration::ZERO,
        );
        (pipeline, injected_tx)
    }

    #[tokio::test]
    async fn single_step_runs_to_completion() {
        let mut registry = StepRegistry::new();
        let step = registry.add_step("a", Returns(json!("A-ok")));
        let registry = Arc::new(registry);

        let preconditions = PreconditionTable::new();
        let (pipeline, injected_tx) = make_pipeline(registry.clone());
        let evaluator = Evaluator::new(registry, preconditions, pipeline);

        // Nothing runs until `start` is injected — the engine never
        // auto-starts a Ready step.
        let mut kickoff = ActionMap::default();
        kickoff.insert(step, crate::types::Action::Start);
        injected_tx.send(kickoff).unwrap();

        let final_states = tokio::time::timeout(Duration::from_secs(5), evaluator.run())
            .await
            .expect("evaluator should not hang")
            .expect("evaluator should not error");

        assert_eq!(final_states.get(&step), Some(&State::Succeeded));
    }
}
