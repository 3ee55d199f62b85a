//! The operator-facing API handler (§4.5).
//!
//! Requests arrive over the in-process channel the control socket feeds
//! (`control.rs`); the handler matches steps by tag query against the
//! registry's static tags and by state/available-action against the
//! evaluator's latest published snapshot, and answers with a `(result,
//! error)` pair plus a [`Relay`] the evaluator applies this tick.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::instrument;

use crate::callbacks::{ActionMap, SharedSnapshots};
use crate::context::Context;
use crate::dag::Dag;
use crate::errors::ApiError;
use crate::step::StepRegistry;
use crate::tags::TagQuery;
use crate::types::{Action, State, StatusField, StepId};
use crate::worker::WorkerTable;

/// A decoded request, already validated field-by-field; [`control`] is
/// responsible for turning wire JSON into this shape (or an [`ApiError`]).
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub operation: Operation,
    pub tags: TagQuery,
    pub states: Vec<State>,
    pub status_fields: Vec<StatusField>,
    pub step_count: u64,
    pub message: Value,
    pub dry_run: bool,
}

impl ApiRequest {
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        ApiRequest {
            operation,
            tags: TagQuery::empty(),
            states: Vec::new(),
            status_fields: Vec::new(),
            step_count: 0,
            message: Value::Null,
            dry_run: false,
        }
    }
}

/// The closed set of implemented operation names (§6). Legacy names
/// (`block`, `unblock`, `pause_branch`, `resume_branch`,
/// `set_pause_on_fail`, `unset_pause_on_fail`) are deliberately absent —
/// parsing one of them yields [`ApiError::UnknownOperation`], per the Design
/// Notes' open-question resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Shutdown,
    Status,
    List,
    Pause,
    Interrupt,
    Resume,
    Rerun,
    Skip,
    Unskip,
    NextSteps,
    SendMessageToSteps,
    GetSerializedContext,
    StepsWaitingForUserInput,
}

impl Operation {
    pub fn parse(name: &str) -> Result<Self, ApiError> {
        Ok(match name {
            "start" => Operation::Start,
            "shutdown" => Operation::Shutdown,
            "status" => Operation::Status,
            "list" => Operation::List,
            "pause" => Operation::Pause,
            "interrupt" => Operation::Interrupt,
            "resume" => Operation::Resume,
            "rerun" => Operation::Rerun,
            "skip" => Operation::Skip,
            "unskip" => Operation::Unskip,
            "next_steps" => Operation::NextSteps,
            "send_message_to_steps" => Operation::SendMessageToSteps,
            "get_serialized_context" => Operation::GetSerializedContext,
            "steps_waiting_for_user_input" => Operation::StepsWaitingForUserInput,
            other => return Err(ApiError::UnknownOperation(other.to_string())),
        })
    }
}

/// What a handled request hands back over the wire.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub result: Value,
    pub error: Option<String>,
}

impl ApiResponse {
    fn ok(result: Value) -> Self {
        ApiResponse { result, error: None }
    }
}

/// What the evaluator should do with a handled request beyond answering it.
#[derive(Clone, Debug, Default)]
pub enum Relay {
    #[default]
    None,
    /// Merge into this tick's action map (subject to availability, same as
    /// any other action source).
    Actions(ActionMap),
    /// Merge `actions` this tick, then have the evaluator exit once they've
    /// been applied — used only by `shutdown`, which first pauses every
    /// running-eligible step and interrupts every still-running one (§4.5)
    /// before the loop terminates.
    Shutdown(ActionMap),
}

pub struct HandlerOutcome {
    pub response: ApiResponse,
    pub relay: Relay,
}

/// Owns the receiving half of the in-process channel fed by the control
/// socket task, plus everything needed to answer a request against the
/// evaluator's current view.
pub struct ApiHandler {
    registry: Arc<StepRegistry>,
    dag: Arc<Dag>,
    requests: flume::Receiver<(ApiRequest, flume::Sender<ApiResponse>)>,
}

impl ApiHandler {
    #[must_use]
    pub fn new(
        registry: Arc<StepRegistry>,
        dag: Arc<Dag>,
        requests: flume::Receiver<(ApiRequest, flume::Sender<ApiResponse>)>,
    ) -> Self {
        ApiHandler { registry, dag, requests }
    }

    /// Service at most one request this tick (§4.3 stage 7). Returns `None`
    /// if no request was waiting.
    #[instrument(skip(self, snapshots, workers, context))]
    pub async fn tick(
        &self,
        snapshots: &SharedSnapshots,
        workers: &WorkerTable,
        context: &Context,
    ) -> Option<HandlerOutcome> {
        let (request, reply_tx) = self.requests.try_recv().ok()?;
        let outcome = self.handle(&request, snapshots, workers, context).await;
        let _ = reply_tx.send(outcome.response.clone());
        Some(outcome)
    }

    async fn handle(
        &self,
        request: &ApiRequest,
        snapshots: &SharedSnapshots,
        workers: &WorkerTable,
        context: &Context,
    ) -> HandlerOutcome {
        let states = snapshots.states.read().await.clone();
        let transitions = snapshots.transitions.read().await.clone();

        let matches_query = |step: StepId| -> bool {
            self.registry
                .get(step)
                .is_some_and(|def| request.tags.matches(&def.tags))
        };
        let matched: Vec<StepId> = self
            .registry
            .ids_in_order()
            .iter()
            .copied()
            .filter(|id| matches_query(*id))
            .filter(|id| request.states.is_empty() || states.get(id).is_some_and(|s| request.states.contains(s)))
            .collect();

        match request.operation {
            Operation::Start => self.emit_if_available(&matched, Action::Start, &transitions, request.dry_run),
            Operation::Pause => self.emit_if_available(&matched, Action::Pause, &transitions, request.dry_run),
            Operation::Resume => self.emit_if_available(&matched, Action::Resume, &transitions, request.dry_run),
            Operation::Skip => self.emit_if_available(&matched, Action::MarkToSkip, &transitions, request.dry_run),
            Operation::Unskip => self.emit_if_available(&matched, Action::Unskip, &transitions, request.dry_run),
            Operation::Rerun => self.emit_if_available(&matched, Action::Rerun, &transitions, request.dry_run),

            Operation::Interrupt => {
                if request.dry_run {
                    return self.dry_run_result(&matched);
                }
                let mut interrupted = Vec::new();
                for step in &matched {
                    if transitions.get(step).is_some_and(|avail| avail.contains(&Action::Interrupt))
                        && workers.interrupt(*step).await
                    {
                        interrupted.push(*step);
                    }
                }
                let mut actions = ActionMap::default();
                for step in &interrupted {
                    actions.insert(*step, Action::Interrupt);
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!(self.names_of(&interrupted))),
                    relay: Relay::Actions(actions),
                }
            }

            Operation::NextSteps => {
                let all_ids = self.registry.ids_in_order();
                let order = self.dag.topological_order(all_ids);
                let limit = if request.step_count == 0 {
                    usize::MAX
                } else {
                    request.step_count as usize
                };
                let chosen: Vec<StepId> = order
                    .into_iter()
                    .filter(|id| states.get(id) == Some(&State::Paused))
                    .filter(|id| transitions.get(id).is_some_and(|avail| avail.contains(&Action::Resume)))
                    .take(limit)
                    .collect();
                if request.dry_run {
                    return HandlerOutcome {
                        response: ApiResponse::ok(json!(self.names_of(&chosen))),
                        relay: Relay::None,
                    };
                }
                let mut actions = ActionMap::default();
                for step in &chosen {
                    actions.insert(*step, Action::Resume);
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!(self.names_of(&chosen))),
                    relay: Relay::Actions(actions),
                }
            }

            Operation::SendMessageToSteps => {
                // §4.5: filter is tag query intersected with state=Running,
                // regardless of any `states` the caller additionally passed.
                let running: Vec<StepId> = matched
                    .iter()
                    .copied()
                    .filter(|id| states.get(id) == Some(&State::Running))
                    .collect();
                if request.dry_run {
                    return self.dry_run_result(&running);
                }
                let mut delivered = Vec::new();
                let mut undelivered = Vec::new();
                for step in &running {
                    if context.reply_to_step(*step, request.message.clone()).await {
                        delivered.push(*step);
                    } else {
                        undelivered.push(*step);
                    }
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!({
                        "delivered": self.names_of(&delivered),
                        "undelivered": self.names_of(&undelivered),
                    })),
                    relay: Relay::None,
                }
            }

            Operation::Status => {
                let fields = if request.status_fields.is_empty() {
                    StatusField::all()
                } else {
                    request.status_fields.clone()
                };
                let mut rows = Vec::new();
                for step in &matched {
                    rows.push(self.status_row(*step, &fields, &states, &transitions, context).await);
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!(rows)),
                    relay: Relay::None,
                }
            }

            Operation::List => HandlerOutcome {
                response: ApiResponse::ok(json!(self.names_of(&matched))),
                relay: Relay::None,
            },

            Operation::GetSerializedContext => {
                // §4.5: filter is always "none" here — the whole context is
                // returned regardless of the request's tag/state filter.
                let mut out = FxHashMap::default();
                for step in self.registry.ids_in_order() {
                    if let Some(snapshot) = context.snapshot_step(*step).await {
                        if let Some(def) = self.registry.get(*step) {
                            out.insert(def.name.clone(), json!(snapshot));
                        }
                    }
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!(out)),
                    relay: Relay::None,
                }
            }

            Operation::StepsWaitingForUserInput => {
                // §4.5: Running steps with a non-empty (unanswered) I/O log.
                let waiting = context.steps_awaiting_reply().await;
                let waiting: Vec<StepId> = waiting
                    .into_iter()
                    .filter(|id| matched.contains(id))
                    .filter(|id| states.get(id) == Some(&State::Running))
                    .collect();
                HandlerOutcome {
                    response: ApiResponse::ok(json!(self.names_of(&waiting))),
                    relay: Relay::None,
                }
            }

            Operation::Shutdown => {
                // Ignores tag/state filters: shutdown always targets every
                // registered step, not just the caller's query (§4.5).
                let all_ids = self.registry.ids_in_order();
                let mut actions = ActionMap::default();
                let mut interrupted = Vec::new();
                for step in all_ids {
                    let available = transitions.get(step);
                    if available.is_some_and(|avail| avail.contains(&Action::Pause)) {
                        actions.insert(*step, Action::Pause);
                    } else if available.is_some_and(|avail| avail.contains(&Action::Interrupt))
                        && workers.interrupt(*step).await
                    {
                        actions.insert(*step, Action::Interrupt);
                        interrupted.push(*step);
                    }
                }
                HandlerOutcome {
                    response: ApiResponse::ok(json!({"interrupted": self.names_of(&interrupted)})),
                    relay: Relay::Shutdown(actions),
                }
            }
        }
    }

    fn emit_if_available(
        &self,
        matched: &[StepId],
        action: Action,
        transitions: &crate::callbacks::TransitionsMap,
        dry_run: bool,
    ) -> HandlerOutcome {
        let eligible: Vec<StepId> = matched
            .iter()
            .copied()
            .filter(|id| transitions.get(id).is_some_and(|avail| avail.contains(&action)))
            .collect();
        if dry_run {
            return HandlerOutcome {
                response: ApiResponse::ok(json!(self.names_of(&eligible))),
                relay: Relay::None,
            };
        }
        let mut actions = ActionMap::default();
        for step in &eligible {
            actions.insert(*step, action);
        }
        HandlerOutcome {
            response: ApiResponse::ok(json!(self.names_of(&eligible))),
            relay: Relay::Actions(actions),
        }
    }

    fn dry_run_result(&self, matched: &[StepId]) -> HandlerOutcome {
        HandlerOutcome {
            response: ApiResponse::ok(json!(self.names_of(matched))),
            relay: Relay::None,
        }
    }

    fn names_of(&self, steps: &[StepId]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|id| self.registry.get(*id).map(|def| def.name.clone()))
            .collect()
    }

    async fn status_row(
        &self,
        step: StepId,
        fields: &[StatusField],
        states: &FxHashMap<StepId, State>,
        transitions: &crate::callbacks::TransitionsMap,
        context: &Context,
    ) -> Value {
        let def = self.registry.get(step);
        let snapshot = context.snapshot_step(step).await;
        let mut row = serde_json::Map::new();
        for field in fields {
            let value = match field {
                StatusField::Name => def.map(|d| json!(d.name)).unwrap_or(Value::Null),
                StatusField::Tags => def.map(|d| json!(d.tags)).unwrap_or(Value::Null),
                StatusField::State => states.get(&step).map(|s| json!(s.as_str())).unwrap_or(Value::Null),
                StatusField::Actions => json!(transitions
                    .get(&step)
                    .map(|actions| actions.iter().map(|a| a.as_str()).collect::<Vec<_>>())
                    .unwrap_or_default()),
                StatusField::IoLog => snapshot.as_ref().map(|s| json!(s.io_log)).unwrap_or(json!([])),
                StatusField::OutputLog => snapshot.as_ref().map(|s| json!(s.output_log)).unwrap_or(json!([])),
                StatusField::ReturnValue => snapshot.as_ref().and_then(|s| s.return_value.clone()).unwrap_or(Value::Null),
                StatusField::Exception => snapshot.as_ref().and_then(|s| s.exception.clone()).unwrap_or(Value::Null),
            };
            row.insert(format!("{field:?}"), value);
        }
        Value::Object(row)
    }
}

/// Parse a request's `error`-returning fields; used by `control.rs` when
/// decoding a wire frame.
pub fn parse_states(values: &[Value]) -> Result<Vec<State>, ApiError> {
    values
        .iter()
        .map(|v| {
            let s = v.as_str().ok_or(ApiError::MalformedField {
                field: "states",
                expected: "array of state name strings",
            })?;
            State::parse(s).ok_or_else(|| ApiError::UnknownState(s.to_string()))
        })
        .collect()
}

pub fn parse_status_fields(values: &[Value]) -> Result<Vec<StatusField>, ApiError> {
    values
        .iter()
        .map(|v| {
            let s = v.as_str().ok_or(ApiError::MalformedField {
                field: "status_fields",
                expected: "array of status field name strings",
            })?;
            StatusField::parse(s).ok_or_else(|| ApiError::UnknownStatusField(s.to_string()))
        })
        .collect()
}
