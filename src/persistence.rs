//! Persisted DAG state: JSON backup/restore (§6, §12).
//!
//! The original implementation ships a full `dump_state`/`restore_state`
//! pair keyed by step name rather than id (ids are only stable within a
//! single process's registry construction order); this module mirrors that
//! naming so a backup survives being restored into a freshly-built registry
//! as long as the same steps are registered in the same DAG shape.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::context::Context;
use crate::dag::Dag;
use crate::errors::PersistenceError;
use crate::step::StepRegistry;
use crate::types::{State, StepId};

/// One step's persisted record, keyed by step name in [`PersistedState`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedStep {
    pub state: String,
    pub return_value: Option<Value>,
    pub prompt_messages: Vec<Value>,
    pub output_messages: Vec<Value>,
    pub input_messages: Vec<Value>,
    pub parents: Vec<String>,
}

pub type PersistedState = FxHashMap<String, PersistedStep>;

/// The on-disk shape: per-step records plus a creation timestamp, so a
/// restored run can be told apart from a stale one left over from an
/// earlier attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub created_at: String,
    pub steps: PersistedState,
}

/// Write the current run's state to `path` as JSON, keyed by step name.
#[instrument(skip(registry, states, context, dag))]
pub async fn backup(
    path: &str,
    registry: &StepRegistry,
    states: &FxHashMap<StepId, State>,
    context: &Context,
    dag: &Dag,
) -> Result<(), PersistenceError> {
    let parents_by_step = parent_names(registry, dag);

    let mut document = PersistedState::default();
    for def in registry.iter() {
        let state = states.get(&def.id).copied().unwrap_or(State::Ready);
        let (return_value, prompt_messages, input_messages, output_messages) =
            context.export_for_persistence(def.id).await;
        document.insert(
            def.name.clone(),
            PersistedStep {
                state: state.as_str().to_string(),
                return_value,
                prompt_messages,
                output_messages,
                input_messages,
                parents: parents_by_step.get(&def.id).cloned().unwrap_or_default(),
            },
        );
    }

    let document = PersistedDocument {
        created_at: chrono::Utc::now().to_rfc3339(),
        steps: document,
    };
    let encoded = serde_json::to_vec_pretty(&document)?;
    tokio::fs::write(path, encoded)
        .await
        .map_err(|source| PersistenceError::Io {
            path: path.to_string(),
            source,
        })
}

/// Restore state from `path`, validating every registered step is present
/// and its persisted parent list agrees with the DAG's current shape, then
/// remapping from-states that are not safe to resume into directly
/// (`Running` and the legacy `Blocked` both become `Paused`).
#[instrument(skip(registry, context, dag))]
pub async fn restore(
    path: &str,
    registry: &StepRegistry,
    context: &Context,
    dag: &Dag,
) -> Result<FxHashMap<StepId, State>, PersistenceError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PersistenceError::Io {
            path: path.to_string(),
            source,
        })?;
    let document: PersistedDocument = serde_json::from_str(&raw)?;
    let document = document.steps;
    let parents_by_step = parent_names(registry, dag);

    let mut states = FxHashMap::default();
    for def in registry.iter() {
        let Some(entry) = document.get(&def.name) else {
            return Err(PersistenceError::MissingStep(def.name.clone()));
        };

        let mut expected_parents = parents_by_step.get(&def.id).cloned().unwrap_or_default();
        let mut actual_parents = entry.parents.clone();
        expected_parents.sort();
        actual_parents.sort();
        if expected_parents != actual_parents {
            return Err(PersistenceError::ParentMismatch { step: def.name.clone() });
        }

        let restored_state = remap_restored_state(&entry.state);
        states.insert(def.id, restored_state);
        context
            .seed_step(
                def.id,
                entry.return_value.clone(),
                entry.prompt_messages.clone(),
                entry.input_messages.clone(),
                entry.output_messages.clone(),
            )
            .await;
    }

    Ok(states)
}

/// `Running -> Paused`, legacy `Blocked -> Paused`, else identity. An
/// unrecognized state name is treated as `Ready` rather than failing the
/// whole restore — a forward-compatible persisted file should not brick an
/// older binary.
fn remap_restored_state(raw: &str) -> State {
    match raw {
        "Running" | "Blocked" => State::Paused,
        other => State::parse(other).unwrap_or(State::Ready),
    }
}

fn parent_names(registry: &StepRegistry, dag: &Dag) -> FxHashMap<StepId, Vec<String>> {
    let mut parents: FxHashMap<StepId, Vec<String>> = FxHashMap::default();
    for (from, to) in dag.success_edges.iter().chain(dag.failure_edges.iter()) {
        if let Some(name) = registry.get(*from).map(|d| d.name.clone()) {
            parents.entry(*to).or_default().push(name);
        }
    }
    parents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_running_and_blocked_to_paused() {
        assert_eq!(remap_restored_state("Running"), State::Paused);
        assert_eq!(remap_restored_state("Blocked"), State::Paused);
        assert_eq!(remap_restored_state("Succeeded"), State::Succeeded);
        assert_eq!(remap_restored_state("nonsense"), State::Ready);
    }
}
