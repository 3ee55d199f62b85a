//! Steps: named, id-bearing wrappers around user callables.
//!
//! [`StepRegistry`] owns the process-wide id counter so construction never
//! needs global mutable state (Design Notes, "Global mutable state"): every
//! step gets a dense, permanent [`StepId`] the moment it is registered.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::channels::{io_channel, output_channel, IoChannelWorker, OutputChannelWorker};
use crate::errors::{ManagerError, WorkerError};
use crate::tags::Tags;
use crate::types::StepId;

/// What a step callable hands back to the engine on success or failure.
pub type StepOutcome = Result<Value, WorkerError>;

/// Execution-time handles passed to a step callable: its own channel
/// endpoints and identity. Dropping the struct drops the worker's side of
/// both channels.
pub struct StepContext {
    pub step_id: StepId,
    pub io: IoChannelWorker,
    pub output: OutputChannelWorker,
}

/// A unit of work. Implementations should be stateless with respect to
/// workflow position — all step-specific data flows in through
/// [`StepContext`] and the return value, not shared mutable fields.
#[async_trait]
pub trait StepFn: Send + Sync {
    async fn call(&self, ctx: StepContext) -> StepOutcome;
}

/// A registered step's static definition: its callable, tags, and identity.
/// Distinct from the *runtime* worker handle, which [`crate::worker`] owns
/// and which comes and goes across start/rerun/interrupt.
pub struct StepDefinition {
    pub id: StepId,
    pub name: String,
    pub tags: Tags,
    pub callable: Arc<dyn StepFn>,
}

/// Builder and owner of the step id counter and the step table.
///
/// Steps are referenced everywhere else only by [`StepId`] — the registry is
/// the one place that keeps the id ⇄ definition mapping, keeping the rule
/// table and preconditions a flat, back-pointer-free arena.
#[derive(Default)]
pub struct StepRegistry {
    next_id: u64,
    steps: FxHashMap<StepId, StepDefinition>,
    names: FxHashMap<String, StepId>,
    order: Vec<StepId>,
}

impl StepRegistry {
    #[must_use]
    pub fn new() -> Self {
        StepRegistry::default()
    }

    /// Register a step with no tags beyond the mandatory `name`/`n`.
    pub fn add_step(&mut self, name: impl Into<String>, callable: impl StepFn + 'static) -> StepId {
        self.add_step_with_tags(name, Tags::default(), callable)
    }

    /// Register a step with caller-supplied tags; `name` and `n` are always
    /// injected (and override any caller-supplied values for those keys),
    /// matching the data model's invariant.
    pub fn add_step_with_tags(
        &mut self,
        name: impl Into<String>,
        mut tags: Tags,
        callable: impl StepFn + 'static,
    ) -> StepId {
        let name = name.into();
        let id = StepId(self.next_id);
        self.next_id += 1;

        tags.insert("name".to_string(), json!(name.clone()));
        tags.insert("n".to_string(), json!(id.value()));

        self.names.insert(name.clone(), id);
        self.order.push(id);
        self.steps.insert(
            id,
            StepDefinition {
                id,
                name,
                tags,
                callable: Arc::new(callable),
            },
        );
        id
    }

    pub fn get(&self, id: StepId) -> Option<&StepDefinition> {
        self.steps.get(&id)
    }

    pub fn id_for_name(&self, name: &str) -> Option<StepId> {
        self.names.get(name).copied()
    }

    /// Steps in registration order — the order ids were handed out, used
    /// wherever a deterministic iteration is needed (e.g. tie-breaking in
    /// `next_steps`'s topological sort).
    pub fn ids_in_order(&self) -> &[StepId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDefinition> {
        self.order.iter().filter_map(|id| self.steps.get(id))
    }

    /// Validate that every id appearing in `edges` is a registered step.
    pub fn validate_edges(&self, edges: &[(StepId, StepId)]) -> Result<(), ManagerError> {
        for (from, to) in edges {
            if !self.steps.contains_key(from) {
                return Err(ManagerError::UnknownEdgeEndpoint(*from));
            }
            if !self.steps.contains_key(to) {
                return Err(ManagerError::UnknownEdgeEndpoint(*to));
            }
        }
        Ok(())
    }
}

/// Build a fresh pair of channel endpoints for a step about to be spawned:
/// one half for the [`StepContext`] the worker receives, one half to attach
/// to the [`crate::context::Context`].
#[must_use]
pub fn new_channel_pair() -> (
    IoChannelWorker,
    OutputChannelWorker,
    crate::channels::IoChannelHost,
    crate::channels::OutputChannelHost,
) {
    let (io_worker, io_host) = io_channel();
    let (output_worker, output_host) = output_channel();
    (io_worker, output_worker, io_host, output_host)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl StepFn for Noop {
        async fn call(&self, _ctx: StepContext) -> StepOutcome {
            Ok(json!(null))
        }
    }

    #[test]
    fn ids_are_dense_and_permanent() {
        let mut registry = StepRegistry::new();
        let a = registry.add_step("a", Noop);
        let b = registry.add_step("b", Noop);
        assert_eq!(a, StepId(0));
        assert_eq!(b, StepId(1));
        assert_eq!(registry.ids_in_order(), &[a, b]);
    }

    #[test]
    fn tags_always_contain_name_and_n() {
        let mut registry = StepRegistry::new();
        let id = registry.add_step("first", Noop);
        let def = registry.get(id).unwrap();
        assert_eq!(def.tags.get("name"), Some(&json!("first")));
        assert_eq!(def.tags.get("n"), Some(&json!(0u64)));
    }

    #[test]
    fn validate_edges_rejects_unknown_step() {
        let mut registry = StepRegistry::new();
        let a = registry.add_step("a", Noop);
        let bogus = StepId(99);
        assert!(registry.validate_edges(&[(a, bogus)]).is_err());
    }
}
