//! The shared, concurrently-accessible context map.
//!
//! The context survives across ticks and is the one piece of state the
//! evaluator, the automated-action stages, and the API layer all touch
//! concurrently: the evaluator and worker-completion handlers write it, the
//! API handler reads it for `status`/`get_serialized_context`. It is stored
//! as a lock-guarded [`rustc_hash::FxHashMap`] rather than per-step
//! back-pointers, matching the arena-plus-index design note.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::channels::{IoChannelHost, OutputChannelHost};
use crate::types::StepId;

/// Per-step data the context retains. Channel endpoints are held here but
/// are never serialized — only their drained logs are.
pub struct StepSlot {
    pub return_value: Option<Value>,
    pub exception: Option<Value>,
    pub io_channel: Option<IoChannelHost>,
    pub output_channel: Option<OutputChannelHost>,
    pub io_log: Vec<Value>,
    pub output_log: Vec<Value>,
    /// Replies the operator has sent on this step's I/O channel — tracked
    /// separately from `io_log` (the worker's prompts) so persistence can
    /// round-trip the original implementation's three-queue shape
    /// (`prompt_messages` / `input_messages` / `output_messages`).
    pub reply_log: Vec<Value>,
    /// Set when the worker has sent a prompt that has not yet been answered
    /// by `reply_to_step`; backs the `steps_waiting_for_user_input` operation.
    pub awaiting_reply: bool,
}

impl StepSlot {
    fn new() -> Self {
        StepSlot {
            return_value: None,
            exception: None,
            io_channel: None,
            output_channel: None,
            io_log: Vec::new(),
            output_log: Vec::new(),
            reply_log: Vec::new(),
            awaiting_reply: false,
        }
    }
}

/// A pure-data snapshot of one step's context sub-map, safe to serialize.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StepContextSnapshot {
    pub return_value: Option<Value>,
    pub exception: Option<Value>,
    pub io_log: Vec<Value>,
    pub output_log: Vec<Value>,
}

/// The engine's shared context: a per-step map plus arbitrary user globals.
#[derive(Clone)]
pub struct Context {
    steps: Arc<RwLock<FxHashMap<StepId, StepSlot>>>,
    globals: Arc<RwLock<FxHashMap<String, Value>>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Context {
            steps: Arc::new(RwLock::new(FxHashMap::default())),
            globals: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// Ensure a step has a slot, creating an empty one if absent.
    pub async fn ensure_slot(&self, step: StepId) {
        let mut guard = self.steps.write().await;
        guard.entry(step).or_insert_with(StepSlot::new);
    }

    /// Synchronous equivalent of [`Self::ensure_slot`], used by
    /// [`crate::manager::Manager::new`] to give every registered step a slot
    /// before any task is spawned (so a step that is skipped and never run
    /// still has one for `status`/`get_serialized_context`). Safe to call
    /// with `try_write` here because construction happens before any other
    /// task can be holding the lock; not a general-purpose substitute for
    /// `ensure_slot` once the engine is running.
    pub fn ensure_slot_sync(&self, step: StepId) {
        if let Ok(mut guard) = self.steps.try_write() {
            guard.entry(step).or_insert_with(StepSlot::new);
        }
    }

    /// Attach fresh channel endpoints at spawn time, replacing any previous
    /// pair (a rerun gets new channels; prior io/output logs are retained).
    pub async fn attach_channels(
        &self,
        step: StepId,
        io_channel: IoChannelHost,
        output_channel: OutputChannelHost,
    ) {
        let mut guard = self.steps.write().await;
        let slot = guard.entry(step).or_insert_with(StepSlot::new);
        slot.io_channel = Some(io_channel);
        slot.output_channel = Some(output_channel);
    }

    /// Record a worker's completion. Per the rerun round-trip property,
    /// io/output logs are never cleared here.
    pub async fn record_result(&self, step: StepId, return_value: Option<Value>, exception: Option<Value>) {
        let mut guard = self.steps.write().await;
        let slot = guard.entry(step).or_insert_with(StepSlot::new);
        slot.return_value = return_value;
        slot.exception = exception;
    }

    /// Drain a step's I/O and output channels into their logs. Non-blocking:
    /// only whatever is already queued is collected, so a quiet step (a
    /// worker that is alive but has sent nothing) never stalls the tick.
    pub async fn drain_step(&self, step: StepId) {
        let guard = self.steps.read().await;
        let Some(slot) = guard.get(&step) else {
            return;
        };
        // Logs are behind the same lock as the channels; draining needs a
        // short write afterwards, so collect first under a read, then apply.
        let mut io_log = Vec::new();
        if let Some(io) = &slot.io_channel {
            io.drain_into(&mut io_log);
        }
        let mut output_log = Vec::new();
        if let Some(output) = &slot.output_channel {
            output.drain_into(&mut output_log);
        }
        drop(guard);
        if io_log.is_empty() && output_log.is_empty() {
            return;
        }
        let mut guard = self.steps.write().await;
        if let Some(slot) = guard.get_mut(&step) {
            if !io_log.is_empty() {
                slot.awaiting_reply = true;
            }
            slot.io_log.extend(io_log);
            slot.output_log.extend(output_log);
        }
    }

    /// Deliver a reply on a step's I/O channel, as `send_message` does.
    /// Returns `false` if the step has no channel or its worker has gone
    /// away (the peer-gone error case).
    pub async fn reply_to_step(&self, step: StepId, message: Value) -> bool {
        let mut guard = self.steps.write().await;
        let Some(slot) = guard.get_mut(&step) else {
            return false;
        };
        let delivered = slot.io_channel.as_ref().is_some_and(|io| io.reply(message.clone()).is_ok());
        if delivered {
            slot.awaiting_reply = false;
            slot.reply_log.push(message);
        }
        delivered
    }

    /// Step ids currently awaiting a reply on their I/O channel.
    pub async fn steps_awaiting_reply(&self) -> Vec<StepId> {
        let guard = self.steps.read().await;
        guard
            .iter()
            .filter(|(_, slot)| slot.awaiting_reply)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot one step's data as plain, serializable data.
    pub async fn snapshot_step(&self, step: StepId) -> Option<StepContextSnapshot> {
        let guard = self.steps.read().await;
        guard.get(&step).map(|slot| StepContextSnapshot {
            return_value: slot.return_value.clone(),
            exception: slot.exception.clone(),
            io_log: slot.io_log.clone(),
            output_log: slot.output_log.clone(),
        })
    }

    /// Snapshot every step's data, keyed by id, for `get_serialized_context`.
    pub async fn snapshot_all(&self) -> FxHashMap<StepId, StepContextSnapshot> {
        let guard = self.steps.read().await;
        guard
            .iter()
            .map(|(id, slot)| {
                (
                    *id,
                    StepContextSnapshot {
                        return_value: slot.return_value.clone(),
                        exception: slot.exception.clone(),
                        io_log: slot.io_log.clone(),
                        output_log: slot.output_log.clone(),
                    },
                )
            })
            .collect()
    }

    /// Export one step's persistable data: `(return_value, prompt_messages,
    /// input_messages, output_messages)`, matching the original
    /// implementation's three-queue shape for backup.
    pub async fn export_for_persistence(&self, step: StepId) -> (Option<Value>, Vec<Value>, Vec<Value>, Vec<Value>) {
        let guard = self.steps.read().await;
        match guard.get(&step) {
            Some(slot) => (
                slot.return_value.clone(),
                slot.io_log.clone(),
                slot.reply_log.clone(),
                slot.output_log.clone(),
            ),
            None => (None, Vec::new(), Vec::new(), Vec::new()),
        }
    }

    /// Seed a step's slot from restored persisted data, replacing whatever
    /// logs/return value it currently has (used only by `restore`, before
    /// any worker has been spawned).
    pub async fn seed_step(
        &self,
        step: StepId,
        return_value: Option<Value>,
        prompt_messages: Vec<Value>,
        input_messages: Vec<Value>,
        output_messages: Vec<Value>,
    ) {
        let mut guard = self.steps.write().await;
        let slot = guard.entry(step).or_insert_with(StepSlot::new);
        slot.return_value = return_value;
        slot.io_log = prompt_messages;
        slot.reply_log = input_messages;
        slot.output_log = output_messages;
    }

    pub async fn set_global(&self, key: impl Into<String>, value: Value) {
        self.globals.write().await.insert(key.into(), value);
    }

    pub async fn get_global(&self, key: &str) -> Option<Value> {
        self.globals.read().await.get(key).cloned()
    }
}
