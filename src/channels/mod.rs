//! Per-step message channels.
//!
//! The engine collapses the many queue objects a naive port would need down
//! to two channel kinds per step (Design Notes, "Coroutines / dynamic
//! queues"): a bidirectional I/O channel the worker can `send`/`recv`
//! against to prompt the operator, and a write-only output channel for
//! informational messages. Both are `flume` multi-producer channels so the
//! API handler and the context serializer can drain them without racing the
//! worker that's writing to them.

use std::time::Duration;

use serde_json::Value;

/// Worker-facing handle onto its own I/O channel.
///
/// Cloning is cheap; the worker keeps one of these, the engine keeps the
/// paired [`IoChannelHost`].
#[derive(Clone)]
pub struct IoChannelWorker {
    pub(crate) to_operator: flume::Sender<Value>,
    pub(crate) from_operator: flume::Receiver<Value>,
}

impl IoChannelWorker {
    /// Prompt the operator with a message; visible in the step's I/O log the
    /// next time the context is serialized.
    pub async fn send(&self, message: Value) -> Result<(), flume::SendError<Value>> {
        self.to_operator.send_async(message).await
    }

    /// Block until the operator replies. Returns `None` if the operator side
    /// has been dropped (the engine is shutting down).
    pub async fn recv(&self) -> Option<Value> {
        self.from_operator.recv_async().await.ok()
    }
}

/// Engine-facing handle onto a step's I/O channel, held in the
/// [`crate::context::Context`].
pub struct IoChannelHost {
    pub(crate) from_worker: flume::Receiver<Value>,
    pub(crate) to_worker: flume::Sender<Value>,
}

impl IoChannelHost {
    /// Deliver a reply to the worker, as `send_message` does.
    pub fn reply(&self, message: Value) -> Result<(), flume::SendError<Value>> {
        self.to_worker.send(message)
    }

    /// Drain every message the worker has sent so far without blocking,
    /// appending each to `log`.
    pub fn drain_into(&self, log: &mut Vec<Value>) {
        while let Ok(msg) = self.from_worker.try_recv() {
            log.push(msg);
        }
    }

    /// Drain with a short timeout. Not used by the routine per-tick context
    /// serializer (which must never block on a quiet worker) — callers that
    /// are actively waiting on a prompt reply can use this instead of a bare
    /// [`Self::drain_into`] to briefly ride out a reply that is mid-send.
    /// Drains everything already queued immediately, then waits at most
    /// `timeout` for one more message.
    pub async fn drain_with_timeout(&self, log: &mut Vec<Value>, timeout: Duration) {
        self.drain_into(log);
        if let Ok(Ok(msg)) = tokio::time::timeout(timeout, self.from_worker.recv_async()).await {
            log.push(msg);
            self.drain_into(log);
        }
    }
}

/// Build a fresh I/O channel pair: the worker's half and the engine's half.
#[must_use]
pub fn io_channel() -> (IoChannelWorker, IoChannelHost) {
    let (to_operator, from_worker) = flume::unbounded();
    let (to_worker, from_operator) = flume::unbounded();
    (
        IoChannelWorker {
            to_operator,
            from_operator,
        },
        IoChannelHost {
            from_worker,
            to_worker,
        },
    )
}

/// Worker-facing handle onto its output-only channel.
#[derive(Clone)]
pub struct OutputChannelWorker {
    pub(crate) sender: flume::Sender<Value>,
}

impl OutputChannelWorker {
    pub fn emit(&self, message: Value) -> Result<(), flume::SendError<Value>> {
        self.sender.send(message)
    }
}

/// Engine-facing handle onto a step's output-only channel.
pub struct OutputChannelHost {
    pub(crate) receiver: flume::Receiver<Value>,
}

impl OutputChannelHost {
    pub fn drain_into(&self, log: &mut Vec<Value>) {
        while let Ok(msg) = self.receiver.try_recv() {
            log.push(msg);
        }
    }
}

#[must_use]
pub fn output_channel() -> (OutputChannelWorker, OutputChannelHost) {
    let (sender, receiver) = flume::unbounded();
    (OutputChannelWorker { sender }, OutputChannelHost { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn io_channel_round_trips_prompt_and_reply() {
        let (worker, host) = io_channel();
        worker.send(json!("ready?")).await.unwrap();

        let mut log = Vec::new();
        host.drain_into(&mut log);
        assert_eq!(log, vec![json!("ready?")]);

        host.reply(json!(true)).unwrap();
        assert_eq!(worker.recv().await, Some(json!(true)));
    }

    #[test]
    fn output_channel_drains_in_order() {
        let (worker, host) = output_channel();
        worker.emit(json!("one")).unwrap();
        worker.emit(json!("two")).unwrap();

        let mut log = Vec::new();
        host.drain_into(&mut log);
        assert_eq!(log, vec![json!("one"), json!("two")]);
    }
}
