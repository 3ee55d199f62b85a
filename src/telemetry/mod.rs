//! Logging setup and operator-facing pretty-printing helpers (§11).
//!
//! [`init_tracing`] installs a global `tracing` subscriber the same way the
//! teacher framework's example binaries do: an `EnvFilter` layered with a
//! `fmt` layer and `tracing_error`'s `ErrorLayer` (so `WorkerError`'s cause
//! chain can be captured as a `SpanTrace` by callers that want one), honoring
//! `RUST_LOG`/`AUTOTRAIL_LOG` with a crate-scoped default. `PlainFormatter`
//! renders `WorkerError` chains and `status` rows for operator-facing CLIs
//! built on top of this crate — the interactive textual client itself is out
//! of scope (§1), but the rendering primitives it would use are not.

use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::WorkerError;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const ERROR_COLOR: &str = "\x1b[31m"; // red
pub const RESET_COLOR: &str = "\x1b[0m";

/// Install a global `tracing` subscriber. `filter` is tried first as an
/// `EnvFilter` directive string (so callers can pass
/// [`crate::config::EngineConfig::log_filter`]); `RUST_LOG` still wins if
/// set, matching `EnvFilter::try_from_default_env`'s precedence. Safe to call
/// at most once per process — a second call is a no-op error that this
/// function swallows, since an embedding application may have already
/// installed its own subscriber.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init();
}

/// Rendered output for a telemetry item that can be consumed by sinks (a CLI
/// stdout writer, a log aggregator, a test assertion).
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    #[must_use]
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

/// Formats step status rows and worker error chains for display. Not used by
/// the engine itself — embedding CLIs depend on it so they don't need to
/// reinvent the coloring/indentation scheme.
pub trait TelemetryFormatter: Send + Sync {
    fn render_worker_error(&self, error: &WorkerError) -> EventRender;
    fn render_status_rows(&self, rows: &[serde_json::Value]) -> Vec<EventRender>;
}

pub struct PlainFormatter;

fn format_error_chain(error: &WorkerError, indent: usize) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        lines.push(format!("{LINE_COLOR}{indent_str}cause: {}{RESET_COLOR}\n", cause.message));
        lines.extend(format_error_chain(cause, indent + 1));
    }
    lines
}

impl TelemetryFormatter for PlainFormatter {
    fn render_worker_error(&self, error: &WorkerError) -> EventRender {
        let kind = match error.kind {
            crate::errors::WorkerErrorKind::Failure => "failure",
            crate::errors::WorkerErrorKind::Tempfail => "tempfail",
        };
        let mut lines = vec![format!(
            "{ERROR_COLOR}[{kind}] {}{RESET_COLOR}\n",
            error.message
        )];
        lines.extend(format_error_chain(error, 1));
        if !error.details.is_null() {
            lines.push(format!("{LINE_COLOR}  details: {}{RESET_COLOR}\n", error.details));
        }
        EventRender {
            context: Some(kind.to_string()),
            lines,
        }
    }

    fn render_status_rows(&self, rows: &[serde_json::Value]) -> Vec<EventRender> {
        rows.iter()
            .map(|row| {
                let name = row.get("Name").and_then(|v| v.as_str()).unwrap_or("?");
                let state = row.get("State").and_then(|v| v.as_str()).unwrap_or("?");
                let line = format!("{CONTEXT_COLOR}{name}{RESET_COLOR}: {LINE_COLOR}{state}{RESET_COLOR}\n");
                EventRender {
                    context: Some(name.to_string()),
                    lines: vec![line],
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WorkerErrorKind;

    #[test]
    fn render_worker_error_includes_cause_chain() {
        let err = WorkerError {
            kind: WorkerErrorKind::Failure,
            message: "outer".to_string(),
            cause: Some(Box::new(WorkerError::tempfail("inner"))),
            details: serde_json::Value::Null,
        };
        let rendered = PlainFormatter.render_worker_error(&err).join_lines();
        assert!(rendered.contains("outer"));
        assert!(rendered.contains("inner"));
    }

    #[test]
    fn render_status_rows_one_event_per_row() {
        let rows = vec![serde_json::json!({"Name": "a", "State": "Succeeded"})];
        let rendered = PlainFormatter.render_status_rows(&rows);
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].join_lines().contains("Succeeded"));
    }
}
