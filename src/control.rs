//! The Unix-domain control socket (§4.6).
//!
//! Framing: one percent-encoded, newline-terminated JSON document per
//! message, one request/response pair per connection. This task owns the
//! socket; it only decodes/encodes and forwards to the evaluator over the
//! in-process channel ([`crate::api::ApiHandler`] holds the other end) —
//! all step-matching and state mutation happens evaluator-side.

use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{instrument, warn};

use crate::api::{parse_states, parse_status_fields, ApiRequest, ApiResponse, Operation};
use crate::errors::{ApiError, ControlError};
use crate::tags::TagQuery;

/// Percent-encode anything outside unreserved characters plus a handful of
/// JSON punctuation marks that are otherwise painful to read in logs; the
/// wire format only requires that the byte stream survive a text line, not
/// that it be maximally compact.
const FRAME_ESCAPE: &AsciiSet = &CONTROLS.add(b'\n').add(b'\r').add(b'%');

pub struct ControlServer {
    listener: UnixListener,
    accept_timeout: Duration,
    to_evaluator: flume::Sender<(ApiRequest, flume::Sender<ApiResponse>)>,
}

impl ControlServer {
    pub fn bind(
        path: &str,
        accept_timeout: Duration,
        to_evaluator: flume::Sender<(ApiRequest, flume::Sender<ApiResponse>)>,
    ) -> Result<Self, ControlError> {
        let listener = UnixListener::bind(path).map_err(|source| ControlError::Bind {
            path: path.to_string(),
            source,
        })?;
        Ok(ControlServer {
            listener,
            accept_timeout,
            to_evaluator,
        })
    }

    /// Run forever, accepting one connection at a time with a timeout so a
    /// quiet socket never blocks the task indefinitely. Intended to be
    /// spawned as its own `tokio` task by the Manager.
    pub async fn run(self) {
        loop {
            if let Err(error) = self.accept_one().await {
                warn!(%error, "control connection failed");
            }
        }
    }

    /// Wait for at most `accept_timeout` for a connection, handle it fully,
    /// then return. A timeout with no connection is not an error (§5:
    /// "socket accept timeout — normal; tick proceeds with no API call").
    #[instrument(skip(self))]
    async fn accept_one(&self) -> Result<(), ControlError> {
        let accepted = tokio::time::timeout(self.accept_timeout, self.listener.accept()).await;
        let (stream, _addr) = match accepted {
            Err(_elapsed) => return Ok(()),
            Ok(result) => result?,
        };
        self.handle_connection(stream).await
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<(), ControlError> {
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        let response = self.process_line(line.trim_end()).await;
        let encoded = encode_frame(&response);
        write_half.write_all(encoded.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.shutdown().await?;
        Ok(())
    }

    async fn process_line(&self, line: &str) -> Value {
        match self.decode_and_dispatch(line).await {
            Ok((name, response)) => json!({ "name": name, "result": response.result, "error": response.error }),
            Err((name, error)) => json!({ "name": name, "result": Value::Null, "error": error.to_string() }),
        }
    }

    async fn decode_and_dispatch(&self, line: &str) -> Result<(String, ApiResponse), (Value, ApiError)> {
        let decoded = percent_decode_str(line).decode_utf8().map_err(|_| {
            (
                Value::Null,
                ApiError::MalformedField {
                    field: "frame",
                    expected: "percent-encoded utf-8",
                },
            )
        })?;
        let value: Value = serde_json::from_str(&decoded).map_err(|_| {
            (
                Value::Null,
                ApiError::MalformedField {
                    field: "frame",
                    expected: "json",
                },
            )
        })?;
        let name = value.get("name").cloned().unwrap_or(Value::Null);
        let request = decode_request(&value).map_err(|e| (name.clone(), e))?;

        let (reply_tx, reply_rx) = flume::bounded(1);
        if self.to_evaluator.send_async((request, reply_tx)).await.is_err() {
            return Err((
                name,
                ApiError::MalformedField {
                    field: "evaluator",
                    expected: "running",
                },
            ));
        }
        let response = reply_rx.recv_async().await.map_err(|_| {
            (
                name.clone(),
                ApiError::MalformedField {
                    field: "evaluator",
                    expected: "a response",
                },
            )
        })?;
        let name_str = name.as_str().unwrap_or_default().to_string();
        Ok((name_str, response))
    }
}

fn decode_request(value: &Value) -> Result<ApiRequest, ApiError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or(ApiError::MalformedField {
            field: "name",
            expected: "string",
        })?;
    let operation = Operation::parse(name)?;

    let tags = match value.get("tags") {
        Some(tags_value) if !tags_value.is_null() => TagQuery::from_json(tags_value).ok_or(ApiError::MalformedField {
            field: "tags",
            expected: "object",
        })?,
        _ => TagQuery::empty(),
    };

    let states = match value.get("states").and_then(Value::as_array) {
        Some(arr) => parse_states(arr)?,
        None => Vec::new(),
    };

    let status_fields = match value.get("status_fields").and_then(Value::as_array) {
        Some(arr) => parse_status_fields(arr)?,
        None => Vec::new(),
    };

    let step_count = value.get("step_count").and_then(Value::as_u64).unwrap_or(0);
    let message = value.get("message").cloned().unwrap_or(Value::Null);
    let dry_run = value.get("dry_run").and_then(Value::as_bool).unwrap_or(false);

    Ok(ApiRequest {
        operation,
        tags,
        states,
        status_fields,
        step_count,
        message,
        dry_run,
    })
}

fn encode_frame(value: &Value) -> String {
    let raw = value.to_string();
    utf8_percent_encode(&raw, FRAME_ESCAPE).to_string()
}
