//! The wire envelope the HTTP collaborator maps onto REST routes:
//! `{status: "ok", result, time_ms}` or
//! `{status: "error", error: {code, message}}`.

use ov_core::error::{OvError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Instant;

/// Success envelope.
pub fn ok(result: Value, time_ms: u64) -> Value {
    json!({ "status": "ok", "result": result, "time_ms": time_ms })
}

/// Error envelope with the stable taxonomy code.
pub fn error(err: &OvError) -> Value {
    json!({
        "status": "error",
        "error": { "code": err.code(), "message": err.to_string() },
    })
}

/// Time an operation and wrap its outcome in the envelope.
pub async fn enveloped<T, Fut>(op: Fut) -> Value
where
    T: Serialize,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    match op.await {
        Ok(result) => match serde_json::to_value(result) {
            Ok(value) => ok(value, started.elapsed().as_millis() as u64),
            Err(e) => error(&OvError::from(e)),
        },
        Err(e) => error(&e),
    }
}
