//! HTTP handlers for the transfer protocol and health probes.

pub mod health_handlers;
pub mod transfer_handlers;

use axum::Json;
use serde::Serialize;
use serde_json::{Value, json};

/// Wrap handler data in the protocol's success envelope.
pub(crate) fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "code": 0, "data": data }))
}
