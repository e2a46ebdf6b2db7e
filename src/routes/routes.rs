//! Defines routes for the chunk transfer protocol.
//!
//! ## Structure
//! - **Transfer endpoints** (bearer-token protected)
//!   - `POST /v1/chunks`          — upload one chunk envelope
//!   - `POST /v1/chunks/complete` — request the merge
//!   - `GET  /v1/tasks/status`    — poll a background merge (`?taskId=`)
//!   - `GET  /v1/files/{*path}`   — download a stored object
//!
//! - **Health endpoints** (open)
//!   - `GET /healthz` — liveness
//!   - `GET /readyz`  — readiness (DB + storage probes)
//!
//! The wildcard `*path` allows nested keys like `pkg/2025/app.apk`.

use crate::{
    auth::require_bearer,
    handlers::{
        health_handlers::{healthz, readyz},
        transfer_handlers::{complete_upload, download_file, task_status, upload_chunk},
    },
    services::RelayService,
};
use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Build the full router over shared `RelayService` state. Every
/// transfer route passes the bearer-token middleware before its handler
/// runs; health probes stay open.
pub fn routes(service: RelayService) -> Router {
    let transfer = Router::new()
        .route("/v1/chunks", post(upload_chunk))
        .route("/v1/chunks/complete", post(complete_upload))
        .route("/v1/tasks/status", get(task_status))
        .route("/v1/files/{*path}", get(download_file))
        .layer(middleware::from_fn_with_state(
            service.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(transfer)
        .with_state(service)
}
