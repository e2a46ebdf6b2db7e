//! Bearer-token verification.
//!
//! Token policy (issuance, rotation, expiry) lives outside this crate.
//! Handlers never read a global key list; the verifier is an injected
//! capability carried in the router state, so the transfer handlers are
//! testable in isolation with a permissive or denying stand-in.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::{errors::ApiError, services::RelayService};

/// Approves or rejects the credential presented with an RPC call.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

/// Verifier backed by a fixed token list from configuration.
pub struct StaticTokenVerifier {
    tokens: Vec<String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

/// Axum middleware: every transfer route requires `Authorization: Bearer`.
/// Failures short-circuit with the `{code: 401, message}` envelope before
/// any handler runs.
pub async fn require_bearer(
    State(service): State<RelayService>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if token.is_empty() {
        return Err(ApiError::unauthorized("missing bearer token"));
    }
    if !service.verifier.verify(token).await {
        return Err(ApiError::unauthorized("invalid bearer token"));
    }

    Ok(next.run(req).await)
}
