//! Server-side services: chunk receiver, merge orchestrator, task store,
//! and the object-storage seam they share.

pub mod chunk_service;
pub mod merge_service;
pub mod store;
pub mod task_store;

use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenVerifier;
use store::ObjectStore;

/// Shared state for all transfer handlers.
///
/// Owns the metadata pool, the object store, the injected token
/// verifier, and the orchestration knobs. Cheap to clone; background
/// merges clone it into their tasks.
#[derive(Clone)]
pub struct RelayService {
    /// SQLite pool for sessions, chunks, and merge tasks.
    pub db: Arc<SqlitePool>,

    /// Object storage collaborator.
    pub store: Arc<dyn ObjectStore>,

    /// Bearer-token verifier consulted before any handler runs.
    pub verifier: Arc<dyn TokenVerifier>,

    /// Combined chunk size under which merges run inline.
    pub sync_merge_threshold: u64,

    /// When set, completion returns chunk URLs instead of merging.
    pub defer_merge: bool,

    /// Cooperative cancellation signals for in-flight background merges,
    /// keyed by task id.
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RelayService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<dyn ObjectStore>,
        verifier: Arc<dyn TokenVerifier>,
        sync_merge_threshold: u64,
        defer_merge: bool,
    ) -> Self {
        Self {
            db,
            store,
            verifier,
            sync_merge_threshold,
            defer_merge,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn register_cancellation(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub(crate) fn deregister_cancellation(&self, task_id: &str) {
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    /// Signal an in-flight background merge to stop. Returns false if no
    /// merge is running under `task_id`.
    pub fn cancel_merge(&self, task_id: &str) -> bool {
        let guard = self
            .cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match guard.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
