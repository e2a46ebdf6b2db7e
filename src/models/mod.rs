//! Core data models for the chunk transfer pipeline.
//!
//! Session, chunk, and merge-task records map to SQLite tables via
//! `sqlx::FromRow`; the wire types mirror the compact JSON envelopes
//! exchanged with clients.

pub mod artifact;
pub mod chunk;
pub mod session;
pub mod task;
pub mod wire;
