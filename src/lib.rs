//! chunk-relay — chunked upload and asynchronous merge pipeline.
//!
//! Moves large binary artifacts through an RPC channel with strict
//! per-call payload ceilings into durable object storage. The server
//! side receives base64-encoded chunks, decides between a synchronous
//! and a background merge, and tracks merge tasks in SQLite; the client
//! side splits files, uploads with bounded concurrency and retry, polls
//! merge tasks, and can reproduce the artifact locally when the server
//! defers merging.

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
