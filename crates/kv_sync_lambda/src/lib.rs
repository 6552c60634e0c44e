//! AWS-oriented adapters and the invocation handler for key-value sync.
//!
//! This crate owns runtime integration details (Lambda handler, secret and
//! store adapters, the HTTP transport) plus the process-wide warm resources
//! shared across invocations. Deterministic lifecycle primitives live in
//! `kv_sync_core`.

pub mod adapters;
pub mod config;
pub mod credentials;
pub mod fetch;
pub mod handlers;
pub mod storage;
pub mod telemetry;
pub mod warm;
