//! Shared key-value sync domain primitives.
//!
//! This crate owns the deterministic parts of an invocation lifecycle: request
//! and result contracts, error classification, timeout budgeting, the
//! budget-aware retry loop, storage key layout, and record transformation. It
//! intentionally excludes AWS SDK, HTTP client, and Lambda runtime concerns,
//! which live in `kv_sync_lambda`.

pub mod budget;
pub mod contract;
pub mod error;
pub mod retry;
pub mod storage_keys;
pub mod transform;
