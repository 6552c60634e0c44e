use std::sync::Arc;
use std::time::Duration;

use kv_sync_core::budget::TimeoutBudget;
use kv_sync_core::contract::StorageRecord;
use kv_sync_core::error::{classify, ErrorContext, RawFailure};
use kv_sync_core::retry::{retry_with_budget, RetryPolicy, RetryReport};

use crate::adapters::durable_store::DurableStore;

const COMPONENT: &str = "storage_writer";
const OPERATION: &str = "store_record";

/// Persists storage records with the shared retry policy.
///
/// Writes are full overwrites keyed by (partition key, sort key), so a retry
/// after an ambiguous failure cannot duplicate data. Each put is cut off at
/// the call timeout or the budget's remaining time, whichever is shorter.
pub struct StorageWriter {
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn DurableStore>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            call_timeout,
        }
    }

    pub async fn write(&self, record: &StorageRecord, budget: &TimeoutBudget) -> RetryReport<()> {
        let attributes = record.to_attributes();
        let context = ErrorContext::new(COMPONENT, OPERATION);
        let report = retry_with_budget(
            OPERATION,
            &self.policy,
            budget,
            |attempt| {
                let attributes = &attributes;
                async move {
                    let limit = budget.clamp(self.call_timeout);
                    tracing::debug!(
                        component = COMPONENT,
                        event = "attempt_started",
                        partition_key = %record.partition_key,
                        sort_key = %record.sort_key,
                        attempt,
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    );
                    let put = self
                        .store
                        .put_item(&record.partition_key, &record.sort_key, attributes);
                    match tokio::time::timeout(limit, put).await {
                        Ok(stored) => stored,
                        Err(_) => Err(RawFailure::StoreUnavailable(format!(
                            "put_item for {} did not finish within {}ms",
                            record.sort_key,
                            limit.as_millis()
                        ))),
                    }
                }
            },
            |failure| {
                let error = classify(failure, &context);
                tracing::info!(
                    component = COMPONENT,
                    event = "attempt_failed",
                    sort_key = %record.sort_key,
                    kind = error.kind().as_str(),
                    retryable = error.is_retryable(),
                );
                error
            },
        )
        .await;

        if report.result.is_ok() {
            tracing::info!(
                component = COMPONENT,
                event = "record_stored",
                partition_key = %record.partition_key,
                sort_key = %record.sort_key,
                attempts = report.attempt_count(),
            );
        }
        report
    }
}
