//! Invocation orchestrator.
//!
//! Runs `Start -> CredentialsReady -> Fetched -> Transformed -> Stored -> Done`,
//! with `Failed` reachable from every step. The budget is consulted before
//! each step starts, and every outcome, including failures, is returned as a
//! complete [`InvocationResult`].

use std::time::Duration;

use chrono::Utc;
use kv_sync_core::budget::TimeoutBudget;
use kv_sync_core::contract::{
    normalize_event, InvocationRequest, InvocationResult, StatisticsTally, SyncStatus, SyncSummary,
};
use kv_sync_core::error::{classify, ClassifiedError, ErrorContext, RawFailure};
use kv_sync_core::transform::transform;
use serde_json::Value;

use crate::fetch::FetchOutcome;
use crate::warm::WarmResources;

const COMPONENT: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Start,
    CredentialsReady,
    Fetched,
    Transformed,
    Stored,
    Done,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CredentialsReady => "credentials_ready",
            Self::Fetched => "fetched",
            Self::Transformed => "transformed",
            Self::Stored => "stored",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Per-invocation inputs that do not come from the event itself.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub request_id: &'a str,
    pub budget: TimeoutBudget,
    pub warm_start: bool,
}

/// Entry point for a raw event. Never fails: malformed events produce a
/// failure result without starting the lifecycle.
pub async fn handle_event(
    event: Value,
    request_id: &str,
    platform_remaining: Duration,
    resources: &WarmResources,
) -> InvocationResult {
    let warm_start = resources.begin_invocation();
    let budget = TimeoutBudget::new(platform_remaining, resources.config().safety_margin_percent);

    let request = match normalize_event(event, &resources.config().default_key_name) {
        Ok(value) => value,
        Err(error) => {
            let error = classify(
                RawFailure::from(error),
                &ErrorContext::new(COMPONENT, "normalize_event"),
            );
            error.log(COMPONENT);
            return InvocationResult::failed(
                &error,
                StatisticsTally::default().finish(budget.elapsed()),
                request_id,
                now_timestamp(),
            );
        }
    };

    let context = InvocationContext {
        request_id,
        budget,
        warm_start,
    };
    handle_invocation(&request, context, resources).await
}

pub async fn handle_invocation(
    request: &InvocationRequest,
    context: InvocationContext<'_>,
    resources: &WarmResources,
) -> InvocationResult {
    let budget = context.budget.with_override(request.max_duration);
    tracing::info!(
        component = COMPONENT,
        event = "invocation_started",
        request_id = context.request_id,
        key = %request.key_name,
        warm_start = context.warm_start,
        budget_ms = duration_ms(budget.total()),
    );

    let mut lifecycle = Lifecycle {
        resources,
        budget,
        state: LifecycleState::Start,
        tally: StatisticsTally::default(),
        credentials_refreshed: false,
    };

    match lifecycle.run(request, context.warm_start).await {
        Ok(summary) => {
            let statistics = lifecycle.tally.finish(budget.elapsed());
            tracing::info!(
                component = COMPONENT,
                event = "invocation_completed",
                request_id = context.request_id,
                status = ?summary.status,
                elapsed_ms = statistics.elapsed_ms,
                api_calls = statistics.api_calls,
                storage_writes = statistics.storage_writes,
                retries = statistics.retries,
            );
            InvocationResult::succeeded(summary, statistics, context.request_id, now_timestamp())
        }
        Err(error) => {
            let failed_in = lifecycle.state;
            lifecycle.state = LifecycleState::Failed;
            error.log(COMPONENT);
            let statistics = lifecycle.tally.finish(budget.elapsed());
            tracing::info!(
                component = COMPONENT,
                event = "invocation_failed",
                request_id = context.request_id,
                last_state = failed_in.as_str(),
                kind = error.kind().as_str(),
                elapsed_ms = statistics.elapsed_ms,
                api_calls = statistics.api_calls,
                storage_writes = statistics.storage_writes,
            );
            InvocationResult::failed(&error, statistics, context.request_id, now_timestamp())
        }
    }
}

struct Lifecycle<'a> {
    resources: &'a WarmResources,
    budget: TimeoutBudget,
    state: LifecycleState,
    tally: StatisticsTally,
    credentials_refreshed: bool,
}

impl Lifecycle<'_> {
    async fn run(
        &mut self,
        request: &InvocationRequest,
        warm_start: bool,
    ) -> Result<SyncSummary, ClassifiedError> {
        let call_cost = self.resources.config().estimated_call_cost;
        let credentials = self.resources.credentials();

        self.check_budget("load_credentials", call_cost)?;
        let lease = credentials.get(&self.budget).await?;
        self.advance(LifecycleState::CredentialsReady);

        self.check_budget("fetch_value", call_cost)?;
        let fetched = self
            .resources
            .fetch_client()
            .fetch(&request.key_name, &lease, credentials, &self.budget)
            .await;
        self.tally.api_calls += fetched.api_calls();
        self.tally.retries += fetched.retries();
        self.tally.record_operation(fetched.result.is_ok());
        self.credentials_refreshed |= fetched.credentials_refreshed();
        // The namespace comes from whichever credentials served the read.
        let namespace = fetched
            .refreshed
            .as_ref()
            .unwrap_or(&lease)
            .credentials
            .namespace();

        let raw = match fetched.result? {
            FetchOutcome::Found(raw) => raw,
            FetchOutcome::Absent => {
                self.advance(LifecycleState::Done);
                return Ok(SyncSummary {
                    status: SyncStatus::KeyAbsent,
                    message: format!("key {} does not exist; nothing stored", request.key_name),
                    key_name: request.key_name.clone(),
                    partition_key: None,
                    sort_key: None,
                    value_type: None,
                    warm_start,
                    credentials_refreshed: self.credentials_refreshed,
                });
            }
        };
        self.advance(LifecycleState::Fetched);

        self.check_budget("transform_record", Duration::ZERO)?;
        let record = transform(raw, &namespace, Utc::now())?;
        self.advance(LifecycleState::Transformed);

        self.check_budget("store_record", call_cost)?;
        let written = self.resources.storage_writer().write(&record, &self.budget).await;
        self.tally.storage_writes += written.attempt_count();
        self.tally.retries += written.retries();
        self.tally.record_operation(written.result.is_ok());
        written.result?;
        self.advance(LifecycleState::Stored);

        self.advance(LifecycleState::Done);
        Ok(SyncSummary {
            status: SyncStatus::Stored,
            message: format!("stored key {} as {}", record.key, record.value_type.as_str()),
            key_name: request.key_name.clone(),
            partition_key: Some(record.partition_key),
            sort_key: Some(record.sort_key),
            value_type: Some(record.value_type),
            warm_start,
            credentials_refreshed: self.credentials_refreshed,
        })
    }

    /// Confirms the next step fits in the budget and announces it.
    fn check_budget(&self, step: &str, estimated_cost: Duration) -> Result<(), ClassifiedError> {
        if self.budget.within_budget(estimated_cost) {
            tracing::info!(
                component = COMPONENT,
                event = "step_started",
                step,
                state = self.state.as_str(),
                remaining_ms = duration_ms(self.budget.remaining()),
            );
            return Ok(());
        }
        Err(classify(
            RawFailure::BudgetExhausted {
                operation: step.to_string(),
                remaining_ms: duration_ms(self.budget.remaining()),
                last_error: None,
            },
            &ErrorContext::new(COMPONENT, step),
        ))
    }

    fn advance(&mut self, next: LifecycleState) {
        tracing::info!(
            component = COMPONENT,
            event = "step_completed",
            from = self.state.as_str(),
            to = next.as_str(),
            remaining_ms = duration_ms(self.budget.remaining()),
        );
        self.state = next;
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
