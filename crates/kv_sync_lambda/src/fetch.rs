//! Remote fetch client: one authenticated read with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use kv_sync_core::budget::TimeoutBudget;
use kv_sync_core::contract::{Credentials, KvValue, RawValue};
use kv_sync_core::error::{classify, ClassifiedError, ErrorContext, ErrorKind, RawFailure};
use kv_sync_core::retry::{retry_with_budget, AttemptOutcome, RetryPolicy, RetryReport};
use serde_json::{Map, Value};

use crate::adapters::kv_api::{KvResponse, KvTransport};
use crate::credentials::{CredentialCache, CredentialLease};

const COMPONENT: &str = "fetch_client";
const OPERATION: &str = "fetch_value";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(RawValue),
    /// The key does not exist; an expected outcome, not a failure.
    Absent,
}

#[derive(Debug)]
pub struct FetchReport {
    pub result: Result<FetchOutcome, ClassifiedError>,
    pub attempts: Vec<AttemptOutcome>,
    /// Credentials loaded after an authentication failure, if any.
    pub refreshed: Option<CredentialLease>,
}

impl FetchReport {
    /// Requests actually sent to the remote API.
    pub fn api_calls(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    pub fn retries(&self) -> u32 {
        self.api_calls().saturating_sub(1)
    }

    pub fn credentials_refreshed(&self) -> bool {
        self.refreshed.is_some()
    }
}

pub struct RemoteFetchClient {
    transport: Arc<dyn KvTransport>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl RemoteFetchClient {
    pub fn new(
        transport: Arc<dyn KvTransport>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            request_timeout,
        }
    }

    /// Fetches `key`, retrying transient failures within the budget.
    ///
    /// An authentication failure invalidates the lease's credentials and is
    /// retried exactly once with freshly loaded ones.
    pub async fn fetch(
        &self,
        key: &str,
        lease: &CredentialLease,
        credentials: &CredentialCache,
        budget: &TimeoutBudget,
    ) -> FetchReport {
        let first = self.attempt_chain(key, &lease.credentials, &self.policy, budget).await;
        let mut attempts = first.attempts;
        let mut refreshed = None;

        let result = match first.result {
            Err(error) if error.kind() == ErrorKind::AuthError => {
                credentials.invalidate(lease.generation);
                tracing::warn!(
                    component = COMPONENT,
                    event = "auth_refresh_retry",
                    key,
                    generation = lease.generation,
                );
                if !budget.within_budget(self.policy.estimated_attempt_cost) {
                    Err(classify(
                        RawFailure::BudgetExhausted {
                            operation: "refresh_credentials".to_string(),
                            remaining_ms: duration_ms(budget.remaining()),
                            last_error: Some(error.to_string()),
                        },
                        &ErrorContext::new(COMPONENT, OPERATION),
                    ))
                } else {
                    match credentials.get(budget).await {
                        Ok(fresh) => {
                            let retry = self
                                .attempt_chain(
                                    key,
                                    &fresh.credentials,
                                    &self.policy.with_max_attempts(1),
                                    budget,
                                )
                                .await;
                            attempts.extend(retry.attempts);
                            refreshed = Some(fresh);
                            retry.result
                        }
                        Err(refresh_error) => Err(refresh_error),
                    }
                }
            }
            other => other,
        };

        let result = match result {
            Ok(raw) => Ok(FetchOutcome::Found(raw)),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::info!(component = COMPONENT, event = "key_absent", key);
                Ok(FetchOutcome::Absent)
            }
            Err(error) => Err(error),
        };

        FetchReport {
            result,
            attempts,
            refreshed,
        }
    }

    async fn attempt_chain(
        &self,
        key: &str,
        credentials: &Credentials,
        policy: &RetryPolicy,
        budget: &TimeoutBudget,
    ) -> RetryReport<RawValue> {
        let context = ErrorContext::new(COMPONENT, OPERATION);
        retry_with_budget(
            OPERATION,
            policy,
            budget,
            |attempt| async move {
                let timeout = budget.clamp(self.request_timeout);
                tracing::debug!(
                    component = COMPONENT,
                    event = "attempt_started",
                    key,
                    attempt,
                    timeout_ms = duration_ms(timeout),
                );
                self.transport
                    .get_value(credentials, key, timeout)
                    .await
                    .map_err(RawFailure::from)
                    .and_then(|response| interpret_response(key, response))
            },
            |failure| {
                let error = classify(failure, &context);
                tracing::info!(
                    component = COMPONENT,
                    event = "attempt_failed",
                    key,
                    kind = error.kind().as_str(),
                    retryable = error.is_retryable(),
                );
                error
            },
        )
        .await
    }
}

/// Turns an HTTP response into a raw value or an unclassified failure.
pub fn interpret_response(key: &str, response: KvResponse) -> Result<RawValue, RawFailure> {
    if !(200..300).contains(&response.status) {
        return Err(RawFailure::Http {
            status: response.status,
            message: error_message(&response.body),
            retry_after: response.retry_after,
        });
    }

    let is_json = response
        .content_type
        .as_deref()
        .map(|content_type| {
            let essence = content_type.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
        })
        .unwrap_or(false);

    let value = if is_json {
        match serde_json::from_str::<Value>(&response.body) {
            Ok(Value::Object(mut envelope)) if is_envelope(&envelope) => {
                if envelope.get("success").and_then(Value::as_bool) != Some(true) {
                    return Err(RawFailure::ApiEnvelope(envelope_error(&envelope)));
                }
                match envelope.remove("result") {
                    Some(Value::String(text)) => KvValue::Text(text),
                    Some(result) => KvValue::Document(result.to_string()),
                    None => KvValue::Text(String::new()),
                }
            }
            _ => KvValue::Document(response.body),
        }
    } else {
        KvValue::Text(response.body)
    };

    let mut metadata = Map::new();
    if let Some(content_type) = response.content_type {
        metadata.insert("content_type".to_string(), Value::String(content_type));
    }

    Ok(RawValue {
        key: key.to_string(),
        value,
        metadata,
        expiration: response.expiration,
    })
}

fn is_envelope(document: &Map<String, Value>) -> bool {
    document.get("success").is_some_and(Value::is_boolean)
        && (document.contains_key("errors") || document.contains_key("result"))
}

fn envelope_error(envelope: &Map<String, Value>) -> String {
    first_error_message(envelope).unwrap_or_else(|| "request reported success=false".to_string())
}

fn first_error_message(document: &Map<String, Value>) -> Option<String> {
    document
        .get("errors")?
        .as_array()?
        .first()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn error_message(body: &str) -> String {
    if let Ok(Value::Object(document)) = serde_json::from_str::<Value>(body) {
        if let Some(message) = first_error_message(&document) {
            return message;
        }
    }
    if body.trim().is_empty() {
        return "empty response body".to_string();
    }
    body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect()
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
