mod support;

use std::time::Duration;

use chrono::Utc;
use kv_sync_core::budget::TimeoutBudget;
use kv_sync_core::contract::{KvValue, RawValue, SyncStatus, ValueType};
use kv_sync_core::error::{ErrorKind, RawFailure, Severity};
use kv_sync_core::transform::transform;
use kv_sync_lambda::handlers::invocation::handle_event;
use serde_json::{json, Map, Value};
use support::{json_body, text, FlakyStore, Harness, ScriptedSecretSource, ScriptedTransport};

const PLATFORM_REMAINING: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn stores_existing_key_in_one_pass() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-a",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    let stats = result.statistics();
    assert_eq!(stats.api_calls, 1);
    assert_eq!(stats.storage_writes, 1);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.retries, 0);
    assert_eq!(result.request_id(), "req-a");

    let data = result.data().expect("success carries data");
    assert_eq!(data.status, SyncStatus::Stored);
    assert_eq!(data.value_type, Some(ValueType::String));
    assert_eq!(data.partition_key.as_deref(), Some("NAMESPACE#ns-1"));
    assert_eq!(data.sort_key.as_deref(), Some("KEY#feature-x"));

    let item = harness
        .store
        .inner
        .get("NAMESPACE#ns-1", "KEY#feature-x")
        .expect("item should be stored");
    assert_eq!(item["value"], "enabled");
    assert_eq!(item["value_type"], "string");
    assert_eq!(item["source"], "remote_kv");
}

#[tokio::test(start_paused = true)]
async fn missing_key_is_reported_as_absent() {
    let body = json!({"success": false, "errors": [{"code": 10009, "message": "key not found"}]});
    let harness = Harness::new(
        ScriptedTransport::new(vec![json_body(404, &body.to_string())]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "missing-key"}),
        "req-b",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    assert!(result.error().is_none());
    let data = result.data().expect("absent outcome carries data");
    assert_eq!(data.status, SyncStatus::KeyAbsent);
    assert_eq!(data.key_name, "missing-key");
    assert_eq!(result.statistics().api_calls, 1);
    assert_eq!(result.statistics().storage_writes, 0);
    assert_eq!(harness.store.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limits_are_retried_with_growing_delays() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![
            text(429, "slow down"),
            text(429, "slow down"),
            text(200, "enabled"),
        ]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-c",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    assert_eq!(result.statistics().api_calls, 3);
    assert_eq!(result.statistics().retries, 2);

    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].at - calls[0].at;
    let second_gap = calls[2].at - calls[1].at;
    assert!(first_gap >= Duration::from_millis(90) && first_gap <= Duration::from_millis(110));
    assert!(second_gap >= Duration::from_millis(180) && second_gap <= Duration::from_millis(220));
    assert!(second_gap > first_gap);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_sets_the_delay() {
    let mut limited = text(429, "slow down");
    limited.retry_after = Some(Duration::from_secs(1));
    let harness = Harness::new(
        ScriptedTransport::new(vec![limited, text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(json!({}), "req-c2", PLATFORM_REMAINING, &harness.resources).await;

    assert!(result.success());
    let calls = harness.transport.calls();
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
    assert_eq!(calls[0].key, "redirect-all-users-to-essentials");
}

#[tokio::test(start_paused = true)]
async fn persistent_server_errors_exhaust_attempts() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(500, "internal")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-d",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::ApiError);
    assert!(error.is_retryable);
    assert_eq!(error.http_status_code, 502);
    assert_eq!(error.retry_after_seconds, Some(2));
    assert_eq!(result.http_status_code(), Some(502));
    assert_eq!(result.statistics().api_calls, 3);
    assert_eq!(result.statistics().storage_writes, 0);
    assert_eq!(result.statistics().success_rate, 0.0);
    assert_eq!(harness.transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_refreshes_credentials_exactly_once() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(401, "unauthorized")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-auth",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::AuthError);
    assert!(!error.is_retryable);
    assert_eq!(error.http_status_code, 401);
    assert_eq!(error.retry_after_seconds, None);

    let credentials = harness.resources.credentials();
    assert_eq!(credentials.invalidation_count(), 1);
    assert_eq!(credentials.refresh_count(), 2);
    assert_eq!(harness.secrets.calls(), 2);

    let tokens: Vec<String> = harness
        .transport
        .calls()
        .into_iter()
        .map(|call| call.token)
        .collect();
    assert_eq!(tokens, vec!["token-0".to_string(), "token-1".to_string()]);
    assert_eq!(result.statistics().api_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn refreshed_credentials_can_recover_the_read() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(403, "forbidden"), text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-auth2",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    let data = result.data().expect("data");
    assert!(data.credentials_refreshed);
    assert_eq!(result.statistics().api_calls, 2);
    assert_eq!(harness.store.inner.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn insufficient_budget_times_out_without_calls() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    // 40ms left is below the 50ms estimated cost of a single call.
    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-budget",
        Duration::from_millis(40),
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.http_status_code, 504);
    assert_eq!(harness.transport.call_count(), 0);
    assert_eq!(harness.secrets.calls(), 0);
    assert_eq!(result.statistics().api_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_deadline() {
    let harness = Harness::new(
        ScriptedTransport::with_latency(vec![text(500, "internal")], Duration::from_millis(100)),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x", "max_duration_ms": 300}),
        "req-deadline",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("last error"));
    assert!(result.statistics().api_calls < 3);
    assert!(result.statistics().elapsed_ms <= 300);
    for call in harness.transport.calls() {
        assert!(call.timeout <= Duration::from_millis(300));
    }
}

#[tokio::test(start_paused = true)]
async fn store_throttling_is_retried() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::new(vec![
            RawFailure::StoreThrottled("ProvisionedThroughputExceededException".to_string()),
            RawFailure::StoreUnavailable("ServiceUnavailable".to_string()),
        ]),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-store",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    assert_eq!(result.statistics().storage_writes, 3);
    assert_eq!(result.statistics().retries, 2);
    assert_eq!(harness.store.inner.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_store_writes_are_cut_off_inside_the_budget() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::with_latency(Vec::new(), Duration::from_secs(300)),
    );
    let started = tokio::time::Instant::now();

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-hung-store",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::StorageError);
    assert_eq!(result.statistics().storage_writes, 3);
    // Three puts capped at the 5s call timeout, well inside the 28.5s budget.
    assert!(started.elapsed() < Duration::from_secs(16));
    assert!(harness.store.inner.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_store_write_never_passes_the_deadline() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::with_latency(Vec::new(), Duration::from_secs(300)),
    );
    let started = tokio::time::Instant::now();

    let result = handle_event(
        json!({"key_name": "feature-x", "max_duration_ms": 3000}),
        "req-hung-deadline",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(result.statistics().storage_writes, 1);
}

#[tokio::test(start_paused = true)]
async fn store_rejection_fails_without_retry() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::new(vec![RawFailure::StoreRejected("ValidationException".to_string())]),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-reject",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(!result.success());
    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::StorageError);
    assert!(!error.is_retryable);
    assert_eq!(error.http_status_code, 500);
    assert_eq!(result.statistics().api_calls, 1);
    assert_eq!(result.statistics().storage_writes, 1);
    assert_eq!(result.statistics().success_rate, 0.5);
}

#[tokio::test(start_paused = true)]
async fn malformed_json_value_is_a_transform_error() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![json_body(200, "{not json")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "feature-x"}),
        "req-malformed",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::TransformError);
    assert_eq!(error.http_status_code, 422);
    assert_eq!(harness.store.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn json_values_round_trip_through_the_store() {
    let document = json!({"rollout": 0.25, "regions": ["eu", "us"]});
    let harness = Harness::new(
        ScriptedTransport::new(vec![json_body(200, &document.to_string())]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({"key_name": "rollout"}),
        "req-json",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    assert!(result.success());
    assert_eq!(result.data().and_then(|data| data.value_type), Some(ValueType::Json));
    let item = harness
        .store
        .inner
        .get("NAMESPACE#ns-1", "KEY#rollout")
        .expect("item should be stored");
    let stored: Value = serde_json::from_str(item["value"].as_str().expect("string value"))
        .expect("stored value should parse");
    assert_eq!(stored, document);
}

#[tokio::test(start_paused = true)]
async fn malformed_events_are_rejected_before_any_call() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    for event in [json!("feature-x"), json!({"key_name": 7}), json!({"body": "{oops"})] {
        let result = handle_event(event, "req-bad", PLATFORM_REMAINING, &harness.resources).await;
        let error = result.error().expect("failure carries error");
        assert_eq!(error.kind, ErrorKind::TransformError);
        assert_eq!(error.severity, Severity::Error);
        assert_eq!(result.statistics().api_calls, 0);
    }
    assert_eq!(harness.secrets.calls(), 0);
    assert_eq!(harness.transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn credential_outage_is_critical() {
    let harness = Harness::with_secrets(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::reliable(),
        ScriptedSecretSource::failing(),
    );

    let result = handle_event(
        json!({}),
        "req-secret",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;

    let error = result.error().expect("failure carries error");
    assert_eq!(error.kind, ErrorKind::CredentialUnavailable);
    assert_eq!(error.severity, Severity::Critical);
    assert_eq!(error.http_status_code, 500);
    assert_eq!(harness.transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_invocation_reuses_warm_credentials() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(200, "enabled")]),
        FlakyStore::reliable(),
    );

    let first = handle_event(json!({}), "req-1", PLATFORM_REMAINING, &harness.resources).await;
    let second = handle_event(json!({}), "req-2", PLATFORM_REMAINING, &harness.resources).await;

    assert!(!first.data().expect("data").warm_start);
    assert!(second.data().expect("data").warm_start);
    assert_eq!(harness.secrets.calls(), 1);
    assert_eq!(harness.resources.invocation_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn writing_a_record_twice_keeps_one_item() {
    let harness = Harness::new(ScriptedTransport::new(Vec::new()), FlakyStore::reliable());
    let record = transform(
        RawValue {
            key: "feature-x".to_string(),
            value: KvValue::Text("enabled".to_string()),
            metadata: Map::new(),
            expiration: Some(1_900_000_000),
        },
        &kv_sync_core::contract::NamespaceContext {
            namespace_id: "ns-1".to_string(),
            namespace_name: "flags".to_string(),
        },
        Utc::now(),
    )
    .expect("record");
    let budget = TimeoutBudget::new(PLATFORM_REMAINING, 5);
    let writer = harness.resources.storage_writer();

    writer.write(&record, &budget).await.result.expect("first write");
    let once = harness.store.inner.get(&record.partition_key, &record.sort_key);
    writer.write(&record, &budget).await.result.expect("second write");
    let twice = harness.store.inner.get(&record.partition_key, &record.sort_key);

    assert_eq!(harness.store.inner.len(), 1);
    assert_eq!(once, twice);
    assert_eq!(twice.expect("item")["ttl"], 1_900_000_000);
}

#[tokio::test(start_paused = true)]
async fn failure_results_serialize_with_public_shape() {
    let harness = Harness::new(
        ScriptedTransport::new(vec![text(500, "internal")]),
        FlakyStore::reliable(),
    );

    let result = handle_event(
        json!({}),
        "req-json-shape",
        PLATFORM_REMAINING,
        &harness.resources,
    )
    .await;
    let rendered = serde_json::to_value(&result).expect("result should serialize");

    assert_eq!(rendered["success"], false);
    assert_eq!(rendered["error"]["kind"], "API_ERROR");
    assert_eq!(rendered["statistics"]["api_calls"], 3);
    assert_eq!(rendered["request_id"], "req-json-shape");
    assert!(rendered["timestamp"].is_string());
}
