use std::sync::Arc;

use chrono::Utc;
use kv_sync_core::budget::platform_remaining;
use kv_sync_core::contract::InvocationResult;
use kv_sync_lambda::config::SyncConfig;
use kv_sync_lambda::handlers::invocation::handle_event;
use kv_sync_lambda::telemetry::init_logging;
use kv_sync_lambda::warm::WarmResources;
use lambda_runtime::{service_fn, Error, LambdaEvent};

async fn handle_request(
    resources: &WarmResources,
    event: LambdaEvent<serde_json::Value>,
) -> Result<InvocationResult, Error> {
    let remaining = platform_remaining(event.context.deadline, Utc::now().timestamp_millis());
    Ok(handle_event(event.payload, &event.context.request_id, remaining, resources).await)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_logging();

    let config = SyncConfig::from_env()?;
    let resources = Arc::new(WarmResources::from_aws(config).await?);
    tracing::info!(component = "bootstrap", event = "resources_ready");

    lambda_runtime::run(service_fn(move |event: LambdaEvent<serde_json::Value>| {
        let resources = Arc::clone(&resources);
        async move { handle_request(&resources, event).await }
    }))
    .await
}
