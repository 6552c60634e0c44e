use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use kv_sync_core::error::RawFailure;
use serde_json::Value;

use crate::adapters::durable_store::{DurableStore, ItemAttributes};

pub const PARTITION_KEY_ATTRIBUTE: &str = "pk";
pub const SORT_KEY_ATTRIBUTE: &str = "sk";

const THROTTLING_CODES: [&str; 3] = [
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];
const UNAVAILABLE_CODES: [&str; 2] = ["InternalServerError", "ServiceUnavailable"];

pub struct DynamoDbStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoDbStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl DurableStore for DynamoDbStore {
    async fn put_item(
        &self,
        partition_key: &str,
        sort_key: &str,
        attributes: &ItemAttributes,
    ) -> Result<(), RawFailure> {
        let mut item: HashMap<String, AttributeValue> = attributes
            .iter()
            .map(|(name, value)| (name.clone(), to_attribute_value(value)))
            .collect();
        item.insert(
            PARTITION_KEY_ATTRIBUTE.to_string(),
            AttributeValue::S(partition_key.to_string()),
        );
        item.insert(
            SORT_KEY_ATTRIBUTE.to_string(),
            AttributeValue::S(sort_key.to_string()),
        );

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| store_failure(&self.table_name, error))
    }
}

pub fn to_attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(flag) => AttributeValue::Bool(*flag),
        Value::Number(number) => AttributeValue::N(number.to_string()),
        Value::String(text) => AttributeValue::S(text.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute_value).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(name, value)| (name.clone(), to_attribute_value(value)))
                .collect(),
        ),
    }
}

fn store_failure<E, R>(table_name: &str, error: SdkError<E, R>) -> RawFailure
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    tracing::debug!(
        component = "storage_writer",
        event = "put_item_sdk_error",
        table_name,
        error = %DisplayErrorContext(&error),
    );
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RawFailure::StoreUnavailable(format!("put_item on table {table_name} failed: {error}"))
        }
        _ => failure_for_code(
            error.code(),
            service_error_message(table_name, error.code(), error.message()),
        ),
    }
}

/// Caller-facing description of a service error: code and message only.
pub fn service_error_message(
    table_name: &str,
    code: Option<&str>,
    message: Option<&str>,
) -> String {
    let code = code.unwrap_or("UnknownError");
    match message {
        Some(message) => format!("put_item on table {table_name} failed: {code}: {message}"),
        None => format!("put_item on table {table_name} failed: {code}"),
    }
}

/// Maps a service error code to a store failure.
pub fn failure_for_code(code: Option<&str>, message: String) -> RawFailure {
    match code {
        Some(code) if THROTTLING_CODES.contains(&code) => RawFailure::StoreThrottled(message),
        Some(code) if UNAVAILABLE_CODES.contains(&code) => RawFailure::StoreUnavailable(message),
        _ => RawFailure::StoreRejected(message),
    }
}
