//! Raw remote value to storage record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::contract::{KvValue, NamespaceContext, RawValue, StorageRecord, ValueType};
use crate::error::{classify, ClassifiedError, ErrorContext, RawFailure};
use crate::storage_keys::{
    partition_key, sort_key, MAX_PARTITION_KEY_BYTES, MAX_SORT_KEY_BYTES,
};

pub const RECORD_SOURCE: &str = "remote_kv";
pub const DATA_VERSION: &str = "1.0";
pub const MAX_ITEM_BYTES: usize = 400 * 1024;

const COMPONENT: &str = "record_transformer";

/// Builds the storage record for a fetched value.
///
/// Text values that parse as a JSON object or array are typed `json`;
/// anything else is a plain string. Values the remote served as JSON must
/// parse, otherwise the input is rejected as malformed.
pub fn transform(
    raw: RawValue,
    namespace: &NamespaceContext,
    now: DateTime<Utc>,
) -> Result<StorageRecord, ClassifiedError> {
    let context = ErrorContext::new(COMPONENT, "transform_record");
    let (value, value_type) = match raw.value {
        KvValue::Text(text) => {
            let value_type = if is_structured(&text) {
                ValueType::Json
            } else {
                ValueType::String
            };
            (text, value_type)
        }
        KvValue::Document(document) => {
            if let Err(error) = serde_json::from_str::<Value>(&document) {
                return Err(classify(
                    RawFailure::MalformedValue(format!(
                        "value for key {} is not valid JSON: {error}",
                        raw.key
                    )),
                    &context,
                ));
            }
            (document, ValueType::Json)
        }
    };

    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let record = StorageRecord {
        partition_key: partition_key(&namespace.namespace_id),
        sort_key: sort_key(&raw.key),
        key: raw.key,
        value,
        value_type,
        namespace_id: namespace.namespace_id.clone(),
        namespace_name: namespace.namespace_name.clone(),
        metadata: raw.metadata,
        expiration: raw.expiration,
        created_at: timestamp.clone(),
        updated_at: timestamp,
        ttl: raw.expiration,
        source: RECORD_SOURCE.to_string(),
        data_version: DATA_VERSION.to_string(),
    };

    validate_record(&record)
        .map_err(|failure| classify(failure, &ErrorContext::new(COMPONENT, "validate_record")))?;
    Ok(record)
}

fn is_structured(text: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(text),
        Ok(Value::Object(_) | Value::Array(_))
    )
}

/// Checks the store's key and item size limits.
pub fn validate_record(record: &StorageRecord) -> Result<(), RawFailure> {
    if record.key.is_empty() {
        return Err(RawFailure::InvalidRecord("key cannot be empty".to_string()));
    }
    if record.namespace_id.is_empty() {
        return Err(RawFailure::InvalidRecord(
            "namespace_id cannot be empty".to_string(),
        ));
    }
    if record.partition_key.len() > MAX_PARTITION_KEY_BYTES {
        return Err(RawFailure::InvalidRecord(format!(
            "partition key is {} bytes, limit is {MAX_PARTITION_KEY_BYTES}",
            record.partition_key.len()
        )));
    }
    if record.sort_key.len() > MAX_SORT_KEY_BYTES {
        return Err(RawFailure::InvalidRecord(format!(
            "sort key is {} bytes, limit is {MAX_SORT_KEY_BYTES}",
            record.sort_key.len()
        )));
    }
    let size = estimate_item_size(record);
    if size > MAX_ITEM_BYTES {
        return Err(RawFailure::InvalidRecord(format!(
            "item is about {size} bytes, limit is {MAX_ITEM_BYTES}"
        )));
    }
    Ok(())
}

/// Approximate stored size: attribute names plus encoded values, numbers
/// counted as 8 bytes.
pub fn estimate_item_size(record: &StorageRecord) -> usize {
    let mut size = "pk".len() + record.partition_key.len() + "sk".len() + record.sort_key.len();
    size += map_size(&record.to_attributes());
    size
}

fn map_size(map: &Map<String, Value>) -> usize {
    map.iter().map(|(name, value)| name.len() + value_size(value)).sum()
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(text) => text.len(),
        Value::Array(items) => 3 + items.iter().map(value_size).sum::<usize>(),
        Value::Object(map) => 3 + map_size(map),
    }
}
