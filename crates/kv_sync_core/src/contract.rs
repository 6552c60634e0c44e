use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{ClassifiedError, ErrorKind, RawFailure, Severity};

pub const DEFAULT_KEY_NAME: &str = "redirect-all-users-to-essentials";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub key_name: String,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
struct InvocationEvent {
    #[serde(default)]
    key_name: Option<String>,
    #[serde(default)]
    max_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ValidationError> for RawFailure {
    fn from(error: ValidationError) -> Self {
        RawFailure::InvalidRequest(error.message)
    }
}

/// Normalises a raw invocation event.
///
/// Direct invocations carry the payload at the top level; API Gateway style
/// events carry it in `body`, either as an object or a JSON string.
pub fn normalize_event(
    event: Value,
    default_key: &str,
) -> Result<InvocationRequest, ValidationError> {
    let payload = match event {
        Value::Null => Value::Object(Map::new()),
        Value::Object(mut object) => match object.remove("body") {
            Some(Value::String(body)) => serde_json::from_str(&body)
                .map_err(|error| ValidationError::new(format!("body is not valid JSON: {error}")))?,
            Some(Value::Null) => Value::Object(Map::new()),
            Some(body) => body,
            None => Value::Object(object),
        },
        other => {
            return Err(ValidationError::new(format!(
                "event must be a JSON object, got {}",
                json_type_name(&other)
            )))
        }
    };

    if !payload.is_object() {
        return Err(ValidationError::new("event payload must be a JSON object"));
    }

    let event: InvocationEvent = serde_json::from_value(payload)
        .map_err(|error| ValidationError::new(format!("invalid event payload: {error}")))?;

    let key_name = event
        .key_name
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| default_key.to_string());

    if let Some(0) = event.max_duration_ms {
        return Err(ValidationError::new(
            "max_duration_ms must be a positive integer",
        ));
    }

    Ok(InvocationRequest {
        key_name,
        max_duration: event.max_duration_ms.map(Duration::from_millis),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_token: String,
    pub account_id: String,
    pub namespace_id: String,
    pub namespace_name: String,
}

impl Credentials {
    pub fn namespace(&self) -> NamespaceContext {
        NamespaceContext {
            namespace_id: self.namespace_id.clone(),
            namespace_name: self.namespace_name.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .field("namespace_name", &self.namespace_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceContext {
    pub namespace_id: String,
    pub namespace_name: String,
}

/// Parses a secret string into credentials.
///
/// Namespace fields are also accepted under the provider's names
/// (`kv_namespace_id`, `kv_namespace`).
pub fn parse_secret(secret_name: &str, secret_string: &str) -> Result<Credentials, RawFailure> {
    let document: Map<String, Value> = serde_json::from_str(secret_string).map_err(|error| {
        RawFailure::SecretUnavailable(format!("secret {secret_name} is not a JSON object: {error}"))
    })?;

    let field = |names: &[&str]| {
        names.iter().find_map(|name| {
            document
                .get(*name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    };

    let api_token = field(&["api_token"]);
    let account_id = field(&["account_id"]);
    let namespace_id = field(&["namespace_id", "kv_namespace_id"]);
    let namespace_name = field(&["namespace_name", "kv_namespace"]);

    match (api_token, account_id, namespace_id, namespace_name) {
        (Some(api_token), Some(account_id), Some(namespace_id), Some(namespace_name)) => {
            Ok(Credentials {
                api_token,
                account_id,
                namespace_id,
                namespace_name,
            })
        }
        (api_token, account_id, namespace_id, namespace_name) => {
            let missing: Vec<&str> = [
                ("api_token", api_token.is_none()),
                ("account_id", account_id.is_none()),
                ("namespace_id", namespace_id.is_none()),
                ("namespace_name", namespace_name.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            Err(RawFailure::SecretUnavailable(format!(
                "secret {secret_name} is missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Value as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    /// Body served with a non-JSON content type.
    Text(String),
    /// Body served as JSON, kept verbatim.
    Document(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawValue {
    pub key: String,
    pub value: KvValue,
    pub metadata: Map<String, Value>,
    /// Epoch seconds.
    pub expiration: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Json,
    String,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageRecord {
    pub partition_key: String,
    pub sort_key: String,
    pub key: String,
    pub value: String,
    pub value_type: ValueType,
    pub namespace_id: String,
    pub namespace_name: String,
    pub metadata: Map<String, Value>,
    pub expiration: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub ttl: Option<i64>,
    pub source: String,
    pub data_version: String,
}

impl StorageRecord {
    /// Non-key item attributes; absent optionals are omitted.
    pub fn to_attributes(&self) -> Map<String, Value> {
        let mut attributes = Map::new();
        attributes.insert("key".to_string(), Value::from(self.key.as_str()));
        attributes.insert("value".to_string(), Value::from(self.value.as_str()));
        attributes.insert("value_type".to_string(), Value::from(self.value_type.as_str()));
        attributes.insert("namespace_id".to_string(), Value::from(self.namespace_id.as_str()));
        attributes.insert(
            "namespace_name".to_string(),
            Value::from(self.namespace_name.as_str()),
        );
        attributes.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        if let Some(expiration) = self.expiration {
            attributes.insert("expiration".to_string(), Value::from(expiration));
        }
        attributes.insert("created_at".to_string(), Value::from(self.created_at.as_str()));
        attributes.insert("updated_at".to_string(), Value::from(self.updated_at.as_str()));
        if let Some(ttl) = self.ttl {
            attributes.insert("ttl".to_string(), Value::from(ttl));
        }
        attributes.insert("source".to_string(), Value::from(self.source.as_str()));
        attributes.insert("data_version".to_string(), Value::from(self.data_version.as_str()));
        attributes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationStatistics {
    pub elapsed_ms: u64,
    pub api_calls: u32,
    pub storage_writes: u32,
    pub success_rate: f64,
    pub retries: u32,
}

/// Running counters for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsTally {
    pub api_calls: u32,
    pub storage_writes: u32,
    pub retries: u32,
    operations: u32,
    successful_operations: u32,
}

impl StatisticsTally {
    pub fn record_operation(&mut self, succeeded: bool) {
        self.operations += 1;
        if succeeded {
            self.successful_operations += 1;
        }
    }

    /// Successful operations over attempted ones, rounded to four places.
    pub fn success_rate(&self) -> f64 {
        if self.operations == 0 {
            return 0.0;
        }
        let rate = f64::from(self.successful_operations) / f64::from(self.operations);
        (rate * 10_000.0).round() / 10_000.0
    }

    pub fn finish(&self, elapsed: Duration) -> InvocationStatistics {
        InvocationStatistics {
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            api_calls: self.api_calls,
            storage_writes: self.storage_writes,
            success_rate: self.success_rate(),
            retries: self.retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Stored,
    KeyAbsent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub status: SyncStatus,
    pub message: String,
    pub key_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    pub warm_start: bool,
    pub credentials_refreshed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub is_retryable: bool,
    pub severity: Severity,
    pub http_status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl From<&ClassifiedError> for ErrorReport {
    fn from(error: &ClassifiedError) -> Self {
        let retry_after_seconds = error.is_retryable().then(|| {
            error
                .retry_after()
                .map(|hint| hint.as_secs() + u64::from(hint.subsec_nanos() > 0))
                .unwrap_or_else(|| suggested_retry_delay_seconds(error.kind()))
        });
        Self {
            kind: error.kind(),
            message: error.message().to_string(),
            is_retryable: error.is_retryable(),
            severity: error.severity(),
            http_status_code: error.http_status_code(),
            retry_after_seconds,
        }
    }
}

fn suggested_retry_delay_seconds(kind: ErrorKind) -> u64 {
    match kind {
        ErrorKind::RateLimited => 60,
        ErrorKind::ApiError => 2,
        _ => 1,
    }
}

/// Terminal value returned to the caller of the handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<SyncSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status_code: Option<u16>,
    statistics: InvocationStatistics,
    request_id: String,
    timestamp: String,
}

impl InvocationResult {
    pub fn succeeded(
        data: SyncSummary,
        statistics: InvocationStatistics,
        request_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            http_status_code: None,
            statistics,
            request_id: request_id.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn failed(
        error: &ClassifiedError,
        statistics: InvocationStatistics,
        request_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from(error);
        Self {
            success: false,
            data: None,
            http_status_code: Some(report.http_status_code),
            error: Some(report),
            statistics,
            request_id: request_id.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&SyncSummary> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorReport> {
        self.error.as_ref()
    }

    pub fn http_status_code(&self) -> Option<u16> {
        self.http_status_code
    }

    pub fn statistics(&self) -> &InvocationStatistics {
        &self.statistics
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}
