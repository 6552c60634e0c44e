//! Error classification.
//!
//! Collaborators report what went wrong as a [`RawFailure`]; [`classify`]
//! turns it into a [`ClassifiedError`]. Retry eligibility and severity come
//! from a single table, [`ErrorKind::policy`], so the fetch and write paths
//! share one policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure categories surfaced in invocation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CredentialUnavailable,
    AuthError,
    NotFound,
    RateLimited,
    ApiError,
    TransformError,
    StorageError,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// How a kind decides retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Never,
    Always,
    /// Retryable only when the underlying failure is transient (network
    /// errors, 5xx, store throttling).
    WhenTransient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub retryability: Retryability,
    pub severity: Severity,
    pub http_status: u16,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        Self::CredentialUnavailable,
        Self::AuthError,
        Self::NotFound,
        Self::RateLimited,
        Self::ApiError,
        Self::TransformError,
        Self::StorageError,
        Self::Timeout,
    ];

    pub fn policy(self) -> KindPolicy {
        let (retryability, severity, http_status) = match self {
            Self::CredentialUnavailable => (Retryability::Never, Severity::Critical, 500),
            Self::AuthError => (Retryability::Never, Severity::Error, 401),
            Self::NotFound => (Retryability::Never, Severity::Warning, 404),
            Self::RateLimited => (Retryability::Always, Severity::Warning, 429),
            Self::ApiError => (Retryability::WhenTransient, Severity::Error, 502),
            Self::TransformError => (Retryability::Never, Severity::Error, 422),
            Self::StorageError => (Retryability::WhenTransient, Severity::Error, 503),
            Self::Timeout => (Retryability::Always, Severity::Error, 504),
        };
        KindPolicy {
            retryability,
            severity,
            http_status,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialUnavailable => "CREDENTIAL_UNAVAILABLE",
            Self::AuthError => "AUTH_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::ApiError => "API_ERROR",
            Self::TransformError => "TRANSFORM_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unclassified failure reported by a collaborator or a lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RawFailure {
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),
    #[error("invalid invocation request: {0}")]
    InvalidRequest(String),
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("remote API reported failure: {0}")]
    ApiEnvelope(String),
    #[error("network error: {message}")]
    Network { message: String, timed_out: bool },
    #[error("malformed value: {0}")]
    MalformedValue(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("store throttled: {0}")]
    StoreThrottled(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store rejected item: {0}")]
    StoreRejected(String),
    #[error("time budget exhausted before {operation} ({remaining_ms}ms left)")]
    BudgetExhausted {
        operation: String,
        remaining_ms: u64,
        last_error: Option<String>,
    },
}

/// Where a failure happened; folded into the classified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext<'a> {
    pub component: &'a str,
    pub operation: &'a str,
}

impl<'a> ErrorContext<'a> {
    pub const fn new(component: &'a str, operation: &'a str) -> Self {
        Self {
            component,
            operation,
        }
    }
}

/// A failure with its kind, retry eligibility and severity fixed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    is_retryable: bool,
    severity: Severity,
    #[serde(skip)]
    retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
}

impl ClassifiedError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Server-provided wait hint (`Retry-After`), if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Upstream HTTP status, when the failure came from an HTTP response.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Status reported to the caller of the handler.
    pub fn http_status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::StorageError if !self.is_retryable => 500,
            kind => kind.policy().http_status,
        }
    }

    /// Emits the error at a level matching its severity.
    pub fn log(&self, component: &str) {
        match self.severity {
            Severity::Warning => tracing::warn!(
                component,
                event = "classified_error",
                kind = self.kind.as_str(),
                retryable = self.is_retryable,
                message = %self.message,
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                component,
                event = "classified_error",
                kind = self.kind.as_str(),
                severity = ?self.severity,
                retryable = self.is_retryable,
                message = %self.message,
            ),
        }
    }
}

/// Maps a raw failure to its classified form.
pub fn classify(failure: RawFailure, context: &ErrorContext<'_>) -> ClassifiedError {
    let mut retry_after = None;
    let mut status_code = None;
    let (kind, transient) = match &failure {
        RawFailure::SecretUnavailable(_) => (ErrorKind::CredentialUnavailable, false),
        RawFailure::InvalidRequest(_) => (ErrorKind::TransformError, false),
        RawFailure::Http {
            status,
            retry_after: hint,
            ..
        } => {
            status_code = Some(*status);
            match *status {
                401 | 403 => (ErrorKind::AuthError, false),
                404 => (ErrorKind::NotFound, false),
                429 => {
                    retry_after = *hint;
                    (ErrorKind::RateLimited, true)
                }
                500..=599 => (ErrorKind::ApiError, true),
                _ => (ErrorKind::ApiError, false),
            }
        }
        RawFailure::ApiEnvelope(_) => (ErrorKind::ApiError, false),
        RawFailure::Network { .. } => (ErrorKind::ApiError, true),
        RawFailure::MalformedValue(_) | RawFailure::InvalidRecord(_) => {
            (ErrorKind::TransformError, false)
        }
        RawFailure::StoreThrottled(_) | RawFailure::StoreUnavailable(_) => {
            (ErrorKind::StorageError, true)
        }
        RawFailure::StoreRejected(_) => (ErrorKind::StorageError, false),
        RawFailure::BudgetExhausted { .. } => (ErrorKind::Timeout, true),
    };

    let policy = kind.policy();
    let is_retryable = match policy.retryability {
        Retryability::Never => false,
        Retryability::Always => true,
        Retryability::WhenTransient => transient,
    };

    let mut message = format!("{} failed in {}: {failure}", context.operation, context.component);
    if let RawFailure::BudgetExhausted {
        last_error: Some(last_error),
        ..
    } = &failure
    {
        message.push_str(&format!(" (last error: {last_error})"));
    }

    ClassifiedError {
        kind,
        message,
        is_retryable,
        severity: policy.severity,
        retry_after,
        status_code,
    }
}
