use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kv_sync_core::contract::Credentials;
use kv_sync_core::error::RawFailure;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const EXPIRATION_HEADER: &str = "expiration";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One response from the value endpoint, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    /// Epoch seconds, from the `expiration` header.
    pub expiration: Option<i64>,
    pub body: String,
}

/// Failure below HTTP: no response was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
    pub connection_failed: bool,
}

impl From<TransportError> for RawFailure {
    fn from(error: TransportError) -> Self {
        RawFailure::Network {
            message: error.message,
            timed_out: error.timed_out,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportInitError {
    #[error("invalid KV API base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Reads a single value from the remote KV API.
#[async_trait]
pub trait KvTransport: Send + Sync {
    async fn get_value(
        &self,
        credentials: &Credentials,
        key: &str,
        timeout: Duration,
    ) -> Result<KvResponse, TransportError>;
}

/// reqwest-backed transport whose connection pool lives as long as the
/// process, and is rebuilt after a connection failure.
pub struct HttpKvTransport {
    base_url: Url,
    client: RwLock<reqwest::Client>,
    clients_built: AtomicU64,
}

impl HttpKvTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportInitError> {
        let parsed = Url::parse(base_url).map_err(|error| TransportInitError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: error.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(TransportInitError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "URL cannot be used as a base".to_string(),
            });
        }
        Ok(Self {
            base_url: parsed,
            client: RwLock::new(build_client()?),
            clients_built: AtomicU64::new(1),
        })
    }

    /// Number of HTTP clients (connection pools) created so far.
    pub fn clients_built(&self) -> u64 {
        self.clients_built.load(Ordering::Relaxed)
    }

    pub fn value_url(&self, credentials: &Credentials, key: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "accounts",
                credentials.account_id.as_str(),
                "storage",
                "kv",
                "namespaces",
                credentials.namespace_id.as_str(),
                "values",
                key,
            ]);
        }
        url
    }

    fn replace_client(&self) {
        match build_client() {
            Ok(client) => {
                *self.client.write() = client;
                self.clients_built.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    component = "fetch_client",
                    event = "http_client_replaced",
                    clients_built = self.clients_built(),
                );
            }
            Err(error) => tracing::warn!(
                component = "fetch_client",
                event = "http_client_rebuild_failed",
                error = %error,
            ),
        }
    }
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
}

#[async_trait]
impl KvTransport for HttpKvTransport {
    async fn get_value(
        &self,
        credentials: &Credentials,
        key: &str,
        timeout: Duration,
    ) -> Result<KvResponse, TransportError> {
        let url = self.value_url(credentials, key);
        // Clone the handle so the lock is not held across the request.
        let client = self.client.read().clone();

        let response = match client
            .get(url)
            .bearer_auth(&credentials.api_token)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                let connection_failed = error.is_connect();
                if connection_failed {
                    self.replace_client();
                }
                return Err(TransportError {
                    message: format!("request for key {key} failed: {error}"),
                    timed_out: error.is_timeout(),
                    connection_failed,
                });
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE.as_str());
        let retry_after = header(RETRY_AFTER.as_str())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let expiration = header(EXPIRATION_HEADER).and_then(|value| value.parse::<i64>().ok());

        let body = response.text().await.map_err(|error| TransportError {
            message: format!("failed to read response body for key {key}: {error}"),
            timed_out: error.is_timeout(),
            connection_failed: false,
        })?;

        Ok(KvResponse {
            status,
            content_type,
            retry_after,
            expiration,
            body,
        })
    }
}
