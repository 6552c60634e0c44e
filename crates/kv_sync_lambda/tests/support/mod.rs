#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kv_sync_core::contract::Credentials;
use kv_sync_core::error::RawFailure;
use kv_sync_lambda::adapters::durable_store::{DurableStore, InMemoryStore, ItemAttributes};
use kv_sync_lambda::adapters::kv_api::{KvResponse, KvTransport, TransportError};
use kv_sync_lambda::adapters::secret_source::SecretSource;
use kv_sync_lambda::config::SyncConfig;
use kv_sync_lambda::warm::WarmResources;
use parking_lot::Mutex;
use tokio::time::Instant;

pub fn text(status: u16, body: &str) -> KvResponse {
    KvResponse {
        status,
        content_type: Some("text/plain".to_string()),
        retry_after: None,
        expiration: None,
        body: body.to_string(),
    }
}

pub fn json_body(status: u16, body: &str) -> KvResponse {
    KvResponse {
        content_type: Some("application/json".to_string()),
        ..text(status, body)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub key: String,
    pub token: String,
    pub timeout: Duration,
}

/// Replays queued responses in order; once the queue is empty the fallback
/// response is served.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<KvResponse, TransportError>>>,
    fallback: KvResponse,
    latency: Duration,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<KvResponse>) -> Arc<Self> {
        Self::with_latency(responses, Duration::ZERO)
    }

    pub fn with_latency(responses: Vec<KvResponse>, latency: Duration) -> Arc<Self> {
        let fallback = responses.last().cloned().unwrap_or_else(|| text(200, "value"));
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback,
            latency,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push_transport_error(&self, error: TransportError) {
        self.responses.lock().push_front(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl KvTransport for ScriptedTransport {
    async fn get_value(
        &self,
        credentials: &Credentials,
        key: &str,
        timeout: Duration,
    ) -> Result<KvResponse, TransportError> {
        self.calls.lock().push(RecordedCall {
            at: Instant::now(),
            key: key.to_string(),
            token: credentials.api_token.clone(),
            timeout,
        });

        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError {
                message: "operation timed out".to_string(),
                timed_out: true,
                connection_failed: false,
            });
        }
        tokio::time::sleep(self.latency).await;

        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Hands out credentials whose token changes on every fetch.
pub struct ScriptedSecretSource {
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedSecretSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSource for ScriptedSecretSource {
    async fn get_secret(&self, name: &str) -> Result<Credentials, RawFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RawFailure::SecretUnavailable(format!(
                "access denied reading secret {name}"
            )));
        }
        Ok(Credentials {
            api_token: format!("token-{call}"),
            account_id: "acc-1".to_string(),
            namespace_id: "ns-1".to_string(),
            namespace_name: "flags".to_string(),
        })
    }
}

/// Fails the first puts with the queued failures, then stores in memory.
/// Every put first waits out the configured latency.
pub struct FlakyStore {
    failures: Mutex<VecDeque<RawFailure>>,
    latency: Duration,
    pub inner: InMemoryStore,
    attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: Vec<RawFailure>) -> Arc<Self> {
        Self::with_latency(failures, Duration::ZERO)
    }

    pub fn with_latency(failures: Vec<RawFailure>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into()),
            latency,
            inner: InMemoryStore::new(),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn reliable() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn put_item(
        &self,
        partition_key: &str,
        sort_key: &str,
        attributes: &ItemAttributes,
    ) -> Result<(), RawFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.failures.lock().pop_front();
        match next {
            Some(failure) => Err(failure),
            None => self.inner.put_item(partition_key, sort_key, attributes).await,
        }
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig::from_lookup(|name| {
        let value = match name {
            "SECRETS_MANAGER_SECRET_NAME" => "kv/credentials",
            "DYNAMODB_TABLE_NAME" => "kv-sync",
            "RETRY_BASE_DELAY_MS" => "100",
            "RETRY_MAX_DELAY_MS" => "2000",
            "ESTIMATED_CALL_MS" => "50",
            "API_TIMEOUT_SECONDS" => "5",
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("test configuration should be valid")
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub secrets: Arc<ScriptedSecretSource>,
    pub store: Arc<FlakyStore>,
    pub resources: WarmResources,
}

impl Harness {
    pub fn new(transport: Arc<ScriptedTransport>, store: Arc<FlakyStore>) -> Self {
        Self::with_secrets(transport, store, ScriptedSecretSource::new())
    }

    pub fn with_secrets(
        transport: Arc<ScriptedTransport>,
        store: Arc<FlakyStore>,
        secrets: Arc<ScriptedSecretSource>,
    ) -> Self {
        let resources = WarmResources::new(
            test_config(),
            secrets.clone(),
            transport.clone(),
            store.clone(),
        );
        Self {
            transport,
            secrets,
            store,
            resources,
        }
    }
}
