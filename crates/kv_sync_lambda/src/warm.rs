//! Process-wide resources reused across invocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, ConfigLoader};

use crate::adapters::durable_store::DurableStore;
use crate::adapters::dynamodb::DynamoDbStore;
use crate::adapters::kv_api::{HttpKvTransport, KvTransport};
use crate::adapters::secret_source::SecretSource;
use crate::adapters::secrets_manager::SecretsManagerSource;
use crate::config::{InitError, SyncConfig};
use crate::credentials::CredentialCache;
use crate::fetch::RemoteFetchClient;
use crate::storage::StorageWriter;

/// Created once per process and shared by every invocation it serves.
///
/// Holds the credential cache and the pooled HTTP transport; nothing here
/// outlives the process.
pub struct WarmResources {
    config: SyncConfig,
    credentials: CredentialCache,
    fetch_client: RemoteFetchClient,
    storage_writer: StorageWriter,
    invocations: AtomicU64,
}

impl WarmResources {
    pub fn new(
        config: SyncConfig,
        secret_source: Arc<dyn SecretSource>,
        transport: Arc<dyn KvTransport>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            credentials: CredentialCache::new(
                secret_source,
                config.secret_name.clone(),
                config.api_timeout,
            ),
            fetch_client: RemoteFetchClient::new(transport, policy.clone(), config.api_timeout),
            storage_writer: StorageWriter::new(store, policy, config.api_timeout),
            invocations: AtomicU64::new(0),
            config,
        }
    }

    /// Wires the AWS-backed collaborators from the default credential chain.
    pub async fn from_aws(config: SyncConfig) -> Result<Self, InitError> {
        let aws_config = sdk_config_loader().load().await;
        let secret_source =
            SecretsManagerSource::new(aws_sdk_secretsmanager::Client::new(&aws_config));
        let store = DynamoDbStore::new(
            aws_sdk_dynamodb::Client::new(&aws_config),
            config.table_name.clone(),
        );
        let transport = HttpKvTransport::new(&config.api_base_url)?;

        Ok(Self::new(
            config,
            Arc::new(secret_source),
            Arc::new(transport),
            Arc::new(store),
        ))
    }

    /// Registers a new invocation; true when this process served one before.
    pub fn begin_invocation(&self) -> bool {
        self.invocations.fetch_add(1, Ordering::SeqCst) > 0
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn fetch_client(&self) -> &RemoteFetchClient {
        &self.fetch_client
    }

    pub fn storage_writer(&self) -> &StorageWriter {
        &self.storage_writer
    }
}

/// SDK configuration shared by the AWS clients.
///
/// SDK-level retries are disabled; every retry goes through the classifier
/// and the invocation budget instead.
pub fn sdk_config_loader() -> ConfigLoader {
    aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled())
}
