use async_trait::async_trait;
use kv_sync_core::contract::Credentials;
use kv_sync_core::error::RawFailure;

/// Source of the remote API credentials.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Credentials, RawFailure>;
}
