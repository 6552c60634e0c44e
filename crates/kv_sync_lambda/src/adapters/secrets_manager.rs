use async_trait::async_trait;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata};
use kv_sync_core::contract::{parse_secret, Credentials};
use kv_sync_core::error::RawFailure;

use crate::adapters::secret_source::SecretSource;

pub struct SecretsManagerSource {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerSource {
    pub fn new(client: aws_sdk_secretsmanager::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for SecretsManagerSource {
    async fn get_secret(&self, name: &str) -> Result<Credentials, RawFailure> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|error| {
                tracing::debug!(
                    component = "credential_cache",
                    event = "get_secret_value_sdk_error",
                    secret_name = name,
                    error = %DisplayErrorContext(&error),
                );
                let message = match error.code() {
                    Some("ResourceNotFoundException") => format!("secret {name} was not found"),
                    Some("AccessDeniedException") => {
                        format!("access denied reading secret {name}")
                    }
                    Some(code) => format!(
                        "failed to read secret {name}: {code}: {}",
                        error.message().unwrap_or("no message")
                    ),
                    None => format!("failed to read secret {name}: {error}"),
                };
                RawFailure::SecretUnavailable(message)
            })?;

        let secret_string = output.secret_string().ok_or_else(|| {
            RawFailure::SecretUnavailable(format!("secret {name} has no string value"))
        })?;
        parse_secret(name, secret_string)
    }
}
