pub mod durable_store;
pub mod dynamodb;
pub mod kv_api;
pub mod secret_source;
pub mod secrets_manager;
