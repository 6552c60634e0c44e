//! Process-wide credential cache.
//!
//! Cached credentials are read without taking the refresh guard. Refreshes are
//! serialized by an async mutex so concurrent invocations that miss the cache
//! trigger a single secret-store call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kv_sync_core::budget::TimeoutBudget;
use kv_sync_core::contract::Credentials;
use kv_sync_core::error::{classify, ClassifiedError, ErrorContext, RawFailure};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::adapters::secret_source::SecretSource;

const COMPONENT: &str = "credential_cache";

/// Credentials plus the cache generation they were issued under.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub generation: u64,
    pub credentials: Arc<Credentials>,
}

pub struct CredentialCache {
    source: Arc<dyn SecretSource>,
    secret_name: String,
    call_timeout: Duration,
    cached: RwLock<Option<CredentialLease>>,
    refresh_guard: Mutex<()>,
    generation: AtomicU64,
    refreshes: AtomicU64,
    invalidations: AtomicU64,
}

impl CredentialCache {
    pub fn new(
        source: Arc<dyn SecretSource>,
        secret_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            source,
            secret_name: secret_name.into(),
            call_timeout,
            cached: RwLock::new(None),
            refresh_guard: Mutex::new(()),
            generation: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Returns cached credentials, fetching them once if the cache is empty.
    ///
    /// A fetch is cut off at the call timeout or the budget's remaining time,
    /// whichever is shorter.
    pub async fn get(&self, budget: &TimeoutBudget) -> Result<CredentialLease, ClassifiedError> {
        if let Some(lease) = self.current() {
            return Ok(lease);
        }

        let _guard = self.refresh_guard.lock().await;
        // Another invocation may have refreshed while we waited.
        if let Some(lease) = self.current() {
            return Ok(lease);
        }

        let limit = budget.clamp(self.call_timeout);
        let fetch = self.source.get_secret(&self.secret_name);
        let loaded = match tokio::time::timeout(limit, fetch).await {
            Ok(loaded) => loaded,
            Err(_) => Err(RawFailure::SecretUnavailable(format!(
                "reading secret {} did not finish within {}ms",
                self.secret_name,
                limit.as_millis()
            ))),
        };
        let context = ErrorContext::new(COMPONENT, "load_credentials");
        let credentials = loaded.map_err(|failure| classify(failure, &context))?;

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lease = CredentialLease {
            generation,
            credentials: Arc::new(credentials),
        };
        *self.cached.write() = Some(lease.clone());

        tracing::info!(
            component = COMPONENT,
            event = "credentials_refreshed",
            generation,
            secret_name = %self.secret_name,
        );
        Ok(lease)
    }

    /// Drops the cached entry if it is still the given generation.
    ///
    /// Returns false when a newer entry has already replaced it.
    pub fn invalidate(&self, generation: u64) -> bool {
        let mut cached = self.cached.write();
        match cached.as_ref() {
            Some(lease) if lease.generation == generation => {
                *cached = None;
                self.invalidations.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    component = COMPONENT,
                    event = "credentials_invalidated",
                    generation,
                );
                true
            }
            _ => false,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Secret-store fetches performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<CredentialLease> {
        self.cached.read().clone()
    }
}
