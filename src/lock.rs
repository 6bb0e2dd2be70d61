//! Distributed advisory locks keyed by resource.
//!
//! A lock record holds an opaque owner token and an expiry. Acquisition is an
//! atomic set-if-absent; release is an atomic compare-and-delete on the token,
//! so a holder whose lock expired and was re-acquired by someone else can never
//! release the newer holder's lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Availability, BackendError};
use crate::config::LockConfig;

/// Proof of lock ownership, unique per acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage primitive behind [`LockManager`].
///
/// Any backend with an atomic set-if-absent-with-expiry and an atomic
/// compare-and-delete can implement this.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `token` under `key` only if no live record exists. Never extends
    /// an existing record, even one owned by `token`.
    async fn set_if_absent(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Delete the record under `key` only if it is live and owned by `token`.
    async fn delete_if_owner(&self, key: &str, token: LockToken) -> Result<bool, BackendError>;
}

#[derive(Debug, Clone, Copy)]
struct LockRecord {
    token: LockToken,
    expires_at: Instant,
}

impl LockRecord {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local [`LockStore`]. Each key's check-and-set runs under its
/// shard's write lock.
#[derive(Debug)]
pub struct InMemoryLockStore {
    records: DashMap<String, LockRecord>,
    availability: Availability,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            availability: Availability::new("lock"),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// Number of live lock records.
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.records.iter().filter(|r| r.is_live(now)).count()
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.availability.check()?;
        let now = Instant::now();
        let record = LockRecord {
            token,
            expires_at: now + ttl,
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                // expired record: the previous holder lost its claim
                entry.insert(record);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
        }
    }

    async fn delete_if_owner(&self, key: &str, token: LockToken) -> Result<bool, BackendError> {
        self.availability.check()?;
        let now = Instant::now();
        let removed = self.records.remove_if(key, |_, record| record.token == token);
        Ok(removed.is_some_and(|(_, record)| record.is_live(now)))
    }
}

/// Lock operations with a key namespace and configured timings.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl LockManager {
    const PREFIX: &'static str = "lock:";

    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Try once to take the lock for `key`.
    pub async fn acquire(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.store
            .set_if_absent(&Self::namespaced(key), token, ttl)
            .await
    }

    /// Release the lock for `key` if `token` still owns it.
    pub async fn release(&self, key: &str, token: LockToken) -> Result<bool, BackendError> {
        let released = self
            .store
            .delete_if_owner(&Self::namespaced(key), token)
            .await?;
        if !released {
            warn!(key, token = %token, "lock release skipped: not the current owner");
        }
        Ok(released)
    }

    /// Poll [`acquire`](Self::acquire) every `poll_interval` until it succeeds
    /// or `max_wait` elapses. Backend errors end the wait immediately.
    pub async fn wait_acquire(
        &self,
        key: &str,
        token: LockToken,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<bool, BackendError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.acquire(key, token, self.config.ttl).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, waited_ms = max_wait.as_millis() as u64, "lock wait timed out");
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Wait for `key` with the configured bounds, returning the owner token on
    /// success.
    pub async fn lock(&self, key: &str) -> Result<Option<LockToken>, BackendError> {
        let token = LockToken::new();
        let acquired = self
            .wait_acquire(key, token, self.config.max_wait, self.config.poll_interval)
            .await?;
        Ok(acquired.then_some(token))
    }

    fn namespaced(key: &str) -> String {
        format!("{}{key}", Self::PREFIX)
    }
}
