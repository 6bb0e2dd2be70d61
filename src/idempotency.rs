//! Memoized responses for state-mutating requests.
//!
//! A request is identified by a [`Fingerprint`]. The first terminal response
//! for a fingerprint is cached for a retention window and replayed verbatim to
//! duplicates. The store is not a mutual-exclusion primitive: two racing
//! writers for one fingerprint both succeed, last write wins.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{Availability, BackendError};

/// Deterministic identity of a logically repeated request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key supplied by the client, scoped by requester so one buyer can never
    /// replay another's response.
    pub fn client_supplied(requester: &str, key: &str) -> Self {
        Self(format!("client:{requester}:{key}"))
    }

    /// SHA-256 over the requester, the operation and the JSON encoding of the
    /// payload. Only caller-stable inputs go in, so retries of the same request
    /// land on the same fingerprint.
    pub fn derive(
        requester: &str,
        operation: &str,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(payload)?;
        let mut hasher = Sha256::new();
        for part in [requester.as_bytes(), operation.as_bytes(), payload.as_slice()] {
            // length prefix keeps ("ab", "c") and ("a", "bc") apart
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }

        Ok(Self(format!("derived:{}", hex::encode(hasher.finalize()))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level outcome as it was first returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// `None` on miss or after the entry expired.
    async fn lookup(&self, fingerprint: &Fingerprint)
    -> Result<Option<CachedResponse>, BackendError>;

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), BackendError>;
}

#[derive(Debug)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// Every this many writes, [`InMemoryIdempotencyStore::store`] drops all
/// expired entries, not only the one being looked up.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    entries: DashMap<Fingerprint, CacheEntry>,
    writes: AtomicU64,
    availability: Availability,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            availability: Availability::new("idempotency"),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// Entries currently retained, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CachedResponse>, BackendError> {
        self.availability.check()?;
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(fingerprint, |_, entry| entry.expires_at <= now);
        if removed.is_some() {
            return Ok(None);
        }
        Ok(self
            .entries
            .get(fingerprint)
            .map(|entry| entry.response.clone()))
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.availability.check()?;
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "expired idempotency entries swept");
            }
        }
        self.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                response,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload<'a> {
        resource: &'a str,
        quantity: u32,
    }

    fn accepted() -> CachedResponse {
        CachedResponse {
            status: 202,
            body: r#"{"status":"processing"}"#.to_string(),
        }
    }

    #[test]
    fn derived_fingerprint_is_deterministic() {
        let payload = Payload {
            resource: "concert",
            quantity: 1,
        };
        let a = Fingerprint::derive("alice", "/tickets/purchase", &payload).unwrap();
        let b = Fingerprint::derive("alice", "/tickets/purchase", &payload).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("derived:"));
        assert_eq!(a.as_str().len(), "derived:".len() + 64);
    }

    #[test]
    fn derived_fingerprint_separates_inputs() {
        let one = Payload {
            resource: "concert",
            quantity: 1,
        };
        let two = Payload {
            resource: "concert",
            quantity: 2,
        };
        let base = Fingerprint::derive("alice", "/tickets/purchase", &one).unwrap();
        assert_ne!(
            base,
            Fingerprint::derive("bob", "/tickets/purchase", &one).unwrap()
        );
        assert_ne!(
            base,
            Fingerprint::derive("alice", "/tickets/release", &one).unwrap()
        );
        assert_ne!(
            base,
            Fingerprint::derive("alice", "/tickets/purchase", &two).unwrap()
        );
        // shifting bytes between fields must not collide
        assert_ne!(
            Fingerprint::derive("ab", "c", &one).unwrap(),
            Fingerprint::derive("a", "bc", &one).unwrap()
        );
    }

    #[test]
    fn client_keys_are_scoped_by_requester() {
        assert_ne!(
            Fingerprint::client_supplied("alice", "k1"),
            Fingerprint::client_supplied("bob", "k1")
        );
    }

    #[tokio::test]
    async fn lookup_after_store_returns_same_response() {
        let store = InMemoryIdempotencyStore::new();
        let key = Fingerprint::client_supplied("alice", "k1");
        assert_eq!(store.lookup(&key).await.unwrap(), None);

        store
            .store(&key, accepted(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.lookup(&key).await.unwrap(), Some(accepted()));
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryIdempotencyStore::new();
        let key = Fingerprint::client_supplied("alice", "k1");
        store
            .store(&key, accepted(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.lookup(&key).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn writes_sweep_expired_entries() {
        let store = InMemoryIdempotencyStore::new();
        let stale = Fingerprint::client_supplied("alice", "stale");
        store
            .store(&stale, accepted(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // never looked up again, only the periodic sweep can drop it
        for i in 1..SWEEP_EVERY {
            let key = Fingerprint::client_supplied("bob", &format!("k{i}"));
            store
                .store(&key, accepted(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.len() as u64, SWEEP_EVERY - 1);
        assert_eq!(store.lookup(&stale).await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_expired_keeps_live_entries() {
        let store = InMemoryIdempotencyStore::new();
        let short = Fingerprint::client_supplied("alice", "short");
        let long = Fingerprint::client_supplied("alice", "long");
        store
            .store(&short, accepted(), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .store(&long, accepted(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(&long).await.unwrap(), Some(accepted()));
    }

    #[tokio::test]
    async fn racing_stores_last_write_wins() {
        let store = InMemoryIdempotencyStore::new();
        let key = Fingerprint::client_supplied("alice", "k1");
        let conflict = CachedResponse {
            status: 409,
            body: "{}".to_string(),
        };
        store
            .store(&key, accepted(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .store(&key, conflict.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.lookup(&key).await.unwrap(), Some(conflict));
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryIdempotencyStore::new();
        store.availability().set_available(false);
        let key = Fingerprint::client_supplied("alice", "k1");
        assert!(store.lookup(&key).await.is_err());
        assert!(
            store
                .store(&key, accepted(), Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
