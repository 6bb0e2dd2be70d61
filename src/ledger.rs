//! Authoritative per-resource availability.
//!
//! Every mutation is a single conditional update against the backing store,
//! so `0 <= available_units <= total_units` holds without any external lock.
//! The purchase path still locks around its multi-step critical section; the
//! compensation path increments without the lock.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{Availability, BackendError};
use crate::model::{NewResource, ReservationId, Resource, ResourceId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("resource {0} not found")]
    NotFound(ResourceId),

    #[error("resource {0} already exists")]
    AlreadyExists(ResourceId),

    #[error("insufficient inventory for {resource}: available {available}, requested {requested}")]
    InsufficientInventory {
        resource: ResourceId,
        available: u32,
        requested: u32,
    },

    #[error("returning {requested} units to {resource} would exceed its capacity ({available}/{total})")]
    CapacityExceeded {
        resource: ResourceId,
        available: u32,
        total: u32,
        requested: u32,
    },

    #[error("quantity must be at least 1")]
    ZeroQuantity,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Outcome of [`Ledger::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// Units were returned; carries the new availability.
    Applied(u32),
    /// This reservation's units were already returned earlier.
    AlreadyApplied(u32),
}

impl Restore {
    pub fn available(self) -> u32 {
        match self {
            Restore::Applied(n) | Restore::AlreadyApplied(n) => n,
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_resource(&self, resource: NewResource) -> Result<Resource, LedgerError>;

    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, LedgerError>;

    /// All resources, ordered by id.
    async fn list_resources(&self) -> Result<Vec<Resource>, LedgerError>;

    /// Take `quantity` units if at least that many are available, returning
    /// the new availability. Never partially applies.
    async fn try_decrement(&self, id: &str, quantity: u32) -> Result<u32, LedgerError>;

    /// Return `quantity` units. Refused if it would exceed `total_units`.
    async fn increment(&self, id: &str, quantity: u32) -> Result<u32, LedgerError>;

    /// Return the units held by `reservation`, at most once per reservation.
    async fn restore(
        &self,
        id: &str,
        quantity: u32,
        reservation: ReservationId,
    ) -> Result<Restore, LedgerError>;

    /// Whether `reservation`'s units have already been returned.
    async fn is_restored(&self, id: &str, reservation: ReservationId)
    -> Result<bool, LedgerError>;
}

#[derive(Debug)]
struct LedgerEntry {
    resource: Resource,
    /// Reservations whose units have been returned by [`Ledger::restore`].
    /// Holds one id per cancelled reservation of this resource, so it grows
    /// no faster than the reservation records themselves, which are never
    /// pruned either. A restore can be redelivered at any later time, so ids
    /// are kept for the life of the resource.
    restored: HashSet<ReservationId>,
}

impl LedgerEntry {
    fn take(&mut self, quantity: u32) -> Result<u32, LedgerError> {
        let resource = &mut self.resource;
        if resource.available_units < quantity {
            return Err(LedgerError::InsufficientInventory {
                resource: resource.id.clone(),
                available: resource.available_units,
                requested: quantity,
            });
        }
        resource.available_units -= quantity;
        Ok(resource.available_units)
    }

    fn put_back(&mut self, quantity: u32) -> Result<u32, LedgerError> {
        let resource = &mut self.resource;
        let room = resource.total_units - resource.available_units;
        if quantity > room {
            return Err(LedgerError::CapacityExceeded {
                resource: resource.id.clone(),
                available: resource.available_units,
                total: resource.total_units,
                requested: quantity,
            });
        }
        resource.available_units += quantity;
        Ok(resource.available_units)
    }
}

/// Process-local [`Ledger`]. Each update runs under the entry's shard lock,
/// which makes check-and-update a single atomic step.
#[derive(Debug)]
pub struct InMemoryLedger {
    entries: DashMap<ResourceId, LedgerEntry>,
    availability: Availability,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            availability: Availability::new("ledger"),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    fn update<T>(
        &self,
        id: &str,
        op: impl FnOnce(&mut LedgerEntry) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        self.availability.check()?;
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        op(&mut entry)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_resource(&self, new: NewResource) -> Result<Resource, LedgerError> {
        self.availability.check()?;
        match self.entries.entry(new.id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::AlreadyExists(new.id)),
            Entry::Vacant(slot) => {
                let resource = Resource {
                    id: new.id,
                    name: new.name,
                    total_units: new.total_units,
                    available_units: new.total_units,
                    unit_price: new.unit_price,
                    created_at: Utc::now(),
                };
                info!(
                    resource = %resource.id,
                    total = resource.total_units,
                    price = %resource.unit_price,
                    "resource created"
                );
                slot.insert(LedgerEntry {
                    resource: resource.clone(),
                    restored: HashSet::new(),
                });
                Ok(resource)
            }
        }
    }

    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, LedgerError> {
        self.availability.check()?;
        Ok(self.entries.get(id).map(|entry| entry.resource.clone()))
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, LedgerError> {
        self.availability.check()?;
        let mut resources: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.resource.clone())
            .collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(resources)
    }

    async fn try_decrement(&self, id: &str, quantity: u32) -> Result<u32, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::ZeroQuantity);
        }
        let available = self.update(id, |entry| entry.take(quantity))?;
        debug!(resource = id, quantity, available, "inventory decremented");
        Ok(available)
    }

    async fn increment(&self, id: &str, quantity: u32) -> Result<u32, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::ZeroQuantity);
        }
        let available = self.update(id, |entry| entry.put_back(quantity))?;
        debug!(resource = id, quantity, available, "inventory incremented");
        Ok(available)
    }

    async fn restore(
        &self,
        id: &str,
        quantity: u32,
        reservation: ReservationId,
    ) -> Result<Restore, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::ZeroQuantity);
        }
        self.update(id, |entry| {
            if entry.restored.contains(&reservation) {
                return Ok(Restore::AlreadyApplied(entry.resource.available_units));
            }
            let available = entry.put_back(quantity)?;
            entry.restored.insert(reservation);
            Ok(Restore::Applied(available))
        })
    }

    async fn is_restored(
        &self,
        id: &str,
        reservation: ReservationId,
    ) -> Result<bool, LedgerError> {
        self.availability.check()?;
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        Ok(entry.restored.contains(&reservation))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::Amount;

    async fn ledger_with(total: u32) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger
            .create_resource(NewResource::new("concert", total, Amount::from_scaled(450_000)))
            .await
            .unwrap();
        ledger
    }

    async fn available(ledger: &InMemoryLedger) -> u32 {
        ledger
            .get_resource("concert")
            .await
            .unwrap()
            .unwrap()
            .available_units
    }

    #[tokio::test]
    async fn create_starts_fully_available() {
        let ledger = ledger_with(10).await;
        let resource = ledger.get_resource("concert").await.unwrap().unwrap();
        assert_eq!(resource.total_units, 10);
        assert_eq!(resource.available_units, 10);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let ledger = ledger_with(10).await;
        let result = ledger
            .create_resource(NewResource::new("concert", 5, Amount::ZERO))
            .await;
        assert_eq!(result, Err(LedgerError::AlreadyExists("concert".into())));
        assert_eq!(available(&ledger).await, 10);
    }

    #[tokio::test]
    async fn decrement_down_to_zero() {
        let ledger = ledger_with(3).await;
        assert_eq!(ledger.try_decrement("concert", 2).await, Ok(1));
        assert_eq!(ledger.try_decrement("concert", 1).await, Ok(0));
    }

    #[tokio::test]
    async fn decrement_beyond_available_never_partially_applies() {
        let ledger = ledger_with(3).await;
        let result = ledger.try_decrement("concert", 4).await;
        assert_eq!(
            result,
            Err(LedgerError::InsufficientInventory {
                resource: "concert".into(),
                available: 3,
                requested: 4,
            })
        );
        assert_eq!(available(&ledger).await, 3);
    }

    #[tokio::test]
    async fn increment_cannot_exceed_total() {
        let ledger = ledger_with(3).await;
        ledger.try_decrement("concert", 1).await.unwrap();
        assert!(matches!(
            ledger.increment("concert", 2).await,
            Err(LedgerError::CapacityExceeded { .. })
        ));
        assert_eq!(ledger.increment("concert", 1).await, Ok(3));
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let ledger = ledger_with(3).await;
        assert_eq!(
            ledger.try_decrement("concert", 0).await,
            Err(LedgerError::ZeroQuantity)
        );
        assert_eq!(
            ledger.increment("concert", 0).await,
            Err(LedgerError::ZeroQuantity)
        );
    }

    #[tokio::test]
    async fn unknown_resource() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            ledger.try_decrement("nope", 1).await,
            Err(LedgerError::NotFound("nope".into()))
        );
        assert_eq!(ledger.get_resource("nope").await, Ok(None));
    }

    #[tokio::test]
    async fn restore_applies_once_per_reservation() {
        let ledger = ledger_with(5).await;
        let reservation = Uuid::new_v4();
        ledger.try_decrement("concert", 2).await.unwrap();

        assert_eq!(ledger.is_restored("concert", reservation).await, Ok(false));
        assert_eq!(
            ledger.restore("concert", 2, reservation).await,
            Ok(Restore::Applied(5))
        );
        assert_eq!(ledger.is_restored("concert", reservation).await, Ok(true));
        assert_eq!(
            ledger.restore("concert", 2, reservation).await,
            Ok(Restore::AlreadyApplied(5))
        );
        assert_eq!(available(&ledger).await, 5);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let ledger = InMemoryLedger::new();
        for id in ["b", "c", "a"] {
            ledger
                .create_resource(NewResource::new(id, 1, Amount::ZERO))
                .await
                .unwrap();
        }
        let ids: Vec<_> = ledger
            .list_resources()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decrements_stay_in_bounds() {
        let ledger = Arc::new(ledger_with(50).await);
        let mut handles = Vec::new();
        for _ in 0..80 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.try_decrement("concert", 1).await.is_ok()
            }));
        }

        let mut taken = 0;
        for handle in handles {
            if handle.await.unwrap() {
                taken += 1;
            }
        }
        assert_eq!(taken, 50);
        assert_eq!(available(&ledger).await, 0);
    }

    #[tokio::test]
    async fn outage_surfaces_backend_error() {
        let ledger = ledger_with(5).await;
        ledger.availability().set_available(false);
        assert!(matches!(
            ledger.try_decrement("concert", 1).await,
            Err(LedgerError::Backend(_))
        ));
        ledger.availability().set_available(true);
        assert_eq!(available(&ledger).await, 5);
    }
}
