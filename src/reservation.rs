//! Reservation and settlement lifecycles.
//!
//! ```text
//! Pending  --(ledger decrement ok)-->                     Reserved
//! Reserved --(settlement completed)-->                    Confirmed  [terminal]
//! Reserved --(retries exhausted | release | expiry)-->    Cancelled  [terminal]
//! ```
//!
//! Terminal records are immutable: a transition out of `Confirmed` or
//! `Cancelled` is logged as an anomaly and not applied.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{Availability, BackendError};
use crate::model::{
    Reservation, ReservationId, ReservationStatus, Settlement, SettlementStatus,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    #[error("reservation {0} already exists")]
    Duplicate(ReservationId),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    Applied { from: S, to: S },
    /// Nothing changed; carries the current status.
    Unchanged(S),
}

impl<S: Copy> Transition<S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// Status after the call.
    pub fn status(&self) -> S {
        match *self {
            Transition::Applied { to, .. } => to,
            Transition::Unchanged(current) => current,
        }
    }
}

/// Allowed reservation edges.
pub fn reservation_edge(from: ReservationStatus, to: ReservationStatus) -> bool {
    use ReservationStatus::*;
    matches!(
        (from, to),
        (Pending, Reserved) | (Reserved, Confirmed) | (Reserved, Cancelled)
    )
}

/// Allowed settlement edges. `Processing -> Pending` is a retry.
pub fn settlement_edge(from: SettlementStatus, to: SettlementStatus) -> bool {
    use SettlementStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Pending)
            | (Processing, Completed)
            | (Pending, Failed)
            | (Processing, Failed)
    )
}

/// Reservation table.
#[derive(Debug)]
pub struct ReservationStore {
    rows: DashMap<ReservationId, Reservation>,
    availability: Availability,
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            availability: Availability::new("reservations"),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn insert(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.availability.check()?;
        match self.rows.entry(reservation.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(reservation.id)),
            Entry::Vacant(slot) => {
                slot.insert(reservation);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        self.availability.check()?;
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    /// Reservations made by `requester`, oldest first.
    pub fn for_requester(&self, requester: &str) -> Result<Vec<Reservation>, StoreError> {
        self.availability.check()?;
        let mut found: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.requester_id == requester)
            .map(|row| row.clone())
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    /// Reservations against `resource`, oldest first.
    pub fn for_resource(&self, resource: &str) -> Result<Vec<Reservation>, StoreError> {
        self.availability.check()?;
        let mut found: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.resource_id == resource)
            .map(|row| row.clone())
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    /// Count of reservations per status.
    pub fn count(&self, status: ReservationStatus) -> usize {
        self.rows.iter().filter(|row| row.status == status).count()
    }

    /// Move reservation `id` to `to` if the edge is allowed.
    pub fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<Transition<ReservationStatus>, StoreError> {
        self.availability.check()?;
        let mut row = self.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let from = row.status;

        if from == to {
            debug!(reservation = %id, status = ?from, "reservation already in requested status");
            return Ok(Transition::Unchanged(from));
        }
        if !reservation_edge(from, to) {
            warn!(
                reservation = %id,
                from = ?from,
                to = ?to,
                "rejected reservation transition"
            );
            return Ok(Transition::Unchanged(from));
        }

        row.status = to;
        Ok(Transition::Applied { from, to })
    }
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Settlement table, keyed by reservation (one settlement per reservation).
#[derive(Debug)]
pub struct SettlementStore {
    rows: DashMap<ReservationId, Settlement>,
    availability: Availability,
}

impl SettlementStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            availability: Availability::new("settlements"),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    /// The reservation's settlement, created `Pending` on first call.
    pub fn get_or_create(&self, reservation: &Reservation) -> Result<Settlement, StoreError> {
        self.availability.check()?;
        let row = self
            .rows
            .entry(reservation.id)
            .or_insert_with(|| Settlement::pending(reservation));
        Ok(row.clone())
    }

    pub fn get(&self, reservation: ReservationId) -> Result<Option<Settlement>, StoreError> {
        self.availability.check()?;
        Ok(self.rows.get(&reservation).map(|row| row.clone()))
    }

    /// Number of settlement records.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn mark_processing(
        &self,
        reservation: ReservationId,
    ) -> Result<Transition<SettlementStatus>, StoreError> {
        self.update(reservation, SettlementStatus::Processing, |_| {})
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retry(
        &self,
        reservation: ReservationId,
        error: &str,
    ) -> Result<Transition<SettlementStatus>, StoreError> {
        self.update(reservation, SettlementStatus::Pending, |row| {
            row.last_error = Some(error.to_string());
        })
    }

    pub fn complete(
        &self,
        reservation: ReservationId,
        receipt: String,
    ) -> Result<Transition<SettlementStatus>, StoreError> {
        self.update(reservation, SettlementStatus::Completed, |row| {
            row.receipt = Some(receipt);
            row.last_error = None;
            row.processed_at = Some(Utc::now());
        })
    }

    pub fn fail(
        &self,
        reservation: ReservationId,
        error: Option<&str>,
    ) -> Result<Transition<SettlementStatus>, StoreError> {
        self.update(reservation, SettlementStatus::Failed, |row| {
            if let Some(error) = error {
                row.last_error = Some(error.to_string());
            }
            row.processed_at = Some(Utc::now());
        })
    }

    fn update(
        &self,
        reservation: ReservationId,
        to: SettlementStatus,
        apply: impl FnOnce(&mut Settlement),
    ) -> Result<Transition<SettlementStatus>, StoreError> {
        self.availability.check()?;
        let mut row = self
            .rows
            .get_mut(&reservation)
            .ok_or(StoreError::NotFound(reservation))?;
        let from = row.status;

        if from == to && from.is_terminal() {
            return Ok(Transition::Unchanged(from));
        }
        if from != to && !settlement_edge(from, to) {
            warn!(
                reservation = %reservation,
                settlement = %row.id,
                from = ?from,
                to = ?to,
                "rejected settlement transition"
            );
            return Ok(Transition::Unchanged(from));
        }

        row.status = to;
        apply(&mut row);
        Ok(Transition::Applied { from, to })
    }
}

impl Default for SettlementStore {
    fn default() -> Self {
        Self::new()
    }
}
