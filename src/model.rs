//! Core domain types: sellable resources, reservations against them, and the
//! settlements that finalize reservations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// Resource identifier (an event's slug).
pub type ResourceId = String;

/// Buyer identifier.
pub type RequesterId = String;

/// Reservation identifier.
pub type ReservationId = Uuid;

/// Settlement identifier.
pub type SettlementId = Uuid;

/// A finite pool of sellable units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub total_units: u32,
    /// Always within `0..=total_units`.
    pub available_units: u32,
    pub unit_price: Amount,
    pub created_at: DateTime<Utc>,
}

/// Administrative input for [`Ledger::create_resource`](crate::ledger::Ledger::create_resource).
#[derive(Debug, Clone)]
pub struct NewResource {
    pub id: ResourceId,
    pub name: String,
    pub total_units: u32,
    pub unit_price: Amount,
}

impl NewResource {
    pub fn new(id: impl Into<ResourceId>, total_units: u32, unit_price: Amount) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            total_units,
            unit_price,
        }
    }
}

/// Lifecycle of a reservation.
///
/// `Pending` is the logical pre-state of a purchase request; a persisted
/// reservation always starts at `Reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Reserved,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled)
    }
}

/// A claim on `quantity` units of a resource, pending settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub quantity: u32,
    /// Total price of the reservation (`unit_price * quantity`).
    pub price: Amount,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The payment finalizing a reservation. At most one exists per reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub reservation_id: ReservationId,
    pub requester_id: RequesterId,
    pub amount: Amount,
    pub status: SettlementStatus,
    /// Gateway reference of the successful charge.
    pub receipt: Option<String>,
    /// Last recorded gateway error, kept while retries remain.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Settlement {
    /// Create a new settlement in the `Pending` state.
    pub fn pending(reservation: &Reservation) -> Self {
        Self {
            id: Uuid::new_v4(),
            reservation_id: reservation.id,
            requester_id: reservation.requester_id.clone(),
            amount: reservation.price,
            status: SettlementStatus::Pending,
            receipt: None,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Per-resource sales figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub resource: ResourceId,
    pub total_units: u32,
    pub available_units: u32,
    /// Units in confirmed reservations.
    pub confirmed_units: u32,
    /// Units in cancelled reservations.
    pub cancelled_units: u32,
    /// Sum of confirmed reservation prices.
    pub revenue: Amount,
}
