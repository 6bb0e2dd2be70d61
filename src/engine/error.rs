//! Error types for purchase orchestration and settlement.

use thiserror::Error;

use crate::backend::BackendError;
use crate::ledger::LedgerError;
use crate::model::{ReservationId, ReservationStatus, ResourceId};
use crate::queue::QueueError;
use crate::reservation::StoreError;

/// Error returned by [`Engine::purchase`](super::Engine::purchase) and
/// [`Engine::reserve`](super::Engine::reserve).
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("quantity must be at least 1, got {0}")]
    InvalidQuantity(u32),

    #[error("resource {0} not found")]
    UnknownResource(ResourceId),

    #[error("insufficient inventory for {resource}: available {available}, requested {requested}")]
    InsufficientInventory {
        resource: ResourceId,
        available: u32,
        requested: u32,
    },

    #[error("price of {quantity} units of {resource} overflows")]
    PriceOverflow { resource: ResourceId, quantity: u32 },

    #[error("lock {0} not acquired in time")]
    LockTimeout(String),

    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),

    #[error("ledger rejected update: {0}")]
    Ledger(LedgerError),

    #[error("reservation store rejected update: {0}")]
    Store(StoreError),

    #[error("failed to encode response: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PurchaseError {
    /// Terminal outcomes that are replayed to duplicate requests. Transient
    /// failures are retried fresh instead.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Self::UnknownResource(_) | Self::InsufficientInventory { .. }
        )
    }

    /// Transport status the orchestration layer maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidQuantity(_) | Self::PriceOverflow { .. } => 400,
            Self::UnknownResource(_) => 404,
            Self::InsufficientInventory { .. } => 409,
            Self::LockTimeout(_) | Self::BackendUnavailable(_) => 503,
            Self::Ledger(_) | Self::Store(_) | Self::Encoding(_) => 500,
        }
    }

    /// Short machine-readable name.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::UnknownResource(_) => "unknown_resource",
            Self::InsufficientInventory { .. } => "insufficient_inventory",
            Self::PriceOverflow { .. } => "price_overflow",
            Self::LockTimeout(_) => "lock_timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Ledger(_) => "ledger_error",
            Self::Store(_) => "store_error",
            Self::Encoding(_) => "encoding_error",
        }
    }
}

impl From<LedgerError> for PurchaseError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(resource) => Self::UnknownResource(resource),
            LedgerError::InsufficientInventory {
                resource,
                available,
                requested,
            } => Self::InsufficientInventory {
                resource,
                available,
                requested,
            },
            LedgerError::ZeroQuantity => Self::InvalidQuantity(0),
            LedgerError::Backend(e) => Self::BackendUnavailable(e),
            other => Self::Ledger(other),
        }
    }
}

impl From<StoreError> for PurchaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Backend(e) => Self::BackendUnavailable(e),
            other => Self::Store(other),
        }
    }
}

impl From<QueueError> for PurchaseError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Backend(e) => Self::BackendUnavailable(e),
        }
    }
}

/// Failure while cancelling a reservation and returning its units. Always
/// re-driven until it succeeds.
#[derive(Debug, Error)]
pub enum CompensationError {
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    #[error("lock {0} not acquired in time")]
    LockTimeout(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("restoring inventory failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("updating reservation or settlement failed: {0}")]
    Store(#[from] StoreError),
}

/// Error returned by [`Engine::release`](super::Engine::release).
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    #[error("reservation {id} is already {status:?}")]
    AlreadyFinal {
        id: ReservationId,
        status: ReservationStatus,
    },

    #[error("lock {0} not acquired in time")]
    LockTimeout(String),

    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),

    #[error("release incomplete, compensation scheduled: {0}")]
    Compensation(#[from] CompensationError),
}

impl From<StoreError> for ReleaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Backend(e) => Self::BackendUnavailable(e),
            other => Self::Compensation(CompensationError::Store(other)),
        }
    }
}

/// Error from read-side queries and catalog passthrough.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
