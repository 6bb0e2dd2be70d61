pub mod amount;
pub mod backend;
pub mod config;
pub mod csv;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod queue;
pub mod reservation;

pub use amount::Amount;
pub use config::Config;
pub use engine::{Engine, PurchaseError, PurchaseRequest, Reply};
pub use model::{
    NewResource, Reservation, ReservationId, ReservationStatus, Resource, ResourceId,
    ResourceSummary, Settlement, SettlementStatus,
};
