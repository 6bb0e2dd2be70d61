//! Settlement, expiry and compensation jobs.
//!
//! Every handler runs under the reservation's lock so a charge, an expiry and
//! a release for one reservation never interleave. Each step checks current
//! state before acting, so a redelivered job converges instead of repeating
//! side effects.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::Core;
use super::error::{CompensationError, ReleaseError};
use crate::events::InventoryEvent;
use crate::gateway::ChargeRequest;
use crate::ledger::Restore;
use crate::model::{Reservation, ReservationId, ReservationStatus, SettlementStatus};
use crate::queue::{Job, JobError, JobHandler, SettlementJob};
use crate::reservation::StoreError;

/// Queue handler driving reservations to `Confirmed` or `Cancelled`.
pub struct SettlementWorker {
    core: Arc<Core>,
}

impl SettlementWorker {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl JobHandler for SettlementWorker {
    async fn run(&self, job: &Job, attempt: u32) -> Result<(), JobError> {
        let key = Core::reservation_lock_key(job.reservation_id());
        let token = match self.core.locks.lock(&key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(JobError::new(format!("lock {key} not acquired in time"))),
            Err(e) => return Err(JobError::new(e.to_string())),
        };

        let result = match job {
            Job::Settle(settle) => self.core.settle_locked(settle, attempt).await,
            Job::Expire { reservation_id } => self.core.expire_locked(*reservation_id).await,
            Job::Compensate {
                reservation_id,
                reason,
            } => self.core.compensate_locked(*reservation_id, reason).await,
        };

        self.core.unlock(&key, token).await;
        result
    }

    async fn exhausted(&self, job: &Job, error: &JobError) {
        let Job::Settle(settle) = job else {
            error!(reservation = %job.reservation_id(), reason = %error, "job gave up");
            return;
        };

        let reason = format!("settlement failed: {error}");
        if let Err(e) = self.core.cancel(settle.reservation_id, &reason).await {
            warn!(
                reservation = %settle.reservation_id,
                reason = %e,
                "compensation incomplete, scheduling re-drive"
            );
            self.core.schedule_compensation(settle.reservation_id, &reason);
        }
    }
}

impl Core {
    async fn settle_locked(&self, job: &SettlementJob, attempt: u32) -> Result<(), JobError> {
        let id = job.reservation_id;
        let Some(reservation) = self.reservations.get(id).map_err(job_error)? else {
            warn!(reservation = %id, "settlement for unknown reservation dropped");
            return Ok(());
        };
        let settlement = self.settlements.get_or_create(&reservation).map_err(job_error)?;

        // redelivery after the charge went through
        if settlement.status == SettlementStatus::Completed {
            self.confirm(&reservation).map_err(job_error)?;
            return Ok(());
        }
        match reservation.status {
            ReservationStatus::Cancelled => {
                self.settlements
                    .fail(id, Some("reservation cancelled"))
                    .map_err(job_error)?;
                info!(reservation = %id, "reservation cancelled before settlement");
                return Ok(());
            }
            ReservationStatus::Confirmed => return Ok(()),
            ReservationStatus::Pending | ReservationStatus::Reserved => {}
        }

        // a rollback or an earlier compensation already put the units back
        if self
            .ledger
            .is_restored(&reservation.resource_id, id)
            .await
            .map_err(job_error)?
        {
            warn!(reservation = %id, "inventory already returned, cancelling instead of charging");
            self.cancel_locked(&reservation, "inventory already returned")
                .await
                .map_err(job_error)?;
            return Ok(());
        }

        self.settlements.mark_processing(id).map_err(job_error)?;
        let charge = ChargeRequest {
            reservation_id: id,
            requester_id: job.requester_id.clone(),
            amount: job.amount,
            idempotency_key: job.idempotency_key.clone(),
        };
        match self.gateway.charge(&charge).await {
            Ok(receipt) => {
                self.settlements
                    .complete(id, receipt.reference)
                    .map_err(job_error)?;
                self.confirm(&reservation).map_err(job_error)?;
                info!(
                    reservation = %id,
                    resource = %job.resource_id,
                    amount = %job.amount,
                    attempt,
                    "settlement completed"
                );
                self.events
                    .publish(InventoryEvent::SettlementCompleted { reservation: id });
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(e) = self.settlements.record_retry(id, &message) {
                    warn!(reservation = %id, reason = %e, "settlement retry not recorded");
                }
                Err(JobError::new(message))
            }
        }
    }

    async fn expire_locked(&self, id: ReservationId) -> Result<(), JobError> {
        let Some(reservation) = self.reservations.get(id).map_err(job_error)? else {
            return Ok(());
        };
        if reservation.status != ReservationStatus::Reserved {
            return Ok(());
        }
        info!(reservation = %id, "reservation expired");
        self.cancel_locked(&reservation, "reservation expired")
            .await
            .map(|_| ())
            .map_err(job_error)
    }

    async fn compensate_locked(&self, id: ReservationId, reason: &str) -> Result<(), JobError> {
        let Some(reservation) = self.reservations.get(id).map_err(job_error)? else {
            warn!(reservation = %id, "compensation for unknown reservation dropped");
            return Ok(());
        };
        self.cancel_locked(&reservation, reason)
            .await
            .map(|_| ())
            .map_err(job_error)
    }

    /// Cancel under the reservation lock. Fails if the lock cannot be taken
    /// or any step fails; every step is safe to re-run.
    async fn cancel(&self, id: ReservationId, reason: &str) -> Result<Reservation, CompensationError> {
        let key = Self::reservation_lock_key(id);
        let token = self
            .locks
            .lock(&key)
            .await?
            .ok_or_else(|| CompensationError::LockTimeout(key.clone()))?;

        let result = match self.reservations.get(id) {
            Ok(Some(reservation)) => self.cancel_locked(&reservation, reason).await,
            Ok(None) => Err(CompensationError::NotFound(id)),
            Err(e) => Err(e.into()),
        };

        self.unlock(&key, token).await;
        result
    }

    /// Return the reservation's units and mark it and its settlement final.
    ///
    /// Units are restored before the reservation leaves `Reserved`, so a
    /// `Cancelled` reservation never holds units. A reservation whose charge
    /// already went through is confirmed instead.
    async fn cancel_locked(
        &self,
        reservation: &Reservation,
        reason: &str,
    ) -> Result<Reservation, CompensationError> {
        let id = reservation.id;
        if reservation.status == ReservationStatus::Confirmed {
            return Ok(reservation.clone());
        }
        if self.is_settled(id)? {
            warn!(reservation = %id, "settlement already completed, confirming instead of cancelling");
            self.confirm(reservation)?;
            return Ok(self.reservations.get(id)?.unwrap_or_else(|| reservation.clone()));
        }

        let restored = self
            .ledger
            .restore(&reservation.resource_id, reservation.quantity, id)
            .await?;
        if let Restore::Applied(available) = restored {
            self.events.publish(InventoryEvent::LedgerChanged {
                resource: reservation.resource_id.clone(),
                available,
            });
        }

        if self
            .reservations
            .transition(id, ReservationStatus::Cancelled)?
            .is_applied()
        {
            info!(
                reservation = %id,
                resource = %reservation.resource_id,
                quantity = reservation.quantity,
                available = restored.available(),
                reason,
                "reservation cancelled"
            );
            self.events.publish(InventoryEvent::ReservationCancelled {
                reservation: id,
                resource: reservation.resource_id.clone(),
                quantity: reservation.quantity,
            });
        }

        // a settlement may not exist if recording the reservation failed
        if self.settlements.get(id)?.is_some()
            && self.settlements.fail(id, Some(reason))?.is_applied()
        {
            self.events.publish(InventoryEvent::SettlementFailed {
                reservation: id,
                reason: reason.to_string(),
            });
        }

        Ok(self.reservations.get(id)?.unwrap_or_else(|| reservation.clone()))
    }

    fn is_settled(&self, id: ReservationId) -> Result<bool, StoreError> {
        Ok(self
            .settlements
            .get(id)?
            .is_some_and(|settlement| settlement.status == SettlementStatus::Completed))
    }

    fn confirm(&self, reservation: &Reservation) -> Result<(), StoreError> {
        if self
            .reservations
            .transition(reservation.id, ReservationStatus::Confirmed)?
            .is_applied()
        {
            info!(reservation = %reservation.id, "reservation confirmed");
        }
        Ok(())
    }

    pub(super) async fn release(&self, id: ReservationId) -> Result<Reservation, ReleaseError> {
        let key = Self::reservation_lock_key(id);
        let token = self
            .locks
            .lock(&key)
            .await?
            .ok_or_else(|| ReleaseError::LockTimeout(key.clone()))?;
        let result = self.release_locked(id).await;
        self.unlock(&key, token).await;
        result
    }

    async fn release_locked(&self, id: ReservationId) -> Result<Reservation, ReleaseError> {
        let reservation = self.reservations.get(id)?.ok_or(ReleaseError::NotFound(id))?;
        match reservation.status {
            ReservationStatus::Confirmed => Err(ReleaseError::AlreadyFinal {
                id,
                status: reservation.status,
            }),
            ReservationStatus::Cancelled => Ok(reservation),
            ReservationStatus::Pending | ReservationStatus::Reserved => {
                if self.is_settled(id)? {
                    self.confirm(&reservation)?;
                    return Err(ReleaseError::AlreadyFinal {
                        id,
                        status: ReservationStatus::Confirmed,
                    });
                }
                const REASON: &str = "released by requester";
                match self.cancel_locked(&reservation, REASON).await {
                    Ok(cancelled) => Ok(cancelled),
                    Err(e) => {
                        self.schedule_compensation(id, REASON);
                        Err(e.into())
                    }
                }
            }
        }
    }
}

fn job_error(e: impl std::fmt::Display) -> JobError {
    JobError::new(e.to_string())
}
