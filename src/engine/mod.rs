//! Purchase orchestration.
//!
//! A purchase runs as a linear pipeline:
//!
//! 1. derive the request fingerprint and replay a memoized response if any
//! 2. take the resource lock (bounded wait)
//! 3. re-check the memo, then decrement the ledger, record the reservation and
//!    its pending settlement, and enqueue the settlement and expiry jobs
//! 4. memoize the response, release the lock, return
//!
//! Settlement runs later on the queue's workers (see [`SettlementWorker`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::config::Config;
use crate::events::{EventBus, InventoryEvent};
use crate::gateway::{SettlementGateway, SimulatedGateway};
use crate::idempotency::{CachedResponse, Fingerprint, IdempotencyStore, InMemoryIdempotencyStore};
use crate::ledger::{InMemoryLedger, Ledger, LedgerError};
use crate::lock::{InMemoryLockStore, LockManager, LockStore, LockToken};
use crate::model::{
    NewResource, RequesterId, Reservation, ReservationId, ReservationStatus, Resource,
    ResourceId, ResourceSummary, Settlement,
};
use crate::queue::{Backoff, Job, JobOptions, QueueStats, SettlementJob, SettlementQueue, WorkerPool};
use crate::reservation::{ReservationStore, SettlementStore, StoreError};

mod error;
pub use error::{CompensationError, EngineError, PurchaseError, ReleaseError};

mod settlement;
pub use settlement::SettlementWorker;

/// Operation path mixed into derived fingerprints.
const PURCHASE_OPERATION: &str = "/tickets/purchase";

/// A buyer's request for units of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub quantity: u32,
    /// Client-supplied idempotency key. Derived from the request when absent.
    pub idempotency_key: Option<String>,
}

impl PurchaseRequest {
    pub fn new(resource_id: impl Into<ResourceId>, requester_id: impl Into<RequesterId>) -> Self {
        Self {
            resource_id: resource_id.into(),
            requester_id: requester_id.into(),
            quantity: 1,
            idempotency_key: None,
        }
    }

    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        #[derive(Serialize)]
        struct Payload<'a> {
            resource: &'a str,
            quantity: u32,
        }

        match &self.idempotency_key {
            Some(key) => Ok(Fingerprint::client_supplied(&self.requester_id, key)),
            None => Fingerprint::derive(
                &self.requester_id,
                PURCHASE_OPERATION,
                &Payload {
                    resource: &self.resource_id,
                    quantity: self.quantity,
                },
            ),
        }
    }
}

/// Body of an accepted purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseBody {
    pub reservation: Reservation,
    pub status: String,
    pub message: String,
}

/// Body of a rejected purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Transport-ready purchase outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    /// Served from the idempotency store.
    pub replayed: bool,
}

impl Reply {
    fn fresh(response: CachedResponse) -> Self {
        Self {
            status: response.status,
            body: response.body,
            replayed: false,
        }
    }

    fn replayed(response: CachedResponse) -> Self {
        Self {
            status: response.status,
            body: response.body,
            replayed: true,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == 202
    }

    /// Decode an accepted body.
    pub fn purchase(&self) -> Option<PurchaseBody> {
        if !self.is_accepted() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Decode a rejection body.
    pub fn error(&self) -> Option<ErrorBody> {
        if self.is_accepted() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

/// A reservation together with its settlement, if one was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub settlement: Option<Settlement>,
}

/// Services shared by request handlers and settlement workers.
pub(crate) struct Core {
    config: Config,
    locks: LockManager,
    idempotency: Arc<dyn IdempotencyStore>,
    ledger: Arc<dyn Ledger>,
    reservations: Arc<ReservationStore>,
    settlements: Arc<SettlementStore>,
    queue: SettlementQueue,
    gateway: Arc<dyn SettlementGateway>,
    events: EventBus,
}

impl Core {
    fn resource_lock_key(resource: &str) -> String {
        format!("resource:{resource}:inventory")
    }

    fn reservation_lock_key(reservation: ReservationId) -> String {
        format!("reservation:{reservation}")
    }

    fn settle_options(&self) -> JobOptions {
        let settlement = &self.config.settlement;
        JobOptions::new(
            settlement.attempts,
            Backoff::Exponential {
                base: settlement.backoff_base,
                max: settlement.backoff_max,
            },
        )
    }

    /// Expiry and compensation must eventually succeed: retry indefinitely.
    fn compensate_options(&self) -> JobOptions {
        let settlement = &self.config.settlement;
        JobOptions::new(
            u32::MAX,
            Backoff::Exponential {
                base: settlement.backoff_base,
                max: settlement.backoff_max,
            },
        )
    }

    async fn unlock(&self, key: &str, token: LockToken) {
        if let Err(e) = self.locks.release(key, token).await {
            // the lock expires on its own once the backend is back
            warn!(key, reason = %e, "failed to release lock");
        }
    }

    /// Steps 3-4 of the pipeline, run under the resource lock.
    async fn purchase_locked(
        &self,
        request: &PurchaseRequest,
        fingerprint: &Fingerprint,
    ) -> Result<Reply, PurchaseError> {
        // a duplicate may have completed while we waited for the lock
        if let Some(cached) = self.idempotency.lookup(fingerprint).await? {
            debug!(fingerprint = %fingerprint, "replaying response memoized while waiting");
            return Ok(Reply::replayed(cached));
        }

        let response = match self.reserve_locked(request, Some(fingerprint)).await {
            Ok(reservation) => CachedResponse {
                status: 202,
                body: serde_json::to_string(&PurchaseBody {
                    reservation,
                    status: "processing".to_string(),
                    message: "Reservation created. Settlement is being processed.".to_string(),
                })?,
            },
            Err(e) if e.is_cacheable() => CachedResponse {
                status: e.status_code(),
                body: serde_json::to_string(&ErrorBody {
                    error: e.to_string(),
                    code: e.code().to_string(),
                })?,
            },
            Err(e) => return Err(e),
        };

        let ttl = self.config.idempotency.ttl;
        if let Err(e) = self
            .idempotency
            .store(fingerprint, response.clone(), ttl)
            .await
        {
            // the side effect already happened; failing here would invite a
            // duplicate purchase
            warn!(fingerprint = %fingerprint, reason = %e, "response not memoized");
        }
        Ok(Reply::fresh(response))
    }

    async fn reserve_locked(
        &self,
        request: &PurchaseRequest,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<Reservation, PurchaseError> {
        let resource = self
            .ledger
            .get_resource(&request.resource_id)
            .await?
            .ok_or_else(|| PurchaseError::UnknownResource(request.resource_id.clone()))?;
        let price = resource.unit_price.checked_mul(request.quantity).ok_or_else(|| {
            PurchaseError::PriceOverflow {
                resource: resource.id.clone(),
                quantity: request.quantity,
            }
        })?;

        let available = self
            .ledger
            .try_decrement(&resource.id, request.quantity)
            .await?;

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.config.reservation.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let reservation = Reservation {
            id: Uuid::new_v4(),
            resource_id: resource.id.clone(),
            requester_id: request.requester_id.clone(),
            quantity: request.quantity,
            price,
            status: ReservationStatus::Reserved,
            created_at: now,
            expires_at,
        };

        if let Err(e) = self.record_reservation(&reservation, fingerprint) {
            warn!(
                reservation = %reservation.id,
                resource = %reservation.resource_id,
                reason = %e,
                "reservation not recorded, rolling back"
            );
            self.roll_back(&reservation).await;
            return Err(e);
        }

        info!(
            reservation = %reservation.id,
            resource = %reservation.resource_id,
            requester = %reservation.requester_id,
            quantity = reservation.quantity,
            price = %reservation.price,
            available,
            "reservation created"
        );
        self.events.publish(InventoryEvent::Reserved {
            reservation: reservation.id,
            resource: reservation.resource_id.clone(),
            quantity: reservation.quantity,
        });
        self.events.publish(InventoryEvent::LedgerChanged {
            resource: reservation.resource_id.clone(),
            available,
        });
        Ok(reservation)
    }

    /// Persist the reservation, its pending settlement and its jobs.
    fn record_reservation(
        &self,
        reservation: &Reservation,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<(), PurchaseError> {
        self.reservations.insert(reservation.clone())?;
        self.settlements.get_or_create(reservation)?;

        let idempotency_key = match fingerprint {
            Some(fingerprint) => fingerprint.to_string(),
            None => format!("reservation:{}", reservation.id),
        };
        self.queue.enqueue(
            Job::Settle(SettlementJob {
                reservation_id: reservation.id,
                resource_id: reservation.resource_id.clone(),
                requester_id: reservation.requester_id.clone(),
                quantity: reservation.quantity,
                amount: reservation.price,
                idempotency_key,
            }),
            self.settle_options(),
        )?;
        self.queue.enqueue(
            Job::Expire {
                reservation_id: reservation.id,
            },
            self.compensate_options()
                .delayed(self.config.reservation.ttl),
        )?;
        Ok(())
    }

    /// Undo a half-recorded reservation. Units go back first; a settle job
    /// that did get enqueued then finds the units returned and cancels
    /// instead of charging. Any step that fails is re-driven by a
    /// compensation job.
    async fn roll_back(&self, reservation: &Reservation) {
        const REASON: &str = "purchase rolled back";
        let id = reservation.id;

        if let Err(e) = self
            .ledger
            .restore(&reservation.resource_id, reservation.quantity, id)
            .await
        {
            error!(
                reservation = %id,
                resource = %reservation.resource_id,
                reason = %e,
                "rollback could not restore inventory, scheduling compensation"
            );
            self.schedule_compensation(id, REASON);
            return;
        }
        match self.reservations.transition(id, ReservationStatus::Cancelled) {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                error!(
                    reservation = %id,
                    reason = %e,
                    "rollback could not cancel reservation, scheduling compensation"
                );
                self.schedule_compensation(id, REASON);
                return;
            }
        }
        match self.settlements.fail(id, Some(REASON)) {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                error!(
                    reservation = %id,
                    reason = %e,
                    "rollback could not fail settlement, scheduling compensation"
                );
                self.schedule_compensation(id, REASON);
            }
        }
    }

    fn schedule_compensation(&self, reservation_id: ReservationId, reason: &str) {
        let job = Job::Compensate {
            reservation_id,
            reason: reason.to_string(),
        };
        if let Err(e) = self.queue.enqueue(job, self.compensate_options()) {
            error!(
                reservation = %reservation_id,
                reason = %e,
                "compensation not scheduled, reservation needs manual repair"
            );
        }
    }
}

/// Entry point for buyers and administrators. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    core: Arc<Core>,
    workers: Arc<Mutex<Option<WorkerPool>>>,
}

/// Public API
impl Engine {
    /// Engine over in-memory stores and a [`SimulatedGateway`].
    pub fn new(config: Config) -> Self {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Start the settlement workers. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_none() {
            let handler = Arc::new(SettlementWorker::new(self.core.clone()));
            *workers = Some(self.core.queue.start(handler, self.core.config.settlement.workers));
        }
    }

    /// Stop the settlement workers after their current job. Queued jobs stay
    /// queued.
    pub async fn shutdown(&self) {
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }

    /// Wait until every settlement and compensation job has finished.
    pub async fn wait_settled(&self) {
        self.core.queue.wait_settled().await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InventoryEvent> {
        self.core.events.subscribe()
    }

    pub async fn create_resource(&self, resource: NewResource) -> Result<Resource, LedgerError> {
        self.core.ledger.create_resource(resource).await
    }

    pub async fn get_resource(&self, id: &str) -> Result<Option<Resource>, LedgerError> {
        self.core.ledger.get_resource(id).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, LedgerError> {
        self.core.ledger.list_resources().await
    }

    /// Idempotent purchase. Duplicates of a request (same fingerprint) get the
    /// first terminal response replayed byte for byte. Lock timeouts and
    /// backend outages are returned as errors and never memoized.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<Reply, PurchaseError> {
        if request.quantity == 0 {
            return Err(PurchaseError::InvalidQuantity(0));
        }
        let core = &self.core;
        let fingerprint = request.fingerprint()?;

        if let Some(cached) = core.idempotency.lookup(&fingerprint).await? {
            debug!(fingerprint = %fingerprint, "replaying memoized response");
            return Ok(Reply::replayed(cached));
        }

        let key = Core::resource_lock_key(&request.resource_id);
        let token = core
            .locks
            .lock(&key)
            .await?
            .ok_or_else(|| PurchaseError::LockTimeout(key.clone()))?;
        let result = core.purchase_locked(&request, &fingerprint).await;
        core.unlock(&key, token).await;

        Self::log_result(&request, &result);
        result
    }

    /// Reserve without idempotency memoization.
    pub async fn reserve(&self, request: &PurchaseRequest) -> Result<Reservation, PurchaseError> {
        if request.quantity == 0 {
            return Err(PurchaseError::InvalidQuantity(0));
        }
        let core = &self.core;
        let key = Core::resource_lock_key(&request.resource_id);
        let token = core
            .locks
            .lock(&key)
            .await?
            .ok_or_else(|| PurchaseError::LockTimeout(key.clone()))?;
        let result = core.reserve_locked(request, None).await;
        core.unlock(&key, token).await;
        result
    }

    /// Run a stream of purchases concurrently, returning each request with
    /// its outcome in submission order.
    pub async fn run(
        &self,
        mut stream: impl Stream<Item = PurchaseRequest> + Unpin,
    ) -> Vec<(PurchaseRequest, Result<Reply, PurchaseError>)> {
        let mut handles = Vec::new();
        while let Some(request) = stream.next().await {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                let result = engine.purchase(request.clone()).await;
                (request, result)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(reason = %e, "purchase task failed"),
            }
        }
        outcomes
    }

    pub async fn reservation_status(
        &self,
        id: ReservationId,
    ) -> Result<Option<ReservationView>, EngineError> {
        let Some(reservation) = self.core.reservations.get(id)? else {
            return Ok(None);
        };
        let settlement = self.core.settlements.get(id)?;
        Ok(Some(ReservationView {
            reservation,
            settlement,
        }))
    }

    /// Reservations made by `requester`, oldest first.
    pub fn reservations_for(&self, requester: &str) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.core.reservations.for_requester(requester)?)
    }

    /// Sales figures for every resource, sorted by id.
    pub async fn summary(&self) -> Result<Vec<ResourceSummary>, EngineError> {
        let mut summaries = Vec::new();
        for resource in self.core.ledger.list_resources().await? {
            let mut summary = ResourceSummary {
                resource: resource.id.clone(),
                total_units: resource.total_units,
                available_units: resource.available_units,
                confirmed_units: 0,
                cancelled_units: 0,
                revenue: Amount::ZERO,
            };
            for reservation in self.core.reservations.for_resource(&resource.id)? {
                match reservation.status {
                    ReservationStatus::Confirmed => {
                        summary.confirmed_units += reservation.quantity;
                        summary.revenue += reservation.price;
                    }
                    ReservationStatus::Cancelled => {
                        summary.cancelled_units += reservation.quantity;
                    }
                    ReservationStatus::Pending | ReservationStatus::Reserved => {}
                }
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub fn reservation_count(&self, status: ReservationStatus) -> usize {
        self.core.reservations.count(status)
    }

    /// Cancel a reservation that has not been settled and return its units.
    pub async fn release(&self, id: ReservationId) -> Result<Reservation, ReleaseError> {
        self.core.release(id).await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.core.queue.stats()
    }

    pub fn queue(&self) -> &SettlementQueue {
        &self.core.queue
    }
}

/// Private API
impl Engine {
    fn log_result(request: &PurchaseRequest, result: &Result<Reply, PurchaseError>) {
        match result {
            Ok(reply) if reply.replayed => {
                info!(
                    resource = %request.resource_id,
                    requester = %request.requester_id,
                    status = reply.status,
                    "purchase replayed"
                );
            }
            Ok(reply) => {
                info!(
                    resource = %request.resource_id,
                    requester = %request.requester_id,
                    quantity = request.quantity,
                    status = reply.status,
                    "purchase handled"
                );
            }
            Err(e) => {
                info!(
                    resource = %request.resource_id,
                    requester = %request.requester_id,
                    quantity = request.quantity,
                    reason = %e,
                    "purchase rejected"
                );
            }
        }
    }
}

/// Wires an [`Engine`] from injectable collaborators; anything not supplied is
/// in-memory.
pub struct EngineBuilder {
    config: Config,
    lock_store: Option<Arc<dyn LockStore>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    ledger: Option<Arc<dyn Ledger>>,
    reservations: Option<Arc<ReservationStore>>,
    settlements: Option<Arc<SettlementStore>>,
    queue: Option<SettlementQueue>,
    gateway: Option<Arc<dyn SettlementGateway>>,
    events: Option<EventBus>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lock_store: None,
            idempotency: None,
            ledger: None,
            reservations: None,
            settlements: None,
            queue: None,
            gateway: None,
            events: None,
        }
    }

    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    pub fn idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn reservations(mut self, store: Arc<ReservationStore>) -> Self {
        self.reservations = Some(store);
        self
    }

    pub fn settlements(mut self, store: Arc<SettlementStore>) -> Self {
        self.settlements = Some(store);
        self
    }

    pub fn queue(mut self, queue: SettlementQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn SettlementGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let lock_store = self
            .lock_store
            .unwrap_or_else(|| Arc::new(InMemoryLockStore::new()));
        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(SimulatedGateway::new(config.gateway.clone())));

        let core = Core {
            locks: LockManager::new(lock_store, config.lock.clone()),
            idempotency: self
                .idempotency
                .unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new())),
            ledger: self.ledger.unwrap_or_else(|| Arc::new(InMemoryLedger::new())),
            reservations: self.reservations.unwrap_or_default(),
            settlements: self.settlements.unwrap_or_default(),
            queue: self.queue.unwrap_or_default(),
            gateway,
            events: self.events.unwrap_or_default(),
            config,
        };
        Engine {
            core: Arc::new(core),
            workers: Arc::new(Mutex::new(None)),
        }
    }
}
