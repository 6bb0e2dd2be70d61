//! External settlement (payment) gateway.
//!
//! [`SimulatedGateway`] stands in for a real processor: it sleeps for a random
//! latency and fails with a configured probability, either timing out or
//! declining. Like real processors it deduplicates charges by idempotency key.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::Amount;
use crate::config::GatewayConfig;
use crate::model::{RequesterId, ReservationId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("charge declined: {0}")]
    Declined(String),
    #[error("gateway timeout")]
    Timeout,
}

/// What the gateway is asked to collect.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub reservation_id: ReservationId,
    pub requester_id: RequesterId,
    pub amount: Amount,
    /// Repeated charges with one key collect at most once.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub reference: String,
}

#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<Receipt, GatewayError>;
}

pub struct SimulatedGateway {
    config: GatewayConfig,
    /// Successful charges by idempotency key.
    charges: DashMap<String, Receipt>,
}

impl SimulatedGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            charges: DashMap::new(),
        }
    }

    /// Instant, always-successful gateway.
    pub fn reliable() -> Self {
        Self::new(GatewayConfig {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            failure_rate: 0.0,
        })
    }

    /// Number of distinct successful charges.
    pub fn charges(&self) -> usize {
        self.charges.len()
    }

    fn roll(&self) -> (Duration, Option<GatewayError>) {
        let lo = self.config.min_latency.min(self.config.max_latency);
        let hi = self.config.min_latency.max(self.config.max_latency);
        let mut rng = rand::thread_rng();
        let latency = if lo == hi {
            lo
        } else {
            Duration::from_millis(rng.gen_range(lo.as_millis() as u64..=hi.as_millis() as u64))
        };
        let failure = rng
            .gen_bool(self.config.failure_rate.clamp(0.0, 1.0))
            .then(|| {
                if rng.gen_bool(0.5) {
                    GatewayError::Timeout
                } else {
                    GatewayError::Declined("simulated processor failure".into())
                }
            });
        (latency, failure)
    }
}

#[async_trait]
impl SettlementGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<Receipt, GatewayError> {
        if let Some(existing) = self.charges.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let (latency, failure) = self.roll();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let receipt = self
            .charges
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| Receipt {
                reference: format!("sim_{}", Uuid::new_v4()),
            })
            .clone();
        info!(
            reservation = %request.reservation_id,
            requester = %request.requester_id,
            amount = %request.amount,
            reference = %receipt.reference,
            "charge collected"
        );
        Ok(receipt)
    }
}
