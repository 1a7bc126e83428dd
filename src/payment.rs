use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use ulid::Ulid;

use crate::engine::now_ms;
use crate::model::{Amount, Ms, PaymentMethod};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved { transaction_id: String },
    Declined { reason: String },
}

/// Whatever takes the guest's money. The engine only needs a yes/no and a
/// transaction reference.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, booking_id: Ulid, amount: Amount, method: PaymentMethod) -> ChargeOutcome;
}

/// Stand-in gateway: waits `latency`, then approves with probability `success_rate`.
#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    success_rate: f64,
    latency: Duration,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64, latency: Duration) -> Self {
        let success_rate = if success_rate.is_finite() {
            success_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            success_rate,
            latency,
        }
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(0.9, Duration::from_secs(2))
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, booking_id: Ulid, amount: Amount, method: PaymentMethod) -> ChargeOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let (approved, suffix) = {
            let mut rng = rand::rng();
            (rng.random_bool(self.success_rate), rng.random_range(0..10_000u32))
        };

        if approved {
            let transaction_id = transaction_id(now_ms(), suffix);
            tracing::debug!(
                "simulated {} charge of {amount} for booking {booking_id} approved: {transaction_id}",
                method.as_str()
            );
            ChargeOutcome::Approved { transaction_id }
        } else {
            tracing::debug!("simulated charge of {amount} for booking {booking_id} declined");
            ChargeOutcome::Declined {
                reason: "declined by simulated gateway".into(),
            }
        }
    }
}

/// `TXN<unix ms><0..9999>`.
pub fn transaction_id(at: Ms, suffix: u32) -> String {
    format!("TXN{at}{suffix}")
}
