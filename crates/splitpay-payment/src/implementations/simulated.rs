//! Simulated payment provider.
//!
//! Stands in for a real gateway: every attempt succeeds with a fixed
//! probability. Outcomes are reproducible when a seed is configured.

use crate::{PaymentError, PaymentInterface, PaymentOutcome, PaymentRequest};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Default probability that an attempt settles.
pub const DEFAULT_SUCCESS_RATE: f64 = 0.9;

pub struct SimulatedPayment {
	success_rate: f64,
	latency: Duration,
	rng: Mutex<StdRng>,
}

impl SimulatedPayment {
	/// Creates a provider settling with probability `success_rate`.
	pub fn new(success_rate: f64, latency: Duration, seed: Option<u64>) -> Result<Self, PaymentError> {
		if !(0.0..=1.0).contains(&success_rate) {
			return Err(PaymentError::Config(format!(
				"success_rate must be within [0, 1], got {}",
				success_rate
			)));
		}
		let rng = match seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		Ok(Self {
			success_rate,
			latency,
			rng: Mutex::new(rng),
		})
	}

	/// Provider that settles every attempt.
	pub fn always_settle() -> Self {
		Self {
			success_rate: 1.0,
			latency: Duration::ZERO,
			rng: Mutex::new(StdRng::seed_from_u64(0)),
		}
	}

	/// Provider that declines every attempt.
	pub fn always_decline() -> Self {
		Self {
			success_rate: 0.0,
			latency: Duration::ZERO,
			rng: Mutex::new(StdRng::seed_from_u64(0)),
		}
	}

	fn roll(&self) -> Result<bool, PaymentError> {
		let mut rng = self
			.rng
			.lock()
			.map_err(|_| PaymentError::Provider("simulator state poisoned".to_string()))?;
		Ok(rng.gen_bool(self.success_rate))
	}
}

#[async_trait]
impl PaymentInterface for SimulatedPayment {
	fn name(&self) -> &str {
		"simulated"
	}

	async fn attempt_payment(
		&self,
		request: &PaymentRequest,
	) -> Result<PaymentOutcome, PaymentError> {
		if !self.latency.is_zero() {
			tokio::time::sleep(self.latency).await;
		}

		if request.credentials.is_empty() {
			return Ok(PaymentOutcome::Declined {
				reason: "missing payment credentials".to_string(),
			});
		}

		if self.roll()? {
			Ok(PaymentOutcome::Settled {
				reference: format!("sim-{}", uuid::Uuid::new_v4()),
			})
		} else {
			Ok(PaymentOutcome::Declined {
				reason: "payment declined by issuer".to_string(),
			})
		}
	}
}

/// Factory function to create the simulated provider from configuration.
///
/// Configuration parameters:
/// - `success_rate`: probability an attempt settles (default: 0.9)
/// - `latency_ms`: artificial delay per attempt (default: 0)
/// - `seed`: fixed RNG seed for reproducible runs (optional)
pub fn create_payment(config: &toml::Value) -> Result<Box<dyn PaymentInterface>, PaymentError> {
	let success_rate = config
		.get("success_rate")
		.and_then(|v| v.as_float())
		.unwrap_or(DEFAULT_SUCCESS_RATE);
	let latency_ms = config
		.get("latency_ms")
		.and_then(|v| v.as_integer())
		.unwrap_or(0);
	if latency_ms < 0 {
		return Err(PaymentError::Config(
			"latency_ms must not be negative".to_string(),
		));
	}
	let seed = config
		.get("seed")
		.and_then(|v| v.as_integer())
		.map(|s| s as u64);

	Ok(Box::new(SimulatedPayment::new(
		success_rate,
		Duration::from_millis(latency_ms as u64),
		seed,
	)?))
}
