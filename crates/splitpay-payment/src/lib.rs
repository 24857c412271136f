//! Payment module for the split-bill settlement system.
//!
//! Charges for a single share go through a [`PaymentInterface`] provider. The
//! bundled provider only simulates outcomes; a gateway client can be dropped in
//! behind the same trait without touching the coordinator.

use async_trait::async_trait;
use dashmap::DashSet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use splitpay_types::ParticipantId;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Re-export implementations
pub mod implementations {
	pub mod simulated;
}

/// Errors that can occur while attempting a payment.
///
/// A declined charge is not an error; it is a [`PaymentOutcome::Declined`].
#[derive(Debug, Error)]
pub enum PaymentError {
	/// Another attempt for the same participant has not resolved yet.
	#[error("Payment already in flight for participant {0}")]
	InFlight(ParticipantId),
	/// The request cannot be charged at all.
	#[error("Invalid payment request: {0}")]
	InvalidRequest(String),
	/// The provider could not be reached or misbehaved.
	#[error("Provider error: {0}")]
	Provider(String),
	/// The provider configuration is unusable.
	#[error("Configuration error: {0}")]
	Config(String),
}

/// Opaque credential input for a payment method (card token, e-wallet pin, ...).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentCredentials(pub BTreeMap<String, String>);

impl PaymentCredentials {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.0.insert(name.into(), value.into());
		self
	}

	pub fn is_empty(&self) -> bool {
		self.0.values().all(|v| v.trim().is_empty())
	}
}

impl std::fmt::Debug for PaymentCredentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_set().entries(self.0.keys()).finish()
	}
}

/// A single charge for one participant's share.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
	pub participant_id: ParticipantId,
	pub amount: Decimal,
	/// Chosen payment method, e.g. "card", "ewallet:tng".
	pub method_ref: String,
	pub credentials: PaymentCredentials,
}

/// What the provider decided about a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
	Settled { reference: String },
	Declined { reason: String },
}

impl PaymentOutcome {
	pub fn is_settled(&self) -> bool {
		matches!(self, PaymentOutcome::Settled { .. })
	}
}

/// Trait defining the interface for payment providers.
#[async_trait]
pub trait PaymentInterface: Send + Sync {
	/// Short provider name used in logs.
	fn name(&self) -> &str;

	/// Attempts to charge the request, returning settled or declined.
	async fn attempt_payment(&self, request: &PaymentRequest)
		-> Result<PaymentOutcome, PaymentError>;
}

/// Service that fronts a payment provider.
///
/// Guarantees that at most one attempt per participant is outstanding at a
/// time; a concurrent second attempt fails fast with [`PaymentError::InFlight`].
pub struct PaymentService {
	provider: Box<dyn PaymentInterface>,
	in_flight: DashSet<ParticipantId>,
}

/// Removes the participant from the in-flight set when the attempt ends,
/// including when the future is dropped mid-way.
struct InFlightGuard<'a> {
	set: &'a DashSet<ParticipantId>,
	participant_id: ParticipantId,
}

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.set.remove(&self.participant_id);
	}
}

impl PaymentService {
	pub fn new(provider: Box<dyn PaymentInterface>) -> Self {
		Self {
			provider,
			in_flight: DashSet::new(),
		}
	}

	/// Charges one share.
	pub async fn pay(&self, request: &PaymentRequest) -> Result<PaymentOutcome, PaymentError> {
		if request.amount <= Decimal::ZERO {
			return Err(PaymentError::InvalidRequest(format!(
				"amount must be positive, got {}",
				request.amount
			)));
		}
		if request.method_ref.trim().is_empty() {
			return Err(PaymentError::InvalidRequest(
				"payment method is required".to_string(),
			));
		}

		if !self.in_flight.insert(request.participant_id.clone()) {
			return Err(PaymentError::InFlight(request.participant_id.clone()));
		}
		let _guard = InFlightGuard {
			set: &self.in_flight,
			participant_id: request.participant_id.clone(),
		};

		debug!(
			"Attempting payment of {} for participant {} via {}",
			request.amount,
			request.participant_id,
			self.provider.name()
		);
		let outcome = self.provider.attempt_payment(request).await?;
		info!(
			participant_id = %request.participant_id,
			amount = %request.amount,
			settled = outcome.is_settled(),
			"Payment attempt resolved"
		);
		Ok(outcome)
	}

	/// Whether an attempt for the participant is currently outstanding.
	pub fn is_in_flight(&self, participant_id: &str) -> bool {
		self.in_flight.contains(participant_id)
	}
}

/// Builds a payment provider by name from its TOML configuration.
pub fn create_payment(
	provider: &str,
	config: &toml::Value,
) -> Result<Box<dyn PaymentInterface>, PaymentError> {
	match provider {
		"simulated" => implementations::simulated::create_payment(config),
		other => Err(PaymentError::Config(format!(
			"Unknown payment provider: {}",
			other
		))),
	}
}
