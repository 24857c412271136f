//! Error types for settlement operations.

use splitpay_payment::PaymentError;
use splitpay_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the settlement core.
#[derive(Debug, Error)]
pub enum SettlementError {
	/// Caller input is invalid. Nothing was written.
	#[error("Validation error: {0}")]
	Validation(String),

	/// The action does not fit the current state. Nothing was written.
	#[error("State conflict: {0}")]
	StateConflict(String),

	/// The store could not be reached. Safe to retry.
	#[error("Store unavailable: {0}")]
	TransientStore(String),

	/// The payment provider declined the charge. Retryable.
	#[error("Payment declined: {0}")]
	PaymentDeclined(String),

	/// Another observer created the order first. Handled internally by adoption.
	#[error("Materialization conflict for key {0}")]
	MaterializationConflict(String),

	#[error("Not found: {0}")]
	NotFound(String),

	/// The actor is not allowed to act on this participant or session.
	#[error("Unauthorized: {0}")]
	Unauthorized(String),

	#[error("Payment error: {0}")]
	Payment(String),

	/// Stored data could not be decoded.
	#[error("Storage error: {0}")]
	Storage(String),
}

impl SettlementError {
	/// Whether retrying the same call later may succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			SettlementError::TransientStore(_) | SettlementError::PaymentDeclined(_)
		)
	}
}

impl From<StorageError> for SettlementError {
	fn from(e: StorageError) -> Self {
		match e {
			StorageError::NotFound => SettlementError::NotFound("record not found".to_string()),
			StorageError::Backend(msg) => SettlementError::TransientStore(msg),
			StorageError::Conflict(key) => {
				SettlementError::StateConflict(format!("concurrent update of {}", key))
			}
			StorageError::Serialization(msg) => SettlementError::Storage(msg),
		}
	}
}

impl From<PaymentError> for SettlementError {
	fn from(e: PaymentError) -> Self {
		match e {
			PaymentError::InFlight(participant_id) => SettlementError::StateConflict(format!(
				"a payment for participant {} is already in progress",
				participant_id
			)),
			PaymentError::InvalidRequest(msg) => SettlementError::Validation(msg),
			PaymentError::Provider(msg) | PaymentError::Config(msg) => {
				SettlementError::Payment(msg)
			}
		}
	}
}

pub type Result<T> = std::result::Result<T, SettlementError>;
