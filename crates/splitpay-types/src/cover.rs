//! The initiator's charge for whatever is left unpaid.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ParticipantId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverStatus {
	/// Recorded before the charge is attempted.
	Charging,
	/// The charge went through; the covered rows may still need writing.
	Settled,
}

/// One cover charge per session, recorded before money moves so that a retry
/// finishes the row writes instead of charging again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCover {
	pub session_id: SessionId,
	/// Row of the initiator, who pays.
	pub payer_id: ParticipantId,
	pub amount: Decimal,
	pub status: CoverStatus,
	pub reference: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl BalanceCover {
	pub fn charging(
		session_id: &str,
		payer_id: &str,
		amount: Decimal,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			session_id: session_id.to_string(),
			payer_id: payer_id.to_string(),
			amount,
			status: CoverStatus::Charging,
			reference: None,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn settled(&self, reference: String, now: DateTime<Utc>) -> Self {
		Self {
			status: CoverStatus::Settled,
			reference: Some(reference),
			updated_at: now,
			..self.clone()
		}
	}

	pub fn is_settled(&self) -> bool {
		self.status == CoverStatus::Settled
	}
}
