//! Participant records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ParticipantId, SessionId};

/// Payment method reference recorded on rows settled by the initiator.
pub const COVERED_BY_INITIATOR: &str = "covered by initiator";

/// Response of an invited party to the split invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
	Pending,
	Accepted,
	Rejected,
}

/// Payment progress of a single share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
	Pending,
	Paid,
	/// Last attempt was declined. Retrying is always allowed.
	Failed,
}

/// An invited party with an assigned share of the total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
	pub id: ParticipantId,
	pub session_id: SessionId,
	/// Stable display order within the session, initiator first.
	pub position: u32,
	/// Contact handle used for the invitation (username, e-mail or student id).
	pub identifier: String,
	pub is_initiator: bool,
	pub amount_due: Decimal,
	pub invitation_status: InvitationStatus,
	pub payment_status: PaymentStatus,
	pub paid_at: Option<DateTime<Utc>>,
	pub payment_method_ref: Option<String>,
	pub updated_at: DateTime<Utc>,
}

impl Participant {
	pub fn is_paid(&self) -> bool {
		self.payment_status == PaymentStatus::Paid
	}

	/// True when the share was settled by the initiator on this participant's behalf.
	pub fn is_covered(&self) -> bool {
		self.is_paid() && self.payment_method_ref.as_deref() == Some(COVERED_BY_INITIATOR)
	}

	/// Whether `actor` is the party this row was issued to.
	pub fn is_identified_by(&self, actor: &str) -> bool {
		self.identifier.eq_ignore_ascii_case(actor.trim())
	}
}
