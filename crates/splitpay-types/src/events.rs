use serde::{Deserialize, Serialize};

use crate::{MaterializedOrder, Participant, SessionId, SessionStatus, SettlementView};

/// Notifications published to observers of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SettlementEvent {
	Participant(ParticipantEvent),
	Session(SessionEvent),
	Order(OrderEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParticipantEvent {
	InvitationAccepted {
		session_id: SessionId,
		participant: Participant,
	},
	InvitationRejected {
		session_id: SessionId,
		participant: Participant,
	},
	PaymentSettled {
		session_id: SessionId,
		participant: Participant,
	},
	PaymentDeclined {
		session_id: SessionId,
		participant_id: String,
		reason: String,
	},
	BalanceCovered {
		session_id: SessionId,
		covered: Vec<String>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
	/// The aggregated view changed on a poll tick.
	ViewChanged {
		session_id: SessionId,
		view: SettlementView,
	},
	StatusChanged {
		session_id: SessionId,
		status: SessionStatus,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
	Materialized {
		session_id: SessionId,
		order: MaterializedOrder,
	},
	MaterializationDeferred {
		session_id: SessionId,
		reason: String,
	},
}
