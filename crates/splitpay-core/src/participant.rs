//! Participant state machine.
//!
//! A row moves along two axes: invitation (`pending → accepted | rejected`)
//! and payment (`pending ⇄ failed → paid`). Payment is only reachable from an
//! accepted invitation, except through the initiator's cover-remaining-balance
//! action. Every function here is pure: it inspects a row and returns the row
//! that should replace it, leaving persistence to the coordinator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use splitpay_payment::PaymentOutcome;
use splitpay_types::{
	InvitationStatus, Participant, PaymentStatus, SessionId, COVERED_BY_INITIATOR,
};

use crate::error::{Result, SettlementError};

/// Reason reported when an action repeats a transition that already happened.
pub const ALREADY_TERMINAL: &str = "already in terminal state";

/// What an operation did, as reported to its invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum TransitionOutcome {
	Applied,
	/// The action was a no-op; the row already had the requested state.
	Unchanged(String),
}

/// Result of evaluating a transition against one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
	/// Replace the row with this one.
	Apply(Participant),
	/// Nothing to write.
	Unchanged(String),
}

/// Creates a freshly invited row in (`pending`, `pending`).
pub fn invite(
	session_id: &SessionId,
	position: u32,
	identifier: &str,
	amount_due: Decimal,
	now: DateTime<Utc>,
) -> Participant {
	Participant {
		id: uuid::Uuid::new_v4().to_string(),
		session_id: session_id.clone(),
		position,
		identifier: identifier.trim().to_string(),
		is_initiator: false,
		amount_due,
		invitation_status: InvitationStatus::Pending,
		payment_status: PaymentStatus::Pending,
		paid_at: None,
		payment_method_ref: None,
		updated_at: now,
	}
}

/// Creates the initiator's synthetic row, which starts accepted.
pub fn initiator(
	session_id: &SessionId,
	identifier: &str,
	amount_due: Decimal,
	now: DateTime<Utc>,
) -> Participant {
	Participant {
		is_initiator: true,
		invitation_status: InvitationStatus::Accepted,
		..invite(session_id, 0, identifier, amount_due, now)
	}
}

fn ensure_actor(participant: &Participant, actor: &str) -> Result<()> {
	if participant.is_identified_by(actor) {
		Ok(())
	} else {
		Err(SettlementError::Unauthorized(format!(
			"{} cannot act for participant {}",
			actor, participant.id
		)))
	}
}

/// `pending → accepted`. Only the invited party may accept.
pub fn accept(participant: &Participant, actor: &str, now: DateTime<Utc>) -> Result<Transition> {
	ensure_actor(participant, actor)?;

	match participant.invitation_status {
		InvitationStatus::Accepted => Ok(Transition::Unchanged("already accepted".to_string())),
		InvitationStatus::Rejected => Err(SettlementError::StateConflict(
			"invitation was already rejected".to_string(),
		)),
		InvitationStatus::Pending if participant.is_paid() => Ok(Transition::Unchanged(
			"share was already covered by the initiator".to_string(),
		)),
		InvitationStatus::Pending => {
			let mut next = participant.clone();
			next.invitation_status = InvitationStatus::Accepted;
			next.updated_at = now;
			Ok(Transition::Apply(next))
		}
	}
}

/// `pending → rejected`. Terminal for the invitation.
pub fn reject(participant: &Participant, actor: &str, now: DateTime<Utc>) -> Result<Transition> {
	ensure_actor(participant, actor)?;

	if participant.is_initiator {
		return Err(SettlementError::StateConflict(
			"the initiator cannot reject their own split".to_string(),
		));
	}

	match participant.invitation_status {
		InvitationStatus::Rejected => Ok(Transition::Unchanged(ALREADY_TERMINAL.to_string())),
		InvitationStatus::Accepted => Err(SettlementError::StateConflict(
			"invitation was already accepted".to_string(),
		)),
		InvitationStatus::Pending if participant.is_paid() => {
			Ok(Transition::Unchanged(ALREADY_TERMINAL.to_string()))
		}
		InvitationStatus::Pending => {
			let mut next = participant.clone();
			next.invitation_status = InvitationStatus::Rejected;
			next.updated_at = now;
			Ok(Transition::Apply(next))
		}
	}
}

/// Whether a payment attempt may start for this row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payability {
	Ready,
	/// Already paid; paying again is a reported no-op.
	AlreadyPaid,
}

/// Checks that `actor` may pay this row now.
pub fn check_payable(participant: &Participant, actor: &str) -> Result<Payability> {
	ensure_actor(participant, actor)?;

	if participant.is_paid() {
		return Ok(Payability::AlreadyPaid);
	}
	if participant.invitation_status != InvitationStatus::Accepted {
		return Err(SettlementError::StateConflict(format!(
			"participant {} must accept the invitation before paying",
			participant.id
		)));
	}
	Ok(Payability::Ready)
}

/// Applies a payment outcome to an accepted, unpaid row.
pub fn record_payment(
	participant: &Participant,
	outcome: &PaymentOutcome,
	method_ref: &str,
	now: DateTime<Utc>,
) -> Transition {
	if participant.is_paid() {
		return Transition::Unchanged(ALREADY_TERMINAL.to_string());
	}

	let mut next = participant.clone();
	next.updated_at = now;
	match outcome {
		PaymentOutcome::Settled { .. } => {
			next.payment_status = PaymentStatus::Paid;
			next.paid_at = Some(now);
			next.payment_method_ref = Some(method_ref.to_string());
		}
		PaymentOutcome::Declined { .. } => {
			if participant.payment_status == PaymentStatus::Failed {
				return Transition::Unchanged("payment already marked failed".to_string());
			}
			next.payment_status = PaymentStatus::Failed;
		}
	}
	Transition::Apply(next)
}

/// Marks an unpaid row as settled by the initiator.
pub fn cover(participant: &Participant, now: DateTime<Utc>) -> Transition {
	if participant.is_paid() {
		return Transition::Unchanged(ALREADY_TERMINAL.to_string());
	}
	let mut next = participant.clone();
	next.payment_status = PaymentStatus::Paid;
	next.paid_at = Some(now);
	next.payment_method_ref = Some(COVERED_BY_INITIATOR.to_string());
	next.updated_at = now;
	Transition::Apply(next)
}

/// Undoes [`cover`] on a row of a session that closed while it was being covered.
pub fn uncover(participant: &Participant, now: DateTime<Utc>) -> Transition {
	if !participant.is_covered() {
		return Transition::Unchanged("share is not covered".to_string());
	}
	let mut next = participant.clone();
	next.payment_status = PaymentStatus::Pending;
	next.paid_at = None;
	next.payment_method_ref = None;
	next.updated_at = now;
	Transition::Apply(next)
}

/// The row invariant: a paid row was accepted, or covered by the initiator.
pub fn satisfies_invariant(participant: &Participant) -> bool {
	!participant.is_paid()
		|| participant.invitation_status == InvitationStatus::Accepted
		|| participant.is_covered()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row() -> Participant {
		invite(
			&"s1".to_string(),
			1,
			"aisyah@campus.edu",
			Decimal::new(1000, 2),
			Utc::now(),
		)
	}

	fn applied(t: Transition) -> Participant {
		match t {
			Transition::Apply(p) => p,
			Transition::Unchanged(reason) => panic!("expected a transition, got no-op: {}", reason),
		}
	}

	fn settled() -> PaymentOutcome {
		PaymentOutcome::Settled {
			reference: "ref".to_string(),
		}
	}

	#[test]
	fn test_invite_starts_pending() {
		let p = row();
		assert_eq!(p.invitation_status, InvitationStatus::Pending);
		assert_eq!(p.payment_status, PaymentStatus::Pending);
		assert!(!p.is_initiator);

		let i = initiator(&"s1".to_string(), "owner", Decimal::ONE, Utc::now());
		assert!(i.is_initiator);
		assert_eq!(i.invitation_status, InvitationStatus::Accepted);
		assert_eq!(i.position, 0);
	}

	#[test]
	fn test_accept_is_idempotent() {
		let p = row();
		let accepted = applied(accept(&p, "aisyah@campus.edu", Utc::now()).unwrap());
		assert_eq!(accepted.invitation_status, InvitationStatus::Accepted);

		let again = accept(&accepted, "AISYAH@campus.edu", Utc::now()).unwrap();
		assert!(matches!(again, Transition::Unchanged(_)));
	}

	#[test]
	fn test_only_invited_party_may_accept() {
		let p = row();
		let err = accept(&p, "someone-else", Utc::now()).unwrap_err();
		assert!(matches!(err, SettlementError::Unauthorized(_)));
	}

	#[test]
	fn test_reject_twice_reports_terminal_state() {
		let p = row();
		let rejected = applied(reject(&p, "aisyah@campus.edu", Utc::now()).unwrap());
		assert_eq!(rejected.invitation_status, InvitationStatus::Rejected);

		match reject(&rejected, "aisyah@campus.edu", Utc::now()).unwrap() {
			Transition::Unchanged(reason) => assert_eq!(reason, ALREADY_TERMINAL),
			other => panic!("unexpected {:?}", other),
		}

		let err = accept(&rejected, "aisyah@campus.edu", Utc::now()).unwrap_err();
		assert!(matches!(err, SettlementError::StateConflict(_)));
	}

	#[test]
	fn test_initiator_cannot_reject() {
		let i = initiator(&"s1".to_string(), "owner", Decimal::ONE, Utc::now());
		assert!(matches!(
			reject(&i, "owner", Utc::now()),
			Err(SettlementError::StateConflict(_))
		));
	}

	#[test]
	fn test_cannot_pay_before_accepting() {
		let p = row();
		let err = check_payable(&p, "aisyah@campus.edu").unwrap_err();
		assert!(matches!(err, SettlementError::StateConflict(_)));
	}

	#[test]
	fn test_payment_lifecycle() {
		let p = applied(accept(&row(), "aisyah@campus.edu", Utc::now()).unwrap());
		assert_eq!(
			check_payable(&p, "aisyah@campus.edu").unwrap(),
			Payability::Ready
		);

		let declined = applied(record_payment(
			&p,
			&PaymentOutcome::Declined {
				reason: "no funds".to_string(),
			},
			"card",
			Utc::now(),
		));
		assert_eq!(declined.payment_status, PaymentStatus::Failed);
		assert!(declined.paid_at.is_none());
		assert_eq!(
			check_payable(&declined, "aisyah@campus.edu").unwrap(),
			Payability::Ready
		);

		let paid = applied(record_payment(&declined, &settled(), "card", Utc::now()));
		assert_eq!(paid.payment_status, PaymentStatus::Paid);
		assert!(paid.paid_at.is_some());
		assert_eq!(paid.payment_method_ref.as_deref(), Some("card"));
		assert!(satisfies_invariant(&paid));

		assert_eq!(
			check_payable(&paid, "aisyah@campus.edu").unwrap(),
			Payability::AlreadyPaid
		);
		assert!(matches!(
			record_payment(&paid, &settled(), "card", Utc::now()),
			Transition::Unchanged(_)
		));
	}

	#[test]
	fn test_cover_marks_rejected_row_paid() {
		let rejected = applied(reject(&row(), "aisyah@campus.edu", Utc::now()).unwrap());
		let covered = applied(cover(&rejected, Utc::now()));
		assert!(covered.is_paid());
		assert!(covered.is_covered());
		assert_eq!(covered.invitation_status, InvitationStatus::Rejected);
		assert!(satisfies_invariant(&covered));
		assert!(matches!(cover(&covered, Utc::now()), Transition::Unchanged(_)));
	}

	#[test]
	fn test_uncover_only_touches_covered_rows() {
		let covered = applied(cover(&row(), Utc::now()));
		let restored = applied(uncover(&covered, Utc::now()));
		assert_eq!(restored.payment_status, PaymentStatus::Pending);
		assert!(restored.payment_method_ref.is_none());

		let accepted = applied(accept(&row(), "aisyah@campus.edu", Utc::now()).unwrap());
		let paid = applied(record_payment(&accepted, &settled(), "card", Utc::now()));
		assert!(matches!(uncover(&paid, Utc::now()), Transition::Unchanged(_)));
	}
}
