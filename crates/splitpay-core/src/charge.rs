//! Charging a single share and recording the result on its row.

use chrono::Utc;
use splitpay_payment::{PaymentCredentials, PaymentOutcome, PaymentRequest, PaymentService};
use splitpay_storage::StorageError;
use splitpay_types::{Participant, PaymentStatus, SessionStatus, SplitSession};
use tracing::{info, warn};

use crate::closing::resolve_close;
use crate::error::{Result, SettlementError};
use crate::participant::{record_payment, Transition, TransitionOutcome};
use crate::store::SettlementStore;

/// Attempts a row write this many times before giving up on a contended row.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 3;

/// Outcome of charging one share.
#[derive(Debug, Clone)]
pub struct Charge {
	pub outcome: TransitionOutcome,
	/// The row as stored after the charge.
	pub participant: Participant,
}

/// Charges `participant.amount_due` and records the outcome.
///
/// The caller has already checked that the row is payable. A declined charge
/// is recorded as `failed` and reported as [`SettlementError::PaymentDeclined`].
pub(crate) async fn charge_share(
	store: &dyn SettlementStore,
	payments: &PaymentService,
	participant: &Participant,
	method_ref: &str,
	credentials: &PaymentCredentials,
) -> Result<Charge> {
	let request = PaymentRequest {
		participant_id: participant.id.clone(),
		amount: participant.amount_due,
		method_ref: method_ref.to_string(),
		credentials: credentials.clone(),
	};
	let outcome = payments.pay(&request).await?;

	let stored = record_outcome(store, participant, &outcome, method_ref).await?;

	match outcome {
		PaymentOutcome::Settled { reference } => {
			info!(
				participant_id = %participant.id,
				session_id = %participant.session_id,
				reference = %reference,
				"Share paid"
			);
			Ok(stored)
		}
		PaymentOutcome::Declined { reason } => Err(SettlementError::PaymentDeclined(reason)),
	}
}

/// Writes the payment outcome, re-reading the row when a concurrent writer won.
///
/// A settled charge is only kept while the session is still collecting. If
/// the session closed around the write, the row is put back and the charge is
/// reported as owed back to the payer.
async fn record_outcome(
	store: &dyn SettlementStore,
	participant: &Participant,
	outcome: &PaymentOutcome,
	method_ref: &str,
) -> Result<Charge> {
	if outcome.is_settled() {
		let session = resolve_close(store, &participant.session_id).await?;
		if !session.is_active() {
			return Err(refund_required(participant, &session));
		}
	}

	let mut current = participant.clone();

	for _ in 0..MAX_WRITE_ATTEMPTS {
		let next = match record_payment(&current, outcome, method_ref, Utc::now()) {
			Transition::Apply(next) => next,
			Transition::Unchanged(reason) => {
				if outcome.is_settled() {
					// Someone else (the initiator's cover) settled the row while
					// this charge was in flight.
					warn!(
						participant_id = %current.id,
						"Share was settled concurrently; charge needs manual refund"
					);
				}
				return Ok(Charge {
					outcome: TransitionOutcome::Unchanged(reason),
					participant: current,
				});
			}
		};

		match store.update_participant(&current, &next).await {
			Ok(()) if outcome.is_settled() => {
				return confirm_payment(store, &current, next).await;
			}
			Ok(()) => {
				return Ok(Charge {
					outcome: TransitionOutcome::Applied,
					participant: next,
				})
			}
			Err(StorageError::Conflict(_)) => {
				current = reread(store, &current).await?;
			}
			Err(e) => return Err(e.into()),
		}
	}

	Err(SettlementError::StateConflict(format!(
		"participant {} is being updated concurrently",
		participant.id
	)))
}

/// Keeps a freshly paid row if the session is still open for it.
async fn confirm_payment(
	store: &dyn SettlementStore,
	before: &Participant,
	paid: Participant,
) -> Result<Charge> {
	let session = resolve_close(store, &paid.session_id).await?;
	match session.status {
		SessionStatus::Active | SessionStatus::Completed => Ok(Charge {
			outcome: TransitionOutcome::Applied,
			participant: paid,
		}),
		SessionStatus::Cancelled | SessionStatus::Expired => {
			back_out(store, before.payment_status, paid).await?;
			Err(refund_required(before, &session))
		}
	}
}

/// Returns a paid row of a closed session to its earlier payment status.
async fn back_out(
	store: &dyn SettlementStore,
	earlier: PaymentStatus,
	paid: Participant,
) -> Result<()> {
	let mut current = paid;
	for _ in 0..MAX_WRITE_ATTEMPTS {
		if current.payment_status != PaymentStatus::Paid {
			return Ok(());
		}
		let mut restored = current.clone();
		restored.payment_status = earlier;
		restored.paid_at = None;
		restored.payment_method_ref = None;
		restored.updated_at = Utc::now();

		match store.update_participant(&current, &restored).await {
			Ok(()) => return Ok(()),
			Err(StorageError::Conflict(_)) => current = reread(store, &current).await?,
			Err(e) => return Err(e.into()),
		}
	}
	Err(SettlementError::StateConflict(format!(
		"participant {} is being updated concurrently",
		current.id
	)))
}

fn refund_required(participant: &Participant, session: &SplitSession) -> SettlementError {
	warn!(
		participant_id = %participant.id,
		session_id = %session.id,
		status = %session.status,
		amount = %participant.amount_due,
		"Charge settled after the session closed; it must be refunded"
	);
	SettlementError::StateConflict(format!(
		"session {} is {}; the charge of {} must be refunded",
		session.id, session.status, participant.amount_due
	))
}

/// Loads the latest version of a row.
pub(crate) async fn reread(
	store: &dyn SettlementStore,
	participant: &Participant,
) -> Result<Participant> {
	store
		.read_participants(&participant.session_id)
		.await?
		.into_iter()
		.find(|p| p.id == participant.id)
		.ok_or_else(|| SettlementError::NotFound(format!("participant {}", participant.id)))
}
