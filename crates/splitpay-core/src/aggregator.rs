//! Session aggregation.
//!
//! The view depends only on the final state of each row, never on the order
//! in which payments landed, so it is always recomputed from scratch.

use rust_decimal::Decimal;
use splitpay_types::{Participant, SettlementView};

/// Computes the settlement view of `participants` against `total_amount`.
pub fn aggregate(total_amount: Decimal, participants: &[Participant]) -> SettlementView {
	let mut paid_count = 0;
	let mut total_paid = Decimal::ZERO;
	let mut unpaid_amount = Decimal::ZERO;

	for participant in participants {
		if participant.is_paid() {
			paid_count += 1;
			total_paid += participant.amount_due;
		} else {
			unpaid_amount += participant.amount_due;
		}
	}

	// An empty session is degenerate and never counts as settled.
	let all_paid = !participants.is_empty() && paid_count == participants.len();

	let progress_ratio = if total_amount > Decimal::ZERO {
		(total_paid / total_amount)
			.min(Decimal::ONE)
			.max(Decimal::ZERO)
	} else {
		Decimal::ZERO
	};

	SettlementView {
		participant_count: participants.len(),
		paid_count,
		total_paid,
		unpaid_amount,
		all_paid,
		progress_ratio,
	}
}
