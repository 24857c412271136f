//! Derived settlement state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Session-level state computed from participant rows.
///
/// Never persisted. It is rebuilt every time participant data is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementView {
	pub participant_count: usize,
	pub paid_count: usize,
	pub total_paid: Decimal,
	/// Sum of `amount_due` over every row that is not paid.
	pub unpaid_amount: Decimal,
	/// True iff there is at least one row and every row is paid.
	pub all_paid: bool,
	/// `total_paid / total_amount`, clamped to `[0, 1]`.
	pub progress_ratio: Decimal,
}
