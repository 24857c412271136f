//! Split session types.
//!
//! A session ties one cart total to the group of participants paying for it.
//! The cart context is copied in at creation so the order can be built later
//! without consulting the (out of scope) cart service again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Lifecycle status of a split session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
	/// Collecting payments.
	Active,
	/// Cancelled by the initiator before full payment.
	Cancelled,
	/// Fully paid and the order has been materialized.
	Completed,
	/// Settlement did not finish before the deadline.
	Expired,
}

impl SessionStatus {
	/// Returns true for statuses no transition leaves.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, SessionStatus::Active)
	}
}

impl std::fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			SessionStatus::Active => "active",
			SessionStatus::Cancelled => "cancelled",
			SessionStatus::Completed => "completed",
			SessionStatus::Expired => "expired",
		};
		f.write_str(s)
	}
}

/// Short-lived claim on an active session while it settles or closes.
///
/// Only one hold is set at a time, and only on an active session; leaving
/// `active` always clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionHold {
	/// Every share was seen paid and the order is being materialized.
	Settling,
	/// A cancel or expiry is in progress and will end in `to` unless every
	/// share turns out to be paid.
	Closing { to: SessionStatus },
}

/// How the total was divided when the session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMethodKind {
	Equal,
	Custom,
}

/// A single line of the cart at the time the split was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
	pub menu_item_id: String,
	pub name: String,
	pub quantity: u32,
	pub unit_price: Decimal,
}

impl CartItem {
	pub fn line_total(&self) -> Decimal {
		self.unit_price * Decimal::from(self.quantity)
	}
}

/// Immutable copy of the originating cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartSnapshot {
	/// Identifier of the originating cart; at most one live session per cart.
	pub cart_id: String,
	pub items: Vec<CartItem>,
}

impl CartSnapshot {
	/// Sum of all line totals.
	pub fn subtotal(&self) -> Decimal {
		self.items.iter().map(CartItem::line_total).sum()
	}
}

/// One bill-splitting instance tied to a single cart total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSession {
	pub id: SessionId,
	/// Identity of the participant who owns the cart.
	pub initiator_id: String,
	/// Fixed total being split. Never changes after creation.
	pub total_amount: Decimal,
	pub status: SessionStatus,
	pub split_method: SplitMethodKind,
	pub cafeteria_id: String,
	pub cart: CartSnapshot,
	pub pickup_time_preference: Option<String>,
	pub created_at: DateTime<Utc>,
	/// Deadline after which an unsettled session expires.
	pub expires_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hold: Option<SessionHold>,
	pub updated_at: DateTime<Utc>,
}

impl SplitSession {
	pub fn is_active(&self) -> bool {
		self.status == SessionStatus::Active
	}

	pub fn is_closing(&self) -> bool {
		matches!(self.hold, Some(SessionHold::Closing { .. }))
	}

	/// Whether a new payment may be started against this session.
	pub fn accepts_payments(&self) -> bool {
		self.is_active() && !self.is_closing()
	}

	/// Whether the settlement deadline has passed at `now`.
	pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_terminal_statuses() {
		assert!(!SessionStatus::Active.is_terminal());
		assert!(SessionStatus::Cancelled.is_terminal());
		assert!(SessionStatus::Completed.is_terminal());
		assert!(SessionStatus::Expired.is_terminal());
	}

	#[test]
	fn test_hold_wire_form() {
		let hold = SessionHold::Closing {
			to: SessionStatus::Cancelled,
		};
		let json = serde_json::to_string(&hold).unwrap();
		assert_eq!(json, r#"{"kind":"closing","to":"cancelled"}"#);
	}

	#[test]
	fn test_cart_subtotal() {
		let cart = CartSnapshot {
			cart_id: "cart-1".to_string(),
			items: vec![
				CartItem {
					menu_item_id: "nasi-lemak".to_string(),
					name: "Nasi Lemak".to_string(),
					quantity: 2,
					unit_price: Decimal::new(850, 2),
				},
				CartItem {
					menu_item_id: "teh-tarik".to_string(),
					name: "Teh Tarik".to_string(),
					quantity: 3,
					unit_price: Decimal::new(250, 2),
				},
			],
		};
		assert_eq!(cart.subtotal(), Decimal::new(2450, 2));
	}

	#[test]
	fn test_status_serializes_snake_case() {
		let json = serde_json::to_string(&SessionStatus::Expired).unwrap();
		assert_eq!(json, "\"expired\"");
	}
}
