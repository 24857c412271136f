//! Downstream order and receipt created once a session settles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CartItem, SessionId};

/// Payment method shown on orders paid through a split session.
pub const SPLIT_BILL_PAYMENT_METHOD: &str = "split bill";

/// Prefix of the idempotency key attached to materialized orders.
pub const MATERIALIZATION_KEY_PREFIX: &str = "split-settlement:";

/// Deterministic idempotency key for the order of `session_id`.
pub fn materialization_key(session_id: &str) -> String {
	format!("{}{}", MATERIALIZATION_KEY_PREFIX, session_id)
}

/// A real cafeteria order created from a fully paid session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	pub id: String,
	/// Uniqueness key. At most one order exists per key.
	pub materialization_key: String,
	pub session_id: SessionId,
	pub cafeteria_id: String,
	/// The initiator, who owns the cart.
	pub customer_id: String,
	pub items: Vec<CartItem>,
	pub subtotal: Decimal,
	pub fees: Decimal,
	pub total: Decimal,
	/// Human-facing pickup number. Not guaranteed unique across sessions.
	pub queue_number: String,
	pub payment_method: String,
	pub pickup_time_preference: Option<String>,
	pub created_at: DateTime<Utc>,
}

/// Receipt snapshot persisted alongside an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
	pub order_id: String,
	pub queue_number: String,
	pub items: Vec<CartItem>,
	pub subtotal: Decimal,
	pub fees: Decimal,
	pub total: Decimal,
	pub payment_method: String,
	pub issued_at: DateTime<Utc>,
}

impl Receipt {
	pub fn for_order(order: &Order, issued_at: DateTime<Utc>) -> Self {
		Self {
			order_id: order.id.clone(),
			queue_number: order.queue_number.clone(),
			items: order.items.clone(),
			subtotal: order.subtotal,
			fees: order.fees,
			total: order.total,
			payment_method: order.payment_method.clone(),
			issued_at,
		}
	}
}

/// Result of materialization as seen by one observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedOrder {
	pub order: Order,
	pub receipt: Receipt,
	/// True when another observer created the order and this one adopted it.
	pub adopted: bool,
}
