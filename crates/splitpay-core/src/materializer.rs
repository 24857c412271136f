//! Order materialization.
//!
//! Turns a fully paid session into exactly one cafeteria order. Every client
//! watching the session may try; the store's uniqueness constraint on the
//! materialization key picks one winner and everyone else adopts its order.

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use splitpay_storage::StorageError;
use splitpay_types::{
	materialization_key, MaterializedOrder, Order, Receipt, SplitSession,
	SPLIT_BILL_PAYMENT_METHOD,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{Result, SettlementError};
use crate::store::SettlementStore;

/// Midnight (UTC) of the day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
	now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[derive(Default)]
struct GuardState {
	in_flight: bool,
	order: Option<MaterializedOrder>,
}

/// Clears the in-flight flag when an attempt finishes, successful or not.
struct InFlightReset<'a> {
	state: &'a Mutex<GuardState>,
}

impl Drop for InFlightReset<'_> {
	fn drop(&mut self) {
		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(poisoned) => poisoned.into_inner(),
		};
		state.in_flight = false;
	}
}

/// Per-coordinator materializer with a local one-shot guard.
pub struct OrderMaterializer {
	store: Arc<dyn SettlementStore>,
	state: Mutex<GuardState>,
}

impl OrderMaterializer {
	pub fn new(store: Arc<dyn SettlementStore>) -> Self {
		Self {
			store,
			state: Mutex::new(GuardState::default()),
		}
	}

	/// The order this instance already materialized or adopted.
	pub fn cached(&self) -> Option<MaterializedOrder> {
		self.lock().order.clone()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
		match self.state.lock() {
			Ok(state) => state,
			Err(poisoned) => poisoned.into_inner(),
		}
	}

	/// Materializes the order of a fully paid session, or adopts the existing one.
	///
	/// Returns `Ok(None)` when another call on this instance is still running.
	pub async fn materialize(&self, session: &SplitSession) -> Result<Option<MaterializedOrder>> {
		{
			let mut state = self.lock();
			if let Some(order) = &state.order {
				return Ok(Some(order.clone()));
			}
			if state.in_flight {
				debug!(session_id = %session.id, "Materialization already in flight");
				return Ok(None);
			}
			state.in_flight = true;
		}
		let _reset = InFlightReset { state: &self.state };

		let materialized = self.materialize_once(session).await?;
		self.lock().order = Some(materialized.clone());
		Ok(Some(materialized))
	}

	async fn materialize_once(&self, session: &SplitSession) -> Result<MaterializedOrder> {
		let key = materialization_key(&session.id);

		if let Some(existing) = self.store.find_order_by_materialization_key(&key).await? {
			debug!(session_id = %session.id, order_id = %existing.id, "Adopting existing order");
			return self.adopt(existing).await;
		}

		let order = self.build_order(session, &key).await?;
		match self.store.insert_order(&order).await {
			Ok(()) => {
				let receipt = self.ensure_receipt(&order).await?;
				info!(
					session_id = %session.id,
					order_id = %order.id,
					queue_number = %order.queue_number,
					"Order materialized"
				);
				Ok(MaterializedOrder {
					order,
					receipt,
					adopted: false,
				})
			}
			Err(StorageError::Conflict(_)) => {
				debug!(session_id = %session.id, "Lost materialization race, adopting");
				let existing = self
					.store
					.find_order_by_materialization_key(&key)
					.await?
					.ok_or(SettlementError::MaterializationConflict(key))?;
				self.adopt(existing).await
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Adopts an order created elsewhere, making sure its receipt exists.
	async fn adopt(&self, order: Order) -> Result<MaterializedOrder> {
		let receipt = match self.store.read_receipt(&order.id).await? {
			Some(receipt) => receipt,
			// The creator stopped between the order and the receipt.
			None => self.ensure_receipt(&order).await?,
		};
		Ok(MaterializedOrder {
			order,
			receipt,
			adopted: true,
		})
	}

	/// Inserts the receipt if missing and returns the stored one.
	async fn ensure_receipt(&self, order: &Order) -> Result<Receipt> {
		let receipt = Receipt::for_order(order, Utc::now());
		self.store.insert_receipt(&receipt).await?;
		Ok(self.store.read_receipt(&order.id).await?.unwrap_or(receipt))
	}

	async fn build_order(&self, session: &SplitSession, key: &str) -> Result<Order> {
		let now = Utc::now();
		let today = self
			.store
			.count_orders_since(&session.cafeteria_id, start_of_day(now))
			.await?;
		let subtotal = session.cart.subtotal();

		Ok(Order {
			id: uuid::Uuid::new_v4().to_string(),
			materialization_key: key.to_string(),
			session_id: session.id.clone(),
			cafeteria_id: session.cafeteria_id.clone(),
			customer_id: session.initiator_id.clone(),
			items: session.cart.items.clone(),
			subtotal,
			fees: (session.total_amount - subtotal).max(Decimal::ZERO),
			total: session.total_amount,
			queue_number: format!("{:03}", today + 1),
			payment_method: SPLIT_BILL_PAYMENT_METHOD.to_string(),
			pickup_time_preference: session.pickup_time_preference.clone(),
			created_at: now,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{memory_store, sample_session, FlakyStore};
	use chrono::TimeZone;
	use futures::future::join_all;

	#[test]
	fn test_start_of_day() {
		let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
		assert_eq!(
			start_of_day(now),
			Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
		);
	}

	#[tokio::test]
	async fn test_materialize_builds_order_and_receipt() {
		let store = memory_store();
		let (session, _) = sample_session("cart-1");
		let materializer = OrderMaterializer::new(store.clone());

		let done = materializer.materialize(&session).await.unwrap().unwrap();
		assert!(!done.adopted);
		assert_eq!(done.order.materialization_key, materialization_key(&session.id));
		assert_eq!(done.order.payment_method, SPLIT_BILL_PAYMENT_METHOD);
		assert_eq!(done.order.total, session.total_amount);
		assert_eq!(done.order.subtotal, session.cart.subtotal());
		assert_eq!(done.order.fees, session.total_amount - session.cart.subtotal());
		assert_eq!(done.order.queue_number, "001");
		assert_eq!(done.receipt.order_id, done.order.id);

		let stored = store.read_receipt(&done.order.id).await.unwrap().unwrap();
		assert_eq!(stored, done.receipt);

		// Cached locally; a second call returns the same result.
		let again = materializer.materialize(&session).await.unwrap().unwrap();
		assert_eq!(again, done);
	}

	#[tokio::test]
	async fn test_queue_numbers_count_up_per_cafeteria() {
		let store = memory_store();
		let (first, _) = sample_session("cart-1");
		let (second, _) = sample_session("cart-2");

		let a = OrderMaterializer::new(store.clone())
			.materialize(&first)
			.await
			.unwrap()
			.unwrap();
		let b = OrderMaterializer::new(store.clone())
			.materialize(&second)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(a.order.queue_number, "001");
		assert_eq!(b.order.queue_number, "002");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_observers_create_one_order() {
		let store = memory_store();
		let (session, _) = sample_session("cart-1");

		let attempts = (0..8).map(|_| {
			let materializer = OrderMaterializer::new(store.clone());
			let session = session.clone();
			tokio::spawn(async move { materializer.materialize(&session).await })
		});
		let results: Vec<MaterializedOrder> = join_all(attempts)
			.await
			.into_iter()
			.map(|r| r.unwrap().unwrap().unwrap())
			.collect();

		let order_id = &results[0].order.id;
		assert!(results.iter().all(|r| &r.order.id == order_id));
		assert_eq!(results.iter().filter(|r| !r.adopted).count(), 1);
		assert_eq!(
			store
				.count_orders_since(&session.cafeteria_id, start_of_day(Utc::now()))
				.await
				.unwrap(),
			1
		);
	}

	#[tokio::test]
	async fn test_lost_insert_race_adopts_winner() {
		let inner = memory_store();
		let (session, _) = sample_session("cart-1");
		let winner = OrderMaterializer::new(inner.clone())
			.materialize(&session)
			.await
			.unwrap()
			.unwrap();

		// The loser's lookup misses the winner's order, so its insert conflicts.
		let flaky = Arc::new(FlakyStore::new(inner.clone()));
		flaky.hide_orders(1);
		let loser = OrderMaterializer::new(flaky.clone())
			.materialize(&session)
			.await
			.unwrap()
			.unwrap();

		assert!(loser.adopted);
		assert_eq!(loser.order.id, winner.order.id);
		assert_eq!(loser.receipt, winner.receipt);
	}

	#[tokio::test]
	async fn test_store_failure_is_retried_on_next_call() {
		let inner = memory_store();
		let flaky = Arc::new(FlakyStore::new(inner.clone()));
		let (session, _) = sample_session("cart-1");
		let materializer = OrderMaterializer::new(flaky.clone());

		flaky.fail_order_writes(1);
		let err = materializer.materialize(&session).await.unwrap_err();
		assert!(matches!(err, SettlementError::TransientStore(_)));
		assert!(materializer.cached().is_none());

		let done = materializer.materialize(&session).await.unwrap().unwrap();
		assert!(!done.adopted);
	}

	#[tokio::test]
	async fn test_adopter_repairs_missing_receipt() {
		let store = memory_store();
		let (session, _) = sample_session("cart-1");
		let order = crate::testing::sample_order(&session.id, &session.cafeteria_id);
		store.insert_order(&order).await.unwrap();

		let adopted = OrderMaterializer::new(store.clone())
			.materialize(&session)
			.await
			.unwrap()
			.unwrap();
		assert!(adopted.adopted);
		assert_eq!(adopted.order.id, order.id);
		assert!(store.read_receipt(&order.id).await.unwrap().is_some());
	}
}
