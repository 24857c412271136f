//! The settlement store: the single shared mutable resource.
//!
//! No multi-row transactions are assumed. Safety comes from conditional
//! writes: compare-and-swap on participant rows and on the session record, a
//! per-cart claim, the per-session cover record and the order uniqueness key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use splitpay_storage::{StorageError, StorageService};
use splitpay_types::{BalanceCover, Order, Participant, Receipt, SplitSession};
use std::sync::Arc;
use tracing::{debug, warn};

const SESSIONS: &str = "sessions";
const PARTICIPANTS: &str = "participants";
const ORDERS: &str = "orders";
const RECEIPTS: &str = "receipts";
const CART_CLAIMS: &str = "cart_claims";
const COVERS: &str = "covers";

/// Trait defining the store operations the settlement core consumes.
#[async_trait]
pub trait SettlementStore: Send + Sync {
	/// Persists a new session and its rows.
	///
	/// Fails with `Conflict` when the cart already has a non-terminal session.
	async fn create_session(
		&self,
		session: &SplitSession,
		participants: &[Participant],
	) -> Result<(), StorageError>;

	async fn read_session(&self, session_id: &str) -> Result<SplitSession, StorageError>;

	/// Returns the rows of a session ordered by position.
	async fn read_participants(&self, session_id: &str) -> Result<Vec<Participant>, StorageError>;

	/// Replaces `current` with `next`; `Conflict` when the stored row is no longer `current`.
	async fn update_participant(
		&self,
		current: &Participant,
		next: &Participant,
	) -> Result<(), StorageError>;

	/// Replaces `current` with `next`; `Conflict` when the stored session is no
	/// longer `current`. Moving to a terminal status releases the cart.
	async fn update_session(
		&self,
		current: &SplitSession,
		next: &SplitSession,
	) -> Result<(), StorageError>;

	/// Records a cover charge before it is attempted; `Conflict` when the
	/// session already has one.
	async fn begin_cover(&self, cover: &BalanceCover) -> Result<(), StorageError>;

	async fn read_cover(&self, session_id: &str) -> Result<Option<BalanceCover>, StorageError>;

	/// Replaces `current` with `next`; `Conflict` when the record changed.
	async fn update_cover(
		&self,
		current: &BalanceCover,
		next: &BalanceCover,
	) -> Result<(), StorageError>;

	/// Drops a cover record whose charge never went through.
	async fn remove_cover(&self, session_id: &str) -> Result<(), StorageError>;

	async fn find_order_by_materialization_key(
		&self,
		key: &str,
	) -> Result<Option<Order>, StorageError>;

	/// Inserts an order under its materialization key; `Conflict` when the key exists.
	async fn insert_order(&self, order: &Order) -> Result<(), StorageError>;

	/// Inserts a receipt. Inserting the same receipt twice is a no-op.
	async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StorageError>;

	async fn read_receipt(&self, order_id: &str) -> Result<Option<Receipt>, StorageError>;

	/// Counts orders of a cafeteria created at or after `since`.
	async fn count_orders_since(
		&self,
		cafeteria_id: &str,
		since: DateTime<Utc>,
	) -> Result<u64, StorageError>;
}

/// Settlement store built on the generic key-value storage service.
pub struct KvSettlementStore {
	storage: Arc<StorageService>,
}

impl KvSettlementStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	fn participant_key(session_id: &str, participant_id: &str) -> String {
		format!("{}:{}", session_id, participant_id)
	}

	/// Claims the cart for `session_id`, taking over claims left by finished sessions.
	async fn claim_cart(&self, cart_id: &str, session_id: &str) -> Result<(), StorageError> {
		let owned = session_id.to_string();
		if self.storage.store_if_absent(CART_CLAIMS, cart_id, &owned).await? {
			return Ok(());
		}

		let holder: String = match self.storage.retrieve_optional(CART_CLAIMS, cart_id).await? {
			Some(holder) => holder,
			// Released between our attempt and the read.
			None => {
				return if self.storage.store_if_absent(CART_CLAIMS, cart_id, &owned).await? {
					Ok(())
				} else {
					Err(StorageError::Conflict(format!("cart {}", cart_id)))
				}
			}
		};

		let holder_is_live = match self
			.storage
			.retrieve_optional::<SplitSession>(SESSIONS, &holder)
			.await?
		{
			Some(session) => !session.status.is_terminal(),
			None => false,
		};
		if holder_is_live {
			return Err(StorageError::Conflict(format!(
				"cart {} already has active session {}",
				cart_id, holder
			)));
		}

		debug!("Taking over stale claim on cart {} from {}", cart_id, holder);
		self.storage
			.compare_and_swap(CART_CLAIMS, cart_id, &holder, &owned)
			.await
	}

	async fn release_cart(&self, session: &SplitSession) {
		let holder: Option<String> = match self
			.storage
			.retrieve_optional(CART_CLAIMS, &session.cart.cart_id)
			.await
		{
			Ok(holder) => holder,
			Err(e) => {
				warn!("Failed to read claim on cart {}: {}", session.cart.cart_id, e);
				return;
			}
		};
		if holder.as_deref() != Some(session.id.as_str()) {
			return;
		}
		// A leftover claim is harmless: the next session takes it over.
		if let Err(e) = self.storage.remove(CART_CLAIMS, &session.cart.cart_id).await {
			warn!("Failed to release cart {}: {}", session.cart.cart_id, e);
		}
	}
}

#[async_trait]
impl SettlementStore for KvSettlementStore {
	async fn create_session(
		&self,
		session: &SplitSession,
		participants: &[Participant],
	) -> Result<(), StorageError> {
		self.claim_cart(&session.cart.cart_id, &session.id).await?;

		// Rows first, so a reader that sees the session also sees its rows.
		for participant in participants {
			self.storage
				.store(
					PARTICIPANTS,
					&Self::participant_key(&session.id, &participant.id),
					participant,
				)
				.await?;
		}

		if !self.storage.store_if_absent(SESSIONS, &session.id, session).await? {
			return Err(StorageError::Conflict(format!("session {}", session.id)));
		}
		Ok(())
	}

	async fn read_session(&self, session_id: &str) -> Result<SplitSession, StorageError> {
		self.storage.retrieve(SESSIONS, session_id).await
	}

	async fn read_participants(&self, session_id: &str) -> Result<Vec<Participant>, StorageError> {
		let mut participants: Vec<Participant> = self
			.storage
			.list(PARTICIPANTS, &format!("{}:", session_id))
			.await?;
		participants.sort_by_key(|p| p.position);
		Ok(participants)
	}

	async fn update_participant(
		&self,
		current: &Participant,
		next: &Participant,
	) -> Result<(), StorageError> {
		self.storage
			.compare_and_swap(
				PARTICIPANTS,
				&Self::participant_key(&current.session_id, &current.id),
				current,
				next,
			)
			.await
	}

	async fn update_session(
		&self,
		current: &SplitSession,
		next: &SplitSession,
	) -> Result<(), StorageError> {
		self.storage
			.compare_and_swap(SESSIONS, &current.id, current, next)
			.await?;

		if next.status.is_terminal() {
			self.release_cart(next).await;
		}
		Ok(())
	}

	async fn begin_cover(&self, cover: &BalanceCover) -> Result<(), StorageError> {
		if self
			.storage
			.store_if_absent(COVERS, &cover.session_id, cover)
			.await?
		{
			Ok(())
		} else {
			Err(StorageError::Conflict(format!(
				"cover for session {}",
				cover.session_id
			)))
		}
	}

	async fn read_cover(&self, session_id: &str) -> Result<Option<BalanceCover>, StorageError> {
		self.storage.retrieve_optional(COVERS, session_id).await
	}

	async fn update_cover(
		&self,
		current: &BalanceCover,
		next: &BalanceCover,
	) -> Result<(), StorageError> {
		self.storage
			.compare_and_swap(COVERS, &current.session_id, current, next)
			.await
	}

	async fn remove_cover(&self, session_id: &str) -> Result<(), StorageError> {
		self.storage.remove(COVERS, session_id).await
	}

	async fn find_order_by_materialization_key(
		&self,
		key: &str,
	) -> Result<Option<Order>, StorageError> {
		self.storage.retrieve_optional(ORDERS, key).await
	}

	async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
		if self
			.storage
			.store_if_absent(ORDERS, &order.materialization_key, order)
			.await?
		{
			Ok(())
		} else {
			Err(StorageError::Conflict(order.materialization_key.clone()))
		}
	}

	async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StorageError> {
		self.storage
			.store_if_absent(RECEIPTS, &receipt.order_id, receipt)
			.await
			.map(|_| ())
	}

	async fn read_receipt(&self, order_id: &str) -> Result<Option<Receipt>, StorageError> {
		self.storage.retrieve_optional(RECEIPTS, order_id).await
	}

	async fn count_orders_since(
		&self,
		cafeteria_id: &str,
		since: DateTime<Utc>,
	) -> Result<u64, StorageError> {
		let orders: Vec<Order> = self.storage.list(ORDERS, "").await?;
		Ok(orders
			.iter()
			.filter(|o| o.cafeteria_id == cafeteria_id && o.created_at >= since)
			.count() as u64)
	}
}
