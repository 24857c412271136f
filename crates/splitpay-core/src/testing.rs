//! Shared fixtures for the unit tests of this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use splitpay_payment::implementations::simulated::SimulatedPayment;
use splitpay_payment::{
	PaymentCredentials, PaymentError, PaymentInterface, PaymentOutcome, PaymentRequest,
	PaymentService,
};
use splitpay_storage::implementations::memory::MemoryStorage;
use splitpay_storage::{StorageError, StorageService};
use splitpay_types::{
	materialization_key, BalanceCover, CartItem, CartSnapshot, InvitationStatus, Order, Participant,
	PaymentStatus, Receipt, SessionHold, SessionStatus, SplitMethodKind, SplitSession,
	SPLIT_BILL_PAYMENT_METHOD,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use crate::closing::with_hold;
use crate::participant;
use crate::split::{InitiateRequest, SplitMethod};
use crate::store::{KvSettlementStore, SettlementStore};

pub const INITIATOR: &str = "owner";
pub const CAFETERIA: &str = "cafe-1";

pub fn memory_store() -> Arc<KvSettlementStore> {
	Arc::new(KvSettlementStore::new(Arc::new(StorageService::new(
		Box::new(MemoryStorage::new()),
	))))
}

pub fn rm(cents: i64) -> Decimal {
	Decimal::new(cents, 2)
}

pub fn cart(cart_id: &str) -> CartSnapshot {
	CartSnapshot {
		cart_id: cart_id.to_string(),
		items: vec![
			CartItem {
				menu_item_id: "nasi-lemak".to_string(),
				name: "Nasi Lemak".to_string(),
				quantity: 2,
				unit_price: rm(900),
			},
			CartItem {
				menu_item_id: "teh-tarik".to_string(),
				name: "Teh Tarik".to_string(),
				quantity: 3,
				unit_price: rm(350),
			},
		],
	}
}

/// An active RM30 session owned by [`INITIATOR`] with invitees `p1` and `p2`.
pub fn sample_session(cart_id: &str) -> (SplitSession, Vec<Participant>) {
	let now = Utc::now();
	let session = SplitSession {
		id: uuid::Uuid::new_v4().to_string(),
		initiator_id: INITIATOR.to_string(),
		total_amount: rm(3000),
		status: SessionStatus::Active,
		split_method: SplitMethodKind::Equal,
		cafeteria_id: CAFETERIA.to_string(),
		cart: cart(cart_id),
		pickup_time_preference: Some("12:30".to_string()),
		created_at: now,
		expires_at: now + chrono::Duration::minutes(30),
		hold: None,
		updated_at: now,
	};
	let participants = vec![
		participant::initiator(&session.id, INITIATOR, rm(1000), now),
		participant::invite(&session.id, 1, "p1", rm(1000), now),
		participant::invite(&session.id, 2, "p2", rm(1000), now),
	];
	(session, participants)
}

/// The session with another status and no hold.
pub fn with_status(session: &SplitSession, status: SessionStatus) -> SplitSession {
	let mut next = session.clone();
	next.status = status;
	next.hold = None;
	next.updated_at = Utc::now();
	next
}

pub fn sample_order(session_id: &str, cafeteria_id: &str) -> Order {
	let cart = cart("cart-x");
	Order {
		id: uuid::Uuid::new_v4().to_string(),
		materialization_key: materialization_key(session_id),
		session_id: session_id.to_string(),
		cafeteria_id: cafeteria_id.to_string(),
		customer_id: INITIATOR.to_string(),
		subtotal: cart.subtotal(),
		items: cart.items,
		fees: rm(0),
		total: rm(2850),
		queue_number: "001".to_string(),
		payment_method: SPLIT_BILL_PAYMENT_METHOD.to_string(),
		pickup_time_preference: None,
		created_at: Utc::now(),
	}
}

pub fn initiate_request(
	cart_id: &str,
	total: Decimal,
	invitees: &[&str],
	method: SplitMethod,
) -> InitiateRequest {
	InitiateRequest {
		initiator_id: INITIATOR.to_string(),
		cafeteria_id: CAFETERIA.to_string(),
		cart: cart(cart_id),
		total_amount: total,
		pickup_time_preference: None,
		invitees: invitees.iter().map(|s| s.to_string()).collect(),
		method,
		payment_method_ref: "card".to_string(),
		credentials: credentials(),
	}
}

pub fn credentials() -> PaymentCredentials {
	PaymentCredentials::new().with("token", "tok_test")
}

pub fn always_settle() -> PaymentService {
	PaymentService::new(Box::new(SimulatedPayment::always_settle()))
}

pub fn always_decline() -> PaymentService {
	PaymentService::new(Box::new(SimulatedPayment::always_decline()))
}

/// Provider that settles every charge and remembers the amounts.
#[derive(Clone, Default)]
pub struct RecordingPayment {
	charges: Arc<Mutex<Vec<Decimal>>>,
}

impl RecordingPayment {
	pub fn charges(&self) -> Vec<Decimal> {
		self.charges.lock().unwrap().clone()
	}

	pub fn service(&self) -> PaymentService {
		PaymentService::new(Box::new(self.clone()))
	}
}

#[async_trait]
impl PaymentInterface for RecordingPayment {
	fn name(&self) -> &str {
		"recording"
	}

	async fn attempt_payment(
		&self,
		request: &PaymentRequest,
	) -> Result<PaymentOutcome, PaymentError> {
		let mut charges = self.charges.lock().unwrap();
		charges.push(request.amount);
		Ok(PaymentOutcome::Settled {
			reference: format!("rec-{}", charges.len()),
		})
	}
}

/// Provider whose charges settle only once released, one per [`GatedPayment::release`].
#[derive(Clone)]
pub struct GatedPayment {
	permits: Arc<Semaphore>,
	entered: Arc<Notify>,
}

impl GatedPayment {
	pub fn new() -> Self {
		Self {
			permits: Arc::new(Semaphore::new(0)),
			entered: Arc::new(Notify::new()),
		}
	}

	/// Resolves once a charge is waiting at the gate.
	pub async fn entered(&self) {
		self.entered.notified().await;
	}

	pub fn release(&self) {
		self.permits.add_permits(1);
	}

	pub fn service(&self) -> PaymentService {
		PaymentService::new(Box::new(self.clone()))
	}
}

#[async_trait]
impl PaymentInterface for GatedPayment {
	fn name(&self) -> &str {
		"gated"
	}

	async fn attempt_payment(
		&self,
		request: &PaymentRequest,
	) -> Result<PaymentOutcome, PaymentError> {
		self.entered.notify_one();
		let permit = self
			.permits
			.acquire()
			.await
			.map_err(|e| PaymentError::Provider(e.to_string()))?;
		permit.forget();
		Ok(PaymentOutcome::Settled {
			reference: format!("gated-{}", request.participant_id),
		})
	}
}

/// Marks every row of the session accepted and paid, bypassing payments.
pub async fn settle_all(store: &dyn SettlementStore, session_id: &str) {
	for row in store.read_participants(session_id).await.unwrap() {
		let mut paid = row.clone();
		paid.invitation_status = InvitationStatus::Accepted;
		paid.payment_status = PaymentStatus::Paid;
		paid.paid_at = Some(Utc::now());
		paid.payment_method_ref = Some("card".to_string());
		store.update_participant(&row, &paid).await.unwrap();
	}
}

/// Store wrapper that injects failures into the next N calls of a kind.
pub struct FlakyStore {
	inner: Arc<KvSettlementStore>,
	failing_reads: AtomicUsize,
	failing_order_writes: AtomicUsize,
	conflicting_row_writes: AtomicUsize,
	hidden_order_lookups: AtomicUsize,
	close_on_row_write: Mutex<Option<SessionStatus>>,
}

fn take(counter: &AtomicUsize) -> bool {
	counter
		.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
		.is_ok()
}

fn unavailable() -> StorageError {
	StorageError::Backend("injected outage".to_string())
}

impl FlakyStore {
	pub fn new(inner: Arc<KvSettlementStore>) -> Self {
		Self {
			inner,
			failing_reads: AtomicUsize::new(0),
			failing_order_writes: AtomicUsize::new(0),
			conflicting_row_writes: AtomicUsize::new(0),
			hidden_order_lookups: AtomicUsize::new(0),
			close_on_row_write: Mutex::new(None),
		}
	}

	/// Session and participant reads fail.
	pub fn fail_reads(&self, n: usize) {
		self.failing_reads.store(n, Ordering::SeqCst);
	}

	/// Order inserts fail as if the store were down.
	pub fn fail_order_writes(&self, n: usize) {
		self.failing_order_writes.store(n, Ordering::SeqCst);
	}

	/// Participant writes report a lost compare-and-swap without writing.
	pub fn conflict_row_writes(&self, n: usize) {
		self.conflicting_row_writes.store(n, Ordering::SeqCst);
	}

	/// The next participant write is preceded by a close towards `to` that
	/// has marked the session but not yet read its rows.
	pub fn close_before_next_row_write(&self, to: SessionStatus) {
		*self.close_on_row_write.lock().unwrap() = Some(to);
	}

	/// Order lookups report nothing even when an order exists.
	pub fn hide_orders(&self, n: usize) {
		self.hidden_order_lookups.store(n, Ordering::SeqCst);
	}
}

#[async_trait]
impl SettlementStore for FlakyStore {
	async fn create_session(
		&self,
		session: &SplitSession,
		participants: &[Participant],
	) -> Result<(), StorageError> {
		self.inner.create_session(session, participants).await
	}

	async fn read_session(&self, session_id: &str) -> Result<SplitSession, StorageError> {
		if take(&self.failing_reads) {
			return Err(unavailable());
		}
		self.inner.read_session(session_id).await
	}

	async fn read_participants(&self, session_id: &str) -> Result<Vec<Participant>, StorageError> {
		if take(&self.failing_reads) {
			return Err(unavailable());
		}
		self.inner.read_participants(session_id).await
	}

	async fn update_participant(
		&self,
		current: &Participant,
		next: &Participant,
	) -> Result<(), StorageError> {
		if take(&self.conflicting_row_writes) {
			return Err(StorageError::Conflict(current.id.clone()));
		}
		let closing = self.close_on_row_write.lock().unwrap().take();
		if let Some(to) = closing {
			let session = self.inner.read_session(&current.session_id).await?;
			let marked = with_hold(&session, Some(SessionHold::Closing { to }));
			self.inner.update_session(&session, &marked).await?;
		}
		self.inner.update_participant(current, next).await
	}

	async fn update_session(
		&self,
		current: &SplitSession,
		next: &SplitSession,
	) -> Result<(), StorageError> {
		self.inner.update_session(current, next).await
	}

	async fn begin_cover(&self, cover: &BalanceCover) -> Result<(), StorageError> {
		self.inner.begin_cover(cover).await
	}

	async fn read_cover(&self, session_id: &str) -> Result<Option<BalanceCover>, StorageError> {
		self.inner.read_cover(session_id).await
	}

	async fn update_cover(
		&self,
		current: &BalanceCover,
		next: &BalanceCover,
	) -> Result<(), StorageError> {
		self.inner.update_cover(current, next).await
	}

	async fn remove_cover(&self, session_id: &str) -> Result<(), StorageError> {
		self.inner.remove_cover(session_id).await
	}

	async fn find_order_by_materialization_key(
		&self,
		key: &str,
	) -> Result<Option<Order>, StorageError> {
		if take(&self.hidden_order_lookups) {
			return Ok(None);
		}
		self.inner.find_order_by_materialization_key(key).await
	}

	async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
		if take(&self.failing_order_writes) {
			return Err(unavailable());
		}
		self.inner.insert_order(order).await
	}

	async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StorageError> {
		self.inner.insert_receipt(receipt).await
	}

	async fn read_receipt(&self, order_id: &str) -> Result<Option<Receipt>, StorageError> {
		self.inner.read_receipt(order_id).await
	}

	async fn count_orders_since(
		&self,
		cafeteria_id: &str,
		since: DateTime<Utc>,
	) -> Result<u64, StorageError> {
		self.inner.count_orders_since(cafeteria_id, since).await
	}
}
