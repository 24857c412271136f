//! Settlement coordinator.
//!
//! One coordinator runs per client view of a session. Many of them, in any
//! number of processes, may watch the same session; they only share the
//! store. Mutations go straight to the store through conditional writes, and
//! a poll loop keeps the local snapshot at most one interval behind.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use splitpay_config::SettlementConfig;
use splitpay_payment::{PaymentCredentials, PaymentOutcome, PaymentRequest, PaymentService};
use splitpay_storage::StorageError;
use splitpay_types::{
	BalanceCover, MaterializedOrder, OrderEvent, Participant, ParticipantEvent, SessionEvent,
	SessionHold, SessionId, SessionStatus, SettlementEvent, SettlementView, SplitSession,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::aggregator::aggregate;
use crate::charge::{charge_share, MAX_WRITE_ATTEMPTS};
use crate::closing::{close_unsettled, resolve_close, with_hold, Close};
use crate::error::{Result, SettlementError};
use crate::event_bus::EventBus;
use crate::expiry::{expire_if_due, ExpiryMonitor};
use crate::materializer::OrderMaterializer;
use crate::participant::{self, Payability, Transition, TransitionOutcome, ALREADY_TERMINAL};
use crate::store::SettlementStore;

/// The coordinator's latest picture of its session.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementSnapshot {
	pub session: SplitSession,
	pub participants: Vec<Participant>,
	pub view: SettlementView,
	pub order: Option<MaterializedOrder>,
	pub observed_at: DateTime<Utc>,
}

impl SettlementSnapshot {
	/// Nothing left to observe: terminal, and a completed session has its order.
	pub fn is_settled(&self) -> bool {
		match self.session.status {
			SessionStatus::Active => false,
			SessionStatus::Completed => self.order.is_some(),
			SessionStatus::Cancelled | SessionStatus::Expired => true,
		}
	}
}

pub struct SettlementCoordinator {
	session_id: SessionId,
	store: Arc<dyn SettlementStore>,
	payments: Arc<PaymentService>,
	materializer: OrderMaterializer,
	event_bus: EventBus,
	settings: SettlementConfig,
	snapshot: ArcSwapOption<SettlementSnapshot>,
}

impl std::fmt::Debug for SettlementCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SettlementCoordinator")
			.field("session_id", &self.session_id)
			.finish_non_exhaustive()
	}
}

/// Running background tasks of a started coordinator.
pub struct CoordinatorHandle {
	shutdown: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
	/// Stops the poll loop and the expiry timer and waits for both.
	pub async fn stop(self) {
		let _ = self.shutdown.send(true);
		for task in self.tasks {
			match task.await {
				Ok(()) => {}
				// The expiry timer is aborted once the session settles.
				Err(e) if e.is_cancelled() => {}
				Err(e) => warn!("Coordinator task ended abnormally: {}", e),
			}
		}
	}

	/// True once every background task has returned.
	pub fn is_finished(&self) -> bool {
		self.tasks.iter().all(|t| t.is_finished())
	}
}

fn same_actor(a: &str, b: &str) -> bool {
	a.trim().eq_ignore_ascii_case(b.trim())
}

impl SettlementCoordinator {
	pub fn new(
		session_id: SessionId,
		store: Arc<dyn SettlementStore>,
		payments: Arc<PaymentService>,
		event_bus: EventBus,
		settings: SettlementConfig,
	) -> Self {
		Self {
			materializer: OrderMaterializer::new(store.clone()),
			session_id,
			store,
			payments,
			event_bus,
			settings,
			snapshot: ArcSwapOption::empty(),
		}
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// The latest snapshot, without touching the store.
	pub fn snapshot(&self) -> Option<Arc<SettlementSnapshot>> {
		self.snapshot.load_full()
	}

	/// Starts the poll loop and the expiry timer.
	///
	/// Loads the session first so an unknown session fails here.
	pub async fn start(self: Arc<Self>) -> Result<CoordinatorHandle> {
		let initial = self.poll_once().await?;
		let (shutdown, rx) = watch::channel(false);

		let expiry = ExpiryMonitor::new(
			self.store.clone(),
			self.session_id.clone(),
			initial.session.expires_at,
		)
		.spawn(rx.clone());

		let poller = tokio::spawn(self.clone().poll_loop(rx, expiry.abort_handle()));
		info!(session_id = %self.session_id, "Coordinator started");

		Ok(CoordinatorHandle {
			shutdown,
			tasks: vec![poller, expiry],
		})
	}

	async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, expiry: AbortHandle) {
		let mut ticker = tokio::time::interval(self.settings.poll_interval());
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// The first tick fires immediately and `start` already polled.
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					match self.poll_once().await {
						Ok(snapshot) if snapshot.is_settled() => {
							debug!(session_id = %self.session_id, "Session settled, poller stopping");
							expiry.abort();
							break;
						}
						Ok(_) => {}
						Err(e) => warn!(session_id = %self.session_id, "Poll failed: {}", e),
					}
				}
				_ = shutdown.changed() => break,
			}
		}
	}

	/// One poll tick: expiry check, reload, and materialization when settled.
	pub async fn poll_once(&self) -> Result<Arc<SettlementSnapshot>> {
		expire_if_due(self.store.as_ref(), &self.session_id, Utc::now()).await?;
		let mut snapshot = self.refresh().await?;

		// A cover charged by a call that failed before writing its rows.
		if snapshot.session.accepts_payments() && !snapshot.view.all_paid {
			if let Some(cover) = self.store.read_cover(&self.session_id).await? {
				if cover.is_settled() {
					self.apply_cover(&cover).await?;
					snapshot = self.refresh().await?;
				}
			}
		}

		let needs_order = match snapshot.session.status {
			SessionStatus::Active => snapshot.view.all_paid,
			SessionStatus::Completed => snapshot.order.is_none(),
			SessionStatus::Cancelled | SessionStatus::Expired => false,
		};
		if !needs_order {
			return Ok(snapshot);
		}
		if snapshot.session.is_active() && !self.hold_for_settling().await? {
			return Ok(snapshot);
		}

		match self.materializer.materialize(&snapshot.session).await {
			Ok(Some(order)) => {
				if snapshot.session.is_active() {
					self.complete().await?;
				}
				self.event_bus
					.publish(SettlementEvent::Order(OrderEvent::Materialized {
						session_id: self.session_id.clone(),
						order,
					}));
				self.refresh().await
			}
			Ok(None) => Ok(snapshot),
			Err(e) if e.is_retryable() => {
				warn!(
					session_id = %self.session_id,
					"Materialization deferred to next poll: {}", e
				);
				self.event_bus
					.publish(SettlementEvent::Order(OrderEvent::MaterializationDeferred {
						session_id: self.session_id.clone(),
						reason: e.to_string(),
					}));
				Ok(snapshot)
			}
			Err(e) => Err(e),
		}
	}

	/// Marks a fully paid session as settling so no close can start.
	///
	/// False when the session left `active` or stayed contended; the next poll
	/// looks again.
	async fn hold_for_settling(&self) -> Result<bool> {
		for _ in 0..MAX_WRITE_ATTEMPTS {
			let session = resolve_close(self.store.as_ref(), &self.session_id).await?;
			if !session.is_active() {
				return Ok(false);
			}
			match session.hold {
				Some(SessionHold::Settling) => return Ok(true),
				Some(SessionHold::Closing { .. }) => continue,
				None => {
					let settling = with_hold(&session, Some(SessionHold::Settling));
					match self.store.update_session(&session, &settling).await {
						Ok(()) => return Ok(true),
						Err(StorageError::Conflict(_)) => continue,
						Err(e) => return Err(e.into()),
					}
				}
			}
		}
		Ok(false)
	}

	/// `active → completed`, once the order exists.
	async fn complete(&self) -> Result<()> {
		for _ in 0..MAX_WRITE_ATTEMPTS {
			let session = self.store.read_session(&self.session_id).await?;
			match (session.status, session.hold) {
				// Another observer completed it first.
				(SessionStatus::Completed, _) => return Ok(()),
				(SessionStatus::Active, Some(SessionHold::Settling)) => {
					let mut completed = with_hold(&session, None);
					completed.status = SessionStatus::Completed;
					match self.store.update_session(&session, &completed).await {
						Ok(()) => {
							info!(session_id = %self.session_id, "Session completed");
							return Ok(());
						}
						Err(StorageError::Conflict(_)) => continue,
						Err(e) => return Err(e.into()),
					}
				}
				(status, _) => {
					return Err(SettlementError::StateConflict(format!(
						"session {} is {} and cannot complete",
						self.session_id, status
					)))
				}
			}
		}
		Err(SettlementError::StateConflict(format!(
			"session {} is being updated concurrently",
			self.session_id
		)))
	}

	/// Reloads session and rows and replaces the snapshot.
	///
	/// Status and view changes are published here, as observed, whichever
	/// client caused them.
	async fn refresh(&self) -> Result<Arc<SettlementSnapshot>> {
		let session = self.store.read_session(&self.session_id).await?;
		let participants = self.store.read_participants(&self.session_id).await?;
		let view = aggregate(session.total_amount, &participants);

		let previous = self.snapshot.load_full();
		if let Some(previous) = &previous {
			if previous.session.status != session.status {
				self.publish_status(session.status);
			}
		}
		if previous.as_ref().map(|p| &p.view) != Some(&view) {
			debug!(
				session_id = %self.session_id,
				paid = view.paid_count,
				of = view.participant_count,
				"Settlement view changed"
			);
			self.event_bus
				.publish(SettlementEvent::Session(SessionEvent::ViewChanged {
					session_id: self.session_id.clone(),
					view: view.clone(),
				}));
		}

		let snapshot = Arc::new(SettlementSnapshot {
			session,
			participants,
			view,
			order: self.materializer.cached(),
			observed_at: Utc::now(),
		});
		self.snapshot.store(Some(snapshot.clone()));
		Ok(snapshot)
	}

	fn publish_status(&self, status: SessionStatus) {
		self.event_bus
			.publish(SettlementEvent::Session(SessionEvent::StatusChanged {
				session_id: self.session_id.clone(),
				status,
			}));
	}

	/// Replaces one row in the local snapshot ahead of the next poll.
	fn apply_local(&self, row: &Participant) {
		let Some(current) = self.snapshot.load_full() else {
			return;
		};
		let mut next = (*current).clone();
		if let Some(slot) = next.participants.iter_mut().find(|p| p.id == row.id) {
			*slot = row.clone();
		}
		next.view = aggregate(next.session.total_amount, &next.participants);
		next.observed_at = Utc::now();
		self.snapshot.store(Some(Arc::new(next)));
	}

	/// Fails unless the session is active, expiring it first if its deadline passed.
	async fn ensure_active(&self) -> Result<SplitSession> {
		let session = expire_if_due(self.store.as_ref(), &self.session_id, Utc::now()).await?;
		if !session.is_active() {
			return Err(SettlementError::StateConflict(format!(
				"session {} is {}",
				session.id, session.status
			)));
		}
		Ok(session)
	}

	/// Like [`Self::ensure_active`], and no cancellation or expiry is under way.
	async fn ensure_payable(&self) -> Result<SplitSession> {
		let session = self.ensure_active().await?;
		if session.is_closing() {
			return Err(SettlementError::StateConflict(format!(
				"session {} is closing",
				session.id
			)));
		}
		Ok(session)
	}

	async fn read_row(&self, participant_id: &str) -> Result<Participant> {
		self.store
			.read_participants(&self.session_id)
			.await?
			.into_iter()
			.find(|p| p.id == participant_id)
			.ok_or_else(|| SettlementError::NotFound(format!("participant {}", participant_id)))
	}

	/// Applies `transition` to the stored row, re-reading after a lost write.
	async fn mutate_row<F>(
		&self,
		participant_id: &str,
		transition: F,
	) -> Result<(TransitionOutcome, Participant)>
	where
		F: Fn(&Participant) -> Result<Transition>,
	{
		for _ in 0..MAX_WRITE_ATTEMPTS {
			let current = self.read_row(participant_id).await?;
			match transition(&current)? {
				Transition::Unchanged(reason) => {
					return Ok((TransitionOutcome::Unchanged(reason), current))
				}
				Transition::Apply(next) => {
					match self.store.update_participant(&current, &next).await {
						Ok(()) => {
							self.apply_local(&next);
							return Ok((TransitionOutcome::Applied, next));
						}
						Err(StorageError::Conflict(_)) => {
							debug!(participant_id = %participant_id, "Row changed underneath, retrying");
						}
						Err(e) => return Err(e.into()),
					}
				}
			}
		}
		Err(SettlementError::StateConflict(format!(
			"participant {} is being updated concurrently",
			participant_id
		)))
	}

	/// The invited party accepts their invitation.
	pub async fn accept_invitation(
		&self,
		participant_id: &str,
		actor: &str,
	) -> Result<TransitionOutcome> {
		self.ensure_active().await?;
		let (outcome, row) = self
			.mutate_row(participant_id, |p| participant::accept(p, actor, Utc::now()))
			.await?;

		if outcome == TransitionOutcome::Applied {
			info!(session_id = %self.session_id, participant_id = %participant_id, "Invitation accepted");
			self.event_bus
				.publish(SettlementEvent::Participant(ParticipantEvent::InvitationAccepted {
					session_id: self.session_id.clone(),
					participant: row,
				}));
		}
		Ok(outcome)
	}

	/// The invited party declines their invitation. Their share stays unpaid.
	pub async fn reject_invitation(
		&self,
		participant_id: &str,
		actor: &str,
	) -> Result<TransitionOutcome> {
		self.ensure_active().await?;
		let (outcome, row) = self
			.mutate_row(participant_id, |p| participant::reject(p, actor, Utc::now()))
			.await?;

		if outcome == TransitionOutcome::Applied {
			info!(session_id = %self.session_id, participant_id = %participant_id, "Invitation rejected");
			self.event_bus
				.publish(SettlementEvent::Participant(ParticipantEvent::InvitationRejected {
					session_id: self.session_id.clone(),
					participant: row,
				}));
		}
		Ok(outcome)
	}

	/// Pays the actor's own share.
	pub async fn pay_my_share(
		&self,
		participant_id: &str,
		actor: &str,
		method_ref: &str,
		credentials: &PaymentCredentials,
	) -> Result<TransitionOutcome> {
		self.ensure_payable().await?;
		let row = self.read_row(participant_id).await?;
		if participant::check_payable(&row, actor)? == Payability::AlreadyPaid {
			return Ok(TransitionOutcome::Unchanged(ALREADY_TERMINAL.to_string()));
		}

		match charge_share(
			self.store.as_ref(),
			&self.payments,
			&row,
			method_ref,
			credentials,
		)
		.await
		{
			Ok(charge) => {
				self.apply_local(&charge.participant);
				if charge.outcome == TransitionOutcome::Applied {
					self.event_bus
						.publish(SettlementEvent::Participant(ParticipantEvent::PaymentSettled {
							session_id: self.session_id.clone(),
							participant: charge.participant,
						}));
				}
				Ok(charge.outcome)
			}
			Err(SettlementError::PaymentDeclined(reason)) => {
				info!(
					session_id = %self.session_id,
					participant_id = %participant_id,
					"Payment declined: {}", reason
				);
				if let Ok(row) = self.read_row(participant_id).await {
					self.apply_local(&row);
				}
				self.event_bus
					.publish(SettlementEvent::Participant(ParticipantEvent::PaymentDeclined {
						session_id: self.session_id.clone(),
						participant_id: participant_id.to_string(),
						reason: reason.clone(),
					}));
				Err(SettlementError::PaymentDeclined(reason))
			}
			Err(e) => Err(e),
		}
	}

	/// The initiator pays everything still unpaid and settles those rows.
	///
	/// The charge is recorded before money moves. A call that fails after the
	/// charge leaves a settled record behind; the next call, or the next poll,
	/// writes the rows from it without charging again.
	pub async fn cover_remaining_balance(
		&self,
		actor: &str,
		method_ref: &str,
		credentials: &PaymentCredentials,
	) -> Result<TransitionOutcome> {
		let session = self.ensure_payable().await?;
		if !same_actor(&session.initiator_id, actor) {
			return Err(SettlementError::Unauthorized(format!(
				"only the initiator can cover the remaining balance of session {}",
				session.id
			)));
		}

		let participants = self.store.read_participants(&self.session_id).await?;
		let view = aggregate(session.total_amount, &participants);
		if view.all_paid {
			return Ok(TransitionOutcome::Unchanged(
				"session is already fully paid".to_string(),
			));
		}

		if let Some(existing) = self.store.read_cover(&self.session_id).await? {
			if existing.is_settled() {
				info!(session_id = %self.session_id, "Finishing balance cover charged earlier");
				return self.apply_cover(&existing).await;
			}
			return Err(cover_in_progress(&self.session_id));
		}

		let payer = participants
			.iter()
			.find(|p| p.is_initiator)
			.ok_or_else(|| SettlementError::NotFound("initiator row".to_string()))?;
		let cover = BalanceCover::charging(&self.session_id, &payer.id, view.unpaid_amount, Utc::now());
		match self.store.begin_cover(&cover).await {
			Ok(()) => {}
			Err(StorageError::Conflict(_)) => return Err(cover_in_progress(&self.session_id)),
			Err(e) => return Err(e.into()),
		}

		let request = PaymentRequest {
			participant_id: payer.id.clone(),
			amount: cover.amount,
			method_ref: method_ref.to_string(),
			credentials: credentials.clone(),
		};
		let reference = match self.payments.pay(&request).await {
			Ok(PaymentOutcome::Settled { reference }) => reference,
			Ok(PaymentOutcome::Declined { reason }) => {
				self.abandon_cover().await;
				self.event_bus
					.publish(SettlementEvent::Participant(ParticipantEvent::PaymentDeclined {
						session_id: self.session_id.clone(),
						participant_id: payer.id.clone(),
						reason: reason.clone(),
					}));
				return Err(SettlementError::PaymentDeclined(reason));
			}
			Err(e) => {
				self.abandon_cover().await;
				return Err(e.into());
			}
		};

		let settled = cover.settled(reference, Utc::now());
		self.mark_cover_settled(&cover, &settled).await;
		self.apply_cover(&settled).await
	}

	/// Drops a cover record whose charge did not go through.
	async fn abandon_cover(&self) {
		if let Err(e) = self.store.remove_cover(&self.session_id).await {
			warn!(session_id = %self.session_id, "Failed to drop unpaid cover record: {}", e);
		}
	}

	async fn mark_cover_settled(&self, charging: &BalanceCover, settled: &BalanceCover) {
		for attempt in 1..=MAX_WRITE_ATTEMPTS {
			match self.store.update_cover(charging, settled).await {
				Ok(()) => return,
				Err(e) if attempt == MAX_WRITE_ATTEMPTS => {
					// Rows are still written below; a later retry sees the cover
					// as in progress and needs the charge reconciled by hand.
					warn!(
						session_id = %self.session_id,
						reference = ?settled.reference,
						"Cover charged but its record stayed in charging: {}", e
					);
				}
				Err(e) => debug!(session_id = %self.session_id, "Cover record write failed: {}", e),
			}
		}
	}

	/// Writes the rows a settled cover pays for.
	async fn apply_cover(&self, cover: &BalanceCover) -> Result<TransitionOutcome> {
		let session = resolve_close(self.store.as_ref(), &self.session_id).await?;
		if !session.is_active() {
			return Err(cover_refund_required(cover, &session));
		}

		let participants = self.store.read_participants(&self.session_id).await?;
		let mut covered = Vec::new();
		for row in participants.iter().filter(|p| !p.is_paid()) {
			let (outcome, _) = self
				.mutate_row(&row.id, |p| Ok(participant::cover(p, Utc::now())))
				.await?;
			if outcome == TransitionOutcome::Applied {
				covered.push(row.id.clone());
			}
		}

		// A close that finished around the writes keeps its rows unpaid.
		let session = resolve_close(self.store.as_ref(), &self.session_id).await?;
		if matches!(session.status, SessionStatus::Cancelled | SessionStatus::Expired) {
			for id in &covered {
				self.mutate_row(id, |p| Ok(participant::uncover(p, Utc::now())))
					.await?;
			}
			return Err(cover_refund_required(cover, &session));
		}

		info!(
			session_id = %self.session_id,
			amount = %cover.amount,
			rows = covered.len(),
			"Remaining balance covered by initiator"
		);
		if !covered.is_empty() {
			self.event_bus
				.publish(SettlementEvent::Participant(ParticipantEvent::BalanceCovered {
					session_id: self.session_id.clone(),
					covered,
				}));
		}
		Ok(TransitionOutcome::Applied)
	}

	/// The initiator abandons an unsettled session.
	pub async fn cancel_session(&self, actor: &str) -> Result<TransitionOutcome> {
		let session = expire_if_due(self.store.as_ref(), &self.session_id, Utc::now()).await?;
		if !same_actor(&session.initiator_id, actor) {
			return Err(SettlementError::Unauthorized(format!(
				"only the initiator can cancel session {}",
				session.id
			)));
		}
		match session.status {
			SessionStatus::Active => {}
			SessionStatus::Cancelled => {
				return Ok(TransitionOutcome::Unchanged("already cancelled".to_string()))
			}
			status => {
				return Err(SettlementError::StateConflict(format!(
					"cannot cancel a {} session",
					status
				)))
			}
		}

		match close_unsettled(self.store.as_ref(), &self.session_id, SessionStatus::Cancelled)
			.await?
		{
			Close::Closed(closed) if closed.status == SessionStatus::Cancelled => {
				// The snapshot catches up on the next poll if this read fails.
				if let Ok(snapshot) = self.refresh().await {
					info!(
						session_id = %self.session_id,
						paid_shares = snapshot.view.paid_count,
						"Session cancelled; paid shares are due a refund"
					);
				}
				Ok(TransitionOutcome::Applied)
			}
			Close::Closed(current) | Close::NotActive(current) => {
				if current.status == SessionStatus::Cancelled {
					Ok(TransitionOutcome::Unchanged("already cancelled".to_string()))
				} else {
					Err(SettlementError::StateConflict(format!(
						"cannot cancel a {} session",
						current.status
					)))
				}
			}
			Close::FullyPaid(_) => Err(SettlementError::StateConflict(
				"cannot cancel a fully paid session".to_string(),
			)),
		}
	}
}

fn cover_in_progress(session_id: &str) -> SettlementError {
	SettlementError::StateConflict(format!(
		"a balance cover for session {} is already in progress",
		session_id
	))
}

fn cover_refund_required(cover: &BalanceCover, session: &SplitSession) -> SettlementError {
	warn!(
		session_id = %session.id,
		status = %session.status,
		amount = %cover.amount,
		reference = ?cover.reference,
		"Cover charge settled for a closed session; it must be refunded"
	);
	SettlementError::StateConflict(format!(
		"session {} is {}; the cover charge of {} must be refunded",
		session.id, session.status, cover.amount
	))
}
