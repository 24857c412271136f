//! Split service: owns the shared store and payment provider and one running
//! coordinator per unsettled session this process serves. Coordinators of
//! settled sessions are dropped; those sessions are answered from a single
//! poll.

use anyhow::{Context, Result};
use dashmap::DashMap;
use splitpay_config::Config;
use splitpay_core::{
	initiate_session, CoordinatorHandle, EventBus, InitiateRequest, InitiatedSession,
	KvSettlementStore, SettlementCoordinator, SettlementError, SettlementStore,
};
use splitpay_payment::{create_payment, PaymentService};
use splitpay_storage::{create_storage, StorageService};
use splitpay_types::SessionId;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SplitService {
	config: Config,
	store: Arc<dyn SettlementStore>,
	payments: Arc<PaymentService>,
	event_bus: EventBus,
	coordinators: DashMap<SessionId, Arc<SettlementCoordinator>>,
	handles: DashMap<SessionId, CoordinatorHandle>,
}

impl SplitService {
	/// Builds the store and payment provider named in the configuration.
	pub fn from_config(config: Config) -> Result<Self> {
		let backend = create_storage(&config.storage.backend, &config.storage.config)
			.context("Failed to create storage backend")?;
		let store: Arc<dyn SettlementStore> = Arc::new(KvSettlementStore::new(Arc::new(
			StorageService::new(backend),
		)));

		let provider = create_payment(&config.payment.provider, &config.payment.config)
			.context("Failed to create payment provider")?;
		let payments = Arc::new(PaymentService::new(provider));

		info!(
			storage = %config.storage.backend,
			payment = %config.payment.provider,
			"Split service initialized"
		);
		Ok(Self::new(config, store, payments))
	}

	pub fn new(config: Config, store: Arc<dyn SettlementStore>, payments: Arc<PaymentService>) -> Self {
		Self {
			event_bus: EventBus::new(config.settlement.event_capacity),
			config,
			store,
			payments,
			coordinators: DashMap::new(),
			handles: DashMap::new(),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Number of sessions with a running coordinator in this process.
	pub fn session_count(&self) -> usize {
		self.coordinators.len()
	}

	/// Forgets coordinators whose background tasks have ended.
	///
	/// Returns how many were removed.
	pub fn reap_finished(&self) -> usize {
		let finished: Vec<SessionId> = self
			.handles
			.iter()
			.filter(|entry| entry.value().is_finished())
			.map(|entry| entry.key().clone())
			.collect();

		let mut reaped = 0;
		for id in finished {
			if self
				.handles
				.remove_if(&id, |_, handle| handle.is_finished())
				.is_some()
			{
				self.coordinators.remove(&id);
				reaped += 1;
			}
		}
		if reaped > 0 {
			debug!(reaped, "Reaped settled coordinators");
		}
		reaped
	}

	/// Opens a new split session and starts watching it.
	pub async fn initiate(
		&self,
		request: InitiateRequest,
	) -> Result<InitiatedSession, SettlementError> {
		let initiated = initiate_session(
			self.store.as_ref(),
			&self.payments,
			&self.config.settlement,
			request,
		)
		.await?;
		self.coordinator(&initiated.session.id).await?;
		Ok(initiated)
	}

	/// Returns the coordinator of a session, starting one on first use.
	///
	/// A session with nothing left to observe gets a coordinator that has
	/// polled once and is not kept.
	pub async fn coordinator(
		&self,
		session_id: &str,
	) -> Result<Arc<SettlementCoordinator>, SettlementError> {
		self.reap_finished();
		if let Some(existing) = self.coordinators.get(session_id) {
			return Ok(existing.clone());
		}

		let coordinator = Arc::new(SettlementCoordinator::new(
			session_id.to_string(),
			self.store.clone(),
			self.payments.clone(),
			self.event_bus.clone(),
			self.config.settlement.clone(),
		));
		let snapshot = coordinator.poll_once().await?;
		if snapshot.is_settled() {
			debug!(session_id = %session_id, status = %snapshot.session.status, "Serving settled session");
			return Ok(coordinator);
		}
		let handle = coordinator.clone().start().await?;

		// Another request may have started one meanwhile; keep the first.
		let winner = self
			.coordinators
			.entry(session_id.to_string())
			.or_insert_with(|| coordinator.clone())
			.clone();
		if Arc::ptr_eq(&winner, &coordinator) {
			self.handles.insert(session_id.to_string(), handle);
		} else {
			handle.stop().await;
		}
		Ok(winner)
	}

	/// Stops every coordinator.
	pub async fn shutdown(&self) {
		let ids: Vec<SessionId> = self.handles.iter().map(|e| e.key().clone()).collect();
		for id in ids {
			if let Some((_, handle)) = self.handles.remove(&id) {
				handle.stop().await;
			}
		}
		info!("All coordinators stopped");
	}
}
