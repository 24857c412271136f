//! Core settlement logic for split-bill sessions.
//!
//! A session divides one cart's total between an initiator and the people
//! they invite. This crate holds the participant state machine, the session
//! aggregator, the coordinator that drives a session from the client side,
//! exactly-once order materialization and session expiry. Persistence and
//! payments are reached through the [`store::SettlementStore`] trait and the
//! `splitpay-payment` service.

pub mod aggregator;
mod charge;
mod closing;
pub mod coordinator;
pub mod error;
pub mod event_bus;
pub mod expiry;
pub mod materializer;
pub mod participant;
pub mod split;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::aggregate;
pub use charge::Charge;
pub use coordinator::{CoordinatorHandle, SettlementCoordinator, SettlementSnapshot};
pub use error::{Result, SettlementError};
pub use event_bus::EventBus;
pub use expiry::{expire_if_due, ExpiryMonitor};
pub use materializer::OrderMaterializer;
pub use participant::TransitionOutcome;
pub use split::{
	initiate_session, plan_shares, InitiateRequest, InitiatedSession, InitiatorPayment,
	SharePlan, SplitMethod,
};
pub use store::{KvSettlementStore, SettlementStore};
