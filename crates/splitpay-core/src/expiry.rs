//! Session expiry.
//!
//! A session that is still unsettled at its deadline moves to `expired`. The
//! timer here is one trigger; every poll and mutation also calls
//! [`expire_if_due`], so a deadline missed while no timer ran is still honored.

use chrono::{DateTime, Utc};
use splitpay_types::{SessionStatus, SplitSession};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::closing::{close_unsettled, resolve_close, Close};
use crate::error::Result;
use crate::store::SettlementStore;

/// Expires the session if its deadline has passed and it is not fully paid.
///
/// Returns the session as stored after the check. A cancellation or expiry
/// left half-way by another writer is finished first.
pub async fn expire_if_due(
	store: &dyn SettlementStore,
	session_id: &str,
	now: DateTime<Utc>,
) -> Result<SplitSession> {
	let session = resolve_close(store, session_id).await?;
	if !session.is_active() || !session.deadline_passed(now) {
		return Ok(session);
	}

	match close_unsettled(store, session_id, SessionStatus::Expired).await? {
		Close::Closed(closed) => {
			if closed.status == SessionStatus::Expired {
				info!(session_id = %session_id, "Session expired unsettled");
			}
			Ok(closed)
		}
		// Settled in time; completion is the poller's job.
		Close::FullyPaid(session) => Ok(session),
		Close::NotActive(session) => {
			debug!(session_id = %session_id, "Session left active state before expiry");
			Ok(session)
		}
	}
}

/// Timer that fires once at a session's deadline.
///
/// It only writes the status; observers see the change on their next poll.
pub struct ExpiryMonitor {
	store: Arc<dyn SettlementStore>,
	session_id: String,
	deadline: DateTime<Utc>,
}

impl ExpiryMonitor {
	pub fn new(
		store: Arc<dyn SettlementStore>,
		session_id: String,
		deadline: DateTime<Utc>,
	) -> Self {
		Self {
			store,
			session_id,
			deadline,
		}
	}

	/// Spawns the timer. It stops early when `shutdown` flips to true.
	pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let wait = (self.deadline - Utc::now()).to_std().unwrap_or_default();
			tokio::select! {
				_ = tokio::time::sleep(wait) => {}
				_ = shutdown.changed() => {
					debug!(session_id = %self.session_id, "Expiry timer cancelled");
					return;
				}
			}

			// The poller checks the deadline as well and retries on failure.
			if let Err(e) = expire_if_due(self.store.as_ref(), &self.session_id, Utc::now()).await {
				warn!(session_id = %self.session_id, "Expiry check failed: {}", e);
			}
		})
	}
}
