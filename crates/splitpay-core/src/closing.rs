//! Closing an unsettled session, by cancellation or expiry.
//!
//! No transaction spans the session record and its rows, so a close and the
//! last payment meet on the session record. A closer first puts a `Closing`
//! hold on the active session and only then reads the rows: every share paid
//! lifts the hold again, anything less moves the session to its terminal
//! status. A payment that lands while the hold is set finishes the close
//! itself before deciding whether to keep the money.
//!
//! While a session is active a paid share never goes back to unpaid. Shares
//! are only backed out once the session is terminal.

use chrono::Utc;
use splitpay_storage::StorageError;
use splitpay_types::{SessionHold, SessionStatus, SplitSession};
use tracing::{debug, info};

use crate::aggregator::aggregate;
use crate::charge::MAX_WRITE_ATTEMPTS;
use crate::error::{Result, SettlementError};
use crate::store::SettlementStore;

/// How a close attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Close {
	/// The session reached the terminal status of the close.
	Closed(SplitSession),
	/// Every share is paid; the session stays active and will complete.
	FullyPaid(SplitSession),
	/// The session had already left `active`.
	NotActive(SplitSession),
}

/// Returns `session` with `hold` set and a fresh `updated_at`.
pub(crate) fn with_hold(session: &SplitSession, hold: Option<SessionHold>) -> SplitSession {
	let mut next = session.clone();
	next.hold = hold;
	next.updated_at = Utc::now();
	next
}

fn contended(session_id: &str) -> SettlementError {
	SettlementError::StateConflict(format!(
		"session {} is being updated concurrently",
		session_id
	))
}

/// Moves an active, not fully paid session to `to`.
///
/// A close already under way is finished instead, with its own target.
pub(crate) async fn close_unsettled(
	store: &dyn SettlementStore,
	session_id: &str,
	to: SessionStatus,
) -> Result<Close> {
	for _ in 0..MAX_WRITE_ATTEMPTS {
		let session = store.read_session(session_id).await?;
		if !session.is_active() {
			return Ok(Close::NotActive(session));
		}

		let marked = match session.hold {
			Some(SessionHold::Settling) => return Ok(Close::FullyPaid(session)),
			Some(SessionHold::Closing { .. }) => session,
			None => {
				let rows = store.read_participants(session_id).await?;
				if aggregate(session.total_amount, &rows).all_paid {
					return Ok(Close::FullyPaid(session));
				}
				let marked = with_hold(&session, Some(SessionHold::Closing { to }));
				match store.update_session(&session, &marked).await {
					Ok(()) => marked,
					Err(StorageError::Conflict(_)) => continue,
					Err(e) => return Err(e.into()),
				}
			}
		};

		if let Some(done) = finish_close(store, &marked).await? {
			return Ok(done);
		}
	}
	Err(contended(session_id))
}

/// Reads the session, finishing a close somebody left half-way.
pub(crate) async fn resolve_close(
	store: &dyn SettlementStore,
	session_id: &str,
) -> Result<SplitSession> {
	for _ in 0..MAX_WRITE_ATTEMPTS {
		let session = store.read_session(session_id).await?;
		if !session.is_closing() {
			return Ok(session);
		}
		match finish_close(store, &session).await? {
			Some(Close::Closed(s)) | Some(Close::FullyPaid(s)) | Some(Close::NotActive(s)) => {
				return Ok(s)
			}
			None => continue,
		}
	}
	Err(contended(session_id))
}

/// Second half of a close: decide on the rows as they are now.
///
/// `None` when another writer changed the session first.
async fn finish_close(
	store: &dyn SettlementStore,
	marked: &SplitSession,
) -> Result<Option<Close>> {
	let Some(SessionHold::Closing { to }) = marked.hold else {
		return Ok(None);
	};

	let rows = store.read_participants(&marked.id).await?;
	let fully_paid = aggregate(marked.total_amount, &rows).all_paid;
	let mut next = with_hold(marked, None);
	if !fully_paid {
		next.status = to;
	}

	match store.update_session(marked, &next).await {
		Ok(()) if fully_paid => {
			info!(session_id = %marked.id, "Every share is paid, {} abandoned", to);
			Ok(Some(Close::FullyPaid(next)))
		}
		Ok(()) => {
			info!(session_id = %marked.id, status = %to, "Session closed unsettled");
			Ok(Some(Close::Closed(next)))
		}
		Err(StorageError::Conflict(_)) => {
			debug!(session_id = %marked.id, "Close finished by another writer");
			Ok(None)
		}
		Err(e) => Err(e.into()),
	}
}
