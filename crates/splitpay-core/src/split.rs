//! Starting a split: share planning, input validation and session creation.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use regex::Regex;
use splitpay_config::SettlementConfig;
use splitpay_payment::{PaymentCredentials, PaymentService};
use splitpay_storage::StorageError;
use splitpay_types::{
	CartSnapshot, Participant, PaymentStatus, SessionStatus, SplitMethodKind, SplitSession,
};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::info;

use crate::charge::charge_share;
use crate::error::{Result, SettlementError};
use crate::participant;

const MAX_IDENTIFIER_LEN: usize = 64;

static IDENTIFIER_SYNTAX: LazyLock<std::result::Result<Regex, regex::Error>> =
	LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@+-]+$"));

/// Payment method recorded on an initiator row with nothing to pay.
pub const NOTHING_DUE: &str = "nothing due";

/// How the total is divided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SplitMethod {
	/// Everyone, the initiator included, owes the same rounded share.
	Equal,
	/// Caller-chosen amounts, one per invitee, plus the initiator's own share.
	Custom {
		initiator_share: Decimal,
		shares: Vec<Decimal>,
	},
}

impl SplitMethod {
	fn kind(&self) -> SplitMethodKind {
		match self {
			SplitMethod::Equal => SplitMethodKind::Equal,
			SplitMethod::Custom { .. } => SplitMethodKind::Custom,
		}
	}
}

/// Everything needed to open a split session.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
	pub initiator_id: String,
	pub cafeteria_id: String,
	pub cart: CartSnapshot,
	pub total_amount: Decimal,
	pub pickup_time_preference: Option<String>,
	/// Contact handles of the invited parties.
	pub invitees: Vec<String>,
	pub method: SplitMethod,
	/// How the initiator pays their own share.
	pub payment_method_ref: String,
	pub credentials: PaymentCredentials,
}

/// Amounts owed, initiator first.
#[derive(Debug, Clone, PartialEq)]
pub struct SharePlan {
	pub initiator_share: Decimal,
	pub invitee_shares: Vec<Decimal>,
}

/// What happened to the initiator's own share during initiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InitiatorPayment {
	NotRequired,
	Settled,
	/// The row is left `failed`; the initiator can retry with `pay_my_share`.
	Declined { reason: String },
}

#[derive(Debug, Clone)]
pub struct InitiatedSession {
	pub session: SplitSession,
	pub participants: Vec<Participant>,
	pub initiator_payment: InitiatorPayment,
}

/// Checks that an invitation handle looks like a username, e-mail or student id.
pub fn validate_identifier(identifier: &str) -> Result<()> {
	let identifier = identifier.trim();
	if identifier.is_empty() {
		return Err(SettlementError::Validation(
			"participant identifier must not be empty".to_string(),
		));
	}
	if identifier.len() > MAX_IDENTIFIER_LEN {
		return Err(SettlementError::Validation(format!(
			"participant identifier longer than {} characters",
			MAX_IDENTIFIER_LEN
		)));
	}
	let syntax = IDENTIFIER_SYNTAX
		.as_ref()
		.map_err(|e| SettlementError::Validation(format!("identifier syntax: {}", e)))?;
	if !syntax.is_match(identifier) {
		return Err(SettlementError::Validation(format!(
			"invalid participant identifier: {}",
			identifier
		)));
	}
	Ok(())
}

fn is_cents(amount: Decimal) -> bool {
	amount == amount.round_dp(2)
}

/// Divides `total` between the initiator and `invitee_count` invitees.
pub fn plan_shares(
	total: Decimal,
	invitee_count: usize,
	method: &SplitMethod,
	epsilon: Decimal,
) -> Result<SharePlan> {
	if total <= Decimal::ZERO || !is_cents(total) {
		return Err(SettlementError::Validation(format!(
			"total must be a positive amount in cents, got {}",
			total
		)));
	}
	if invitee_count == 0 {
		return Err(SettlementError::Validation(
			"at least one participant must be invited".to_string(),
		));
	}

	match method {
		SplitMethod::Equal => {
			let heads = Decimal::from(invitee_count as u64 + 1);
			let share = (total / heads).round_dp(2);
			let initiator_share = total - share * Decimal::from(invitee_count as u64);
			if share <= Decimal::ZERO || initiator_share < Decimal::ZERO {
				return Err(SettlementError::Validation(format!(
					"total {} is too small to split {} ways",
					total, heads
				)));
			}
			Ok(SharePlan {
				initiator_share,
				invitee_shares: vec![share; invitee_count],
			})
		}
		SplitMethod::Custom {
			initiator_share,
			shares,
		} => {
			if shares.len() != invitee_count {
				return Err(SettlementError::Validation(format!(
					"expected {} custom amounts, got {}",
					invitee_count,
					shares.len()
				)));
			}
			if *initiator_share < Decimal::ZERO || !is_cents(*initiator_share) {
				return Err(SettlementError::Validation(format!(
					"invalid initiator share {}",
					initiator_share
				)));
			}
			if let Some(bad) = shares
				.iter()
				.find(|s| **s <= Decimal::ZERO || !is_cents(**s))
			{
				return Err(SettlementError::Validation(format!(
					"custom amounts must be positive amounts in cents, got {}",
					bad
				)));
			}

			let assigned: Decimal = shares.iter().copied().sum::<Decimal>() + *initiator_share;
			if (assigned - total).abs() > epsilon {
				return Err(SettlementError::Validation(format!(
					"custom amounts sum to {} but the total is {}",
					assigned, total
				)));
			}
			Ok(SharePlan {
				initiator_share: *initiator_share,
				invitee_shares: shares.clone(),
			})
		}
	}
}

fn validate_request(request: &InitiateRequest) -> Result<()> {
	validate_identifier(&request.initiator_id)?;
	if request.cafeteria_id.trim().is_empty() {
		return Err(SettlementError::Validation(
			"cafeteria is required".to_string(),
		));
	}
	if request.cart.cart_id.trim().is_empty() || request.cart.items.is_empty() {
		return Err(SettlementError::Validation(
			"cart must have an id and at least one item".to_string(),
		));
	}

	let mut seen = HashSet::new();
	seen.insert(request.initiator_id.trim().to_ascii_lowercase());
	for invitee in &request.invitees {
		validate_identifier(invitee)?;
		if !seen.insert(invitee.trim().to_ascii_lowercase()) {
			return Err(SettlementError::Validation(format!(
				"{} is invited twice or is the initiator",
				invitee.trim()
			)));
		}
	}
	Ok(())
}

/// Validates the request, persists the session with its rows, then charges the
/// initiator's own share.
pub async fn initiate_session(
	store: &dyn crate::store::SettlementStore,
	payments: &PaymentService,
	settings: &SettlementConfig,
	request: InitiateRequest,
) -> Result<InitiatedSession> {
	validate_request(&request)?;
	let plan = plan_shares(
		request.total_amount,
		request.invitees.len(),
		&request.method,
		settings.split_epsilon,
	)?;

	let now = Utc::now();
	let timeout = chrono::Duration::from_std(settings.session_timeout())
		.map_err(|e| SettlementError::Validation(format!("invalid session timeout: {}", e)))?;

	let session = SplitSession {
		id: uuid::Uuid::new_v4().to_string(),
		initiator_id: request.initiator_id.trim().to_string(),
		total_amount: request.total_amount,
		status: SessionStatus::Active,
		split_method: request.method.kind(),
		cafeteria_id: request.cafeteria_id.clone(),
		cart: request.cart.clone(),
		pickup_time_preference: request.pickup_time_preference.clone(),
		created_at: now,
		expires_at: now + timeout,
		hold: None,
		updated_at: now,
	};

	let mut initiator_row =
		participant::initiator(&session.id, &session.initiator_id, plan.initiator_share, now);
	if plan.initiator_share.is_zero() {
		initiator_row.payment_status = PaymentStatus::Paid;
		initiator_row.paid_at = Some(now);
		initiator_row.payment_method_ref = Some(NOTHING_DUE.to_string());
	}

	let mut participants = vec![initiator_row];
	for (index, (identifier, share)) in request
		.invitees
		.iter()
		.zip(plan.invitee_shares.iter())
		.enumerate()
	{
		participants.push(participant::invite(
			&session.id,
			index as u32 + 1,
			identifier,
			*share,
			now,
		));
	}

	store
		.create_session(&session, &participants)
		.await
		.map_err(|e| match e {
			StorageError::Conflict(msg) => SettlementError::StateConflict(format!(
				"cart already has an active split: {}",
				msg
			)),
			other => other.into(),
		})?;

	info!(
		session_id = %session.id,
		initiator = %session.initiator_id,
		total = %session.total_amount,
		invitees = request.invitees.len(),
		"Split session created"
	);

	let initiator_payment = if plan.initiator_share.is_zero() {
		InitiatorPayment::NotRequired
	} else {
		match charge_share(
			store,
			payments,
			&participants[0],
			&request.payment_method_ref,
			&request.credentials,
		)
		.await
		{
			Ok(charge) => {
				participants[0] = charge.participant;
				InitiatorPayment::Settled
			}
			Err(SettlementError::PaymentDeclined(reason)) => {
				if let Ok(rows) = store.read_participants(&session.id).await {
					participants = rows;
				}
				InitiatorPayment::Declined { reason }
			}
			Err(e) => return Err(e),
		}
	};

	Ok(InitiatedSession {
		session,
		participants,
		initiator_payment,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SettlementStore;
	use crate::testing::{always_decline, always_settle, initiate_request, memory_store};

	fn rm(cents: i64) -> Decimal {
		Decimal::new(cents, 2)
	}

	fn eps() -> Decimal {
		rm(1)
	}

	#[test]
	fn test_equal_split_of_thirty_between_three() {
		let plan = plan_shares(rm(3000), 2, &SplitMethod::Equal, eps()).unwrap();
		assert_eq!(plan.invitee_shares, vec![rm(1000), rm(1000)]);
		assert_eq!(plan.initiator_share, rm(1000));
	}

	#[test]
	fn test_equal_split_rounding_goes_to_initiator() {
		let plan = plan_shares(rm(1000), 2, &SplitMethod::Equal, eps()).unwrap();
		assert_eq!(plan.invitee_shares, vec![rm(333), rm(333)]);
		assert_eq!(plan.initiator_share, rm(334));
		let sum: Decimal = plan.invitee_shares.iter().copied().sum::<Decimal>() + plan.initiator_share;
		assert_eq!(sum, rm(1000));
	}

	#[test]
	fn test_custom_split_reconciles_with_initiator_share() {
		let method = SplitMethod::Custom {
			initiator_share: rm(1000),
			shares: vec![rm(2000), rm(2000)],
		};
		let plan = plan_shares(rm(5000), 2, &method, eps()).unwrap();
		assert_eq!(plan.initiator_share, rm(1000));
	}

	#[test]
	fn test_custom_split_imbalance_is_rejected() {
		let method = SplitMethod::Custom {
			initiator_share: Decimal::ZERO,
			shares: vec![rm(2500), rm(2000)],
		};
		let err = plan_shares(rm(5000), 2, &method, eps()).unwrap_err();
		assert!(matches!(err, SettlementError::Validation(_)));
	}

	#[test]
	fn test_custom_split_within_epsilon_is_accepted() {
		let method = SplitMethod::Custom {
			initiator_share: Decimal::ZERO,
			shares: vec![rm(1666), rm(1667), rm(1666)],
		};
		assert!(plan_shares(rm(5000), 3, &method, eps()).is_ok());
	}

	#[test]
	fn test_custom_split_wrong_count() {
		let method = SplitMethod::Custom {
			initiator_share: Decimal::ZERO,
			shares: vec![rm(5000)],
		};
		assert!(plan_shares(rm(5000), 2, &method, eps()).is_err());
	}

	#[test]
	fn test_empty_invite_list_is_rejected() {
		let err = plan_shares(rm(3000), 0, &SplitMethod::Equal, eps()).unwrap_err();
		assert!(matches!(err, SettlementError::Validation(_)));
	}

	#[test]
	fn test_identifier_validation() {
		assert!(validate_identifier("aisyah@campus.edu").is_ok());
		assert!(validate_identifier("A1234567").is_ok());
		assert!(validate_identifier("  ").is_err());
		assert!(validate_identifier("has space").is_err());
		assert!(validate_identifier("semi;colon").is_err());
		assert!(validate_identifier("zoë").is_err());
		assert!(validate_identifier("a.b_c+d-e").is_ok());
		assert!(validate_identifier(&"x".repeat(64)).is_ok());
		assert!(validate_identifier(&"x".repeat(65)).is_err());
	}

	#[tokio::test]
	async fn test_initiate_creates_rows_and_charges_initiator() {
		let store = memory_store();
		let payments = always_settle();
		let request = initiate_request("cart-1", rm(3000), &["p1", "p2"], SplitMethod::Equal);

		let initiated = initiate_session(
			store.as_ref(),
			&payments,
			&SettlementConfig::default(),
			request,
		)
		.await
		.unwrap();

		assert_eq!(initiated.initiator_payment, InitiatorPayment::Settled);
		assert_eq!(initiated.participants.len(), 3);
		assert!(initiated.participants[0].is_initiator);
		assert!(initiated.participants[0].is_paid());

		let rows = store.read_participants(&initiated.session.id).await.unwrap();
		assert_eq!(rows, initiated.participants);
		assert!(rows[1..].iter().all(|p| !p.is_paid()));
		assert_eq!(
			initiated.session.expires_at - initiated.session.created_at,
			chrono::Duration::minutes(30)
		);
	}

	#[tokio::test]
	async fn test_initiate_rejects_duplicates_without_writing() {
		let store = memory_store();
		let payments = always_settle();
		let request =
			initiate_request("cart-1", rm(3000), &["p1", "P1"], SplitMethod::Equal);

		let err = initiate_session(
			store.as_ref(),
			&payments,
			&SettlementConfig::default(),
			request,
		)
		.await
		.unwrap_err();
		assert!(matches!(err, SettlementError::Validation(_)));

		// Nothing was claimed, so the cart can still be split.
		let request = initiate_request("cart-1", rm(3000), &["p1"], SplitMethod::Equal);
		assert!(initiate_session(
			store.as_ref(),
			&payments,
			&SettlementConfig::default(),
			request
		)
		.await
		.is_ok());
	}

	#[tokio::test]
	async fn test_initiate_rejects_inviting_the_initiator() {
		let store = memory_store();
		let request = initiate_request("cart-1", rm(3000), &["Owner"], SplitMethod::Equal);
		let err = initiate_session(
			store.as_ref(),
			&always_settle(),
			&SettlementConfig::default(),
			request,
		)
		.await
		.unwrap_err();
		assert!(matches!(err, SettlementError::Validation(_)));
	}

	#[tokio::test]
	async fn test_second_split_of_same_cart_conflicts() {
		let store = memory_store();
		let payments = always_settle();
		let settings = SettlementConfig::default();
		initiate_session(
			store.as_ref(),
			&payments,
			&settings,
			initiate_request("cart-1", rm(3000), &["p1"], SplitMethod::Equal),
		)
		.await
		.unwrap();

		let err = initiate_session(
			store.as_ref(),
			&payments,
			&settings,
			initiate_request("cart-1", rm(3000), &["p2"], SplitMethod::Equal),
		)
		.await
		.unwrap_err();
		assert!(matches!(err, SettlementError::StateConflict(_)));
	}

	#[tokio::test]
	async fn test_declined_initiator_payment_leaves_row_retryable() {
		let store = memory_store();
		let initiated = initiate_session(
			store.as_ref(),
			&always_decline(),
			&SettlementConfig::default(),
			initiate_request("cart-1", rm(3000), &["p1"], SplitMethod::Equal),
		)
		.await
		.unwrap();

		assert!(matches!(
			initiated.initiator_payment,
			InitiatorPayment::Declined { .. }
		));
		assert_eq!(
			initiated.participants[0].payment_status,
			PaymentStatus::Failed
		);
		assert!(initiated.session.is_active());
	}

	#[tokio::test]
	async fn test_zero_initiator_share_needs_no_payment() {
		let store = memory_store();
		let method = SplitMethod::Custom {
			initiator_share: Decimal::ZERO,
			shares: vec![rm(2000), rm(2000)],
		};
		let initiated = initiate_session(
			store.as_ref(),
			&always_decline(),
			&SettlementConfig::default(),
			initiate_request("cart-1", rm(4000), &["p1", "p2"], method),
		)
		.await
		.unwrap();

		assert_eq!(initiated.initiator_payment, InitiatorPayment::NotRequired);
		assert!(initiated.participants[0].is_paid());
		assert!(crate::participant::satisfies_invariant(&initiated.participants[0]));
	}
}
