//! HTTP API for the split-bill client.

use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use splitpay_core::{InitiateRequest, SettlementError, SplitMethod, TransitionOutcome};
use splitpay_payment::PaymentCredentials;
use splitpay_types::CartSnapshot;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::service::SplitService;

#[derive(Clone)]
struct AppState {
	service: Arc<SplitService>,
}

/// Error response carrying a settlement error to the client.
pub struct ApiError(SettlementError);

impl From<SettlementError> for ApiError {
	fn from(e: SettlementError) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, kind) = match &self.0 {
			SettlementError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
			SettlementError::StateConflict(_) => (StatusCode::CONFLICT, "state_conflict"),
			SettlementError::MaterializationConflict(_) => {
				(StatusCode::CONFLICT, "materialization_conflict")
			}
			SettlementError::PaymentDeclined(_) => {
				(StatusCode::PAYMENT_REQUIRED, "payment_declined")
			}
			SettlementError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
			SettlementError::Unauthorized(_) => (StatusCode::FORBIDDEN, "unauthorized"),
			SettlementError::TransientStore(_) => {
				(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
			}
			SettlementError::Payment(_) => (StatusCode::BAD_GATEWAY, "payment_provider"),
			SettlementError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
		};
		let body = serde_json::json!({
			"error": kind,
			"message": self.0.to_string(),
			"retryable": self.0.is_retryable(),
		});
		(status, Json(body)).into_response()
	}
}

type ApiResult<T> = Result<T, ApiError>;

fn equal_split() -> SplitMethod {
	SplitMethod::Equal
}

#[derive(Debug, Deserialize)]
struct InitiateBody {
	initiator_id: String,
	cafeteria_id: String,
	cart: CartSnapshot,
	total_amount: Decimal,
	#[serde(default)]
	pickup_time_preference: Option<String>,
	invitees: Vec<String>,
	#[serde(default = "equal_split")]
	split: SplitMethod,
	payment_method_ref: String,
	#[serde(default)]
	credentials: PaymentCredentials,
}

#[derive(Debug, Deserialize)]
struct ActorBody {
	actor: String,
}

#[derive(Debug, Deserialize)]
struct PayBody {
	actor: String,
	payment_method_ref: String,
	#[serde(default)]
	credentials: PaymentCredentials,
}

pub fn router(service: Arc<SplitService>) -> Router {
	Router::new()
		.route("/health", get(health_check))
		.route("/api/sessions", post(initiate))
		.route("/api/sessions/{id}", get(get_session))
		.route(
			"/api/sessions/{id}/participants/{pid}/accept",
			post(accept_invitation),
		)
		.route(
			"/api/sessions/{id}/participants/{pid}/reject",
			post(reject_invitation),
		)
		.route("/api/sessions/{id}/participants/{pid}/pay", post(pay_share))
		.route("/api/sessions/{id}/cover", post(cover_remaining))
		.route("/api/sessions/{id}/cancel", post(cancel_session))
		.with_state(AppState { service })
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
}

/// Serves the API until the listener fails or the task is aborted.
pub async fn start_http_server(service: Arc<SplitService>, host: String, port: u16) -> anyhow::Result<()> {
	let app = router(service);
	let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
	info!("API server listening on {}:{}", host, port);
	axum::serve(listener, app).await?;
	Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
	Json(serde_json::json!({
		"status": "ok",
		"service": state.service.config().service.name,
		"sessions": state.service.session_count(),
	}))
}

async fn initiate(
	State(state): State<AppState>,
	Json(body): Json<InitiateBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
	let request = InitiateRequest {
		initiator_id: body.initiator_id,
		cafeteria_id: body.cafeteria_id,
		cart: body.cart,
		total_amount: body.total_amount,
		pickup_time_preference: body.pickup_time_preference,
		invitees: body.invitees,
		method: body.split,
		payment_method_ref: body.payment_method_ref,
		credentials: body.credentials,
	};
	let initiated = state.service.initiate(request).await?;

	Ok((
		StatusCode::CREATED,
		Json(serde_json::json!({
			"session": initiated.session,
			"participants": initiated.participants,
			"initiator_payment": initiated.initiator_payment,
		})),
	))
}

async fn get_session(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
	let coordinator = state.service.coordinator(&id).await?;
	let snapshot = match coordinator.snapshot() {
		Some(snapshot) => snapshot,
		None => coordinator.poll_once().await?,
	};
	Ok(Json(serde_json::json!(snapshot.as_ref())))
}

async fn accept_invitation(
	State(state): State<AppState>,
	Path((id, pid)): Path<(String, String)>,
	Json(body): Json<ActorBody>,
) -> ApiResult<Json<TransitionOutcome>> {
	let coordinator = state.service.coordinator(&id).await?;
	Ok(Json(coordinator.accept_invitation(&pid, &body.actor).await?))
}

async fn reject_invitation(
	State(state): State<AppState>,
	Path((id, pid)): Path<(String, String)>,
	Json(body): Json<ActorBody>,
) -> ApiResult<Json<TransitionOutcome>> {
	let coordinator = state.service.coordinator(&id).await?;
	Ok(Json(coordinator.reject_invitation(&pid, &body.actor).await?))
}

async fn pay_share(
	State(state): State<AppState>,
	Path((id, pid)): Path<(String, String)>,
	Json(body): Json<PayBody>,
) -> ApiResult<Json<TransitionOutcome>> {
	let coordinator = state.service.coordinator(&id).await?;
	let outcome = coordinator
		.pay_my_share(&pid, &body.actor, &body.payment_method_ref, &body.credentials)
		.await?;
	Ok(Json(outcome))
}

async fn cover_remaining(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<PayBody>,
) -> ApiResult<Json<TransitionOutcome>> {
	let coordinator = state.service.coordinator(&id).await?;
	let outcome = coordinator
		.cover_remaining_balance(&body.actor, &body.payment_method_ref, &body.credentials)
		.await?;
	Ok(Json(outcome))
}

async fn cancel_session(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<ActorBody>,
) -> ApiResult<Json<TransitionOutcome>> {
	let coordinator = state.service.coordinator(&id).await?;
	Ok(Json(coordinator.cancel_session(&body.actor).await?))
}
