//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::errors::DisburserError;
use crate::orchestrator::{Orchestrator, Snapshot};
use crate::session::{Notification, SessionStore};
use crate::store::DisbursementStore;
use crate::types::{DisbursementRequest, MilestoneId, StepEventRecord};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn DisbursementStore>,
    pub session: Arc<SessionStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/disbursements", post(start_disbursement))
        .route("/disbursements/:id", get(get_disbursement))
        .route("/disbursements/:id/events", get(get_disbursement_events))
        .route("/disbursements/:id/cancel", post(cancel_disbursement))
        .route("/disbursements/:id/retry", post(retry_disbursement))
        .route("/session", post(begin_session).delete(end_session))
        .route("/notifications", get(get_notifications))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventsResponse {
    pub milestone_id: MilestoneId,
    pub count: usize,
    pub events: Vec<StepEventRecord>,
}

#[derive(Serialize)]
pub struct NotificationsResponse {
    pub user: Option<String>,
    pub count: usize,
    pub notifications: Vec<Notification>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct SessionRequest {
    pub user: String,
}

/// Maps domain errors onto HTTP status codes.
pub struct ApiError(DisburserError);

impl From<DisburserError> for ApiError {
    fn from(e: DisburserError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DisburserError::NotFound(_) => StatusCode::NOT_FOUND,
            DisburserError::InvalidStateTransition { .. }
            | DisburserError::AlreadyExecuted
            | DisburserError::Cancelled => StatusCode::CONFLICT,
            DisburserError::ChainUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /disbursements`
///
/// Starts (or resumes) the disbursement for an approved milestone.
pub async fn start_disbursement(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<DisbursementRequest>,
) -> ApiResult<(StatusCode, Json<Snapshot>)> {
    let handle = state.orchestrator.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot().await)))
}

/// `GET /disbursements/:id`
pub async fn get_disbursement(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<MilestoneId>,
) -> ApiResult<Json<Snapshot>> {
    let handle = live_handle(&state, milestone_id).await?;
    Ok(Json(handle.snapshot().await))
}

/// `GET /disbursements/:id/events`
///
/// Returns the persisted step log for the milestone, oldest first.
pub async fn get_disbursement_events(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<MilestoneId>,
) -> ApiResult<Json<EventsResponse>> {
    let events = state.store.events(milestone_id).await?;
    Ok(Json(EventsResponse {
        milestone_id,
        count: events.len(),
        events,
    }))
}

/// `POST /disbursements/:id/cancel`
pub async fn cancel_disbursement(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<MilestoneId>,
) -> ApiResult<Json<Snapshot>> {
    let handle = live_handle(&state, milestone_id).await?;
    state.orchestrator.cancel(&handle).await;
    Ok(Json(handle.snapshot().await))
}

/// `POST /disbursements/:id/retry`
pub async fn retry_disbursement(
    State(state): State<Arc<ApiState>>,
    Path(milestone_id): Path<MilestoneId>,
) -> ApiResult<Json<Snapshot>> {
    let handle = live_handle(&state, milestone_id).await?;
    state.orchestrator.retry(&handle).await?;
    Ok(Json(handle.snapshot().await))
}

/// `POST /session`
pub async fn begin_session(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    state.session.begin(request.user);
    StatusCode::NO_CONTENT
}

/// `DELETE /session`
pub async fn end_session(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.session.end();
    StatusCode::NO_CONTENT
}

/// `GET /notifications`
pub async fn get_notifications(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let notifications = state.session.notifications();
    Json(NotificationsResponse {
        user: state.session.user(),
        count: notifications.len(),
        notifications,
    })
}

/// The tracked handle, or a read-only one for a retired record.
async fn live_handle(
    state: &ApiState,
    milestone_id: MilestoneId,
) -> ApiResult<crate::orchestrator::DisbursementHandle> {
    if let Some(handle) = state.orchestrator.handle(milestone_id).await {
        return Ok(handle);
    }
    match state.store.load(milestone_id).await? {
        Some(record) if record.retired => Ok(state.orchestrator.resume(milestone_id).await?),
        _ => Err(ApiError(DisburserError::NotFound(format!(
            "disbursement {milestone_id}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutils::{chain, fast_config, FakeReader, Reply, PROPOSED, RECIPIENT, SAFE};
    use crate::types::{Status, Step};
    use serde_json::{json, Value};

    fn status_of(e: DisburserError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(status_of(DisburserError::NotFound("7".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(DisburserError::AlreadyExecuted), StatusCode::CONFLICT);
        assert_eq!(status_of(DisburserError::Cancelled), StatusCode::CONFLICT);
        assert_eq!(
            status_of(DisburserError::InvalidStateTransition {
                action: "execute",
                step: Step::CollectSignatures,
                status: Status::InProgress,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(DisburserError::ChainUnavailable("timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(DisburserError::Config("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    async fn serve(reader: Arc<FakeReader>) -> String {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(fast_config(), reader, store.clone());
        let state = Arc::new(ApiState {
            orchestrator: Arc::new(orchestrator),
            store,
            session: Arc::new(SessionStore::new()),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        base
    }

    fn start_body(milestone_id: u64) -> Value {
        json!({
            "milestoneId": milestone_id,
            "safeAddress": SAFE,
            "recipient": RECIPIENT,
            "amount": "1500000000000000000",
            "transactionHash": PROPOSED,
        })
    }

    #[tokio::test]
    async fn routes_drive_a_disbursement() {
        let reader = FakeReader::new(Reply::State(chain(1, 2, false)));
        let base = serve(reader).await;
        let http = reqwest::Client::new();

        let health = http.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let missing = http.get(format!("{base}/disbursements/21")).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let started = http
            .post(format!("{base}/disbursements"))
            .json(&start_body(21))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::ACCEPTED);
        let snapshot: Value = started.json().await.unwrap();
        assert_eq!(snapshot["milestoneId"], 21);
        assert_eq!(snapshot["phase"], "active");
        assert_eq!(snapshot["currentStep"], "COLLECT_SIGNATURES");

        let fetched = http.get(format!("{base}/disbursements/21")).send().await.unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);

        // Retrying an active disbursement is a no-op.
        let retried = http
            .post(format!("{base}/disbursements/21/retry"))
            .send()
            .await
            .unwrap();
        assert_eq!(retried.status(), StatusCode::OK);

        let events: Value = http
            .get(format!("{base}/disbursements/21/events"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(events["milestone_id"], 21);
        assert_eq!(
            events["count"].as_u64().unwrap() as usize,
            events["events"].as_array().unwrap().len()
        );

        let cancelled = http
            .post(format!("{base}/disbursements/21/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(cancelled.status(), StatusCode::OK);
        let snapshot: Value = cancelled.json().await.unwrap();
        assert_eq!(snapshot["phase"], "cancelled");

        // Cancelled handles are released.
        let gone = http.get(format!("{base}/disbursements/21")).send().await.unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completed_disbursement_stays_readable() {
        let reader = FakeReader::new(Reply::State(chain(2, 2, true)));
        let base = serve(reader).await;
        let http = reqwest::Client::new();

        let started = http
            .post(format!("{base}/disbursements"))
            .json(&start_body(22))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::ACCEPTED);

        let completed = tokio::time::timeout(std::time::Duration::from_secs(3), async {
            loop {
                let snapshot: Value = http
                    .get(format!("{base}/disbursements/22"))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if snapshot["phase"] == "completed" {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(completed.is_ok(), "milestone 22 never completed");

        // Starting another milestone sweeps the finished handle out of the map.
        let other = http
            .post(format!("{base}/disbursements"))
            .json(&start_body(23))
            .send()
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::ACCEPTED);

        let fetched = http.get(format!("{base}/disbursements/22")).send().await.unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        let snapshot: Value = fetched.json().await.unwrap();
        assert_eq!(snapshot["phase"], "completed");
        assert_eq!(snapshot["currentStep"], "COMPLETED");
    }
}
