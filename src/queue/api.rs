use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::coordinator::{Coordinator, CycleReport};
use super::models::{PhaseQueueItem, RemovalOutcome};
use super::store::PhaseQueueStore;
use super::ws::{Broadcaster, WsBroadcaster};
use crate::errors::QueueError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: PhaseQueueStore,
    pub broadcaster: WsBroadcaster,
    pub coordinator: Arc<Coordinator>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub phases: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub external_ref: i64,
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub error: String,
}

#[derive(Deserialize, Default)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize, Default)]
pub struct RunningQuery {
    pub group_id: Option<i64>,
}

#[derive(Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub cycles_completed: u64,
    pub poll_interval_secs: u64,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let msg = e.to_string();
        match e {
            QueueError::Validation(_) => ApiError::BadRequest(msg),
            QueueError::InvalidTransition { .. } => ApiError::Conflict(msg),
            QueueError::NotFound { .. } => ApiError::NotFound(msg),
            QueueError::Database(_) | QueueError::LockPoisoned | QueueError::Other(_) => {
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/groups", get(list_groups))
        .route("/api/groups/{group_id}", get(get_group).delete(cancel_group))
        .route("/api/groups/{group_id}/phases", post(enqueue_phases))
        .route("/api/phases/running", get(list_running))
        .route("/api/phases/{queue_id}", get(get_phase).delete(remove_phase))
        .route("/api/phases/{queue_id}/running", post(mark_running))
        .route("/api/phases/{queue_id}/complete", post(mark_complete))
        .route("/api/phases/{queue_id}/fail", post(mark_failed))
        .route("/api/coordinator", get(coordinator_status))
        .route("/api/coordinator/reconcile", post(reconcile))
        .route("/health", get(health_check))
}

// ── Broadcast helpers ─────────────────────────────────────────────────

/// Push the group's current chain to live viewers. Never fails the request.
async fn publish_group(state: &AppState, group_id: i64) {
    match state.store.get_by_group(group_id).await {
        Ok(items) => {
            if let Err(e) = state.broadcaster.publish(group_id, &items) {
                warn!(group_id, error = %e, "broadcast failed");
            }
        }
        Err(e) => warn!(group_id, error = %e, "could not load group for broadcast"),
    }
}

fn publish_transitions<'a>(state: &AppState, items: impl IntoIterator<Item = &'a PhaseQueueItem>) {
    for item in items {
        if let Err(e) = state.broadcaster.publish_transition(item) {
            warn!(queue_id = %item.queue_id, error = %e, "broadcast failed");
        }
    }
}

async fn publish_removal(state: &AppState, outcome: &RemovalOutcome) {
    let Some(group_id) = outcome.group_id else {
        return;
    };
    if let Err(e) = state.broadcaster.publish_removed(group_id, &outcome.removed) {
        warn!(group_id, error = %e, "broadcast failed");
    }
    publish_group(state, group_id).await;
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_groups(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let groups = state.store.list_groups().await?;
    Ok(Json(groups))
}

async fn get_group(
    State(state): State<SharedState>,
    Path(group_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.store.group_view(group_id).await?;
    if view.phases.is_empty() {
        return Err(ApiError::NotFound(format!("Group {} not found", group_id)));
    }
    Ok(Json(view))
}

async fn enqueue_phases(
    State(state): State<SharedState>,
    Path(group_id): Path<i64>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.store.enqueue_items(group_id, req.phases).await?;
    if let Err(e) = state.broadcaster.publish(group_id, &items) {
        warn!(group_id, error = %e, "broadcast failed");
    }
    Ok((StatusCode::CREATED, Json(items)))
}

async fn cancel_group(
    State(state): State<SharedState>,
    Path(group_id): Path<i64>,
    Query(query): Query<ForceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.store.cancel_group(group_id, query.force).await?;
    if outcome.removed.is_empty() {
        return Err(ApiError::NotFound(format!(
            "Group {} has no removable phases",
            group_id
        )));
    }
    publish_removal(&state, &outcome).await;
    Ok(Json(outcome))
}

async fn list_running(
    State(state): State<SharedState>,
    Query(query): Query<RunningQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.store.get_running(query.group_id).await?;
    Ok(Json(items))
}

async fn get_phase(
    State(state): State<SharedState>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get(&queue_id).await? {
        Some(item) => Ok(Json(item)),
        None => Err(QueueError::not_found(&queue_id).into()),
    }
}

async fn remove_phase(
    State(state): State<SharedState>,
    Path(queue_id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.store.remove(&queue_id, query.force).await?;
    publish_removal(&state, &outcome).await;
    Ok(Json(outcome))
}

async fn mark_running(
    State(state): State<SharedState>,
    Path(queue_id): Path<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.store.mark_running(&queue_id, req.external_ref).await?;
    publish_group(&state, item.group_id).await;
    Ok(Json(item))
}

async fn mark_complete(
    State(state): State<SharedState>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.store.mark_complete(&queue_id).await?;
    if outcome.changed {
        publish_group(&state, outcome.item.group_id).await;
        publish_transitions(&state, [&outcome.item]);
    }
    Ok(Json(outcome))
}

async fn mark_failed(
    State(state): State<SharedState>,
    Path(queue_id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.store.mark_failed(&queue_id, &req.error).await?;
    if outcome.changed {
        publish_group(&state, outcome.item.group_id).await;
        publish_transitions(&state, std::iter::once(&outcome.item).chain(&outcome.blocked));
    }
    Ok(Json(outcome))
}

async fn coordinator_status(State(state): State<SharedState>) -> Json<CoordinatorStatus> {
    Json(CoordinatorStatus {
        running: state.coordinator.is_running(),
        cycles_completed: state.coordinator.cycles_completed(),
        poll_interval_secs: state.coordinator.config().poll_interval.as_secs(),
    })
}

async fn reconcile(State(state): State<SharedState>) -> Json<CycleReport> {
    Json(state.coordinator.run_cycle().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::coordinator::CoordinatorConfig;
    use crate::queue::github::LogNotifier;
    use crate::queue::provider::{ExternalStatus, ExternalStatusProvider};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Every run reports success.
    struct SucceedingProvider;

    #[async_trait]
    impl ExternalStatusProvider for SucceedingProvider {
        async fn get_status(&self, _external_ref: i64) -> anyhow::Result<ExternalStatus> {
            Ok(ExternalStatus::Succeeded)
        }
    }

    fn test_state() -> SharedState {
        let store = PhaseQueueStore::in_memory().unwrap();
        let broadcaster = WsBroadcaster::new();
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::new(SucceedingProvider),
            Arc::new(broadcaster.clone()),
            Arc::new(LogNotifier),
            CoordinatorConfig::default(),
        ));
        Arc::new(AppState {
            store,
            broadcaster,
            coordinator,
        })
    }

    fn test_app() -> (Router, SharedState) {
        let state = test_state();
        (api_router().with_state(state.clone()), state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Enqueue `n` titled phases for `group_id` and return their ids.
    async fn enqueue(app: &Router, group_id: i64, n: usize) -> Vec<String> {
        let phases: Vec<Value> = (1..=n).map(|i| json!({"title": format!("p{i}")})).collect();
        let response = send(
            app,
            "POST",
            &format!("/api/groups/{group_id}/phases"),
            Some(json!({ "phases": phases })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let items: Vec<Value> = body_json(response).await;
        items
            .iter()
            .map(|i| i["queue_id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_enqueue_creates_linear_chain() {
        let (app, _) = test_app();
        let ids = enqueue(&app, 7, 3).await;
        assert_eq!(ids.len(), 3);

        let response = send(&app, "GET", "/api/groups/7", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let view: Value = body_json(response).await;
        assert_eq!(view["summary"]["total"], 3);
        assert_eq!(view["summary"]["ready"], 1);
        assert_eq!(view["phases"][0]["status"], "ready");
        assert_eq!(view["phases"][2]["depends_on_phase"], 2);

        let groups: Vec<i64> = body_json(send(&app, "GET", "/api/groups", None).await).await;
        assert_eq!(groups, vec![7]);
    }

    #[tokio::test]
    async fn test_enqueue_empty_chain_is_bad_request() {
        let (app, _) = test_app();
        let response = send(
            &app,
            "POST",
            "/api/groups/1/phases",
            Some(json!({"phases": []})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("at least one phase"));
    }

    #[tokio::test]
    async fn test_unknown_group_and_phase_are_404() {
        let (app, _) = test_app();
        assert_eq!(
            send(&app, "GET", "/api/groups/99", None).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            send(&app, "GET", "/api/phases/missing", None).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            send(&app, "POST", "/api/phases/missing/complete", None)
                .await
                .status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_dispatching_a_queued_phase_conflicts() {
        let (app, _) = test_app();
        let ids = enqueue(&app, 2, 2).await;
        let response = send(
            &app,
            "POST",
            &format!("/api/phases/{}/running", ids[1]),
            Some(json!({"external_ref": 55})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_dispatch_complete_promotes_successor() {
        let (app, _) = test_app();
        let ids = enqueue(&app, 3, 2).await;

        let response = send(
            &app,
            "POST",
            &format!("/api/phases/{}/running", ids[0]),
            Some(json!({"external_ref": 300})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let running: Vec<Value> =
            body_json(send(&app, "GET", "/api/phases/running?group_id=3", None).await).await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0]["external_ref"], 300);

        let outcome: Value = body_json(
            send(&app, "POST", &format!("/api/phases/{}/complete", ids[0]), None).await,
        )
        .await;
        assert_eq!(outcome["changed"], true);
        assert_eq!(outcome["promoted"]["queue_id"], ids[1].as_str());

        let again: Value = body_json(
            send(&app, "POST", &format!("/api/phases/{}/complete", ids[0]), None).await,
        )
        .await;
        assert_eq!(again["changed"], false);
    }

    #[tokio::test]
    async fn test_fail_blocks_dependents() {
        let (app, _) = test_app();
        let ids = enqueue(&app, 4, 3).await;
        send(
            &app,
            "POST",
            &format!("/api/phases/{}/running", ids[0]),
            Some(json!({"external_ref": 1})),
        )
        .await;

        let response = send(
            &app,
            "POST",
            &format!("/api/phases/{}/fail", ids[0]),
            Some(json!({"error": "compile error"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: Value = body_json(response).await;
        assert_eq!(outcome["item"]["status"], "failed");
        assert_eq!(outcome["blocked"].as_array().unwrap().len(), 2);

        let blank = send(
            &app,
            "POST",
            &format!("/api/phases/{}/fail", ids[1]),
            Some(json!({"error": "  "})),
        )
        .await;
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_remove_phase_takes_pending_dependents() {
        let (app, state) = test_app();
        let ids = enqueue(&app, 5, 3).await;

        let response = send(&app, "DELETE", &format!("/api/phases/{}", ids[1]), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: Value = body_json(response).await;
        assert_eq!(outcome["removed"].as_array().unwrap().len(), 2);

        let remaining = state.store.get_by_group(5).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].queue_id, ids[0]);
    }

    #[tokio::test]
    async fn test_cancel_group_with_running_phase_needs_force() {
        let (app, state) = test_app();
        let ids = enqueue(&app, 6, 2).await;
        state.store.mark_running(&ids[0], 60).await.unwrap();

        let refused = send(&app, "DELETE", "/api/groups/6", None).await;
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.store.get_by_group(6).await.unwrap().len(), 2);

        let forced = send(&app, "DELETE", "/api/groups/6?force=true", None).await;
        assert_eq!(forced.status(), StatusCode::OK);
        assert!(state.store.get_by_group(6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_broadcasts_queue_update() {
        let (app, state) = test_app();
        let mut rx = state.broadcaster.subscribe();

        enqueue(&app, 8, 2).await;

        let msg = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "QueueUpdated");
        assert_eq!(parsed["data"]["group_id"], 8);
        assert_eq!(parsed["data"]["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_endpoint_runs_one_cycle() {
        let (app, state) = test_app();
        let ids = enqueue(&app, 9, 2).await;
        state.store.mark_running(&ids[0], 90).await.unwrap();

        let report: Value =
            body_json(send(&app, "POST", "/api/coordinator/reconcile", None).await).await;
        assert_eq!(report["polled"], 1);
        assert_eq!(report["completed"], 1);

        let status: Value = body_json(send(&app, "GET", "/api/coordinator", None).await).await;
        assert_eq!(status["running"], false);
        assert_eq!(status["cycles_completed"], 1);
    }

    #[test]
    fn test_queue_error_status_mapping() {
        use crate::queue::models::PhaseStatus;
        let cases = [
            (QueueError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                QueueError::invalid_transition("q", PhaseStatus::Queued, PhaseStatus::Running),
                StatusCode::CONFLICT,
            ),
            (QueueError::not_found("q"), StatusCode::NOT_FOUND),
            (QueueError::LockPoisoned, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
