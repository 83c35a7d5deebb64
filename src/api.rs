use std::sync::Arc;

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::{
    admission::{DispatchAdmission, Submission},
    clients::health::HealthChecker,
    dead_letter::DeadLetterFeed,
    error::DispatchError,
    models::{
        health::HealthStatus,
        message::DeadLetterEntry,
        record::NotificationRecord,
        request::SubmitNotification,
        response::{ApiResponse, PaginationMeta},
    },
};

const DEFAULT_PAGE: u64 = 1;
const DEFAULT_LIMIT: u64 = 20;

pub struct AppState {
    pub admission: DispatchAdmission,
    pub dead_letters: DeadLetterFeed,
    pub health_checker: HealthChecker,
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub user_id: String,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/notifications",
            post(submit_notification).get(list_notifications),
        )
        .route("/api/v1/notifications/{id}/status", get(notification_status))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route("/api/v1/dead-letters/{id}", get(inspect_dead_letter))
        .route("/api/v1/dead-letters/{id}/replay", post(replay_dead_letter))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}

async fn submit_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitNotification>,
) -> Result<(StatusCode, Json<ApiResponse<Submission>>), DispatchError> {
    let request = body.into_request()?;
    let submission = state.admission.submit(request).await?;

    let message = if submission.duplicate {
        "Duplicate request, returning original notification"
    } else {
        "Notification accepted"
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(submission, message)),
    ))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<ApiResponse<Vec<NotificationRecord>>>, DispatchError> {
    let page = query.page.unwrap_or(DEFAULT_PAGE);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    let result = state
        .admission
        .list_for_user(&query.user_id, page, limit)
        .await?;

    Ok(Json(
        ApiResponse::success(result.records, "Notifications retrieved")
            .with_meta(PaginationMeta::new(result.total, page, limit)),
    ))
}

async fn notification_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<NotificationRecord>>, DispatchError> {
    let record = state.admission.get_status(id).await?;
    Ok(Json(ApiResponse::success(record, "Notification status retrieved")))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<DeadLetterEntry>>>, DispatchError> {
    let page = query.page.unwrap_or(DEFAULT_PAGE);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    let result = state.dead_letters.list(page, limit).await?;

    Ok(Json(
        ApiResponse::success(result.entries, "Dead letters retrieved")
            .with_meta(PaginationMeta::new(result.total, page, limit)),
    ))
}

async fn inspect_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<DeadLetterEntry>>, DispatchError> {
    let entry = state.dead_letters.inspect(id).await?;
    Ok(Json(ApiResponse::success(entry, "Dead letter retrieved")))
}

async fn replay_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ApiResponse<Submission>>), DispatchError> {
    let submission = state.dead_letters.replay(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(submission, "Dead letter replayed")),
    ))
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}
