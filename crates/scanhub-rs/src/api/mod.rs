use std::fmt::Display;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    db,
    jobs::QueuedJob,
    models::{JobStatus, Severity, Tool},
    security::validate_target_url,
    AppState,
};

/// Header carrying the authenticated user's id, set by the fronting auth layer.
const USER_HEADER: &str = "x-user-id";

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.runner_state.lock().await.running;
    Json(serde_json::json!({"status": "ok", "service": "scanhub", "running_jobs": running}))
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    target_id: Uuid,
    tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobFilter {
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
pub struct FindingFilter {
    severity: Option<Severity>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TopTargetsQuery {
    limit: Option<i64>,
}

/// Wrapper for list-shaped metrics responses.
#[derive(Debug, Serialize)]
pub struct Data<T> {
    data: T,
}

pub async fn create_target(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTargetRequest>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let url = match validate_target_url(&payload.url, &state.config.allowed_scan_domains) {
        Ok(url) => url,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };
    if payload.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "target name is required").into_response();
    }

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::insert_target(&mut conn, user_id, payload.name.trim(), &url).await {
        Ok(target) => (StatusCode::CREATED, Json(target)).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn list_targets(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::list_targets(&mut conn, user_id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn get_target(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(target_id): Path<Uuid>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::fetch_target(&mut conn, target_id).await {
        Ok(Some(target)) if target.user_id == user_id => Json(target).into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "target not found").into_response(),
        Err(e) => internal(e),
    }
}

/// Deletes the target together with its jobs and findings.
pub async fn delete_target(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(target_id): Path<Uuid>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::delete_target(&mut conn, target_id, user_id).await {
        Ok(true) => {
            info!(%target_id, "target deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, "target not found").into_response(),
        Err(e) => internal(e),
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateJobRequest>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(reason) = validate_tools(&payload.tools) {
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }

    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::fetch_target(&mut conn, payload.target_id).await {
        Ok(Some(target)) if target.user_id == user_id => {}
        Ok(_) => return (StatusCode::NOT_FOUND, "target not found").into_response(),
        Err(e) => return internal(e),
    }

    let job = match db::insert_job(&mut conn, user_id, payload.target_id, &payload.tools).await {
        Ok(job) => job,
        Err(e) => return internal(e),
    };
    drop(conn);

    if let Err(e) = state.queue.send(QueuedJob { id: job.id }).await {
        error!(job_id = %job.id, error = %e, "dispatcher unavailable, job stays queued");
    } else {
        info!(job_id = %job.id, tools = ?job.tools_used, "job queued");
    }

    (StatusCode::CREATED, Json(job)).into_response()
}

pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<JobFilter>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::list_jobs(&mut conn, user_id, filter.status).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::fetch_job(&mut conn, job_id).await {
        Ok(Some(job)) if job.user_id == user_id => Json(job).into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "job not found").into_response(),
        Err(e) => internal(e),
    }
}

pub async fn list_findings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
    Query(filter): Query<FindingFilter>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::fetch_job(&mut conn, job_id).await {
        Ok(Some(job)) if job.user_id == user_id => {}
        Ok(_) => return (StatusCode::NOT_FOUND, "job not found").into_response(),
        Err(e) => return internal(e),
    }
    match db::list_findings(&mut conn, job_id, filter.severity).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn metrics_summary(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::metrics_summary(&mut conn, user_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn metrics_by_severity(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::findings_by_severity(&mut conn, user_id).await {
        Ok(data) => Json(Data { data }).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn metrics_by_tool(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::findings_by_tool(&mut conn, user_id).await {
        Ok(data) => Json(Data { data }).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn metrics_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TimelineQuery>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let since = Utc::now() - Duration::days(timeline_days(query.days));
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::metrics_timeline(&mut conn, user_id, since).await {
        Ok(data) => Json(Data { data }).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn metrics_top_targets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TopTargetsQuery>,
) -> Response {
    let user_id = match owner(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let mut conn = match state.pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return internal(e),
    };
    match db::top_targets(&mut conn, user_id, top_targets_limit(query.limit)).await {
        Ok(data) => Json(Data { data }).into_response(),
        Err(e) => internal(e),
    }
}

/// Timeline window in days: 30 by default, clamped to one year.
fn timeline_days(days: Option<i64>) -> i64 {
    days.unwrap_or(30).clamp(1, 365)
}

fn top_targets_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(5).clamp(1, 100)
}

/// Rejects empty tool lists and names outside the supported set.
pub fn validate_tools(tools: &[String]) -> Result<(), String> {
    if tools.is_empty() {
        return Err("at least one tool is required".to_string());
    }
    let invalid: Vec<&str> = tools
        .iter()
        .filter(|t| t.parse::<Tool>().is_err())
        .map(String::as_str)
        .collect();
    if invalid.is_empty() {
        return Ok(());
    }
    let valid: Vec<&str> = Tool::ALL.iter().map(|t| t.name()).collect();
    Err(format!(
        "invalid tools: {}. Valid tools: {}",
        invalid.join(", "),
        valid.join(", ")
    ))
}

fn owner(headers: &HeaderMap) -> Result<Uuid, Response> {
    let value = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing user identity").into_response())?;
    Uuid::parse_str(value.trim())
        .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid user identity").into_response())
}

fn internal(e: impl Display) -> Response {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn tools_must_be_known_and_present() {
        assert!(validate_tools(&["ZAP".to_string(), "SSLyze".to_string()]).is_ok());
        assert!(validate_tools(&[]).is_err());

        let err = validate_tools(&["Nuclei".to_string(), "nmap".to_string()]).expect_err("nmap");
        assert!(err.contains("nmap"));
        assert!(err.contains("ZAP, Nuclei, SSLyze"));
    }

    #[test]
    fn metrics_windows_have_defaults_and_bounds() {
        assert_eq!(timeline_days(None), 30);
        assert_eq!(timeline_days(Some(0)), 1);
        assert_eq!(timeline_days(Some(10_000)), 365);
        assert_eq!(top_targets_limit(None), 5);
        assert_eq!(top_targets_limit(Some(-3)), 1);
        assert_eq!(top_targets_limit(Some(20)), 20);
    }

    #[test]
    fn owner_comes_from_header() {
        let mut headers = HeaderMap::new();
        assert!(owner(&headers).is_err());

        headers.insert(USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(owner(&headers).is_err());

        let id = Uuid::new_v4();
        headers.insert(
            USER_HEADER,
            HeaderValue::from_str(&id.to_string()).expect("header value"),
        );
        assert_eq!(owner(&headers).ok(), Some(id));
    }
}
