use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use common::models::{NotificationConfig, NotificationKind, NotifyEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: NotificationKind,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub events: Vec<NotifyEvent>,
    #[serde(default)]
    pub pipeline_ids: Vec<Uuid>,
    #[serde(default)]
    pub job_ids: Vec<Uuid>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_kind() -> NotificationKind {
    NotificationKind::Webhook
}

fn default_enabled() -> bool {
    true
}

/// Read projection; the HMAC secret stays in the store
#[derive(Debug, Serialize)]
pub struct NotificationView {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub url: String,
    pub has_secret: bool,
    pub headers: HashMap<String, String>,
    pub events: Vec<NotifyEvent>,
    pub pipeline_ids: Vec<Uuid>,
    pub job_ids: Vec<Uuid>,
    pub enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&NotificationConfig> for NotificationView {
    fn from(c: &NotificationConfig) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            kind: c.kind,
            url: c.url.clone(),
            has_secret: c.secret.is_some(),
            headers: c.headers.clone(),
            events: c.events.clone(),
            pipeline_ids: c.pipeline_ids.clone(),
            job_ids: c.job_ids.clone(),
            enabled: c.enabled,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

fn validate(request: &NotificationRequest) -> Result<(), ErrorResponse> {
    if request.events.is_empty() {
        return Err(ErrorResponse::new(
            "VALIDATION_ERROR",
            "at least one event is required",
        ));
    }
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(ErrorResponse::new(
            "VALIDATION_ERROR",
            "url must be http(s)",
        ));
    }
    Ok(())
}

#[tracing::instrument(skip(state, body))]
pub async fn create_notification(
    State(state): State<AppState>,
    Json(body): Json<NotificationRequest>,
) -> Result<(StatusCode, Json<NotificationView>), ErrorResponse> {
    validate(&body)?;
    let now = Utc::now();
    let config = NotificationConfig {
        id: Uuid::new_v4(),
        name: body.name,
        kind: body.kind,
        url: body.url,
        secret: body.secret,
        headers: body.headers,
        events: body.events,
        pipeline_ids: body.pipeline_ids,
        job_ids: body.job_ids,
        enabled: body.enabled,
        created_at: now,
        updated_at: now,
    };
    state
        .controller
        .store
        .notifications()
        .insert(config.clone())
        .map_err(error_response)?;
    tracing::info!(notification = %config.name, id = %config.id, "Notification created");
    Ok((StatusCode::CREATED, Json(NotificationView::from(&config))))
}

#[tracing::instrument(skip(state))]
pub async fn list_notifications(State(state): State<AppState>) -> Json<Vec<NotificationView>> {
    let mut configs = state.controller.store.notifications().list();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Json(configs.iter().map(NotificationView::from).collect())
}

#[tracing::instrument(skip(state))]
pub async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationView>, ErrorResponse> {
    let config = state
        .controller
        .store
        .notifications()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(NotificationView::from(&config)))
}

#[tracing::instrument(skip(state, body))]
pub async fn update_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NotificationRequest>,
) -> Result<Json<NotificationView>, ErrorResponse> {
    validate(&body)?;
    let existing = state
        .controller
        .store
        .notifications()
        .get(id)
        .map_err(error_response)?;
    let updated = NotificationConfig {
        id: existing.id,
        name: body.name,
        kind: body.kind,
        url: body.url,
        // An omitted secret keeps the stored one
        secret: body.secret.or(existing.secret),
        headers: body.headers,
        events: body.events,
        pipeline_ids: body.pipeline_ids,
        job_ids: body.job_ids,
        enabled: body.enabled,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    state
        .controller
        .store
        .notifications()
        .save(updated.clone())
        .map_err(error_response)?;
    Ok(Json(NotificationView::from(&updated)))
}

#[tracing::instrument(skip(state))]
pub async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .controller
        .store
        .notifications()
        .delete(id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct NotificationTestResult {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fire a synthetic event at the config's URL, without retries
#[tracing::instrument(skip(state))]
pub async fn test_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationTestResult>, ErrorResponse> {
    let config = state
        .controller
        .store
        .notifications()
        .get(id)
        .map_err(error_response)?;
    match state.controller.notifier.send_test(&config).await {
        Ok(status) => Ok(Json(NotificationTestResult {
            delivered: true,
            status: Some(status),
            error: None,
        })),
        Err(e) => Ok(Json(NotificationTestResult {
            delivered: false,
            status: None,
            error: Some(e.to_string()),
        })),
    }
}
