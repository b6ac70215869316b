use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use common::executor::{ssh, SshTarget};
use common::models::{SshAuthMethod, SshHost, SshHostView, SshSecret, TestStatus};
use common::vault;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SshHostRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Serialize)]
pub struct TestResult {
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SshHostRequest {
    fn secret(&self) -> Option<SshSecret> {
        if self.password.is_none() && self.private_key.is_none() {
            return None;
        }
        Some(SshSecret {
            password: self.password.clone(),
            private_key: self.private_key.clone(),
            passphrase: self.passphrase.clone(),
        })
    }

    fn validate(&self) -> Result<(), ErrorResponse> {
        match self.auth_method {
            SshAuthMethod::Password if self.password.is_none() => Err(ErrorResponse::new(
                "VALIDATION_ERROR",
                "password auth requires a password",
            )),
            SshAuthMethod::Key if self.private_key.is_none() => Err(ErrorResponse::new(
                "VALIDATION_ERROR",
                "key auth requires a private key",
            )),
            _ => Ok(()),
        }
    }
}

#[tracing::instrument(skip(state, body))]
pub async fn create_host(
    State(state): State<AppState>,
    Json(body): Json<SshHostRequest>,
) -> Result<(StatusCode, Json<SshHostView>), ErrorResponse> {
    body.validate()?;
    let sealed = match body.secret() {
        Some(secret) => Some(
            vault::seal_ssh_secret(state.controller.sealer.as_ref(), &secret)
                .map_err(error_response)?,
        ),
        None => None,
    };
    let now = Utc::now();
    let host = SshHost {
        id: Uuid::new_v4(),
        name: body.name,
        host: body.host,
        port: body.port,
        username: body.username,
        auth_method: body.auth_method,
        groups: body.groups,
        description: body.description,
        sealed_secret: sealed,
        fingerprint: body.fingerprint,
        test_status: None,
        last_tested_at: None,
        created_at: now,
        updated_at: now,
    };
    state
        .controller
        .store
        .ssh_hosts()
        .insert(host.clone())
        .map_err(error_response)?;
    tracing::info!(host = %host.name, id = %host.id, "SSH host created");
    Ok((StatusCode::CREATED, Json(SshHostView::from(&host))))
}

#[tracing::instrument(skip(state))]
pub async fn list_hosts(State(state): State<AppState>) -> Json<Vec<SshHostView>> {
    let mut hosts = state.controller.store.ssh_hosts().list();
    hosts.sort_by(|a, b| a.name.cmp(&b.name));
    Json(hosts.iter().map(SshHostView::from).collect())
}

#[tracing::instrument(skip(state))]
pub async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SshHostView>, ErrorResponse> {
    let host = state
        .controller
        .store
        .ssh_hosts()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(SshHostView::from(&host)))
}

/// Update a host; an omitted secret keeps the sealed value on record
#[tracing::instrument(skip(state, body))]
pub async fn update_host(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SshHostRequest>,
) -> Result<Json<SshHostView>, ErrorResponse> {
    let existing = state
        .controller
        .store
        .ssh_hosts()
        .get(id)
        .map_err(error_response)?;
    let sealed = match body.secret() {
        Some(secret) => Some(
            vault::seal_ssh_secret(state.controller.sealer.as_ref(), &secret)
                .map_err(error_response)?,
        ),
        None => existing.sealed_secret.clone(),
    };
    if sealed.is_none() {
        body.validate()?;
    }
    let updated = SshHost {
        id: existing.id,
        name: body.name,
        host: body.host,
        port: body.port,
        username: body.username,
        auth_method: body.auth_method,
        groups: body.groups,
        description: body.description,
        sealed_secret: sealed,
        fingerprint: body.fingerprint,
        test_status: existing.test_status,
        last_tested_at: existing.last_tested_at,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    state
        .controller
        .store
        .ssh_hosts()
        .save(updated.clone())
        .map_err(error_response)?;
    Ok(Json(SshHostView::from(&updated)))
}

#[tracing::instrument(skip(state))]
pub async fn delete_host(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .controller
        .store
        .ssh_hosts()
        .delete(id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Decrypt in memory, open a session, run `true`, record the outcome
#[tracing::instrument(skip(state))]
pub async fn test_host(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TestResult>, ErrorResponse> {
    let host = state
        .controller
        .store
        .ssh_hosts()
        .get(id)
        .map_err(error_response)?;
    let outcome = probe(&state, &host).await;
    let (status, error) = match outcome {
        Ok(()) => (TestStatus::Ok, None),
        Err(e) => (TestStatus::Failed, Some(e)),
    };
    state
        .controller
        .store
        .ssh_hosts()
        .update_with(id, |h| {
            h.test_status = Some(status);
            h.last_tested_at = Some(Utc::now());
        })
        .map_err(error_response)?;
    Ok(Json(TestResult { status, error }))
}

async fn probe(state: &AppState, host: &SshHost) -> Result<(), String> {
    let sealed = host
        .sealed_secret
        .as_deref()
        .ok_or_else(|| "no sealed secret on record".to_string())?;
    let secret = vault::open_ssh_secret(state.controller.sealer.as_ref(), sealed)
        .map_err(|e| e.to_string())?;
    let io_timeout =
        Duration::from_secs(state.controller.settings.executor.ssh_io_timeout_seconds);
    let target = SshTarget::from_host(host, &secret, io_timeout).map_err(|e| e.to_string())?;
    let shell = state.controller.engine.shell();
    ssh::test_connection(shell.as_ref(), &target)
        .await
        .map_err(|e| e.to_string())
}
