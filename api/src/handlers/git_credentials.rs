use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use common::executor::git;
use common::models::{GitAuthMethod, GitCredential, GitCredentialView, GitSecret, TestStatus};
use common::scheduler::CancelToken;
use common::vault;
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::ssh_hosts::TestResult;
use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GitCredentialRequest {
    pub name: String,
    pub auth_method: GitAuthMethod,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitTestRequest {
    pub url: String,
}

impl GitCredentialRequest {
    fn secret(&self) -> Option<GitSecret> {
        if self.token.is_none() && self.password.is_none() && self.private_key.is_none() {
            return None;
        }
        Some(GitSecret {
            token: self.token.clone(),
            password: self.password.clone(),
            private_key: self.private_key.clone(),
            passphrase: self.passphrase.clone(),
        })
    }

    fn validate(&self) -> Result<(), ErrorResponse> {
        let missing = match self.auth_method {
            GitAuthMethod::Token => self.token.is_none(),
            GitAuthMethod::Password => self.password.is_none(),
            GitAuthMethod::SshKey => self.private_key.is_none(),
        };
        if missing {
            return Err(ErrorResponse::new(
                "VALIDATION_ERROR",
                "credential material missing for the selected auth method",
            ));
        }
        Ok(())
    }
}

#[tracing::instrument(skip(state, body))]
pub async fn create_credential(
    State(state): State<AppState>,
    Json(body): Json<GitCredentialRequest>,
) -> Result<(StatusCode, Json<GitCredentialView>), ErrorResponse> {
    body.validate()?;
    let sealed = match body.secret() {
        Some(secret) => Some(
            vault::seal_git_secret(state.controller.sealer.as_ref(), &secret)
                .map_err(error_response)?,
        ),
        None => None,
    };
    let now = Utc::now();
    let credential = GitCredential {
        id: Uuid::new_v4(),
        name: body.name,
        auth_method: body.auth_method,
        username: body.username,
        description: body.description,
        sealed_secret: sealed,
        test_status: None,
        last_tested_at: None,
        created_at: now,
        updated_at: now,
    };
    state
        .controller
        .store
        .git_credentials()
        .insert(credential.clone())
        .map_err(error_response)?;
    tracing::info!(credential = %credential.name, id = %credential.id, "Git credential created");
    Ok((
        StatusCode::CREATED,
        Json(GitCredentialView::from(&credential)),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn list_credentials(State(state): State<AppState>) -> Json<Vec<GitCredentialView>> {
    let mut credentials = state.controller.store.git_credentials().list();
    credentials.sort_by(|a, b| a.name.cmp(&b.name));
    Json(credentials.iter().map(GitCredentialView::from).collect())
}

#[tracing::instrument(skip(state))]
pub async fn get_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<GitCredentialView>, ErrorResponse> {
    let credential = state
        .controller
        .store
        .git_credentials()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(GitCredentialView::from(&credential)))
}

#[tracing::instrument(skip(state, body))]
pub async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<GitCredentialRequest>,
) -> Result<Json<GitCredentialView>, ErrorResponse> {
    let existing = state
        .controller
        .store
        .git_credentials()
        .get(id)
        .map_err(error_response)?;
    let sealed = match body.secret() {
        Some(secret) => Some(
            vault::seal_git_secret(state.controller.sealer.as_ref(), &secret)
                .map_err(error_response)?,
        ),
        None => existing.sealed_secret.clone(),
    };
    if sealed.is_none() {
        body.validate()?;
    }
    let updated = GitCredential {
        id: existing.id,
        name: body.name,
        auth_method: body.auth_method,
        username: body.username,
        description: body.description,
        sealed_secret: sealed,
        test_status: existing.test_status,
        last_tested_at: existing.last_tested_at,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    state
        .controller
        .store
        .git_credentials()
        .save(updated.clone())
        .map_err(error_response)?;
    Ok(Json(GitCredentialView::from(&updated)))
}

#[tracing::instrument(skip(state))]
pub async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .controller
        .store
        .git_credentials()
        .delete(id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Probe the credential with `git ls-remote` against the supplied URL
#[tracing::instrument(skip(state, body))]
pub async fn test_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<GitTestRequest>,
) -> Result<Json<TestResult>, ErrorResponse> {
    let credential = state
        .controller
        .store
        .git_credentials()
        .get(id)
        .map_err(error_response)?;
    let outcome = probe(&state, &credential, &body.url).await;
    let (status, error) = match outcome {
        Ok(()) => (TestStatus::Ok, None),
        Err(e) => (TestStatus::Failed, Some(e)),
    };
    state
        .controller
        .store
        .git_credentials()
        .update_with(id, |c| {
            c.test_status = Some(status);
            c.last_tested_at = Some(Utc::now());
        })
        .map_err(error_response)?;
    Ok(Json(TestResult { status, error }))
}

async fn probe(state: &AppState, credential: &GitCredential, url: &str) -> Result<(), String> {
    let sealed = credential
        .sealed_secret
        .as_deref()
        .ok_or_else(|| "no sealed secret on record".to_string())?;
    let secret = vault::open_git_secret(state.controller.sealer.as_ref(), sealed)
        .map_err(|e| e.to_string())?;
    let scratch = state
        .controller
        .settings
        .storage
        .workspaces_dir()
        .join(format!("credential-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&scratch).map_err(|e| e.to_string())?;
    let result = git::test_credential(&scratch, url, credential, &secret, &CancelToken::never())
        .await
        .map_err(|e| e.to_string());
    let _ = std::fs::remove_dir_all(&scratch);
    result
}
