// Webhook gateway: authenticates external triggers by token and optional
// HMAC signature, then hands admitted requests to the run factory.

use crate::errors::WebhookError;
use crate::models::{FreestyleBuild, Run, TriggerKind, TriggerSource};
use crate::runs::RunFactory;
use crate::store::Store;
use crate::webhook;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Optional fields extracted from an inbound webhook body for bookkeeping
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

impl WebhookPayload {
    /// Any JSON is accepted; non-JSON or non-object bodies yield the empty
    /// payload rather than a rejection.
    pub fn from_body(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(body).unwrap_or_default()
    }
}

pub struct WebhookGateway {
    store: Arc<Store>,
    factory: Arc<RunFactory>,
}

impl WebhookGateway {
    pub fn new(store: Arc<Store>, factory: Arc<RunFactory>) -> Self {
        Self { store, factory }
    }

    /// Admit a pipeline webhook: resolve, token compare, optional HMAC,
    /// trigger declared and enabled, then trigger.
    #[instrument(skip(self, token, signature, body))]
    pub async fn admit_pipeline(
        &self,
        pipeline_id: Uuid,
        token: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Run, WebhookError> {
        let pipeline = self
            .store
            .pipelines()
            .get(pipeline_id)
            .map_err(|_| WebhookError::TargetNotFound)?;

        if !webhook::constant_time_eq(
            pipeline.status.webhook_token.as_bytes(),
            token.as_bytes(),
        ) {
            return Err(WebhookError::InvalidToken);
        }

        verify_hmac(
            pipeline.status.webhook_secret.as_deref(),
            signature,
            body,
            &pipeline.name,
        )?;

        let declared = pipeline
            .spec
            .triggers
            .iter()
            .any(|t| t.kind == TriggerKind::Webhook && t.enabled);
        if !declared {
            return Err(WebhookError::TriggerNotEnabled);
        }

        let payload = WebhookPayload::from_body(body);
        metrics::counter!("gagos_webhooks_admitted_total").increment(1);
        let run = self
            .factory
            .trigger_pipeline(
                pipeline_id,
                payload.variables,
                TriggerSource::Webhook,
                None,
                payload.commit,
            )
            .await?;
        Ok(run)
    }

    /// Admit a freestyle webhook addressed by token alone
    #[instrument(skip(self, token, signature, body))]
    pub async fn admit_job(
        &self,
        token: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<FreestyleBuild, WebhookError> {
        let job = self
            .store
            .job_by_webhook_token(token)
            .ok_or(WebhookError::TargetNotFound)?;

        verify_hmac(
            job.triggers.webhook_secret.as_deref(),
            signature,
            body,
            &job.name,
        )?;

        if !job.triggers.webhook_enabled {
            return Err(WebhookError::TriggerNotEnabled);
        }
        if !job.enabled {
            return Err(WebhookError::TargetDisabled);
        }

        let payload = WebhookPayload::from_body(body);
        metrics::counter!("gagos_webhooks_admitted_total").increment(1);
        let build = self
            .factory
            .trigger_job(
                job.id,
                payload.parameters,
                TriggerSource::Webhook,
                None,
                payload.commit,
            )
            .await?;
        Ok(build)
    }
}

/// HMAC policy: with a secret configured, a present signature must verify; a
/// missing signature is admitted with a warning so senders can adopt signing
/// progressively.
fn verify_hmac(
    secret: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    target_name: &str,
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    match signature {
        Some(signature) => {
            if webhook::verify_signature(secret, body, signature) {
                Ok(())
            } else {
                Err(WebhookError::InvalidSignature)
            }
        }
        None => {
            warn!(
                target = %target_name,
                "Webhook admitted without signature although a secret is configured"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_from_empty_body() {
        let payload = WebhookPayload::from_body(b"");
        assert!(payload.variables.is_empty());
        assert!(payload.commit.is_none());
    }

    #[test]
    fn test_payload_from_arbitrary_json() {
        let payload = WebhookPayload::from_body(br#"{"unrelated": [1, 2]}"#);
        assert!(payload.parameters.is_empty());
    }

    #[test]
    fn test_payload_extracts_bookkeeping_fields() {
        let payload = WebhookPayload::from_body(
            br#"{"ref": "refs/heads/main", "commit": "abc123", "event": "push",
                 "parameters": {"ENV": "prod"}}"#,
        );
        assert_eq!(payload.git_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(payload.commit.as_deref(), Some("abc123"));
        assert_eq!(payload.event.as_deref(), Some("push"));
        assert_eq!(payload.parameters["ENV"], "prod");
    }

    #[test]
    fn test_payload_from_invalid_json_is_empty() {
        let payload = WebhookPayload::from_body(b"not json at all");
        assert!(payload.variables.is_empty());
    }

    #[test]
    fn test_verify_hmac_no_secret_accepts_anything() {
        assert!(verify_hmac(None, Some("sha256=bogus"), b"{}", "t").is_ok());
        assert!(verify_hmac(None, None, b"{}", "t").is_ok());
    }

    #[test]
    fn test_verify_hmac_valid_signature() {
        let sig = webhook::sign_payload("s3cret", b"{}");
        assert!(verify_hmac(Some("s3cret"), Some(&sig), b"{}", "t").is_ok());
    }

    #[test]
    fn test_verify_hmac_invalid_signature_rejected() {
        let sig = webhook::sign_payload("other", b"{}");
        assert!(matches!(
            verify_hmac(Some("s3cret"), Some(&sig), b"{}", "t"),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_hmac_missing_signature_admitted_with_secret() {
        // Progressive adoption: absent signature passes, but is logged
        assert!(verify_hmac(Some("s3cret"), None, b"{}", "t").is_ok());
    }
}
