use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::models::Artifact;
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ArtifactsQuery {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
}

#[tracing::instrument(skip(state))]
pub async fn list_artifacts(
    State(state): State<AppState>,
    Query(query): Query<ArtifactsQuery>,
) -> Json<Vec<Artifact>> {
    let store = &state.controller.store;
    let mut artifacts = match (query.run_id, query.pipeline_id) {
        (Some(run_id), _) => store.artifacts_for_run(run_id),
        (None, Some(pipeline_id)) => store.artifacts_for_pipeline(pipeline_id),
        (None, None) => store.artifacts().list(),
    };
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(artifacts)
}

/// Stream the blob with content-type and filename headers from the record
#[tracing::instrument(skip(state))]
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ErrorResponse> {
    let (file, artifact) = state
        .controller
        .artifacts
        .open_download(id)
        .await
        .map_err(error_response)?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.name);
    Ok((
        [
            (header::CONTENT_TYPE, artifact.mime_type.clone()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, artifact.size_bytes.to_string()),
        ],
        Body::from_stream(chunked(file)),
    )
        .into_response())
}

/// Chunked reads of the open blob, so large artifacts never sit in memory
fn chunked(
    mut file: tokio::fs::File,
) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => {
                    if tx
                        .send(Ok(bytes::Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

#[tracing::instrument(skip(state))]
pub async fn delete_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .controller
        .artifacts
        .delete(id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
