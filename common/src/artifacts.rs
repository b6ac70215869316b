// Artifact store: blobs under `<root>/<artifact_id>/<basename>`, metadata
// records in the Store. Blob and record are created and deleted in lockstep.

use crate::errors::StoreError;
use crate::models::Artifact;
use crate::store::Store;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct ArtifactStore {
    root: PathBuf,
    store: Arc<Store>,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, store: Arc<Store>) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, store })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a captured file as a new artifact. The blob lands on disk
    /// first; if the metadata insert fails the blob is removed again.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn save(
        &self,
        pipeline_id: Uuid,
        run_id: Uuid,
        name: &str,
        bytes: &[u8],
    ) -> Result<Artifact, StoreError> {
        let id = Uuid::new_v4();
        let basename = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact")
            .to_string();
        let blob_dir = self.root.join(id.to_string());
        fs::create_dir_all(&blob_dir)?;
        let blob_path = blob_dir.join(&basename);
        fs::write(&blob_path, bytes)?;

        let artifact = Artifact {
            id,
            pipeline_id,
            run_id,
            name: basename.clone(),
            path: format!("{}/{}", id, basename),
            mime_type: mime_for(&basename).to_string(),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.artifacts().insert(artifact.clone()) {
            let _ = fs::remove_dir_all(&blob_dir);
            return Err(e);
        }
        info!(artifact_id = %id, run_id = %run_id, name = %basename, "Artifact stored");
        Ok(artifact)
    }

    /// Absolute blob path for a metadata record
    pub fn blob_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    /// Resolve metadata and open the blob for streaming
    pub async fn open_download(
        &self,
        id: Uuid,
    ) -> Result<(tokio::fs::File, Artifact), StoreError> {
        let artifact = self.store.artifacts().get(id)?;
        let file = tokio::fs::File::open(self.blob_path(&artifact))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StoreError::NotFound(format!("artifact blob {}", artifact.path))
                }
                _ => StoreError::Io(e),
            })?;
        Ok((file, artifact))
    }

    /// Delete one artifact: blob first, then metadata
    pub fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let artifact = self.store.artifacts().get(id)?;
        let blob_dir = self.root.join(artifact.id.to_string());
        if blob_dir.exists() {
            fs::remove_dir_all(&blob_dir)?;
        }
        self.store.artifacts().delete(id)?;
        Ok(())
    }

    /// Remove every artifact captured from a run. Metadata is removed only
    /// for blobs that were actually deleted, so a partial failure leaves the
    /// remaining records consistent.
    #[instrument(skip(self))]
    pub fn cleanup_run(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut removed = 0usize;
        let mut first_failure: Option<StoreError> = None;
        for artifact in self.store.artifacts_for_run(run_id) {
            match self.delete(artifact.id) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(artifact_id = %artifact.id, error = %e, "Failed to remove artifact");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

/// Content type from the file extension; the artifact API sets this on
/// download responses
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "xml" => "application/xml",
        "html" => "text/html",
        "csv" => "text/csv",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ArtifactStore, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("state")).unwrap());
        let artifacts =
            ArtifactStore::new(dir.path().join("artifacts"), Arc::clone(&store)).unwrap();
        (artifacts, store, dir)
    }

    #[test]
    fn test_save_creates_blob_and_metadata() {
        let (artifacts, store, _dir) = setup();
        let run_id = Uuid::new_v4();
        let artifact = artifacts
            .save(Uuid::new_v4(), run_id, "reports/out.txt", b"42")
            .unwrap();
        assert_eq!(artifact.name, "out.txt");
        assert_eq!(artifact.size_bytes, 2);
        assert_eq!(artifact.mime_type, "text/plain");
        assert!(artifacts.blob_path(&artifact).exists());
        assert_eq!(store.artifacts_for_run(run_id).len(), 1);
    }

    #[tokio::test]
    async fn test_open_download_roundtrip() {
        let (artifacts, _store, _dir) = setup();
        let saved = artifacts
            .save(Uuid::new_v4(), Uuid::new_v4(), "out.txt", b"42")
            .unwrap();
        let (mut file, meta) = artifacts.open_download(saved.id).await.unwrap();
        let mut contents = String::new();
        use tokio::io::AsyncReadExt;
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "42");
        assert_eq!(meta.name, "out.txt");
    }

    #[test]
    fn test_cleanup_run_removes_blobs_and_records() {
        let (artifacts, store, _dir) = setup();
        let run_id = Uuid::new_v4();
        let other_run = Uuid::new_v4();
        let pid = Uuid::new_v4();
        let a = artifacts.save(pid, run_id, "a.txt", b"a").unwrap();
        let b = artifacts.save(pid, run_id, "b.txt", b"b").unwrap();
        let keep = artifacts.save(pid, other_run, "c.txt", b"c").unwrap();

        let removed = artifacts.cleanup_run(run_id).unwrap();
        assert_eq!(removed, 2);
        assert!(store.artifacts_for_run(run_id).is_empty());
        assert!(!artifacts.blob_path(&a).exists());
        assert!(!artifacts.blob_path(&b).exists());
        // Unrelated run untouched
        assert!(artifacts.blob_path(&keep).exists());
        assert_eq!(store.artifacts_for_run(other_run).len(), 1);
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let (artifacts, _store, _dir) = setup();
        assert!(matches!(
            artifacts.delete(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_mime_mapping() {
        assert_eq!(mime_for("build.log"), "text/plain");
        assert_eq!(mime_for("report.json"), "application/json");
        assert_eq!(mime_for("archive.tar"), "application/x-tar");
        assert_eq!(mime_for("mystery.bin"), "application/octet-stream");
        assert_eq!(mime_for("no-extension"), "application/octet-stream");
    }
}
