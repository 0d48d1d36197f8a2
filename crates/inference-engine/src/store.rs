//! Result persistence
//!
//! Terminal requests are written to `<request_id>.json` in the result
//! directory, so results stay available after the in-memory record is purged.
//! Each file carries an `expires_at` timestamp used by the cleanup pass.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use common::error::Result;
use common::models::{Request, RequestView};
use common::types::RequestId;

/// Directory of persisted request results
#[derive(Debug, Clone)]
pub struct ResultStore {
    /// Directory holding one file per request
    dir: PathBuf,

    /// Retention period
    ttl: Duration,
}

impl ResultStore {
    /// Creates a result store; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>, ttl: std::time::Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(365)),
        }
    }

    /// Gets the result directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &RequestId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Writes the projection of a terminal request
    pub async fn save(&self, request: &Request) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut view = request.view();
        let completed_at = request.completed_at.unwrap_or_else(Utc::now);
        view.expires_at = Some(completed_at + self.ttl);

        let bytes = serde_json::to_vec_pretty(&view)?;
        let path = self.path(&request.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved result of request {} to {}", request.id, path.display());

        Ok(())
    }

    /// Reads a persisted result, ignoring expired ones
    pub async fn load(&self, id: &RequestId) -> Result<Option<RequestView>> {
        let bytes = match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let view: RequestView = serde_json::from_slice(&bytes)?;
        if view.expires_at.map_or(false, |expires_at| expires_at < Utc::now()) {
            return Ok(None);
        }

        Ok(Some(view))
    }

    /// Removes expired result files, returning how many were removed
    pub async fn cleanup(&self) -> Result<usize> {
        self.cleanup_at(Utc::now()).await
    }

    /// Removes result files that expired before `now`
    ///
    /// Files without a readable `expires_at` are aged by modification time.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            if self.is_expired(&path, now).await {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove result file {}: {}", path.display(), e),
                }
            }
        }

        if removed > 0 {
            info!("Removed {} expired result files", removed);
        }

        Ok(removed)
    }

    async fn is_expired(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let expires_at = tokio::fs::read(path)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .and_then(|value| {
                value
                    .get("expires_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            })
            .map(|expires_at| expires_at.with_timezone(&Utc));

        if let Some(expires_at) = expires_at {
            return expires_at < now;
        }

        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        let age = now
            .signed_duration_since(DateTime::<Utc>::from(modified))
            .max(Duration::zero());
        age > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use common::models::{InferencePayload, RequestPriority, RequestStatus};

    fn completed_request() -> Request {
        let mut request = Request::new(
            InferencePayload::new("echo", json!({"x": 1})),
            RequestPriority::High,
            None,
        );
        let now = Utc::now();
        request
            .transition(RequestStatus::Processing, None, None, now)
            .unwrap();
        request
            .transition(RequestStatus::Completed, Some(json!({"y": 2})), None, now)
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("results"), std::time::Duration::from_secs(3600));
        let request = completed_request();

        store.save(&request).await.unwrap();
        let view = store.load(&request.id).await.unwrap().unwrap();

        assert_eq!(view.request_id, request.id);
        assert_eq!(view.status, RequestStatus::Completed);
        assert_eq!(view.result, Some(json!({"y": 2})));
        assert!(view.expires_at.is_some());

        assert!(store.load(&RequestId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path(), std::time::Duration::from_secs(3600));
        let request = completed_request();
        store.save(&request).await.unwrap();

        // Unparseable file, aged by mtime
        tokio::fs::write(dir.path().join("garbage.json"), b"not json")
            .await
            .unwrap();
        // Other files are left alone
        tokio::fs::write(dir.path().join("notes.txt"), b"keep").await.unwrap();

        assert_eq!(store.cleanup().await.unwrap(), 0);

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(store.cleanup_at(later).await.unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_cleanup_of_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("absent"), std::time::Duration::from_secs(3600));
        assert_eq!(store.cleanup().await.unwrap(), 0);
    }
}
