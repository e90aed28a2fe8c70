//! Filesystem cache: one file per record, named by its timestamp.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Cacher;
use crate::error::{Result, TelemetryError};
use crate::records::timestamp_of;
use crate::types::{BoxFuture, Layout, LoaderObjectType, Scope};

const BACKEND: &str = "file cache";

/// Caches records under `<root>/<kind directory>/<seconds>:<nanos>`.
///
/// Each record is written to a hidden staging file first and then hard-linked
/// to its key, so an entry either holds the whole record or does not exist,
/// and two concurrent offers of the same record leave exactly one copy.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    layout: Layout,
}

impl FileCache {
    /// Creates a cache rooted at `root` using `layout` for per-kind directories.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the record would be stored at.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is app-scoped or not in the layout, or the
    /// timestamp cannot be decoded.
    pub fn entry_path(&self, device: Uuid, kind: LoaderObjectType, data: &[u8]) -> Result<PathBuf> {
        if kind.is_app_scoped() {
            return Err(TelemetryError::Unsupported {
                backend: BACKEND,
                kind,
            });
        }
        let dir = self.layout.render(BACKEND, kind, &Scope::device(device))?;
        let timestamp = timestamp_of(kind, data)?;
        Ok(self.root.join(dir).join(timestamp.cache_key()))
    }

    async fn save(&self, device: Uuid, kind: LoaderObjectType, data: &[u8]) -> Result<()> {
        let path = self.entry_path(device, kind, data)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&path).await? {
            debug!(path = %path.display(), "record already cached");
            return Ok(());
        }

        let staged = staging_path(&path);
        let published = publish(&staged, &path, data).await;
        if let Err(e) = fs::remove_file(&staged).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %staged.display(), error = %e, "cannot remove staging file");
            }
        }
        if published? {
            debug!(path = %path.display(), "record cached");
        } else {
            debug!(path = %path.display(), "record already cached");
        }
        Ok(())
    }
}

/// Hidden sibling of `path`, unique per write.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Writes `data` to `staged` and links it to `path`.
///
/// Returns `false` if `path` already existed.
async fn publish(staged: &Path, path: &Path, data: &[u8]) -> Result<bool> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staged)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    match fs::hard_link(staged, path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Cacher for FileCache {
    fn check_and_save<'a>(
        &'a self,
        device: Uuid,
        kind: LoaderObjectType,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.save(device, kind, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_record(ts: &str, content: &str) -> Vec<u8> {
        format!(r#"{{"severity":"INFO","content":"{content}","timestamp":"{ts}"}}"#).into_bytes()
    }

    fn cached_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    #[tokio::test]
    async fn saves_under_timestamp_key() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let device = Uuid::new_v4();
        let data = log_record("2023-05-06T07:08:09.000000010Z", "hello");

        cache
            .check_and_save(device, LoaderObjectType::Logs, &data)
            .await
            .unwrap();

        let dir = tmp.path().join(format!("device/{device}/logs"));
        let files = cached_files(&dir);
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with(":000000010"));
        assert_eq!(std::fs::read(&files[0]).unwrap(), data);
    }

    #[tokio::test]
    async fn second_offer_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let device = Uuid::new_v4();
        let first = log_record("2023-05-06T07:08:09Z", "first");
        let second = log_record("2023-05-06T07:08:09Z", "second");

        cache.check_and_save(device, LoaderObjectType::Logs, &first).await.unwrap();
        cache.check_and_save(device, LoaderObjectType::Logs, &second).await.unwrap();

        let files = cached_files(&tmp.path().join(format!("device/{device}/logs")));
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), first);
    }

    #[tokio::test]
    async fn concurrent_offers_store_one_copy() {
        let tmp = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(FileCache::new(tmp.path(), Layout::directories()));
        let device = Uuid::new_v4();
        let data = log_record("2023-05-06T07:08:09Z", "race");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = std::sync::Arc::clone(&cache);
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                cache.check_and_save(device, LoaderObjectType::Logs, &data).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let files = cached_files(&tmp.path().join(format!("device/{device}/logs")));
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn leaves_no_staging_files() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let device = Uuid::new_v4();
        for second in 1..=3 {
            let data = log_record(&format!("2023-05-06T07:08:0{second}Z"), "x");
            cache.check_and_save(device, LoaderObjectType::Logs, &data).await.unwrap();
            cache.check_and_save(device, LoaderObjectType::Logs, &data).await.unwrap();
        }

        let names: Vec<String> = cached_files(&tmp.path().join(format!("device/{device}/logs")))
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["1683356881:000000000", "1683356882:000000000", "1683356883:000000000"]);
    }

    #[tokio::test]
    async fn interrupted_write_does_not_claim_the_key() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let device = Uuid::new_v4();
        let data = log_record("2023-05-06T07:08:09Z", "complete");
        let path = cache.entry_path(device, LoaderObjectType::Logs, &data).unwrap();

        // a writer that died halfway leaves only its staging file behind
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(staging_path(&path), &data[..data.len() / 2]).unwrap();
        assert!(!path.exists());

        cache.check_and_save(device, LoaderObjectType::Logs, &data).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn publish_keeps_existing_entry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("1:000000000");
        std::fs::write(&path, b"first").unwrap();

        let staged = staging_path(&path);
        assert!(!publish(&staged, &path, b"second").await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }

    #[tokio::test]
    async fn rejects_record_without_timestamp() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let err = cache
            .check_and_save(Uuid::new_v4(), LoaderObjectType::Info, br#"{"ztype":"ZiDevice"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::MissingTimestamp(LoaderObjectType::Info)));
    }

    #[tokio::test]
    async fn app_logs_are_not_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = FileCache::new(tmp.path(), Layout::directories());
        let data = log_record("2023-05-06T07:08:09Z", "app");
        let err = cache
            .check_and_save(Uuid::new_v4(), LoaderObjectType::AppLog, &data)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Unsupported { .. }));
    }
}
