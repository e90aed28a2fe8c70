//! Local filesystem loader: one file per record, one directory per kind.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{Binding, Loader};
use crate::cache::SharedCacher;
use crate::error::{Result, TelemetryError};
use crate::retry::{Delivery, Flow, ProcessFunction, with_timeout};
use crate::types::{BoxFuture, Layout, LoaderObjectType};

/// Default pause before reading a file, letting the writer finish.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const BACKEND: &str = "file";

/// Order in which stored files are replayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrder {
    /// Oldest modification time first.
    #[default]
    Chronological,
    /// Newest modification time first.
    NewestFirst,
}

/// Reads records from a controller's on-disk device tree.
#[derive(Debug, Clone)]
pub struct FileLoader {
    root: PathBuf,
    layout: Layout,
    order: FileOrder,
    settle_delay: Duration,
    binding: Binding,
}

impl FileLoader {
    /// Creates a loader over `root` using `layout` for per-kind directories.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
            order: FileOrder::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            binding: Binding::default(),
        }
    }

    /// Sets the replay order.
    #[must_use]
    pub const fn with_order(mut self, order: FileOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the settle delay.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    async fn directory(&self, kind: LoaderObjectType) -> Result<PathBuf> {
        if fs::metadata(&self.root).await.is_err() {
            return Err(TelemetryError::Config(format!(
                "controller directory {} is not accessible",
                self.root.display()
            )));
        }
        let dir = self.layout.render(BACKEND, kind, self.binding.scope())?;
        Ok(self.root.join(dir))
    }

    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "no records stored yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                    continue;
                }
            };
            if !meta.is_file() || is_hidden(&entry.path()) {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }

        files.sort();
        if self.order == FileOrder::NewestFirst {
            files.reverse();
        }
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    async fn scan(&self, process: ProcessFunction, kind: LoaderObjectType) -> Result<()> {
        let mut delivery = self.binding.delivery(kind, process)?;
        let dir = self.directory(kind).await?;
        let files = self.list(&dir).await?;
        sleep(self.settle_delay).await;

        for path in files {
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot read record file");
                    continue;
                }
            };
            debug!(path = %path.display(), "parsing record file");
            if delivery.offer(&data).await? == Flow::Stop {
                break;
            }
        }
        Ok(())
    }

    async fn watch(&self, process: ProcessFunction, kind: LoaderObjectType) -> Result<()> {
        let mut delivery = self.binding.delivery(kind, process)?;
        let dir = self.directory(kind).await?;
        fs::create_dir_all(&dir).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "watching for new records");

        let mut seen = HashSet::new();
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "watch error");
                    continue;
                }
            };
            if !is_write(&event.kind) {
                continue;
            }
            for path in event.paths {
                if seen.contains(&path) || is_hidden(&path) {
                    continue;
                }
                let Some(flow) = self.read_new(&path, &mut delivery).await? else {
                    continue;
                };
                seen.insert(path);
                if flow == Flow::Stop {
                    return Ok(());
                }
            }
        }
        Err(TelemetryError::WatcherClosed)
    }

    /// Reads a file reported by the watcher and offers it.
    ///
    /// Returns `None` if nothing was delivered.
    async fn read_new(&self, path: &Path, delivery: &mut Delivery) -> Result<Option<Flow>> {
        sleep(self.settle_delay).await;
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read record file");
                return Ok(None);
            }
        };
        if data.is_empty() {
            // still being written; a later event delivers it
            return Ok(None);
        }
        debug!(path = %path.display(), "parsing new record file");
        delivery.offer(&data).await.map(Some)
    }
}

// staging files of a cache sharing the directory
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

impl Loader for FileLoader {
    fn set_uuid(&mut self, device: Uuid) {
        self.binding.set_device(device);
    }

    fn set_app_uuid(&mut self, app: Uuid) {
        self.binding.set_app(app);
    }

    fn set_cache(&mut self, cache: SharedCacher) {
        self.binding.set_cache(cache);
    }

    fn process_existing(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.scan(process, kind))
    }

    fn process_stream(
        &mut self,
        process: ProcessFunction,
        kind: LoaderObjectType,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(timeout, self.watch(process, kind)))
    }

    fn clone_loader(&self) -> Box<dyn Loader> {
        Box::new(self.clone())
    }
}
