//! Integration tests for the file backend with a file cache attached.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use edge_telemetry::{
    FileCache, FileLoader, Layout, LoaderObjectType, LogEntry, Loader, ProcessFunction, Query,
    Record, TelemetryConfig,
};
use tempfile::TempDir;
use uuid::Uuid;

struct Fixture {
    _tmp: TempDir,
    store: PathBuf,
    cache: PathBuf,
    device: Uuid,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = tmp.path().join("store");
        let cache = tmp.path().join("cache");
        Self {
            _tmp: tmp,
            store,
            cache,
            device: Uuid::new_v4(),
        }
    }

    fn logs_dir(&self) -> PathBuf {
        self.store.join(format!("device/{}/logs", self.device))
    }

    fn cached_keys(&self) -> Vec<String> {
        let dir = self.cache.join(format!("device/{}/logs", self.device));
        let mut keys: Vec<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }

    fn loader(&self) -> FileLoader {
        let mut loader =
            FileLoader::new(&self.store, Layout::directories()).with_settle_delay(Duration::ZERO);
        loader.set_uuid(self.device);
        loader.set_cache(Arc::new(FileCache::new(&self.cache, Layout::directories())));
        loader
    }
}

/// Writes a log record stamped `2023-01-01T00:00:0{second}Z`, aged so mtimes follow timestamps.
fn write_log(dir: &Path, second: u64, severity: &str, content: &str) {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("record-{second}"));
    let body = format!(
        r#"{{"severity":"{severity}","content":"{content}","timestamp":"2023-01-01T00:00:0{second}Z"}}"#
    );
    std::fs::write(&path, body).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(60 - second * 10))
        .unwrap();
}

fn seed(fixture: &Fixture) {
    let dir = fixture.logs_dir();
    write_log(&dir, 1, "INFO", "booted");
    write_log(&dir, 2, "ERROR", "disk failure");
    write_log(&dir, 3, "INFO", "recovered");
}

fn counting() -> (ProcessFunction, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let process: ProcessFunction = Box::new(move |data| {
        let entry = LogEntry::decode(data)?;
        sink.lock().unwrap().push(entry.content);
        Ok(true)
    });
    (process, seen)
}

#[tokio::test]
async fn test_first_error_stops_before_later_records() {
    let fixture = Fixture::new();
    seed(&fixture);

    let query = Query::new([("Severity", "ERROR")]).unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let process: ProcessFunction = Box::new(move |data| {
        let entry = LogEntry::decode(data)?;
        if !query.matches(&entry) {
            return Ok(true);
        }
        sink.lock().unwrap().push(entry.content);
        Ok(false)
    });

    let mut loader = fixture.loader();
    loader
        .process_existing(process, LoaderObjectType::Logs)
        .await
        .expect("existing scan should succeed");

    assert_eq!(*calls.lock().unwrap(), ["disk failure"]);
    // the third record was never offered, so it never reached the cache
    assert_eq!(
        fixture.cached_keys(),
        ["1672531201:000000000", "1672531202:000000000"]
    );
}

#[tokio::test]
async fn test_repeated_scans_cache_each_record_once() {
    let fixture = Fixture::new();
    seed(&fixture);
    let mut loader = fixture.loader();

    let (process, seen) = counting();
    loader.process_existing(process, LoaderObjectType::Logs).await.unwrap();
    let (process, seen_again) = counting();
    loader.process_existing(process, LoaderObjectType::Logs).await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(*seen.lock().unwrap(), *seen_again.lock().unwrap());
    assert_eq!(fixture.cached_keys().len(), 3);
}

#[tokio::test]
async fn test_clones_replay_and_tail_independently() {
    let fixture = Fixture::new();
    seed(&fixture);
    let base = fixture.loader();
    let mut replaying = base.clone_loader();
    let mut tailing = base.clone_loader();

    let (replay, replayed) = counting();
    let tailed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tailed);
    let tail: ProcessFunction = Box::new(move |data| {
        sink.lock().unwrap().push(LogEntry::decode(data)?.content);
        Ok(false)
    });

    let dir = fixture.logs_dir();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        write_log(&dir, 4, "WARN", "fan speed");
    });

    let (existing, stream) = tokio::join!(
        replaying.process_existing(replay, LoaderObjectType::Logs),
        tailing.process_stream(tail, LoaderObjectType::Logs, Duration::from_secs(10)),
    );
    writer.await.unwrap();
    existing.unwrap();
    stream.unwrap();

    assert_eq!(*replayed.lock().unwrap(), ["booted", "disk failure", "recovered"]);
    assert_eq!(*tailed.lock().unwrap(), ["fan speed"]);
    assert_eq!(fixture.cached_keys().len(), 4);
}

#[tokio::test]
async fn test_loader_from_config() {
    let fixture = Fixture::new();
    seed(&fixture);
    let json = serde_json::json!({
        "controller": "file",
        "file": {"root": fixture.store, "settle_delay_ms": 0},
        "cache": {"type": "file", "root": fixture.cache},
    })
    .to_string();

    let config = TelemetryConfig::from_json(&json).unwrap();
    let mut loader = config.build_loader().unwrap();
    loader.set_uuid(fixture.device);

    let (process, seen) = counting();
    loader.process_existing(process, LoaderObjectType::Logs).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(fixture.cached_keys().len(), 3);
}

#[tokio::test]
async fn test_stream_times_out_no_sooner_than_deadline() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(&fixture.store).unwrap();
    let mut loader = fixture.loader();

    let started = std::time::Instant::now();
    let (process, seen) = counting();
    let err = loader
        .process_stream(process, LoaderObjectType::Logs, Duration::from_millis(400))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(seen.lock().unwrap().is_empty());
}
