use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Durable string values under well-known keys.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let mut path = self.dir.clone();
        path.push(format!("{key}.json"));
        path
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        // Readers only ever see a complete document.
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

enum WriteRequest {
    Save(String),
    Flush(oneshot::Sender<()>),
}

/// Writes one key from a background task so callers never wait on storage.
///
/// Saves land in submission order. When several are pending only the latest
/// is written. The blocking [`Storage::save`] runs on tokio's blocking pool.
#[derive(Debug)]
pub struct StorageWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl StorageWriter {
    pub fn spawn(runtime: &Handle, storage: Arc<dyn Storage>, key: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(storage, key.to_string(), rx));
        Self { tx }
    }

    pub fn save(&self, value: String) {
        if self.tx.send(WriteRequest::Save(value)).is_err() {
            error!("Storage writer stopped, dropping save");
        }
    }

    /// Resolves once every save submitted before this call is on storage.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(done)).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

async fn run_writer(
    storage: Arc<dyn Storage>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(request) = rx.recv().await {
        let mut latest = None;
        let mut waiters = vec![];
        let mut pending = Some(request);
        while let Some(request) = pending.take().or_else(|| rx.try_recv().ok()) {
            match request {
                WriteRequest::Save(value) => {
                    if latest.replace(value).is_some() {
                        debug!("Coalesced pending {key} save");
                    }
                }
                WriteRequest::Flush(done) => waiters.push(done),
            }
        }

        if let Some(value) = latest {
            let storage = storage.clone();
            let save_key = key.clone();
            match tokio::task::spawn_blocking(move || storage.save(&save_key, &value)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Failed to save {key} : {err:#}"),
                Err(err) => error!("Storage write for {key} aborted : {err}"),
            }
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
    debug!("Storage writer for {key} stopped");
}
