//! Durable alias → descriptor store.
//!
//! The registry is one JSON document. Every mutation is a read-modify-write
//! of that document under a writer lock, and the new document replaces the
//! old one by rename, so a crash leaves either the previous or the next
//! valid document on disk, never a mix.
//!
//! ```text
//!   add/remove/update
//!         │
//!         ▼
//!   writer mutex (in-process) ─▶ exclusive lock on registry.lock (cross-process)
//!         │
//!         ▼
//!   read registry.json ─▶ apply change ─▶ write registry.json.tmp ─▶ fsync ─▶ rename
//!         │
//!         ▼
//!   swap in-memory snapshot (readers clone an Arc, never block on I/O)
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::RegistryError;
use crate::registry::descriptor::{ProviderDescriptor, ProviderView};
use crate::safety::SecretScrubber;

/// Current registry document format.
const DOCUMENT_VERSION: u32 = 1;

/// Attempts at a shared lock before falling back to a blocking wait.
const READ_LOCK_ATTEMPTS: u32 = 5;

/// Pause between shared-lock attempts.
const READ_LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// The persisted registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderDescriptor>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            providers: BTreeMap::new(),
        }
    }
}

/// Registry store with a single-writer / many-reader discipline.
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    snapshot: RwLock<Arc<RegistryDocument>>,
    writer: Mutex<()>,
}

impl RegistryStore {
    /// Load the registry document, creating an empty registry if none exists.
    ///
    /// An unreadable or unparsable document is an error; the broker must not
    /// start on top of it.
    pub async fn open(
        path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let path = path.into();
        let lock_path = lock_path.into();

        let document = {
            let path = path.clone();
            let lock_path = lock_path.clone();
            run_blocking(&path.clone(), move || read_shared(&path, &lock_path)).await?
        };

        tracing::info!(
            "Loaded registry from {} ({} providers)",
            path.display(),
            document.providers.len()
        );

        Ok(Self {
            path,
            lock_path,
            snapshot: RwLock::new(Arc::new(document)),
            writer: Mutex::new(()),
        })
    }

    /// Path of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot of the whole registry.
    pub async fn snapshot(&self) -> Arc<RegistryDocument> {
        self.snapshot.read().await.clone()
    }

    /// Register a new descriptor. The stored entry is returned redacted.
    pub async fn add(&self, descriptor: ProviderDescriptor) -> Result<ProviderView, RegistryError> {
        descriptor.validate()?;
        let alias = descriptor.alias.clone();

        let view = self
            .mutate(move |doc| {
                if doc.providers.contains_key(&descriptor.alias) {
                    return Err(RegistryError::DuplicateAlias(descriptor.alias));
                }
                let view = descriptor.view();
                doc.providers.insert(descriptor.alias.clone(), descriptor);
                Ok(view)
            })
            .await?;

        tracing::info!("Registered provider '{}'", alias);
        Ok(view)
    }

    /// All descriptors, redacted, ordered by alias.
    pub async fn list(&self) -> Vec<ProviderView> {
        self.snapshot()
            .await
            .providers
            .values()
            .map(ProviderDescriptor::view)
            .collect()
    }

    /// Full descriptor, secrets included. For launching providers only.
    pub async fn get(&self, alias: &str) -> Result<ProviderDescriptor, RegistryError> {
        self.snapshot()
            .await
            .providers
            .get(alias)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(alias.to_string()))
    }

    /// Redacted descriptor.
    pub async fn view(&self, alias: &str) -> Result<ProviderView, RegistryError> {
        self.snapshot()
            .await
            .providers
            .get(alias)
            .map(ProviderDescriptor::view)
            .ok_or_else(|| RegistryError::NotFound(alias.to_string()))
    }

    pub async fn contains(&self, alias: &str) -> bool {
        self.snapshot().await.providers.contains_key(alias)
    }

    /// Drop a registry entry. Files of managed providers are left on disk.
    pub async fn remove(&self, alias: &str) -> Result<ProviderView, RegistryError> {
        let alias = alias.to_string();
        let view = self
            .mutate(move |doc| {
                doc.providers
                    .remove(&alias)
                    .map(|d| d.view())
                    .ok_or(RegistryError::NotFound(alias))
            })
            .await?;

        tracing::info!("Removed provider '{}' from registry", view.alias);
        Ok(view)
    }

    /// Apply `mutation` to one descriptor atomically.
    ///
    /// The alias cannot change and the result must still validate; otherwise
    /// nothing is written.
    pub async fn update<F>(&self, alias: &str, mutation: F) -> Result<ProviderView, RegistryError>
    where
        F: FnOnce(&mut ProviderDescriptor) + Send + 'static,
    {
        let alias = alias.to_string();
        self.mutate(move |doc| {
            let current = doc
                .providers
                .get(&alias)
                .ok_or_else(|| RegistryError::NotFound(alias.clone()))?;

            let mut updated = current.clone();
            mutation(&mut updated);
            if updated.alias != alias {
                return Err(RegistryError::InvalidDescriptor(format!(
                    "alias '{}' is immutable",
                    alias
                )));
            }
            updated.validate()?;
            updated.updated_at = Utc::now();

            let view = updated.view();
            doc.providers.insert(alias, updated);
            Ok(view)
        })
        .await
    }

    /// Scrubber covering every secret currently registered.
    pub async fn scrubber(&self) -> SecretScrubber {
        let snapshot = self.snapshot().await;
        SecretScrubber::from_environments(snapshot.providers.values().map(|d| &d.environment))
    }

    /// Serialized read-modify-write of the persisted document.
    async fn mutate<F, T>(&self, change: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<T, RegistryError> + Send + 'static,
        T: Send + 'static,
    {
        let _writer = self.writer.lock().await;

        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let (document, out) = run_blocking(&self.path, move || {
            let lock = open_lock_file(&lock_path)?;
            FileExt::lock_exclusive(&lock).map_err(|e| io_error(&lock_path, e))?;

            let result = (|| {
                let mut document = read_document(&path)?;
                let out = change(&mut document)?;
                write_document(&path, &document)?;
                Ok((document, out))
            })();

            let _ = FileExt::unlock(&lock);
            result
        })
        .await?;

        *self.snapshot.write().await = Arc::new(document);
        Ok(out)
    }
}

async fn run_blocking<T, F>(path: &Path, work: F) -> Result<T, RegistryError>
where
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| io_error(path, std::io::Error::other(e)))?
}

fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, RegistryError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| io_error(lock_path, e))
}

/// Read under a shared lock, retrying while a writer holds the lock.
fn read_shared(path: &Path, lock_path: &Path) -> Result<RegistryDocument, RegistryError> {
    let lock = open_lock_file(lock_path)?;

    let mut locked = false;
    for attempt in 1..=READ_LOCK_ATTEMPTS {
        match FileExt::try_lock_shared(&lock) {
            Ok(()) => {
                locked = true;
                break;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(
                    "Registry is being written, retrying read (attempt {})",
                    attempt
                );
                std::thread::sleep(READ_LOCK_BACKOFF);
            }
            Err(e) => return Err(io_error(lock_path, e)),
        }
    }
    if !locked {
        FileExt::lock_shared(&lock).map_err(|e| io_error(lock_path, e))?;
    }

    let result = read_document(path);
    let _ = FileExt::unlock(&lock);
    result
}

fn read_document(path: &Path) -> Result<RegistryDocument, RegistryError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RegistryDocument::default()),
        Err(e) => return Err(io_error(path, e)),
    };

    let corrupt = |reason: String| RegistryError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let document: RegistryDocument =
        serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;

    if document.version > DOCUMENT_VERSION {
        return Err(corrupt(format!(
            "unsupported document version {}",
            document.version
        )));
    }
    for (alias, descriptor) in &document.providers {
        if alias != &descriptor.alias {
            return Err(corrupt(format!(
                "entry '{}' carries alias '{}'",
                alias, descriptor.alias
            )));
        }
    }

    Ok(document)
}

fn write_document(path: &Path, document: &RegistryDocument) -> Result<(), RegistryError> {
    let json = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    {
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
    }

    std::fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;

    // Persist the rename itself.
    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
