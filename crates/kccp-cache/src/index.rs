//! Persisted path-to-record index with debounced, crash-safe saves.
//!
//! The same store backs both `cached.json` and the patched-asset index
//! `mod-cache.json`; only the record type differs.

use crate::{
    config::{DEFAULT_SAVE_BACKPRESSURE, DEFAULT_SAVE_DEBOUNCE},
    error::CacheResult,
    persist::{backup_path, write_temp},
};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Which document an index was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    /// The primary document
    Primary,
    /// The `.bak` generation, after the primary was missing or unreadable
    Backup,
    /// Neither document was usable
    Empty,
}

#[derive(Debug, Default)]
struct PendingSave {
    count: usize,
    // Bumped whenever the timer is replaced or cancelled
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingSave {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Mapping from canonical path to record, persisted as one JSON document.
#[derive(Debug)]
pub struct IndexStore<R> {
    path: PathBuf,
    entries: RwLock<HashMap<String, R>>,
    source: IndexSource,
    pending: Mutex<PendingSave>,
    // Serializes writers of the document itself
    save_lock: tokio::sync::Mutex<()>,
    debounce: Duration,
    backpressure: usize,
}

impl<R> IndexStore<R>
where
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create an empty index that will be saved at `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self::with_entries(path.into(), HashMap::new(), IndexSource::Empty)
    }

    fn with_entries(path: PathBuf, entries: HashMap<String, R>, source: IndexSource) -> Self {
        Self {
            path,
            entries: RwLock::new(entries),
            source,
            pending: Mutex::new(PendingSave::default()),
            save_lock: tokio::sync::Mutex::new(()),
            debounce: DEFAULT_SAVE_DEBOUNCE,
            backpressure: DEFAULT_SAVE_BACKPRESSURE,
        }
    }

    /// Load the index at `path`, falling back to `.bak` and then to an empty index.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("Loading index from {}", path.display());

        match read_document::<R>(&path).await {
            Ok(Some(entries)) => {
                info!("Loaded {} entries from {}", entries.len(), path.display());
                return Self::with_entries(path, entries, IndexSource::Primary);
            }
            Ok(None) => debug!("No index at {}", path.display()),
            Err(e) => warn!("Index at {} is unreadable: {}", path.display(), e),
        }

        let backup = backup_path(&path);
        match read_document::<R>(&backup).await {
            Ok(Some(entries)) => {
                warn!(
                    "Recovered {} entries from backup {}",
                    entries.len(),
                    backup.display()
                );
                return Self::with_entries(path, entries, IndexSource::Backup);
            }
            Ok(None) => {}
            Err(e) => error!("Backup index at {} is unreadable: {}", backup.display(), e),
        }

        info!("Starting with an empty index at {}", path.display());
        Self::with_entries(path, HashMap::new(), IndexSource::Empty)
    }

    /// Override the save schedule.
    pub fn with_schedule(mut self, debounce: Duration, backpressure: usize) -> Self {
        self.debounce = debounce;
        self.backpressure = backpressure;
        self
    }

    /// Path of the primary document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Document the entries were loaded from
    pub fn source(&self) -> IndexSource {
        self.source
    }

    /// Look up a record
    pub fn get(&self, key: &str) -> Option<R> {
        self.entries.read().get(key).cloned()
    }

    /// Whether a record exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Insert or replace a record, returning the previous one
    pub fn insert(&self, key: impl Into<String>, record: R) -> Option<R> {
        self.entries.write().insert(key.into(), record)
    }

    /// Mutate an existing record in place. Returns false when absent.
    pub fn update(&self, key: &str, f: impl FnOnce(&mut R)) -> bool {
        self.entries.write().get_mut(key).map(f).is_some()
    }

    /// Remove a record
    pub fn remove(&self, key: &str) -> Option<R> {
        self.entries.write().remove(key)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the index has no records
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every record
    pub fn snapshot(&self) -> HashMap<String, R> {
        self.entries.read().clone()
    }

    /// Fold over the records without cloning them
    pub fn fold<T>(&self, init: T, f: impl FnMut(T, (&String, &R)) -> T) -> T {
        self.entries.read().iter().fold(init, f)
    }

    /// Schedule a debounced save.
    ///
    /// Each call restarts the debounce timer until the back-pressure count is
    /// reached; after that the pending timer is left to fire so bursts cannot
    /// postpone the save forever.
    pub fn queue_save(self: &Arc<Self>) {
        let mut pending = self.pending.lock();
        pending.count += 1;
        if pending.count >= self.backpressure && pending.timer.is_some() {
            return;
        }

        pending.cancel();
        let generation = pending.generation;
        let store = Arc::clone(self);
        let delay = self.debounce;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = store.pending.lock();
                if pending.generation != generation {
                    return;
                }
                // Detach instead of aborting: this task is the timer
                pending.timer = None;
                pending.count = 0;
            }
            // Aborting a timer must never interrupt a save halfway
            tokio::spawn(async move {
                if let Err(e) = store.save().await {
                    error!("Failed to save index {}: {}", store.path.display(), e);
                }
            });
        }));
    }

    /// Number of mutations scheduled since the last save
    pub fn pending_saves(&self) -> usize {
        self.pending.lock().count
    }

    /// Cancel any pending timer and save now.
    pub async fn flush(&self) -> CacheResult<()> {
        {
            let mut pending = self.pending.lock();
            pending.cancel();
            pending.count = 0;
        }
        self.save().await
    }

    /// Write the document, rotating the current generation to `.bak`.
    ///
    /// An empty index is never written so a failed load cannot clobber the
    /// previous generation.
    pub async fn save(&self) -> CacheResult<()> {
        let _guard = self.save_lock.lock().await;

        let document = {
            let entries = self.entries.read();
            if entries.is_empty() {
                info!("Index is empty, not saved to {}", self.path.display());
                return Ok(());
            }
            let sorted: BTreeMap<&String, &R> = entries.iter().collect();
            serde_json::to_vec(&sorted)?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = write_temp(&self.path, &document).await?;
        if fs::try_exists(&self.path).await? {
            fs::rename(&self.path, backup_path(&self.path)).await?;
        }
        fs::rename(&tmp, &self.path).await?;

        info!("Saved index to {}", self.path.display());
        Ok(())
    }
}

async fn read_document<R: DeserializeOwned>(
    path: &Path,
) -> CacheResult<Option<HashMap<String, R>>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}
