use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::item::{sanitize_id, QueueItem, QueueItemStatus, DEFAULT_MAX_ATTEMPTS};
use crate::config::DEFAULT_PRIORITY;
use crate::error::QueueError;
use crate::storage::{atomic_rename, atomic_write, ensure_directory, TEMP_SUFFIX};

/// Default payload file extension.
pub const DEFAULT_EXTENSION: &str = "wsjf";

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Payload file extension, without the leading dot.
    pub extension: String,
    /// Maximum number of pending + processing items. 0 means unbounded.
    pub max_size: usize,
    /// Remove completed items from disk instead of keeping a `.completed` file.
    pub delete_completed: bool,
    /// Run load-time recovery when the queue is opened.
    pub auto_load: bool,
    pub default_max_attempts: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            extension: DEFAULT_EXTENSION.to_string(),
            max_size: 0,
            delete_completed: true,
            auto_load: true,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Per-item options for [`PersistentQueue::add`].
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Explicit id; sanitised before use. A random id is generated if absent.
    pub item_id: Option<String>,
    pub priority: i32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub max_attempts: Option<u32>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            item_id: None,
            priority: DEFAULT_PRIORITY,
            metadata: serde_json::Map::new(),
            max_attempts: None,
        }
    }
}

impl AddOptions {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

/// Outcome of a [`PersistentQueue::process_pending`] batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    id: &'a str,
    priority: i32,
    attempts: u32,
    max_attempts: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error: Option<&'a str>,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    priority: i32,
    #[serde(default)]
    attempts: u32,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    error: Option<String>,
    data: T,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

struct Index<T> {
    items: HashMap<String, QueueItem<T>>,
    /// Ids whose files are being created or renamed outside the lock.
    in_flight: HashSet<String>,
    next_sequence: u64,
}

impl<T> Index<T> {
    fn active_count(&self) -> usize {
        self.items.values().filter(|i| i.status.is_active()).count()
    }

    /// New ids still being written; claimed items are already in `items`.
    fn reserved_count(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|id| !self.items.contains_key(*id))
            .count()
    }
}

/// A priority work queue persisted as one file per item.
///
/// Each item lives at `<id>.<status>.<ext>` with a `<id>.<status>.meta.json`
/// sidecar. Status changes are atomic renames, so after a crash every item is
/// found in exactly one state; items caught in `processing` are put back to
/// `pending` on the next load.
pub struct PersistentQueue<T> {
    dir: PathBuf,
    options: QueueOptions,
    index: Mutex<Index<T>>,
}

impl<T> PersistentQueue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Opens the queue directory, creating it if missing.
    pub fn open(dir: impl Into<PathBuf>, options: QueueOptions) -> Result<Self, QueueError> {
        let dir = dir.into();

        if dir.exists() && !dir.is_dir() {
            return Err(QueueError::Corrupted {
                path: dir,
                reason: "queue path is not a directory".to_string(),
            });
        }
        ensure_directory(&dir)?;

        let queue = Self {
            dir,
            options,
            index: Mutex::new(Index {
                items: HashMap::new(),
                in_flight: HashSet::new(),
                next_sequence: 0,
            }),
        };

        if queue.options.auto_load {
            queue.load()?;
        }

        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Rebuilds the in-memory index from disk and recovers interrupted items.
    ///
    /// Returns the number of items loaded.
    pub fn load(&self) -> Result<usize, QueueError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| QueueError::Corrupted {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut found: HashMap<String, Vec<QueueItemStatus>> = HashMap::new();
        let mut sidecars: HashMap<String, Vec<QueueItemStatus>> = HashMap::new();

        for entry in entries {
            let entry = entry.map_err(|e| QueueError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TEMP_SUFFIX) {
                debug!("Removing stale temp file {}", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove temp file {}: {}", path.display(), e);
                }
                continue;
            }

            if let Some((id, status)) = self.parse_payload_name(name) {
                found.entry(id).or_default().push(status);
            } else if let Some((id, status)) = parse_meta_name(name) {
                sidecars.entry(id).or_default().push(status);
            }
        }

        let mut loaded = Vec::new();

        for (id, mut statuses) in found {
            statuses.sort_by_key(|s| std::cmp::Reverse(s.rank()));
            let status = statuses[0];

            let mut metas = sidecars.remove(&id).unwrap_or_default();
            metas.sort_by_key(|s| std::cmp::Reverse(s.rank()));
            self.reconcile_meta(&id, status, &metas);

            for stale in &statuses[1..] {
                warn!(
                    "Queue item {} found as both {} and {}; keeping {}",
                    id, status, stale, status
                );
                if let Err(e) = self.delete_files(&id, *stale) {
                    warn!("Failed to remove duplicate of queue item {}: {}", id, e);
                }
            }

            match self.read_item(&id, status) {
                Some(item) => loaded.push(item),
                None => continue,
            }
        }

        for (id, statuses) in sidecars {
            debug!("Removing metadata of vanished queue item {}", id);
            for status in statuses {
                if let Err(e) = remove_if_exists(&self.meta_path(&id, status)) {
                    warn!("Failed to remove orphaned metadata for {}: {}", id, e);
                }
            }
        }

        loaded.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut recovered = Vec::new();
        {
            let mut index = self.lock()?;
            index.items.clear();
            for mut item in loaded {
                item.sequence = index.next_sequence;
                index.next_sequence += 1;
                if item.status == QueueItemStatus::Processing {
                    recovered.push(item.id.clone());
                }
                index.items.insert(item.id.clone(), item);
            }
        }

        for id in recovered {
            let Some(mut item) = self.get(&id) else {
                continue;
            };
            item.reset_to_pending();
            item.attempts += 1;
            match self.persist(&item, QueueItemStatus::Processing) {
                Ok(()) => {
                    info!("Recovered interrupted queue item {}", id);
                    self.lock()?.items.insert(id, item);
                }
                Err(e) => warn!("Failed to recover queue item {}: {}", id, e),
            }
        }

        let count = self.size();
        if count > 0 {
            info!("Loaded {} queue items from {}", count, self.dir.display());
        }
        Ok(count)
    }

    /// Persists a new pending item.
    pub fn add(&self, data: T, options: AddOptions) -> Result<QueueItem<T>, QueueError> {
        let mut item = match options.item_id {
            Some(id) => QueueItem::new(id, data, options.priority),
            None => QueueItem::create(data, options.priority),
        };
        item.metadata = options.metadata;
        item.max_attempts = options
            .max_attempts
            .unwrap_or(self.options.default_max_attempts);

        {
            let mut index = self.lock()?;
            if index.items.contains_key(&item.id) || index.in_flight.contains(&item.id) {
                return Err(QueueError::Duplicate(item.id));
            }
            let max_size = self.options.max_size;
            if max_size > 0 && index.active_count() + index.reserved_count() >= max_size {
                return Err(QueueError::Full { max_size });
            }
            index.in_flight.insert(item.id.clone());
            item.sequence = index.next_sequence;
            index.next_sequence += 1;
        }

        let written = self
            .write_meta(&item.id, item.status, &item.metadata)
            .and_then(|_| self.write_payload(&item, item.status));

        let mut index = self.lock()?;
        index.in_flight.remove(&item.id);
        match written {
            Ok(()) => {
                debug!("Queued item {} (priority {})", item.id, item.priority);
                index.items.insert(item.id.clone(), item.clone());
                Ok(item)
            }
            Err(e) => {
                drop(index);
                let _ = self.delete_files(&item.id, item.status);
                Err(e)
            }
        }
    }

    /// Claims the most urgent pending item and marks it processing.
    ///
    /// Items another queue over the same folder claimed first are dropped
    /// from this index and the next candidate is tried.
    pub fn get_next(&self) -> Result<Option<QueueItem<T>>, QueueError> {
        loop {
            let mut item = {
                let mut index = self.lock()?;
                let next = index
                    .items
                    .values()
                    .filter(|i| {
                        i.status == QueueItemStatus::Pending && !index.in_flight.contains(&i.id)
                    })
                    .min_by_key(|i| i.order_key())
                    .cloned();
                match next {
                    Some(item) => {
                        index.in_flight.insert(item.id.clone());
                        item
                    }
                    None => return Ok(None),
                }
            };

            item.mark_processing();
            let result = self.persist(&item, QueueItemStatus::Pending);

            let mut index = self.lock()?;
            index.in_flight.remove(&item.id);
            match result {
                Ok(()) => {
                    index.items.insert(item.id.clone(), item.clone());
                    return Ok(Some(item));
                }
                Err(QueueError::Moved(id)) => {
                    debug!("Queue item {} was claimed elsewhere", id);
                    index.items.remove(&id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes an item's new content and status.
    ///
    /// The in-memory index only changes once the files are in place.
    pub fn update(&self, item: &QueueItem<T>) -> Result<(), QueueError> {
        let (previous, sequence) = {
            let index = self.lock()?;
            let current = index
                .items
                .get(&item.id)
                .ok_or_else(|| QueueError::NotFound(item.id.clone()))?;
            (current.status, current.sequence)
        };

        if self.options.delete_completed && item.status == QueueItemStatus::Completed {
            self.delete_files(&item.id, previous)?;
            self.lock()?.items.remove(&item.id);
            debug!("Completed queue item {} removed", item.id);
            return Ok(());
        }

        self.persist(item, previous)?;

        let mut stored = item.clone();
        stored.sequence = sequence;
        self.lock()?.items.insert(stored.id.clone(), stored);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<QueueItem<T>> {
        let id = sanitize_id(id);
        self.index.lock().ok()?.items.get(&id).cloned()
    }

    /// Number of items known to the queue, in any state.
    pub fn size(&self) -> usize {
        self.index.lock().map(|i| i.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.count_where(|i| i.status == QueueItemStatus::Pending)
    }

    /// Pending plus processing items; the figure `max_size` limits.
    pub fn active_count(&self) -> usize {
        self.count_where(|i| i.status.is_active())
    }

    /// Pending items in dispatch order, optionally followed by failed ones.
    pub fn list_pending(&self, include_failed: bool) -> Vec<QueueItem<T>> {
        let Ok(index) = self.index.lock() else {
            return Vec::new();
        };
        let mut items: Vec<_> = index
            .items
            .values()
            .filter(|i| {
                i.status == QueueItemStatus::Pending
                    || (include_failed && i.status == QueueItemStatus::Failed)
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.status == QueueItemStatus::Failed, i.order_key()));
        items
    }

    /// Whether any pending or processing item's payload satisfies `predicate`.
    pub fn find_active<F>(&self, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.index
            .lock()
            .map(|index| {
                index
                    .items
                    .values()
                    .any(|i| i.status.is_active() && predicate(&i.data))
            })
            .unwrap_or(false)
    }

    /// Removes every item, or only those with the given status.
    pub fn clear(&self, status: Option<QueueItemStatus>) -> Result<usize, QueueError> {
        let doomed: Vec<(String, QueueItemStatus)> = {
            let index = self.lock()?;
            index
                .items
                .values()
                .filter(|i| status.map_or(true, |s| i.status == s))
                .filter(|i| !index.in_flight.contains(&i.id))
                .map(|i| (i.id.clone(), i.status))
                .collect()
        };

        let mut removed = 0;
        for (id, item_status) in doomed {
            match self.delete_files(&id, item_status) {
                Ok(()) => {
                    self.lock()?.items.remove(&id);
                    removed += 1;
                }
                Err(e) => warn!("Failed to clear queue item {}: {}", id, e),
            }
        }

        if removed > 0 {
            info!("Cleared {} queue items", removed);
        }
        Ok(removed)
    }

    /// Deletes a single item. Returns `false` if it was not queued.
    pub fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let id = sanitize_id(id);
        let status = match self.lock()?.items.get(&id) {
            Some(item) => item.status,
            None => return Ok(false),
        };
        self.delete_files(&id, status)?;
        self.lock()?.items.remove(&id);
        Ok(true)
    }

    /// Puts failed items that still have attempts left back in line.
    pub fn retry_failed(&self) -> Result<usize, QueueError> {
        let retryable: Vec<QueueItem<T>> = {
            let index = self.lock()?;
            index
                .items
                .values()
                .filter(|i| i.status == QueueItemStatus::Failed && i.can_retry())
                .cloned()
                .collect()
        };

        let mut retried = 0;
        for mut item in retryable {
            item.reset_to_pending();
            match self.update(&item) {
                Ok(()) => retried += 1,
                Err(e) => warn!("Failed to retry queue item {}: {}", item.id, e),
            }
        }
        Ok(retried)
    }

    /// Drains pending items synchronously through `processor`.
    ///
    /// Each item is marked processing, then completed or failed according to
    /// the processor's result.
    pub fn process_pending<F, E>(
        &self,
        mut processor: F,
        include_failed: bool,
    ) -> Result<ProcessSummary, QueueError>
    where
        F: FnMut(&T) -> Result<(), E>,
        E: Display,
    {
        let mut summary = ProcessSummary::default();

        for candidate in self.list_pending(include_failed) {
            let Some(mut item) = self.get(&candidate.id) else {
                continue;
            };
            if !matches!(item.status, QueueItemStatus::Pending | QueueItemStatus::Failed) {
                continue;
            }

            item.mark_processing();
            self.update(&item)?;

            summary.processed += 1;
            match processor(&item.data) {
                Ok(()) => {
                    item.mark_completed();
                    summary.succeeded += 1;
                }
                Err(e) => {
                    item.mark_failed(e.to_string());
                    summary.failed += 1;
                }
            }
            self.update(&item)?;
        }

        Ok(summary)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Index<T>>, QueueError> {
        self.index.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn count_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueueItem<T>) -> bool,
    {
        self.index
            .lock()
            .map(|i| i.items.values().filter(|item| predicate(item)).count())
            .unwrap_or(0)
    }

    fn payload_path(&self, id: &str, status: QueueItemStatus) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", id, status.as_suffix(), self.options.extension))
    }

    fn meta_path(&self, id: &str, status: QueueItemStatus) -> PathBuf {
        self.dir
            .join(format!("{}.{}{}", id, status.as_suffix(), META_SUFFIX))
    }

    fn parse_payload_name(&self, name: &str) -> Option<(String, QueueItemStatus)> {
        if name.ends_with(META_SUFFIX) {
            return None;
        }
        let stem = name.strip_suffix(&format!(".{}", self.options.extension))?;
        let (id, status) = stem.rsplit_once('.')?;
        let status = status.parse().ok()?;
        if id.is_empty() || sanitize_id(id) != id {
            return None;
        }
        Some((id.to_string(), status))
    }

    fn encode(&self, item: &QueueItem<T>) -> Result<Vec<u8>, QueueError> {
        let envelope = EnvelopeRef {
            id: &item.id,
            priority: item.priority,
            attempts: item.attempts,
            max_attempts: item.max_attempts,
            created_at: item.created_at,
            updated_at: item.updated_at,
            error: item.error.as_deref(),
            data: &item.data,
        };
        serde_json::to_vec_pretty(&envelope).map_err(|source| QueueError::Serialize {
            id: item.id.clone(),
            source,
        })
    }

    fn write_payload(&self, item: &QueueItem<T>, status: QueueItemStatus) -> Result<(), QueueError> {
        let content = self.encode(item)?;
        atomic_write(&self.payload_path(&item.id, status), &content)?;
        Ok(())
    }

    fn write_meta(
        &self,
        id: &str,
        status: QueueItemStatus,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), QueueError> {
        let content = serde_json::to_vec_pretty(metadata).map_err(|source| QueueError::Serialize {
            id: id.to_string(),
            source,
        })?;
        atomic_write(&self.meta_path(id, status), &content)?;
        Ok(())
    }

    /// Renames the item's files into their new state, then rewrites their
    /// content there.
    ///
    /// The payload rename is the commit point. A missing source file means a
    /// queue sharing the folder already moved the item, reported as
    /// [`QueueError::Moved`]; nothing is written in that case.
    fn persist(&self, item: &QueueItem<T>, from: QueueItemStatus) -> Result<(), QueueError> {
        let source = self.payload_path(&item.id, from);

        if from != item.status {
            if let Err(e) = fs::rename(&source, self.payload_path(&item.id, item.status)) {
                return Err(if e.kind() == ErrorKind::NotFound {
                    QueueError::Moved(item.id.clone())
                } else {
                    QueueError::Io {
                        path: source,
                        source: e,
                    }
                });
            }
            self.move_meta(&item.id, from, item.status)?;
        } else if !source.exists() {
            return Err(QueueError::Moved(item.id.clone()));
        }

        self.write_payload(item, item.status)?;
        self.write_meta(&item.id, item.status, &item.metadata)
    }

    fn move_meta(&self, id: &str, from: QueueItemStatus, to: QueueItemStatus) -> Result<(), QueueError> {
        let source = self.meta_path(id, from);
        match fs::rename(&source, self.meta_path(id, to)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::Io {
                path: source,
                source: e,
            }),
        }
    }

    /// Leaves at most one sidecar for `id`, named for `status`.
    ///
    /// `found` lists the sidecar states on disk, most advanced first. When a
    /// transition was interrupted between the payload and sidecar renames, the
    /// sidecar still carries the earlier state and is renamed over.
    fn reconcile_meta(&self, id: &str, status: QueueItemStatus, found: &[QueueItemStatus]) {
        let mut settled = found.contains(&status);

        for other in found.iter().filter(|s| **s != status) {
            let path = self.meta_path(id, *other);
            if settled {
                if let Err(e) = remove_if_exists(&path) {
                    warn!("Failed to remove stale metadata {}: {}", path.display(), e);
                }
                continue;
            }
            match atomic_rename(&path, &self.meta_path(id, status)) {
                Ok(()) => {
                    debug!("Moved metadata of queue item {} from {} to {}", id, other, status);
                    settled = true;
                }
                Err(e) => warn!("Failed to adopt metadata {}: {}", path.display(), e),
            }
        }
    }

    fn read_item(&self, id: &str, status: QueueItemStatus) -> Option<QueueItem<T>> {
        let path = self.payload_path(id, status);
        let envelope: Envelope<T> = match fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Skipping corrupt queue file {}: {}", path.display(), e);
                return None;
            }
        };

        Some(QueueItem {
            id: id.to_string(),
            data: envelope.data,
            priority: envelope.priority,
            status,
            attempts: envelope.attempts,
            max_attempts: envelope.max_attempts,
            created_at: envelope.created_at,
            updated_at: envelope.updated_at,
            error: envelope.error,
            metadata: self.read_meta(id, status),
            sequence: 0,
        })
    }

    fn read_meta(&self, id: &str, status: QueueItemStatus) -> serde_json::Map<String, serde_json::Value> {
        let path = self.meta_path(id, status);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return serde_json::Map::new(),
            Err(e) => {
                warn!("Failed to read queue metadata {}: {}", path.display(), e);
                return serde_json::Map::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("Ignoring corrupt queue metadata {}", path.display());
                serde_json::Map::new()
            }
        }
    }

    fn delete_files(&self, id: &str, status: QueueItemStatus) -> Result<(), QueueError> {
        remove_if_exists(&self.payload_path(id, status))?;
        remove_if_exists(&self.meta_path(id, status))
    }
}

fn parse_meta_name(name: &str) -> Option<(String, QueueItemStatus)> {
    let stem = name.strip_suffix(META_SUFFIX)?;
    let (id, status) = stem.rsplit_once('.')?;
    let status = status.parse().ok()?;
    if id.is_empty() || sanitize_id(id) != id {
        return None;
    }
    Some((id.to_string(), status))
}

fn remove_if_exists(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QueueError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
