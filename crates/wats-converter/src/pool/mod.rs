//! The converter pool.
//!
//! Files reported by the folder watchers or the startup scan are persisted in
//! the durable queue and dispatched by a single scheduler task, most urgent
//! first, to at most `max_concurrent` concurrent conversions. Each conversion
//! runs the converter (sandboxed unless the converter is trusted), submits the
//! report and then archives or quarantines the source file.

mod item;
mod post_process;
mod scan;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use item::{ConversionItem, ConversionItemState, ConversionTask};
pub use post_process::{
    error_note_path, handle_error, post_process, process_archive_queues, PostProcessOutcome,
    ERROR_NOTE_SUFFIX,
};
pub use scan::ScanStats;

use crate::api::ReportSubmitter;
use crate::config::{validate_config, PoolConfig};
use crate::converter::{Converter, ConverterFactory};
use crate::error::{ConverterError, PoolError, QueueError};
use crate::queue::{AddOptions, PersistentQueue, QueueItem, QueueOptions};
use crate::sandbox::{run_direct, ConverterSandbox, SandboxConfig};
use crate::watcher::{FileCallback, FileWatcher};
use scan::StartupScan;

/// The durable queue as used by the pool.
pub type ConversionQueue = PersistentQueue<ConversionTask>;

/// How long the scheduler sleeps when idle before looking at the queue again,
/// in case items were made pending without a wake-up.
const IDLE_POLL: Duration = Duration::from_secs(1);

const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatistics {
    pub total_processed: u64,
    pub successful: u64,
    pub errors: u64,
    /// Items waiting in the durable queue.
    pub queue_size: usize,
    /// Conversions currently in flight.
    pub active: usize,
    pub sandbox_enabled: bool,
}

#[derive(Default)]
struct Counters {
    total_processed: AtomicU64,
    successful: AtomicU64,
    errors: AtomicU64,
}

/// Cloneable handle to a running or stopped pool.
#[derive(Clone)]
pub struct ConverterPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: RwLock<PoolConfig>,
    submitter: Arc<dyn ReportSubmitter>,
    factory: Arc<dyn ConverterFactory>,
    queue: Arc<ConversionQueue>,
    converters: RwLock<Vec<Arc<dyn Converter>>>,
    watchers: Mutex<Vec<FileWatcher>>,
    sandbox: RwLock<Arc<ConverterSandbox>>,
    semaphore: Arc<Semaphore>,
    /// Permits currently owned by the semaphore, tracked for reloads.
    permits: Mutex<usize>,
    tracker: TaskTracker,
    state: Mutex<PoolState>,
    stop_token: Mutex<CancellationToken>,
    background: Mutex<Vec<JoinHandle<()>>>,
    wake: Notify,
    counters: Counters,
    startup_scan: Mutex<StartupScan>,
}

impl ConverterPool {
    /// Creates a stopped pool and opens (and recovers) its durable queue.
    pub fn new(
        config: PoolConfig,
        submitter: Arc<dyn ReportSubmitter>,
        factory: Arc<dyn ConverterFactory>,
    ) -> Result<Self, ConverterError> {
        validate_config(&config)?;

        let queue = PersistentQueue::open(
            &config.queue_dir,
            QueueOptions {
                max_size: config.max_queue_size,
                delete_completed: config.delete_completed,
                ..QueueOptions::default()
            },
        )?;
        let sandbox = ConverterSandbox::new(SandboxConfig::from(&config.sandbox));

        info!(
            "Converter pool created (max_concurrent={}, sandbox={}, queue={})",
            config.max_concurrent,
            config.enable_sandbox,
            config.queue_dir.display()
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                submitter,
                factory,
                queue: Arc::new(queue),
                converters: RwLock::new(Vec::new()),
                watchers: Mutex::new(Vec::new()),
                sandbox: RwLock::new(Arc::new(sandbox)),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                permits: Mutex::new(config.max_concurrent),
                tracker: TaskTracker::new(),
                state: Mutex::new(PoolState::Stopped),
                stop_token: Mutex::new(CancellationToken::new()),
                background: Mutex::new(Vec::new()),
                wake: Notify::new(),
                counters: Counters::default(),
                startup_scan: Mutex::new(StartupScan::default()),
                config: RwLock::new(config),
            }),
        })
    }

    /// Loads converters, scans the watch folders, starts the watchers and the
    /// scheduler. Starting a running pool does nothing.
    pub async fn start(&self) -> Result<(), ConverterError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                PoolState::Running => {
                    debug!("Converter pool already running");
                    return Ok(());
                }
                PoolState::Stopping => return Err(PoolError::Stopping.into()),
                PoolState::Stopped => *state = PoolState::Running,
            }
        }

        let token = CancellationToken::new();
        *lock(&self.inner.stop_token) = token.clone();
        self.inner.tracker.reopen();

        let converters = self.load_converters();

        let carried_over = self.inner.queue.pending_count();
        if carried_over > 0 {
            info!("{} queued conversions carried over from a previous run", carried_over);
        }

        let pool = self.clone();
        let stats = tokio::task::spawn_blocking(move || pool.scan_existing_files())
            .await
            .unwrap_or_else(|e| {
                error!("Startup scan aborted: {}", e);
                ScanStats::default()
            });
        if stats.scanned > 0 || stats.errors > 0 {
            info!(
                "Startup scan: {} scanned, {} queued, {} skipped, {} errors",
                stats.scanned, stats.queued, stats.skipped, stats.errors
            );
        }

        self.start_watchers();

        let scheduler = tokio::spawn(self.clone().run_scheduler(token.clone()));
        let maintenance = tokio::spawn(self.clone().run_archive_maintenance(token));
        lock(&self.inner.background).extend([scheduler, maintenance]);
        self.inner.wake.notify_one();

        info!("Converter pool started with {} converters", converters.len());
        Ok(())
    }

    /// Stops watching for new files. Conversions already dispatched finish.
    pub fn stop_accepting(&self) {
        lock(&self.inner.stop_token).cancel();
        self.stop_watchers();
        debug!("Converter pool no longer accepting files");
    }

    /// Stops accepting files and waits up to the configured stop timeout for
    /// the scheduler, archive maintenance and in-flight conversions.
    /// Conversions still running after that are left to finish on their own;
    /// their queue entries are recovered on the next start if they never
    /// complete.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != PoolState::Running {
                return;
            }
            *state = PoolState::Stopping;
        }

        info!("Stopping converter pool");
        let stop_timeout = read(&self.inner.config).stop_timeout();
        let deadline = tokio::time::Instant::now() + stop_timeout;
        self.stop_accepting();

        let background = std::mem::take(&mut *lock(&self.inner.background));
        for mut handle in background {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Background task still busy at stop timeout; aborting it");
                    handle.abort();
                }
            }
        }

        self.inner.tracker.close();
        if tokio::time::timeout_at(deadline, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} conversions still running after {:?}; abandoning them",
                self.inner.tracker.len(),
                stop_timeout
            );
        }

        *lock(&self.inner.state) = PoolState::Stopped;

        let stats = self.stats();
        info!(
            "Converter pool stopped ({} processed, {} successful, {} errors)",
            stats.total_processed, stats.successful, stats.errors
        );
    }

    /// Processes a dequeued item once a concurrency slot is free, then
    /// records the outcome in the durable queue.
    pub async fn process_with_limit(
        &self,
        item: ConversionItem,
        queued: QueueItem<ConversionTask>,
    ) -> ConversionItem {
        let Ok(permit) = Arc::clone(&self.inner.semaphore).acquire_owned().await else {
            warn!("Concurrency limiter closed; {} not processed", item.file_name());
            return item;
        };
        self.run_queued(item, queued, Some(Arc::new(permit))).await
    }

    /// Converts, submits and post-processes one item.
    ///
    /// Failures are recorded on the item and counted; this never returns an
    /// error.
    pub async fn process_item(&self, item: &mut ConversionItem) {
        let span = conversion_span(item);
        self.process_item_inner(item, None).instrument(span).await
    }

    /// Untrusted converters always run in the sandbox.
    pub fn should_use_sandbox(&self, converter: &dyn Converter) -> bool {
        !converter.trusted_mode()
    }

    /// Applies a new configuration: rebuilds converters and watchers and
    /// resizes the concurrency limit. The queue folder stays as opened.
    pub async fn reload_config(&self, config: PoolConfig) -> Result<(), ConverterError> {
        validate_config(&config)?;

        {
            let current = read(&self.inner.config);
            if current.queue_dir != config.queue_dir {
                warn!(
                    "Queue folder change to {} takes effect after restart",
                    config.queue_dir.display()
                );
            }
        }

        self.resize_permits(config.max_concurrent);
        *write(&self.inner.sandbox) =
            Arc::new(ConverterSandbox::new(SandboxConfig::from(&config.sandbox)));
        *write(&self.inner.config) = config;

        let converters = self.load_converters();
        if self.is_running() {
            self.start_watchers();
            self.inner.wake.notify_one();
        }

        info!("Configuration reloaded; {} converters active", converters.len());
        Ok(())
    }

    pub fn get_active_count(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn stats(&self) -> PoolStatistics {
        let counters = &self.inner.counters;
        PoolStatistics {
            total_processed: counters.total_processed.load(Ordering::SeqCst),
            successful: counters.successful.load(Ordering::SeqCst),
            errors: counters.errors.load(Ordering::SeqCst),
            queue_size: self.inner.queue.pending_count(),
            active: self.get_active_count(),
            sandbox_enabled: read(&self.inner.config).enable_sandbox,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.inner.state)
    }

    pub fn converters(&self) -> Vec<Arc<dyn Converter>> {
        read(&self.inner.converters).clone()
    }

    pub fn queue(&self) -> Arc<ConversionQueue> {
        Arc::clone(&self.inner.queue)
    }

    pub fn config(&self) -> PoolConfig {
        read(&self.inner.config).clone()
    }

    /// Number of folder watchers currently running.
    pub fn watcher_count(&self) -> usize {
        lock(&self.inner.watchers).len()
    }

    /// Entry point for watcher events. Returns whether the file was queued.
    pub fn on_file_created(&self, path: &Path, converter: &Arc<dyn Converter>) -> bool {
        if !self.is_accepting() {
            debug!("Ignoring {}: pool is not accepting files", path.display());
            return false;
        }

        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if !converter.matches_file(&path) || self.is_converter_output(&path, converter.as_ref()) {
            return false;
        }
        if self.is_startup_scan_duplicate(&path) {
            debug!("{} was already picked up by the startup scan", path.display());
            return false;
        }

        match self.enqueue(&path, converter, "watcher") {
            Ok(queued) => queued,
            Err(QueueError::Full { max_size }) => {
                warn!(
                    "Queue full ({} items); dropping {} until the next startup scan",
                    max_size,
                    path.display()
                );
                false
            }
            Err(e) => {
                error!("Failed to queue {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Runs every converter's archive maintenance on the blocking pool.
    pub async fn process_archive_queues(&self) {
        let converters = self.converters();
        if converters.is_empty() {
            return;
        }
        if let Err(e) =
            tokio::task::spawn_blocking(move || post_process::process_archive_queues(&converters))
                .await
        {
            error!("Archive maintenance aborted: {}", e);
        }
    }

    fn is_accepting(&self) -> bool {
        !lock(&self.inner.stop_token).is_cancelled()
    }

    fn load_converters(&self) -> Vec<Arc<dyn Converter>> {
        let mut converters = Vec::new();
        {
            let config = read(&self.inner.config);
            for settings in config.enabled_converters() {
                match self.inner.factory.build(settings) {
                    Ok(converter) => {
                        debug!("Loaded converter '{}'", converter.name());
                        converters.push(converter);
                    }
                    Err(e) => error!(
                        "{}",
                        PoolError::ConverterBuild {
                            name: settings.name.clone(),
                            reason: e.to_string(),
                        }
                    ),
                }
            }
        }

        *write(&self.inner.converters) = converters.clone();
        converters
    }

    fn find_converter(&self, name: &str) -> Option<Arc<dyn Converter>> {
        read(&self.inner.converters)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Replaces the running watchers with one per converter whose watch
    /// folder exists.
    fn start_watchers(&self) {
        let debounce = read(&self.inner.config).debounce();
        let mut watchers = Vec::new();

        for converter in self.converters() {
            let Some(watch_path) = converter.watch_path() else {
                continue;
            };
            if !watch_path.is_dir() {
                warn!(
                    "Watch folder {} for converter '{}' does not exist; not watching",
                    watch_path.display(),
                    converter.name()
                );
                continue;
            }

            let pool = Arc::downgrade(&self.inner);
            let target = Arc::clone(&converter);
            let callback: FileCallback = Arc::new(move |path| {
                if let Some(inner) = pool.upgrade() {
                    ConverterPool { inner }.on_file_created(&path, &target);
                }
            });

            match FileWatcher::start(
                converter.name(),
                watch_path,
                converter.watch_recursive(),
                debounce,
                callback,
            ) {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => error!("{}", e),
            }
        }

        let previous = std::mem::replace(&mut *lock(&self.inner.watchers), watchers);
        drop(previous);
    }

    fn stop_watchers(&self) {
        let watchers = std::mem::take(&mut *lock(&self.inner.watchers));
        drop(watchers);
    }

    fn resize_permits(&self, max_concurrent: usize) {
        let mut permits = lock(&self.inner.permits);
        if max_concurrent > *permits {
            self.inner.semaphore.add_permits(max_concurrent - *permits);
        } else if max_concurrent < *permits {
            // Busy permits are retired as soon as they are released.
            let excess = (*permits - max_concurrent) as u32;
            let semaphore = Arc::clone(&self.inner.semaphore);
            tokio::spawn(async move {
                if let Ok(permit) = semaphore.acquire_many_owned(excess).await {
                    permit.forget();
                }
            });
        }
        if max_concurrent != *permits {
            info!("Concurrency limit changed from {} to {}", *permits, max_concurrent);
        }
        *permits = max_concurrent;
    }

    /// Files inside a converter's own archive or error folder are outputs,
    /// never inputs.
    fn is_converter_output(&self, path: &Path, converter: &dyn Converter) -> bool {
        [converter.archive_path(), converter.error_path()]
            .into_iter()
            .flatten()
            .any(|dir| {
                let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
                path.starts_with(dir)
            })
    }

    /// Persists a new task unless the file is already waiting or running.
    fn enqueue(
        &self,
        path: &Path,
        converter: &Arc<dyn Converter>,
        source: &str,
    ) -> Result<bool, QueueError> {
        if self.inner.queue.find_active(|task| task.file_path == path) {
            debug!("{} is already queued", path.display());
            return Ok(false);
        }

        let item = ConversionItem::new(path, Arc::clone(converter));
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), source.into());
        metadata.insert("fileName".to_string(), item.file_name().into());

        let queued = self.inner.queue.add(
            item.to_task(),
            AddOptions {
                priority: item.priority,
                metadata,
                ..AddOptions::default()
            },
        )?;

        debug!(
            "Queued {} for '{}' as {} (priority {})",
            path.display(),
            converter.name(),
            queued.id,
            queued.priority
        );
        self.inner.wake.notify_one();
        Ok(true)
    }

    /// Binds a dequeued task to its live converter. Tasks whose converter is
    /// gone are marked failed.
    fn bind(&self, queued: &QueueItem<ConversionTask>) -> Option<ConversionItem> {
        let task = &queued.data;
        if let Some(converter) = self.find_converter(&task.converter_name) {
            return Some(ConversionItem::from_task(
                task.clone(),
                converter,
                queued.priority,
                queued.created_at,
            ));
        }

        let message = format!("Converter '{}' is not available", task.converter_name);
        warn!("{}; failing {}", message, task.file_path.display());
        let mut failed = queued.clone();
        failed.mark_failed(message);
        if let Err(e) = self.inner.queue.update(&failed) {
            error!("Failed to record orphaned task {}: {}", queued.id, e);
        }
        None
    }

    /// `slot` is the concurrency permit the item runs under. A sandboxed
    /// conversion that outlives its timeout keeps a share of it until the
    /// converter actually returns.
    async fn run_queued(
        &self,
        mut item: ConversionItem,
        mut queued: QueueItem<ConversionTask>,
        slot: Option<Arc<OwnedSemaphorePermit>>,
    ) -> ConversionItem {
        let span = conversion_span(&item);
        self.process_item_inner(&mut item, slot.as_ref())
            .instrument(span)
            .await;

        match item.state() {
            ConversionItemState::Completed => queued.mark_completed(),
            _ => queued.mark_failed(
                item.error
                    .clone()
                    .unwrap_or_else(|| "conversion did not complete".to_string()),
            ),
        }
        if let Err(e) = self.inner.queue.update(&queued) {
            error!("Failed to record result for {}: {}", item.file_name(), e);
        }
        item
    }

    async fn process_item_inner(
        &self,
        item: &mut ConversionItem,
        slot: Option<&Arc<OwnedSemaphorePermit>>,
    ) {
        if let Err(e) = item.start_processing() {
            warn!("Not processing {}: {}", item.file_name(), e);
            return;
        }
        debug!("Conversion started");

        match self.convert_and_submit(item, slot).await {
            Ok(()) => {
                if let Err(e) = item.complete() {
                    warn!("{}", e);
                }
                self.inner.counters.successful.fetch_add(1, Ordering::SeqCst);

                match post_process(item) {
                    Ok(outcome) => debug!(?outcome, "Post-processing finished"),
                    Err(e) => warn!("Post-processing failed for {}: {}", item.file_name(), e),
                }
                info!(
                    "Converted {} in {:?}",
                    item.file_name(),
                    item.processing_time().unwrap_or_default()
                );
            }
            Err(message) => {
                warn!("Conversion of {} failed: {}", item.file_name(), message);
                if let Err(e) = item.fail(message.clone()) {
                    warn!("{}", e);
                }
                self.inner.counters.errors.fetch_add(1, Ordering::SeqCst);
                handle_error(item, &message);
            }
        }

        self.inner
            .counters
            .total_processed
            .fetch_add(1, Ordering::SeqCst);
    }

    async fn convert_and_submit(
        &self,
        item: &ConversionItem,
        slot: Option<&Arc<OwnedSemaphorePermit>>,
    ) -> Result<(), String> {
        let converter = Arc::clone(&item.converter);
        let sandboxed =
            read(&self.inner.config).enable_sandbox && self.should_use_sandbox(converter.as_ref());

        let result = if sandboxed {
            let sandbox = Arc::clone(&read(&self.inner.sandbox));
            sandbox
                .run_holding(converter, &item.file_path, slot.cloned())
                .await
        } else {
            run_direct(converter, &item.file_path).await
        };
        let report = result.map_err(|e| e.to_string())?;

        match report {
            Some(report) => self
                .inner
                .submitter
                .submit(report)
                .await
                .map_err(|e| e.to_string()),
            None => {
                debug!("Converter produced no report");
                Ok(())
            }
        }
    }

    async fn run_scheduler(self, token: CancellationToken) {
        debug!("Scheduler started");

        loop {
            // A slot is claimed before dequeuing so the next item is chosen
            // only when it can actually run.
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&self.inner.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.inner.queue.get_next() {
                Ok(Some(queued)) => {
                    if let Some(item) = self.bind(&queued) {
                        let pool = self.clone();
                        self.inner.tracker.spawn(async move {
                            pool.run_queued(item, queued, Some(Arc::new(permit))).await;
                        });
                    }
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to take the next queued conversion: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!("Scheduler stopped");
    }

    async fn run_archive_maintenance(self, token: CancellationToken) {
        let period = read(&self.inner.config).archive_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A hook that hangs must not hold up shutdown.
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.process_archive_queues() => {}
            }
        }
    }
}

fn conversion_span(item: &ConversionItem) -> tracing::Span {
    info_span!(
        "conversion",
        file = %item.file_name(),
        converter = %item.converter.name()
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
