//! Debounced folder watching, one watcher per converter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};

use crate::error::PoolError;

/// Extension of marker files an external tool leaves next to sources it has
/// already claimed. Only read here; never written.
pub const QUEUED_MARKER_EXTENSION: &str = "queued";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives every file path that survives the watcher's filters.
pub type FileCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

pub struct FileWatcher {
    converter: String,
    root: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching `watch_path` on a dedicated thread.
    ///
    /// Setup errors (missing folder, OS watch limits) are returned here rather
    /// than surfacing later on the thread.
    pub fn start(
        converter: impl Into<String>,
        watch_path: &Path,
        recursive: bool,
        debounce: Duration,
        callback: FileCallback,
    ) -> Result<Self, PoolError> {
        let converter = converter.into();
        let watch_error = |reason: String| PoolError::Watch {
            path: watch_path.to_path_buf(),
            reason,
        };

        let root = watch_path
            .canonicalize()
            .map_err(|e| watch_error(e.to_string()))?;

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(debounce, tx).map_err(|e| watch_error(e.to_string()))?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(&root, mode)
            .map_err(|e| watch_error(e.to_string()))?;

        info!(
            "Watching {} for converter '{}'{}",
            root.display(),
            converter,
            if recursive { " (recursive)" } else { "" }
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_root = root.clone();
        let thread_name = converter.clone();

        let handle = thread::Builder::new()
            .name(format!("watch-{}", converter))
            .spawn(move || {
                // Keeps the OS watch alive for the lifetime of the loop.
                let _debouncer = debouncer;

                while !thread_shutdown.load(Ordering::Relaxed) {
                    match rx.recv_timeout(POLL_INTERVAL) {
                        Ok(Ok(events)) => {
                            for event in events {
                                if thread_shutdown.load(Ordering::Relaxed) {
                                    break;
                                }
                                forward_event(&thread_root, recursive, event, &callback);
                            }
                        }
                        Ok(Err(e)) => error!("Watch error for converter '{}': {}", thread_name, e),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                debug!("Watcher thread for '{}' exiting", thread_name);
            })
            .map_err(|e| watch_error(e.to_string()))?;

        Ok(Self {
            converter,
            root,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn converter_name(&self) -> &str {
        &self.converter
    }

    pub fn watch_path(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // Dropped from our own callback; the loop exits on the flag.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Watcher thread for '{}' panicked", self.converter);
            } else {
                info!("Stopped watching {}", self.root.display());
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_event(root: &Path, recursive: bool, event: DebouncedEvent, callback: &FileCallback) {
    if should_forward(root, recursive, &event.path) {
        debug!("File event: {}", event.path.display());
        callback(event.path);
    }
}

/// Whether an event path refers to a candidate source file.
pub(crate) fn should_forward(root: &Path, recursive: bool, path: &Path) -> bool {
    // Vanished before we got to it, or a folder.
    if !path.is_file() {
        return false;
    }
    if is_queued_marker(path) {
        return false;
    }
    if !recursive && path.parent() != Some(root) {
        return false;
    }
    path.starts_with(root)
}

pub(crate) fn is_queued_marker(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(QUEUED_MARKER_EXTENSION))
}
