//! Picks up files that arrived while the client was not running.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{lock, read, ConverterPool};
use crate::converter::Converter;
use crate::error::{PoolError, QueueError};
use crate::watcher::{is_queued_marker, QUEUED_MARKER_EXTENSION};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Files that matched a converter.
    pub scanned: usize,
    pub queued: usize,
    /// Already marked as queued, already in the queue, or over the file limit.
    pub skipped: usize,
    pub errors: usize,
}

impl ScanStats {
    fn merge(&mut self, other: ScanStats) {
        self.scanned += other.scanned;
        self.queued += other.queued;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Paths seen by the last startup scan. Watcher events for them are ignored
/// until the entries expire.
#[derive(Debug, Default)]
pub(super) struct StartupScan {
    seen: HashSet<PathBuf>,
    expires_at: Option<Instant>,
    complete: bool,
}

impl StartupScan {
    fn begin(&mut self) {
        self.seen.clear();
        self.expires_at = None;
        self.complete = false;
    }

    fn finish(&mut self, seen: HashSet<PathBuf>, ttl: Duration) {
        self.seen = seen;
        self.expires_at = Some(Instant::now() + ttl);
        self.expire_if_due();
    }

    fn mark_complete(&mut self) {
        self.seen.clear();
        self.expires_at = None;
        self.complete = true;
    }

    fn expire_if_due(&mut self) {
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            self.mark_complete();
        }
    }

    pub(super) fn contains(&mut self, path: &Path) -> bool {
        self.expire_if_due();
        self.seen.contains(path)
    }

    pub(super) fn is_complete(&mut self) -> bool {
        self.expire_if_due();
        self.complete
    }

    pub(super) fn len(&mut self) -> usize {
        self.expire_if_due();
        self.seen.len()
    }
}

impl ConverterPool {
    /// Queues matching files already sitting in the watch folders, oldest
    /// first.
    pub fn scan_existing_files(&self) -> ScanStats {
        let (enabled, max_files, ttl) = {
            let config = read(&self.inner.config);
            (
                config.enable_startup_scan,
                config.startup_scan_max_files,
                config.startup_scan_dedup_ttl(),
            )
        };

        if !enabled {
            debug!("Startup scan disabled");
            lock(&self.inner.startup_scan).mark_complete();
            return ScanStats::default();
        }

        lock(&self.inner.startup_scan).begin();

        let mut stats = ScanStats::default();
        let mut seen = HashSet::new();
        let mut budget = if max_files == 0 { usize::MAX } else { max_files };

        for converter in self.converters() {
            let Some(watch_path) = converter.watch_path() else {
                continue;
            };
            if !watch_path.is_dir() {
                debug!(
                    "Skipping startup scan for '{}': {} does not exist",
                    converter.name(),
                    watch_path.display()
                );
                continue;
            }

            let converter_stats =
                self.scan_converter(&converter, watch_path, &mut seen, &mut budget);
            info!(
                "Startup scan for '{}': {} scanned, {} queued, {} skipped, {} errors",
                converter.name(),
                converter_stats.scanned,
                converter_stats.queued,
                converter_stats.skipped,
                converter_stats.errors
            );
            stats.merge(converter_stats);
        }

        lock(&self.inner.startup_scan).finish(seen, ttl);
        stats
    }

    /// Whether the de-duplication window of the last startup scan has closed.
    pub fn startup_scan_complete(&self) -> bool {
        lock(&self.inner.startup_scan).is_complete()
    }

    /// Number of paths currently suppressed for watcher events.
    pub fn startup_scan_pending_dedup(&self) -> usize {
        lock(&self.inner.startup_scan).len()
    }

    pub(super) fn is_startup_scan_duplicate(&self, path: &Path) -> bool {
        lock(&self.inner.startup_scan).contains(path)
    }

    fn scan_converter(
        &self,
        converter: &Arc<dyn Converter>,
        watch_path: &Path,
        seen: &mut HashSet<PathBuf>,
        budget: &mut usize,
    ) -> ScanStats {
        let mut stats = ScanStats::default();
        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();

        let max_depth = if converter.watch_recursive() { usize::MAX } else { 1 };

        for entry in WalkDir::new(watch_path).min_depth(1).max_depth(max_depth) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => {
                    warn!(
                        "{}",
                        PoolError::ScanFailed {
                            path: watch_path.to_path_buf(),
                            source,
                        }
                    );
                    stats.errors += 1;
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || is_queued_marker(path) {
                continue;
            }
            if self.is_converter_output(path, converter.as_ref()) {
                continue;
            }
            if !converter.matches_file(path) {
                continue;
            }

            stats.scanned += 1;

            if has_queued_marker(path) {
                debug!("{} already marked as queued", path.display());
                stats.skipped += 1;
                continue;
            }

            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, path.to_path_buf()));
        }

        candidates.sort();

        for (_, path) in candidates {
            let path = path.canonicalize().unwrap_or(path);

            if *budget == 0 {
                stats.skipped += 1;
                continue;
            }

            match self.enqueue(&path, converter, "startup-scan") {
                Ok(true) => {
                    *budget -= 1;
                    stats.queued += 1;
                    seen.insert(path);
                }
                Ok(false) => {
                    stats.skipped += 1;
                    seen.insert(path);
                }
                Err(QueueError::Full { max_size }) => {
                    warn!(
                        "Queue full ({} items); {} left for a later scan",
                        max_size,
                        path.display()
                    );
                    stats.errors += 1;
                }
                Err(e) => {
                    warn!("Failed to queue {}: {}", path.display(), e);
                    stats.errors += 1;
                }
            }
        }

        stats
    }
}

fn has_queued_marker(path: &Path) -> bool {
    let mut name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => return false,
    };
    name.push(".");
    name.push(QUEUED_MARKER_EXTENSION);
    path.with_file_name(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_scan_window_expires() {
        let mut scan = StartupScan::default();
        scan.begin();
        assert!(!scan.is_complete());

        let path = PathBuf::from("/watch/a.csv");
        scan.finish(HashSet::from([path.clone()]), Duration::from_millis(30));
        assert!(scan.contains(&path));
        assert!(!scan.is_complete());

        std::thread::sleep(Duration::from_millis(60));
        assert!(!scan.contains(&path));
        assert!(scan.is_complete());
        assert_eq!(scan.len(), 0);
    }

    #[test]
    fn test_zero_ttl_completes_immediately() {
        let mut scan = StartupScan::default();
        scan.begin();
        scan.finish(HashSet::from([PathBuf::from("/watch/a.csv")]), Duration::ZERO);
        assert!(scan.is_complete());
    }

    #[test]
    fn test_has_queued_marker() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("unit.csv");
        std::fs::write(&file, "x").unwrap();
        assert!(!has_queued_marker(&file));

        std::fs::write(temp.path().join("unit.csv.queued"), "").unwrap();
        assert!(has_queued_marker(&file));
    }
}
