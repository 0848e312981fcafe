//! Test harness for isolated pool execution.
//!
//! Every harness owns a temporary directory with `watch`, `archive`,
//! `errors` and `queue` folders, a recording submitter and a factory that
//! builds converters whose behaviour is selected through their parameters.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use wats_converter::config::{ConverterSettings, PoolConfig};
use wats_converter::converter::{Converter, ConverterFactory, Report, SettingsConverter};
use wats_converter::error::{ConversionError, SubmitError};
use wats_converter::{ConverterPool, ReportSubmitter};

use super::builders::ConverterBuilder;

/// Records submitted reports and the peak number of concurrent submissions.
#[derive(Default)]
pub struct MockSubmitter {
    reports: Mutex<Vec<Report>>,
    delay: Duration,
    fail: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    /// File names of submitted reports in submission order.
    pub fn submitted_files(&self) -> Vec<String> {
        self.reports()
            .iter()
            .filter_map(|r| r["file"].as_str().map(str::to_string))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportSubmitter for MockSubmitter {
    async fn submit(&self, report: Report) -> Result<(), SubmitError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(SubmitError::Transport("server unreachable".to_string()));
        }
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

/// Builds `SettingsConverter`s whose behaviour follows the `mode` and
/// `delayMs` parameters set by `ConverterBuilder`.
pub fn mock_factory() -> Arc<dyn ConverterFactory> {
    Arc::new(
        |settings: &ConverterSettings| -> Result<Arc<dyn Converter>, ConversionError> {
            let mode = settings
                .parameters
                .get("mode")
                .and_then(|v| v.as_str())
                .unwrap_or("ok")
                .to_string();
            if mode == "unbuildable" {
                return Err(ConversionError::failed("converter module missing"));
            }
            let delay = settings
                .parameters
                .get("delayMs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);

            Ok(Arc::new(SettingsConverter::from_fn(
                settings.clone(),
                move |path, settings| {
                    if delay > 0 {
                        std::thread::sleep(Duration::from_millis(delay));
                    }
                    match mode.as_str() {
                        "fail" => Err(ConversionError::failed(format!(
                            "unexpected header in {}",
                            path.display()
                        ))),
                        "panic" => panic!("converter crashed"),
                        "none" => Ok(None),
                        _ => {
                            let content = std::fs::read_to_string(path).map_err(|e| {
                                ConversionError::Read {
                                    path: path.to_path_buf(),
                                    source: e,
                                }
                            })?;
                            let file = path.file_name().and_then(|n| n.to_str());
                            Ok(Some(json!({
                                "converter": settings.name,
                                "file": file,
                                "content": content,
                            })))
                        }
                    }
                },
            )))
        },
    )
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Isolated environment for a pool under test.
pub struct TestHarness {
    temp_dir: TempDir,
    pub watch_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub error_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub submitter: Arc<MockSubmitter>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_submitter(MockSubmitter::new())
    }

    pub fn with_submitter(submitter: MockSubmitter) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let watch_dir = base.join("watch");
        let archive_dir = base.join("archive");
        let error_dir = base.join("errors");
        let queue_dir = base.join("queue");
        std::fs::create_dir_all(&watch_dir).expect("Failed to create watch dir");

        Self {
            temp_dir,
            watch_dir,
            archive_dir,
            error_dir,
            queue_dir,
            submitter: Arc::new(submitter),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Pool settings suited to tests: no startup scan, short debounce and
    /// stop timeout, no converters yet.
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            queue_dir: self.queue_dir.clone(),
            max_concurrent: 5,
            enable_startup_scan: false,
            debounce_millis: 100,
            stop_timeout_secs: 5,
            converters: Vec::new(),
            ..PoolConfig::default()
        }
    }

    /// A converter watching this harness' folders.
    pub fn converter(&self, name: &str) -> ConverterBuilder {
        ConverterBuilder::new(name)
            .watching(&self.watch_dir)
            .archive(&self.archive_dir)
            .errors(&self.error_dir)
    }

    pub fn pool(&self, config: PoolConfig) -> ConverterPool {
        let submitter: Arc<dyn ReportSubmitter> = self.submitter.clone();
        ConverterPool::new(config, submitter, mock_factory()).expect("Failed to create pool")
    }

    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.watch_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write test file");
        path
    }
}

/// Looks up a loaded converter by name.
pub fn converter_named(pool: &ConverterPool, name: &str) -> Arc<dyn Converter> {
    pool.converters()
        .into_iter()
        .find(|c| c.name() == name)
        .unwrap_or_else(|| panic!("converter '{}' not loaded", name))
}
