//! Isolated execution of untrusted converters.
//!
//! A converter runs on tokio's blocking pool with panics caught, a wall-clock
//! limit, input checks before it starts and a size cap on what it returns.
//! Converters flagged as trusted skip all of this and go through [`run_direct`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SandboxSettings;
use crate::converter::{Converter, Report};
use crate::error::{ConversionError, SandboxError};

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    /// Upper bound on the serialized report size.
    pub max_report_bytes: usize,
    pub confine_to_watch_path: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig::from(&SandboxSettings::default())
    }
}

impl From<&SandboxSettings> for SandboxConfig {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            max_report_bytes: settings.max_report_bytes,
            confine_to_watch_path: settings.confine_to_watch_path,
        }
    }
}

pub struct ConverterSandbox {
    config: SandboxConfig,
    active: Arc<AtomicUsize>,
}

impl ConverterSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Conversions currently executing, including ones that outlived their
    /// timeout and are still occupying a blocking thread.
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn run(
        &self,
        converter: Arc<dyn Converter>,
        path: &Path,
    ) -> Result<Option<Report>, SandboxError> {
        self.run_holding(converter, path, ()).await
    }

    /// Like [`ConverterSandbox::run`], keeping `slot` alive until the
    /// converter returns, even when that is long after the timeout fired.
    /// The pool passes its concurrency permit here so abandoned conversions
    /// still count against the limit.
    pub async fn run_holding<S>(
        &self,
        converter: Arc<dyn Converter>,
        path: &Path,
        slot: S,
    ) -> Result<Option<Report>, SandboxError>
    where
        S: Send + 'static,
    {
        let input = self.validate_input(converter.as_ref(), path)?;
        let name = converter.name().to_string();

        debug!(converter = %name, file = %input.display(), "Running converter in sandbox");

        let guard = ActiveRun::enter(&self.active);
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let _slot = slot;
            catch_unwind(AssertUnwindSafe(|| converter.convert(&input)))
        });

        let report = match tokio::time::timeout(self.config.timeout, handle).await {
            Ok(Ok(Ok(result))) => result?,
            Ok(Ok(Err(payload))) => {
                return Err(SandboxError::Panicked {
                    converter: name,
                    message: panic_message(payload.as_ref()),
                })
            }
            Ok(Err(join_error)) => {
                return Err(SandboxError::Panicked {
                    converter: name,
                    message: join_error.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    converter = %name,
                    "Converter exceeded {:?}; abandoning its worker thread",
                    self.config.timeout
                );
                return Err(SandboxError::Timeout {
                    converter: name,
                    seconds: self.config.timeout.as_secs(),
                });
            }
        };

        if let Some(report) = &report {
            self.check_report_size(report)?;
        }
        Ok(report)
    }

    fn validate_input(&self, converter: &dyn Converter, path: &Path) -> Result<PathBuf, SandboxError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            SandboxError::Security(format!("cannot access '{}': {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(SandboxError::Security(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }

        let canonical = path.canonicalize().map_err(|e| {
            SandboxError::Security(format!("cannot resolve '{}': {}", path.display(), e))
        })?;

        if self.config.confine_to_watch_path {
            if let Some(watch_path) = converter.watch_path() {
                let root = watch_path.canonicalize().map_err(|e| {
                    SandboxError::Security(format!(
                        "watch folder '{}' is unavailable: {}",
                        watch_path.display(),
                        e
                    ))
                })?;
                if !canonical.starts_with(&root) {
                    return Err(SandboxError::Security(format!(
                        "'{}' is outside the watch folder '{}'",
                        canonical.display(),
                        root.display()
                    )));
                }
            }
        }

        Ok(canonical)
    }

    fn check_report_size(&self, report: &Report) -> Result<(), SandboxError> {
        let size = serde_json::to_vec(report)
            .map_err(|e| ConversionError::failed(format!("report is not serializable: {}", e)))?
            .len();
        if size > self.config.max_report_bytes {
            return Err(SandboxError::ResourceLimit {
                size,
                limit: self.config.max_report_bytes,
            });
        }
        Ok(())
    }
}

/// Runs a trusted converter on the blocking pool without sandbox checks.
/// Panics still become errors so one converter cannot take down a worker.
pub async fn run_direct(
    converter: Arc<dyn Converter>,
    path: &Path,
) -> Result<Option<Report>, SandboxError> {
    let name = converter.name().to_string();
    let input = path.to_path_buf();

    match tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| converter.convert(&input)))
    })
    .await
    {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(payload)) => Err(SandboxError::Panicked {
            converter: name,
            message: panic_message(payload.as_ref()),
        }),
        Err(join_error) => Err(SandboxError::Panicked {
            converter: name,
            message: join_error.to_string(),
        }),
    }
}

struct ActiveRun(Arc<AtomicUsize>);

impl ActiveRun {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConverterSettings;
    use crate::converter::SettingsConverter;
    use serde_json::json;
    use tempfile::TempDir;

    fn converter_in(
        watch: &Path,
        convert: impl Fn(&Path) -> Result<Option<Report>, ConversionError> + Send + Sync + 'static,
    ) -> Arc<dyn Converter> {
        let mut settings = ConverterSettings::new("Test");
        settings.watch_path = Some(watch.to_path_buf());
        Arc::new(SettingsConverter::from_fn(settings, move |path, _| convert(path)))
    }

    fn sandbox() -> ConverterSandbox {
        ConverterSandbox::new(SandboxConfig::default())
    }

    fn write_input(dir: &Path) -> PathBuf {
        let path = dir.join("unit.csv");
        std::fs::write(&path, "sn,result\nA1,pass\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |path| {
            let text = std::fs::read_to_string(path).unwrap();
            Ok(Some(json!({ "lines": text.lines().count() })))
        });

        let report = sandbox().run(converter, &input).await.unwrap();
        assert_eq!(report, Some(json!({ "lines": 2 })));
    }

    #[tokio::test]
    async fn test_converter_error_is_passed_through() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| Err(ConversionError::failed("bad header")));

        let err = sandbox().run(converter, &input).await.unwrap_err();
        assert!(matches!(err, SandboxError::Converter(_)));
        assert_eq!(err.to_string(), "bad header");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| panic!("index out of range"));

        let sandbox = sandbox();
        let err = sandbox.run(converter, &input).await.unwrap_err();
        match err {
            SandboxError::Panicked { converter, message } => {
                assert_eq!(converter, "Test");
                assert!(message.contains("index out of range"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sandbox.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(None)
        });

        let sandbox = ConverterSandbox::new(SandboxConfig {
            timeout: Duration::from_millis(50),
            ..SandboxConfig::default()
        });
        let err = sandbox.run(converter, &input).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_timed_out_run_keeps_its_slot_until_converter_returns() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(None)
        });

        let limit = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = Arc::clone(&limit).acquire_owned().await.unwrap();
        let sandbox = ConverterSandbox::new(SandboxConfig {
            timeout: Duration::from_millis(50),
            ..SandboxConfig::default()
        });

        let err = sandbox.run_holding(converter, &input, permit).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
        assert_eq!(limit.available_permits(), 0);
        assert_eq!(sandbox.active_runs(), 1);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(limit.available_permits(), 1);
        assert_eq!(sandbox.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_rejects_missing_and_directory_inputs() {
        let temp = TempDir::new().unwrap();
        let converter = converter_in(temp.path(), |_| Ok(None));

        let err = sandbox()
            .run(converter.clone(), &temp.path().join("missing.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));

        let err = sandbox().run(converter, temp.path()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[tokio::test]
    async fn test_rejects_input_outside_watch_folder() {
        let watch = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let input = write_input(elsewhere.path());
        let converter = converter_in(watch.path(), |_| Ok(None));

        let err = sandbox().run(converter.clone(), &input).await.unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));

        let relaxed = ConverterSandbox::new(SandboxConfig {
            confine_to_watch_path: false,
            ..SandboxConfig::default()
        });
        assert!(relaxed.run(converter, &input).await.is_ok());
    }

    #[tokio::test]
    async fn test_report_size_limit() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| Ok(Some(json!({ "blob": "x".repeat(256) }))));

        let sandbox = ConverterSandbox::new(SandboxConfig {
            max_report_bytes: 64,
            ..SandboxConfig::default()
        });
        let err = sandbox.run(converter, &input).await.unwrap_err();
        assert!(matches!(err, SandboxError::ResourceLimit { limit: 64, .. }));
    }

    #[tokio::test]
    async fn test_run_direct_maps_panics() {
        let temp = TempDir::new().unwrap();
        let input = write_input(temp.path());
        let converter = converter_in(temp.path(), |_| panic!("boom"));

        let err = run_direct(converter, &input).await.unwrap_err();
        assert!(matches!(err, SandboxError::Panicked { .. }));
    }
}
