use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::converter::PostProcessAction;

/// Default number of conversions allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Default converter priority (lower runs first).
pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Directory holding the durable conversion queue.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_true")]
    pub enable_sandbox: bool,
    /// Remove completed queue records instead of keeping them for audit.
    #[serde(default = "default_true")]
    pub delete_completed: bool,
    /// Maximum active (pending + processing) queue items, 0 = unbounded.
    #[serde(default)]
    pub max_queue_size: usize,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_archive_interval_secs")]
    pub archive_interval_secs: u64,
    #[serde(default = "default_debounce_millis")]
    pub debounce_millis: u64,
    #[serde(default = "default_true")]
    pub enable_startup_scan: bool,
    /// Cap on files queued by the startup scan, 0 = no limit.
    #[serde(default)]
    pub startup_scan_max_files: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub startup_scan_dedup_ttl_secs: u64,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub converters: Vec<ConverterSettings>,
}

impl PoolConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    pub fn startup_scan_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.startup_scan_dedup_ttl_secs)
    }

    /// Enabled converter entries, in configuration order.
    pub fn enabled_converters(&self) -> impl Iterator<Item = &ConverterSettings> {
        self.converters.iter().filter(|c| c.enabled)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            enable_sandbox: true,
            delete_completed: true,
            max_queue_size: 0,
            stop_timeout_secs: default_stop_timeout_secs(),
            archive_interval_secs: default_archive_interval_secs(),
            debounce_millis: default_debounce_millis(),
            enable_startup_scan: true,
            startup_scan_max_files: 0,
            startup_scan_dedup_ttl_secs: default_dedup_ttl_secs(),
            sandbox: SandboxSettings::default(),
            converters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_report_bytes")]
    pub max_report_bytes: usize,
    /// Reject inputs that resolve outside the converter's watch folder.
    #[serde(default = "default_true")]
    pub confine_to_watch_path: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            max_report_bytes: default_max_report_bytes(),
            confine_to_watch_path: true,
        }
    }
}

/// One converter entry as it appears in the client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverterSettings {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub watch_path: Option<PathBuf>,
    #[serde(default)]
    pub watch_recursive: bool,
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub error_path: Option<PathBuf>,
    #[serde(default)]
    pub post_process_action: PostProcessAction,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub trusted_mode: bool,
    /// Location of dynamically loaded converter code, if any.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    /// Free-form converter arguments.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl ConverterSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            watch_path: None,
            watch_recursive: false,
            file_patterns: default_file_patterns(),
            archive_path: None,
            error_path: None,
            post_process_action: PostProcessAction::default(),
            priority: DEFAULT_PRIORITY,
            trusted_mode: false,
            source_path: None,
            parameters: serde_json::Map::new(),
        }
    }
}

fn default_queue_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wats-client")
        .join("conversion-queue")
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_archive_interval_secs() -> u64 {
    60
}

fn default_debounce_millis() -> u64 {
    500
}

fn default_dedup_ttl_secs() -> u64 {
    5
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}

fn default_max_report_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_file_patterns() -> Vec<String> {
    vec!["*.*".to_string()]
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}
