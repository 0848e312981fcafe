pub mod api;
pub mod config;
pub mod converter;
pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod storage;
pub mod watcher;

pub use api::ReportSubmitter;
pub use config::{load_config, ConverterSettings, PoolConfig};
pub use converter::{Converter, ConverterFactory, PostProcessAction, Report, SettingsConverter};
pub use error::{
    ConfigError, ConversionError, ConverterError, PoolError, QueueError, Result, SandboxError,
    StorageError, SubmitError,
};
pub use logging::{init_logging, LogFormat};
pub use pool::{
    ConversionItem, ConversionItemState, ConversionTask, ConverterPool, PoolState, PoolStatistics,
    ScanStats,
};
pub use queue::{PersistentQueue, QueueItem, QueueItemStatus};
pub use sandbox::{ConverterSandbox, SandboxConfig};
pub use watcher::FileWatcher;
