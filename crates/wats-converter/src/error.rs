use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConverterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid file pattern '{pattern}' for converter '{converter}': {reason}")]
    InvalidPattern {
        converter: String,
        pattern: String,
        reason: String,
    },

    #[error("Duplicate converter name: {0}")]
    DuplicateConverter(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is full ({max_size} active items)")]
    Full { max_size: usize },

    #[error("Queue storage at '{path}' is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Queue I/O failed on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue file operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to serialize queue item '{id}': {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Queue item already exists: {0}")]
    Duplicate(String),

    #[error("Queue item {0} was moved by another queue instance")]
    Moved(String),

    #[error("Queue index lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete file '{path}': {source}")]
    DeleteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build archive '{path}': {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

/// Error raised by a converter's own `convert()` or archive maintenance.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("{0}")]
    Failed(String),

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ConversionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Error raised by the report submission API.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Report rejected: {0}")]
    Rejected(String),

    #[error("Submission failed: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum SandboxError {
    /// The converter itself reported an error; displayed verbatim.
    #[error(transparent)]
    Converter(#[from] ConversionError),

    #[error("Converter '{converter}' timed out after {seconds}s")]
    Timeout { converter: String, seconds: u64 },

    #[error("Converter '{converter}' panicked: {message}")]
    Panicked { converter: String, message: String },

    #[error("Sandbox rejected input: {0}")]
    Security(String),

    #[error("Report of {size} bytes exceeds the {limit} byte limit")]
    ResourceLimit { size: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to build converter '{name}': {reason}")]
    ConverterBuild { name: String, reason: String },

    #[error("Failed to watch '{path}': {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Pool is not running")]
    NotRunning,

    #[error("Pool is still stopping")]
    Stopping,

    #[error("Invalid conversion state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, ConverterError>;
