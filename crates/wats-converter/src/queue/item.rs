use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of attempts before a failed item stops being retried.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Longest item id kept after sanitising, leaving room for the state
/// suffix and temp-file suffix within common filename limits.
const MAX_ID_LEN: usize = 160;

/// Lifecycle phase of a queued item, encoded in its on-disk file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    /// File name suffix for this status.
    pub fn as_suffix(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// How far along the lifecycle a status is; used when the same id is
    /// found on disk in more than one state. A success outranks a failure.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Failed => 2,
            Self::Completed => 3,
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_suffix())
    }
}

impl FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Failed),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

/// A payload plus the bookkeeping the durable queue persists for it.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub id: String,
    pub data: T,
    pub priority: i32,
    pub status: QueueItemStatus,
    /// Failed or interrupted processing attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Insertion order, the final FIFO tie-break.
    pub(crate) sequence: u64,
}

impl<T> QueueItem<T> {
    pub fn new(id: impl AsRef<str>, data: T, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: sanitize_id(id.as_ref()),
            data,
            priority,
            status: QueueItemStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            error: None,
            metadata: serde_json::Map::new(),
            sequence: 0,
        }
    }

    /// Creates an item with a random id.
    pub fn create(data: T, priority: i32) -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), data, priority)
    }

    pub fn mark_processing(&mut self) {
        self.status = QueueItemStatus::Processing;
        self.error = None;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = QueueItemStatus::Completed;
        self.error = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = QueueItemStatus::Failed;
        self.error = Some(error.into());
        self.attempts += 1;
        self.touch();
    }

    /// Puts the item back in line, e.g. after a crash or for a retry.
    pub fn reset_to_pending(&mut self) {
        self.status = QueueItemStatus::Pending;
        self.touch();
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Dispatch order: priority, then queue time, then insertion order.
    pub fn order_key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.sequence)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Restricts an id to characters that are safe in a file name.
pub fn sanitize_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_ID_LEN)
        .collect();

    if sanitized.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        sanitized
    }
}
