//! Durable, file-backed work queue.

mod item;
mod persistent;

pub use item::{sanitize_id, QueueItem, QueueItemStatus, DEFAULT_MAX_ATTEMPTS};
pub use persistent::{AddOptions, PersistentQueue, ProcessSummary, QueueOptions, DEFAULT_EXTENSION};
