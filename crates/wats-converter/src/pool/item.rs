use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::converter::Converter;
use crate::error::PoolError;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionItemState {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ConversionItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Error => "Error",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    fn can_become(&self, next: ConversionItemState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Error)
        )
    }
}

impl fmt::Display for ConversionItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the durable queue stores for each file awaiting conversion.
///
/// The converter is referenced by name and bound again when the task is
/// dispatched, so tasks survive restarts and configuration reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTask {
    pub file_path: PathBuf,
    pub converter_name: String,
    #[serde(default)]
    pub file_date: Option<DateTime<Utc>>,
}

/// One file on its way through a converter.
pub struct ConversionItem {
    pub file_path: PathBuf,
    pub converter: Arc<dyn Converter>,
    /// Lower runs first.
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub process_start: Option<DateTime<Utc>>,
    pub process_end: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Modification time of the source file.
    pub file_date: Option<DateTime<Utc>>,
    state: ConversionItemState,
    sequence: u64,
}

impl ConversionItem {
    pub fn new(file_path: impl Into<PathBuf>, converter: Arc<dyn Converter>) -> Self {
        let file_path = file_path.into();
        let priority = converter.priority();
        let file_date = modified_time(&file_path);
        Self {
            file_path,
            converter,
            priority,
            queued_at: Utc::now(),
            process_start: None,
            process_end: None,
            error: None,
            file_date,
            state: ConversionItemState::Pending,
            sequence: NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Rebuilds an item from a persisted task bound to a live converter.
    pub fn from_task(
        task: ConversionTask,
        converter: Arc<dyn Converter>,
        priority: i32,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            file_path: task.file_path,
            converter,
            priority,
            queued_at,
            process_start: None,
            process_end: None,
            error: None,
            file_date: task.file_date,
            state: ConversionItemState::Pending,
            sequence: NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn state(&self) -> ConversionItemState {
        self.state
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.display().to_string())
    }

    /// Moves the item forward; backwards or skipping transitions are refused.
    pub fn set_state(&mut self, next: ConversionItemState) -> Result<(), PoolError> {
        if !self.state.can_become(next) {
            return Err(PoolError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<(), PoolError> {
        self.set_state(ConversionItemState::Processing)?;
        self.process_start = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), PoolError> {
        self.set_state(ConversionItemState::Completed)?;
        self.process_end = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), PoolError> {
        self.set_state(ConversionItemState::Error)?;
        self.error = Some(message.into());
        self.process_end = Some(Utc::now());
        Ok(())
    }

    /// Wall time spent processing; `None` until the item has finished.
    pub fn processing_time(&self) -> Option<Duration> {
        let (start, end) = (self.process_start?, self.process_end?);
        (end - start).to_std().ok()
    }

    pub fn to_task(&self) -> ConversionTask {
        ConversionTask {
            file_path: self.file_path.clone(),
            converter_name: self.converter.name().to_string(),
            file_date: self.file_date,
        }
    }

    fn order_key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.priority, self.queued_at, self.sequence)
    }
}

impl fmt::Debug for ConversionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionItem")
            .field("file_path", &self.file_path)
            .field("converter", &self.converter.name())
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

impl PartialEq for ConversionItem {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for ConversionItem {}

impl PartialOrd for ConversionItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConversionItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConverterSettings;
    use crate::converter::SettingsConverter;

    fn converter(priority: i32) -> Arc<dyn Converter> {
        let mut settings = ConverterSettings::new("Csv");
        settings.priority = priority;
        Arc::new(SettingsConverter::from_fn(settings, |_, _| Ok(None)))
    }

    #[test]
    fn test_new_item_defaults() {
        let item = ConversionItem::new("/data/in/a.csv", converter(3));
        assert_eq!(item.state(), ConversionItemState::Pending);
        assert_eq!(item.priority, 3);
        assert!(item.process_start.is_none());
        assert!(item.processing_time().is_none());
        assert_eq!(item.file_name(), "a.csv");
    }

    #[test]
    fn test_forward_transitions() {
        let mut item = ConversionItem::new("a.csv", converter(5));
        item.start_processing().unwrap();
        assert!(item.process_start.is_some());
        assert!(item.processing_time().is_none());

        item.complete().unwrap();
        assert_eq!(item.state(), ConversionItemState::Completed);
        assert!(item.processing_time().is_some());
    }

    #[test]
    fn test_backward_transitions_are_rejected() {
        let mut item = ConversionItem::new("a.csv", converter(5));
        assert!(item.complete().is_err());
        assert_eq!(item.state(), ConversionItemState::Pending);

        item.start_processing().unwrap();
        item.fail("bad data").unwrap();
        assert_eq!(item.error.as_deref(), Some("bad data"));

        assert!(item.set_state(ConversionItemState::Pending).is_err());
        assert!(item.set_state(ConversionItemState::Processing).is_err());
        assert_eq!(item.state(), ConversionItemState::Error);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConversionItemState::Pending.to_string(), "Pending");
        assert_eq!(ConversionItemState::Processing.to_string(), "Processing");
        assert_eq!(ConversionItemState::Completed.to_string(), "Completed");
        assert_eq!(ConversionItemState::Error.to_string(), "Error");
    }

    #[test]
    fn test_ordering_priority_then_fifo() {
        let first = ConversionItem::new("first.csv", converter(5));
        let second = ConversionItem::new("second.csv", converter(5));
        let urgent = ConversionItem::new("urgent.csv", converter(1));

        let mut items = vec![second, urgent, first];
        items.sort();
        let names: Vec<_> = items.iter().map(|i| i.file_name()).collect();
        assert_eq!(names, vec!["urgent.csv", "first.csv", "second.csv"]);
    }

    #[test]
    fn test_task_round_trip() {
        let item = ConversionItem::new("/data/in/a.csv", converter(5));
        let task = item.to_task();
        assert_eq!(task.converter_name, "Csv");

        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("converterName").is_some());
        let back: ConversionTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
