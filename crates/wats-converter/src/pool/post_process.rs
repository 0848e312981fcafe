//! What happens to source files once their conversion has finished.

use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::item::ConversionItem;
use crate::converter::{Converter, PostProcessAction};
use crate::error::StorageError;
use crate::storage::{atomic_write, delete_file, move_into, zip_into};

/// Suffix of the note written next to files moved to the error folder.
pub const ERROR_NOTE_SUFFIX: &str = ".error.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessOutcome {
    Kept,
    Moved(PathBuf),
    Deleted,
    Zipped(PathBuf),
}

/// Applies the converter's post-process action to a successfully converted file.
pub fn post_process(item: &ConversionItem) -> Result<PostProcessOutcome, StorageError> {
    let converter = &item.converter;
    let source = &item.file_path;

    match converter.post_process_action() {
        PostProcessAction::Keep => Ok(PostProcessOutcome::Kept),
        PostProcessAction::Delete => {
            delete_file(source)?;
            debug!("Deleted {}", source.display());
            Ok(PostProcessOutcome::Deleted)
        }
        PostProcessAction::Move => match converter.archive_path() {
            Some(archive) => {
                let target = move_into(source, archive)?;
                debug!("Archived {} to {}", source.display(), target.display());
                Ok(PostProcessOutcome::Moved(target))
            }
            None => {
                warn!(
                    "Converter '{}' asks to move files but has no archive path; keeping {}",
                    converter.name(),
                    source.display()
                );
                Ok(PostProcessOutcome::Kept)
            }
        },
        PostProcessAction::Zip => match converter.archive_path() {
            Some(archive) => {
                let target = zip_into(source, archive)?;
                debug!("Zipped {} to {}", source.display(), target.display());
                Ok(PostProcessOutcome::Zipped(target))
            }
            None => {
                warn!(
                    "Converter '{}' asks to zip files but has no archive path; keeping {}",
                    converter.name(),
                    source.display()
                );
                Ok(PostProcessOutcome::Kept)
            }
        },
    }
}

/// Moves a failed source file into the converter's error folder together with
/// a note describing the failure. Returns the file's new location, if moved.
///
/// Never fails: problems are logged and the file stays where it is.
pub fn handle_error(item: &ConversionItem, message: &str) -> Option<PathBuf> {
    let converter = &item.converter;
    let Some(error_dir) = converter.error_path() else {
        debug!(
            "Converter '{}' has no error path; leaving {} in place",
            converter.name(),
            item.file_path.display()
        );
        return None;
    };

    if !item.file_path.exists() {
        warn!("Failed file {} no longer exists", item.file_path.display());
        return None;
    }

    let target = match move_into(&item.file_path, error_dir) {
        Ok(target) => target,
        Err(e) => {
            error!(
                "Failed to move {} to error folder: {}",
                item.file_path.display(),
                e
            );
            return None;
        }
    };

    let note = error_note_path(&target);
    if let Err(e) = atomic_write(&note, render_error_note(item, message).as_bytes()) {
        warn!("Failed to write error note {}: {}", note.display(), e);
    }

    info!("Moved failed file to {}", target.display());
    Some(target)
}

pub fn error_note_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(ERROR_NOTE_SUFFIX);
    file.with_file_name(name)
}

fn render_error_note(item: &ConversionItem, message: &str) -> String {
    let mut note = String::new();
    let _ = writeln!(note, "File: {}", item.file_path.display());
    let _ = writeln!(note, "Converter: {}", item.converter.name());
    let _ = writeln!(note, "Failed at: {}", Utc::now().to_rfc3339());
    let _ = writeln!(note, "Error: {}", message);
    note
}

/// Runs every converter's archive maintenance. One converter failing or
/// panicking does not stop the others.
pub fn process_archive_queues(converters: &[Arc<dyn Converter>]) {
    for converter in converters {
        match catch_unwind(AssertUnwindSafe(|| converter.process_archive_queue())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "Archive queue processing failed for '{}': {}",
                converter.name(),
                e
            ),
            Err(_) => error!("Archive queue processing panicked for '{}'", converter.name()),
        }
    }
}
