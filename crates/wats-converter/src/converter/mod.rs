//! The converter contract consumed by the pool.
//!
//! Converters are pluggable, frequently third-party components that turn
//! one source file into a report payload. The pool only ever talks to them
//! through [`Converter`]; optional capabilities have conservative defaults
//! so that an implementation which says nothing about trust is sandboxed.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConverterSettings, DEFAULT_PRIORITY};
use crate::error::ConversionError;

mod settings;

pub use settings::{ConvertFn, SettingsConverter};

/// Opaque report payload produced by a converter and handed to the API.
pub type Report = serde_json::Value;

/// What happens to a source file after its report was submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessAction {
    /// Leave the file where it is.
    #[default]
    Keep,
    /// Move the file into the converter's archive folder.
    Move,
    /// Delete the file.
    Delete,
    /// Compress the file into the archive folder and delete the original.
    Zip,
}

pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Folder to watch for new files. `None` disables watching.
    fn watch_path(&self) -> Option<&Path>;

    fn watch_recursive(&self) -> bool {
        false
    }

    fn matches_file(&self, path: &Path) -> bool;

    /// Converts one file. `Ok(None)` means the file produced nothing to submit.
    fn convert(&self, path: &Path) -> Result<Option<Report>, ConversionError>;

    fn post_process_action(&self) -> PostProcessAction {
        PostProcessAction::Keep
    }

    fn archive_path(&self) -> Option<&Path> {
        None
    }

    fn error_path(&self) -> Option<&Path> {
        None
    }

    /// Periodic maintenance hook, e.g. retrying delivery of archived reports.
    fn process_archive_queue(&self) -> Result<(), ConversionError> {
        Ok(())
    }

    /// Statically bundled, known-safe converters opt out of the sandbox here.
    fn trusted_mode(&self) -> bool {
        false
    }

    /// Location of dynamically loaded converter code, if any.
    fn source_path(&self) -> Option<&Path> {
        None
    }

    /// Queue priority for files claimed by this converter (lower runs first).
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }
}

impl std::fmt::Debug for dyn Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("name", &self.name())
            .field("watch_path", &self.watch_path())
            .field("trusted_mode", &self.trusted_mode())
            .finish()
    }
}

/// Builds live converters from configuration entries.
pub trait ConverterFactory: Send + Sync {
    fn build(&self, settings: &ConverterSettings) -> Result<Arc<dyn Converter>, ConversionError>;
}

impl<F> ConverterFactory for F
where
    F: Fn(&ConverterSettings) -> Result<Arc<dyn Converter>, ConversionError> + Send + Sync,
{
    fn build(&self, settings: &ConverterSettings) -> Result<Arc<dyn Converter>, ConversionError> {
        self(settings)
    }
}
