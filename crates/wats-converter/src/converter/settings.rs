use std::path::Path;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use tracing::warn;

use super::{Converter, PostProcessAction, Report};
use crate::config::ConverterSettings;
use crate::error::ConversionError;

/// Conversion logic plugged into a [`SettingsConverter`].
pub type ConvertFn =
    Arc<dyn Fn(&Path, &ConverterSettings) -> Result<Option<Report>, ConversionError> + Send + Sync>;

/// A [`Converter`] whose folders, patterns and policies come straight from a
/// configuration entry; only the conversion itself is supplied in code.
pub struct SettingsConverter {
    settings: ConverterSettings,
    patterns: Vec<Pattern>,
    convert_fn: ConvertFn,
}

impl SettingsConverter {
    pub fn new(settings: ConverterSettings, convert_fn: ConvertFn) -> Self {
        let patterns = settings
            .file_patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(
                        "Invalid file pattern '{}' in converter '{}': {}",
                        p, settings.name, e
                    );
                    None
                }
            })
            .collect();

        Self {
            settings,
            patterns,
            convert_fn,
        }
    }

    /// Same as [`SettingsConverter::new`], taking the conversion as a closure.
    pub fn from_fn<F>(settings: ConverterSettings, convert: F) -> Self
    where
        F: Fn(&Path, &ConverterSettings) -> Result<Option<Report>, ConversionError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(settings, Arc::new(convert))
    }

    pub fn settings(&self) -> &ConverterSettings {
        &self.settings
    }
}

impl Converter for SettingsConverter {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn watch_path(&self) -> Option<&Path> {
        self.settings.watch_path.as_deref()
    }

    fn watch_recursive(&self) -> bool {
        self.settings.watch_recursive
    }

    fn matches_file(&self, path: &Path) -> bool {
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };

        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(filename, options))
    }

    fn convert(&self, path: &Path) -> Result<Option<Report>, ConversionError> {
        (self.convert_fn)(path, &self.settings)
    }

    fn post_process_action(&self) -> PostProcessAction {
        self.settings.post_process_action
    }

    fn archive_path(&self) -> Option<&Path> {
        self.settings.archive_path.as_deref()
    }

    fn error_path(&self) -> Option<&Path> {
        self.settings.error_path.as_deref()
    }

    fn trusted_mode(&self) -> bool {
        self.settings.trusted_mode
    }

    fn source_path(&self) -> Option<&Path> {
        self.settings.source_path.as_deref()
    }

    fn priority(&self) -> i32 {
        self.settings.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn csv_converter(patterns: &[&str]) -> SettingsConverter {
        let mut settings = ConverterSettings::new("Csv");
        settings.file_patterns = patterns.iter().map(|p| p.to_string()).collect();
        settings.watch_path = Some(PathBuf::from("/data/in"));
        settings.priority = 2;

        SettingsConverter::from_fn(settings, |path, settings| {
            Ok(Some(serde_json::json!({
                "converter": settings.name,
                "sn": path.file_stem().and_then(|s| s.to_str()),
            })))
        })
    }

    #[test]
    fn test_matches_file_patterns() {
        let converter = csv_converter(&["*.csv", "log_*.txt"]);

        assert!(converter.matches_file(Path::new("/data/in/unit1.csv")));
        assert!(converter.matches_file(Path::new("/data/in/UNIT2.CSV")));
        assert!(converter.matches_file(Path::new("/data/in/log_42.txt")));
        assert!(!converter.matches_file(Path::new("/data/in/notes.txt")));
        assert!(!converter.matches_file(Path::new("/data/in/unit.xml")));
    }

    #[test]
    fn test_default_pattern_matches_anything_with_extension() {
        let converter = csv_converter(&["*.*"]);
        assert!(converter.matches_file(Path::new("a.xml")));
        assert!(!converter.matches_file(Path::new("Makefile")));
    }

    #[test]
    fn test_invalid_patterns_are_dropped() {
        let converter = csv_converter(&["[broken", "*.csv"]);
        assert!(converter.matches_file(Path::new("x.csv")));
    }

    #[test]
    fn test_settings_flow_through() {
        let converter = csv_converter(&["*.csv"]);
        assert_eq!(converter.name(), "Csv");
        assert_eq!(converter.priority(), 2);
        assert_eq!(converter.watch_path(), Some(Path::new("/data/in")));
        assert!(!converter.trusted_mode());

        let report = converter.convert(Path::new("/data/in/SN001.csv")).unwrap();
        assert_eq!(report.unwrap()["sn"], "SN001");
    }
}
