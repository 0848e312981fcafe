//! Builder patterns for creating converter configurations programmatically.

#![allow(dead_code)]

use std::path::Path;

use serde_json::json;
use wats_converter::config::ConverterSettings;
use wats_converter::PostProcessAction;

/// Builder for `ConverterSettings` entries understood by `mock_factory`.
pub struct ConverterBuilder {
    settings: ConverterSettings,
}

impl ConverterBuilder {
    /// A converter accepting `*.csv` files that reports their content.
    pub fn new(name: &str) -> Self {
        let mut settings = ConverterSettings::new(name);
        settings.file_patterns = vec!["*.csv".to_string()];
        Self { settings }
    }

    pub fn watching(mut self, dir: &Path) -> Self {
        self.settings.watch_path = Some(dir.to_path_buf());
        self
    }

    pub fn recursive(mut self) -> Self {
        self.settings.watch_recursive = true;
        self
    }

    pub fn patterns(mut self, patterns: &[&str]) -> Self {
        self.settings.file_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.settings.priority = priority;
        self
    }

    pub fn action(mut self, action: PostProcessAction) -> Self {
        self.settings.post_process_action = action;
        self
    }

    pub fn archive(mut self, dir: &Path) -> Self {
        self.settings.archive_path = Some(dir.to_path_buf());
        self
    }

    pub fn errors(mut self, dir: &Path) -> Self {
        self.settings.error_path = Some(dir.to_path_buf());
        self
    }

    pub fn trusted(mut self) -> Self {
        self.settings.trusted_mode = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.settings.enabled = false;
        self
    }

    /// One of `ok` (default), `fail`, `panic`, `none` or `unbuildable`.
    pub fn mode(mut self, mode: &str) -> Self {
        self.settings
            .parameters
            .insert("mode".to_string(), json!(mode));
        self
    }

    /// Makes every conversion block for `millis` first.
    pub fn delay_ms(mut self, millis: u64) -> Self {
        self.settings
            .parameters
            .insert("delayMs".to_string(), json!(millis));
        self
    }

    pub fn build(self) -> ConverterSettings {
        self.settings
    }
}
