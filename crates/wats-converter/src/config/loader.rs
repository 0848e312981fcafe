use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::PoolConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PoolConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<PoolConfig, ConfigError> {
    let config: PoolConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &PoolConfig) -> Result<(), ConfigError> {
    if config.max_concurrent == 0 {
        return Err(ConfigError::Validation {
            message: "maxConcurrent must be at least 1".to_string(),
        });
    }

    if config.sandbox.timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "sandbox.timeoutSecs must be greater than 0".to_string(),
        });
    }

    let mut names = HashSet::new();
    for converter in &config.converters {
        if converter.name.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "Converter name must not be empty".to_string(),
            });
        }

        if !names.insert(converter.name.as_str()) {
            return Err(ConfigError::DuplicateConverter(converter.name.clone()));
        }

        for pattern in &converter.file_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::InvalidPattern {
                    converter: converter.name.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::PostProcessAction;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();

        assert_eq!(config.max_concurrent, 10);
        assert!(config.enable_sandbox);
        assert!(config.delete_completed);
        assert!(config.enable_startup_scan);
        assert_eq!(config.stop_timeout_secs, 30);
        assert!(config.converters.is_empty());
        assert!(config.queue_dir.ends_with("conversion-queue"));
    }

    #[test]
    fn test_full_converter_entry() {
        let json = r#"{
            "queueDir": "/var/lib/wats/queue",
            "maxConcurrent": 4,
            "enableSandbox": false,
            "converters": [{
                "name": "TeradyneCsv",
                "watchPath": "/data/in",
                "watchRecursive": true,
                "filePatterns": ["*.csv", "*.txt"],
                "archivePath": "/data/done",
                "errorPath": "/data/error",
                "postProcessAction": "move",
                "priority": 1,
                "trustedMode": true,
                "parameters": {"station": "ICT-01"}
            }]
        }"#;

        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert!(!config.enable_sandbox);

        let conv = &config.converters[0];
        assert_eq!(conv.name, "TeradyneCsv");
        assert!(conv.enabled);
        assert!(conv.watch_recursive);
        assert_eq!(conv.file_patterns, vec!["*.csv", "*.txt"]);
        assert_eq!(conv.post_process_action, PostProcessAction::Move);
        assert_eq!(conv.priority, 1);
        assert!(conv.trusted_mode);
        assert_eq!(conv.parameters["station"], "ICT-01");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = load_config_from_str(r#"{"maxConcurrent": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_duplicate_converter_rejected() {
        let json = r#"{"converters": [{"name": "A"}, {"name": "A"}]}"#;
        let err = load_config_from_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateConverter(name) if name == "A"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let json = r#"{"converters": [{"name": "A", "filePatterns": ["[unclosed"]}]}"#;
        let err = load_config_from_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_malformed_json() {
        let err = load_config_from_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseJson(_)));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
