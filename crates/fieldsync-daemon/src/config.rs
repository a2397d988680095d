//! Host configuration: engine tunables from an optional YAML file.

use anyhow::{Context, Result};
use fieldsync_core::SyncConfig;
use std::path::Path;

/// Parse engine tunables from YAML. Keys use the same camelCase names as
/// the JSON config (`projectName`, `pollIntervalMs`, ...).
pub fn parse_config(yaml: &str) -> Result<SyncConfig> {
    // An empty document means "all defaults"
    if yaml.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    let config: SyncConfig = serde_yaml::from_str(yaml).context("invalid config YAML")?;
    config.validate()?;
    Ok(config)
}

/// Load the config file (if any), then apply the `--project` override.
pub fn load_config(path: Option<&Path>, project: Option<&str>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            parse_config(&yaml)?
        }
        None => SyncConfig::default(),
    };
    if let Some(project) = project {
        config.project_name = project.to_string();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = parse_config("projectName: Bridge 42\npollIntervalMs: 5000\n").unwrap();
        assert_eq!(config.project_name, "Bridge 42");
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.structural_debounce_ms, SyncConfig::default().structural_debounce_ms);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(parse_config("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_config("keyPrefix: 'a:b'\n").is_err());
        assert!(parse_config("pollIntervalMs: 0\n").is_err());
        assert!(parse_config("pollIntervalMs: soon\n").is_err());
    }

    #[test]
    fn test_project_flag_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fieldsync.yaml");
        std::fs::write(&path, "projectName: From File\n").unwrap();

        let config = load_config(Some(&path), Some("From Flag")).unwrap();
        assert_eq!(config.project_name, "From Flag");

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.project_name, "From File");
    }
}
