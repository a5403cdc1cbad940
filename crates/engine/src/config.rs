//! Engine configuration via `vellum.toml`
//!
//! On first open a default `vellum.toml` is written into the engine
//! directory. Volumes listed there are opened with the engine; more can be
//! opened at runtime with `Engine::open_volume`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use vellum_core::{VellumError, VellumResult, VolumeSpec};

/// Config file name placed in the engine directory.
pub const CONFIG_FILE_NAME: &str = "vellum.toml";

/// Engine configuration loaded from `vellum.toml`.
///
/// # Example
///
/// ```toml
/// emergency_flush = true
///
/// [[volume]]
/// path = "main.v01"
/// alias = "main"
/// create = true
/// initial_pages = 16
/// maximum_pages = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Force every open volume when the fatal latch trips.
    #[serde(default = "default_emergency_flush")]
    pub emergency_flush: bool,
    /// Volumes opened with the engine.
    #[serde(default, rename = "volume", skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,
}

fn default_emergency_flush() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            emergency_flush: default_emergency_flush(),
            volumes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Add a volume to the config
    pub fn with_volume(mut self, spec: VolumeSpec) -> Self {
        self.volumes.push(spec);
        self
    }

    /// Validate every volume spec and reject duplicate volume names.
    pub fn validate(&self) -> VellumResult<()> {
        let mut names = HashSet::new();
        for spec in &self.volumes {
            spec.validate()?;
            let name = spec.describe();
            if !names.insert(name.clone()) {
                return Err(VellumError::config(format!(
                    "volume '{}' is listed more than once in {}",
                    name, CONFIG_FILE_NAME
                )));
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Vellum engine configuration
#
# Force every open volume when the engine shuts down on a fatal error
# (default: true). The forced data is what a restart will find on disk.
emergency_flush = true

# Volumes opened with the engine. Relative paths resolve against this
# directory. Uncomment and edit to add one.
# [[volume]]
# path = "main.v01"
# alias = "main"
# create = true          # or read_only = true, or create_only = true
# page_size = 8192
# initial_pages = 16
# maximum_pages = 4096
# transient = false      # remove the file on close
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> VellumResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VellumError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            VellumError::config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> VellumResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                VellumError::config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> VellumResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VellumError::config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            VellumError::config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_flushes_on_trip() {
        let config = EngineConfig::default();
        assert!(config.emergency_flush);
        assert!(config.volumes.is_empty());
    }

    #[test]
    fn default_toml_parses_correctly() {
        let config: EngineConfig = toml::from_str(EngineConfig::default_toml()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parse_volume_tables() {
        let config: EngineConfig = toml::from_str(
            r#"
emergency_flush = false

[[volume]]
path = "main.v01"
alias = "main"
create = true
initial_pages = 4

[[volume]]
path = "/srv/archive.v01"
read_only = true
"#,
        )
        .unwrap();
        assert!(!config.emergency_flush);
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].describe(), "main");
        assert_eq!(config.volumes[0].initial_pages(), Some(4));
        assert!(config.volumes[1].read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_volume_names_rejected() {
        let config = EngineConfig::default()
            .with_volume(VolumeSpec::new("a.v01").with_alias("main"))
            .with_volume(VolumeSpec::new("b.v01").with_alias("main"));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, VellumError::Config(_)));
    }

    #[test]
    fn invalid_volume_spec_rejected() {
        let config =
            EngineConfig::default().with_volume(VolumeSpec::read_only("a.v01").transient());
        assert!(matches!(config.validate(), Err(VellumError::Config(_))));
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(!path.exists());

        EngineConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(config.emergency_flush);
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "emergency_flush = false\n").unwrap();

        EngineConfig::write_default_if_missing(&path).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.emergency_flush);
    }

    #[test]
    fn from_file_with_missing_field_uses_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn from_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "emergency_flush = \"sometimes\"").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(VellumError::Config(_))
        ));
    }

    #[test]
    fn config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = EngineConfig {
            emergency_flush: false,
            volumes: vec![
                VolumeSpec::new("main.v01")
                    .with_alias("main")
                    .with_initial_pages(8)
                    .with_maximum_pages(64),
                VolumeSpec::new("scratch.v01").transient(),
            ],
        };

        config.write_to_file(&path).unwrap();
        let parsed = EngineConfig::from_file(&path).unwrap();
        assert_eq!(parsed, config);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[[volume]]"));
    }
}
