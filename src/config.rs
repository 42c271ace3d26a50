use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::builtin::SUPPORTED_FORMATS;
use crate::cache::DEFAULT_MANIFEST_TTL;
use crate::catalog::PatchType;

pub const DEFAULT_MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// URL or local path of the catalog manifest.
    pub location: String,
    pub manifest_ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            location: DEFAULT_MANIFEST_NAME.to_string(),
            manifest_ttl_secs: DEFAULT_MANIFEST_TTL.as_secs(),
        }
    }
}

impl CatalogConfig {
    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("romhack"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Formats the patch backend must support for the engine to come up.
    pub formats: Vec<PatchType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            formats: SUPPORTED_FORMATS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path(),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("romhack")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.catalog.manifest_ttl(), Duration::from_secs(3600));
        assert!(config.cache.enabled);
        assert_eq!(config.engine.formats, SUPPORTED_FORMATS.to_vec());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[catalog]
location = "https://example.org/manifest.json"

[engine]
formats = ["bps"]
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.catalog.location, "https://example.org/manifest.json");
        assert_eq!(config.catalog.manifest_ttl_secs, 3600);
        assert_eq!(config.engine.formats, vec![PatchType::Bps]);
        assert_eq!(config.output.dir, PathBuf::from("."));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.catalog.location, DEFAULT_MANIFEST_NAME);
    }

    #[test]
    fn test_bad_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nformats = [\"zip\"]\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
