//! Processor settings and their loading from YAML or JSON files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on loop iterations per conversion.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Execution limits applied to every conversion of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Render deadline in milliseconds for JSON conversions; `<= 0` disables it.
    #[serde(rename = "TimeOut", alias = "timeout", alias = "time_out")]
    pub timeout_ms: i64,

    /// Cap on loop iterations per conversion; `0` disables it.
    #[serde(rename = "MaxIterations", alias = "max_iterations")]
    pub max_iterations: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl ProcessorSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// The render deadline, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Load settings from a file. `.json` files are read as JSON, anything
    /// else as YAML.
    ///
    /// # Example
    /// ```ignore
    /// use fhir_converter::ProcessorSettings;
    ///
    /// let settings = ProcessorSettings::load_from_file("config/settings.yaml")?;
    /// println!("timeout: {:?}", settings.timeout());
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let settings = if is_json {
            Self::from_json_str(&contents)?
        } else {
            Self::from_yaml_str(&contents)?
        };
        tracing::debug!(path = %path.display(), ?settings, "loaded processor settings");
        Ok(settings)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = ProcessorSettings::default();
        assert_eq!(settings.timeout_ms, 0);
        assert_eq!(settings.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(settings.timeout(), None);
    }

    #[test]
    fn test_timeout_only_when_positive() {
        assert_eq!(ProcessorSettings::new().with_timeout_ms(-5).timeout(), None);
        assert_eq!(
            ProcessorSettings::new().with_timeout_ms(250).timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_yaml_accepts_both_key_styles() {
        let pascal = ProcessorSettings::from_yaml_str("TimeOut: 100\nMaxIterations: 5\n").unwrap();
        let snake = ProcessorSettings::from_yaml_str("timeout: 100\nmax_iterations: 5\n").unwrap();
        assert_eq!(pascal, snake);
        assert_eq!(pascal.timeout_ms, 100);
        assert_eq!(pascal.max_iterations, 5);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let settings = ProcessorSettings::from_json_str(r#"{"TimeOut": 10}"#).unwrap();
        assert_eq!(settings.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(ProcessorSettings::from_yaml_str("").unwrap(), ProcessorSettings::default());
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("settings.json");
        let yaml = dir.path().join("settings.yaml");
        fs::write(&json, r#"{"MaxIterations": 7}"#).unwrap();
        fs::write(&yaml, "TimeOut: 30\n").unwrap();

        assert_eq!(ProcessorSettings::load_from_file(&json).unwrap().max_iterations, 7);
        assert_eq!(ProcessorSettings::load_from_file(&yaml).unwrap().timeout_ms, 30);
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        let missing = ProcessorSettings::load_from_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            ProcessorSettings::load_from_file(&bad),
            Err(ConfigError::Json(_))
        ));
    }
}
