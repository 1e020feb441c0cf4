//! Per-worker configuration.
//!
//! Defaults come from the process-wide [`EngineFlags`]; a TOML file can override
//! any of them:
//!
//! ```toml
//! name = "plugin-host"
//! global_name = "Host"
//! max_nesting_depth = 8
//! memory_limit = 33554432
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{self, EngineFlags};
use crate::error::ConfigError;

/// Settings for one [`Worker`](crate::Worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, used for thread names and log lines.
    #[serde(default = "default_name")]
    pub name: String,

    /// Global object that carries `print`, `send` and `recv` in classic scripts.
    #[serde(default = "default_global_name")]
    pub global_name: String,

    /// Specifier prefix of host-provided modules.
    #[serde(default = "default_privileged_prefix")]
    pub privileged_prefix: String,

    #[serde(default = "default_memory_limit")]
    pub memory_limit: Option<usize>,

    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: Option<usize>,

    #[serde(default = "default_gc_threshold")]
    pub gc_threshold: Option<usize>,

    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    #[serde(default = "default_strict")]
    pub strict: bool,
}

fn default_name() -> String {
    "worker".to_string()
}

fn default_global_name() -> String {
    "JsWorker".to_string()
}

fn default_privileged_prefix() -> String {
    "core:".to_string()
}

fn default_memory_limit() -> Option<usize> {
    engine::flags().memory_limit
}

fn default_max_stack_size() -> Option<usize> {
    engine::flags().max_stack_size
}

fn default_gc_threshold() -> Option<usize> {
    engine::flags().gc_threshold
}

fn default_max_nesting_depth() -> usize {
    engine::flags().max_nesting_depth
}

fn default_strict() -> bool {
    engine::flags().strict
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_flags(&engine::flags())
    }
}

impl WorkerConfig {
    /// Config with the given engine flags and default names.
    pub fn from_flags(flags: &EngineFlags) -> Self {
        Self {
            name: default_name(),
            global_name: default_global_name(),
            privileged_prefix: default_privileged_prefix(),
            memory_limit: flags.memory_limit,
            max_stack_size: flags.max_stack_size,
            gc_threshold: flags.gc_threshold,
            max_nesting_depth: flags.max_nesting_depth,
            strict: flags.strict,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("[config] Loaded {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Rejects settings a worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.privileged_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "privileged_prefix must not be empty".to_string(),
            ));
        }
        if !is_identifier(&self.global_name) {
            return Err(ConfigError::Invalid(format!(
                "global_name {:?} is not a valid identifier",
                self.global_name
            )));
        }
        if self.max_nesting_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_flags(&EngineFlags::default());
        assert_eq!(config.global_name, "JsWorker");
        assert_eq!(config.privileged_prefix, "core:");
        assert_eq!(config.max_nesting_depth, engine::DEFAULT_MAX_NESTING_DEPTH);
        assert!(!config.strict);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = WorkerConfig::from_toml_str(
            r#"
            name = "plugins"
            max_nesting_depth = 4
            memory_limit = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "plugins");
        assert_eq!(config.max_nesting_depth, 4);
        assert_eq!(config.memory_limit, Some(1048576));
        assert_eq!(config.global_name, "JsWorker");
    }

    #[test]
    fn test_invalid_global_name() {
        let err = WorkerConfig::from_toml_str(r#"global_name = "not valid""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = WorkerConfig::from_toml_str("max_nesting_depth = 0").unwrap_err();
        assert!(err.to_string().contains("max_nesting_depth"));
    }

    #[test]
    fn test_parse_error() {
        let err = WorkerConfig::from_toml_str("max_nesting_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "global_name = \"Host\"").unwrap();
        writeln!(file, "privileged_prefix = \"host:\"").unwrap();

        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.global_name, "Host");
        assert_eq!(config.privileged_prefix, "host:");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkerConfig::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_toml_roundtrip_keeps_names() {
        let config = WorkerConfig::default().with_name("roundtrip");
        let text = config.to_toml_string().unwrap();
        let back = WorkerConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.name, "roundtrip");
    }
}
