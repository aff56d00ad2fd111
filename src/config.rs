use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{ErrorKind, FfiError, FfiResult};
use crate::logging::{LogConfig, LogFormat, LogOutput};

/// Engine configuration, usually read from `cffi.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub libraries: LibraryConfig,

    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormatName,

    #[serde(default)]
    pub output: LogOutputName,

    #[serde(default = "default_log_dir")]
    pub directory: String,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_false")]
    pub span_events: bool,

    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatName {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputName {
    Stdout,
    #[default]
    Stderr,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories searched for bare library names
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Load libraries with global symbol visibility unless told otherwise
    #[serde(default = "default_false")]
    pub global_by_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Recognise `__idiv`, `__band`, `__bor`, `__bxor`, `__bnot`, `__shl`, `__shr`
    #[serde(default = "default_true")]
    pub bitwise_metamethods: bool,

    /// Recognise `__ipairs`
    #[serde(default = "default_false")]
    pub ipairs_metamethod: bool,

    /// Read 8-byte integers as boxed typed values instead of host numbers
    #[serde(default = "default_true")]
    pub box_64bit_integers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormatName::default(),
            output: LogOutputName::default(),
            directory: default_log_dir(),
            prefix: default_prefix(),
            span_events: false,
            filter: None,
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            global_by_default: false,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bitwise_metamethods: true,
            ipairs_metamethod: false,
            box_64bit_integers: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "logs".to_string() }
fn default_prefix() -> String { "cffi".to_string() }

fn invalid(reason: String) -> FfiError {
    ErrorKind::InvalidConfig { reason }.into()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> FfiResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> FfiResult<Self> {
        toml::from_str(content).map_err(|e| invalid(format!("failed to parse config: {}", e)))
    }

    /// Default configuration as TOML text
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> FfiResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("failed to serialize config: {}", e)))?;

        fs::write(path, content)
            .map_err(|e| invalid(format!("failed to write {}: {}", path.display(), e)))
    }
}

impl LoggingConfig {
    /// Translate into the subscriber configuration
    pub fn to_log_config(&self) -> FfiResult<LogConfig> {
        let level = self
            .level
            .parse::<tracing::Level>()
            .map_err(|_| invalid(format!("unknown log level '{}'", self.level)))?;

        let format = match self.format {
            LogFormatName::Pretty => LogFormat::Pretty,
            LogFormatName::Compact => LogFormat::Compact,
            LogFormatName::Json => LogFormat::Json,
        };

        let output = match self.output {
            LogOutputName::Stdout => LogOutput::Stdout,
            LogOutputName::Stderr => LogOutput::Stderr,
            LogOutputName::File => LogOutput::File {
                directory: self.directory.clone(),
                prefix: self.prefix.clone(),
            },
        };

        let mut config = LogConfig::new()
            .with_level(level)
            .with_format(format)
            .with_output(output)
            .with_span_events(self.span_events);
        if let Some(filter) = &self.filter {
            config = config.with_filter(filter.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.host.bitwise_metamethods);
        assert!(config.host.box_64bit_integers);
        assert!(!config.libraries.global_by_default);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [libraries]
            search_paths = ["/opt/lib"]
            global_by_default = true

            [host]
            ipairs_metamethod = true

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config = EngineConfig::parse(toml).unwrap();
        assert_eq!(config.libraries.search_paths, vec![PathBuf::from("/opt/lib")]);
        assert!(config.libraries.global_by_default);
        assert!(config.host.ipairs_metamethod);
        assert!(config.host.bitwise_metamethods);

        let log = config.logging.to_log_config().unwrap();
        assert_eq!(log.level, tracing::Level::DEBUG);
        assert_eq!(log.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_level() {
        let config = EngineConfig::parse("[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(config.logging.to_log_config().is_err());
        assert!(EngineConfig::parse("[host\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cffi.toml");
        let mut config = EngineConfig::default();
        config.host.box_64bit_integers = false;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert!(!loaded.host.box_64bit_integers);
        assert!(EngineConfig::generate_default().contains("[host]"));
    }
}
