//! # Nautilus Configuration
//!
//! Configuration management with support for:
//! - Multiple formats (YAML, TOML, JSON)
//! - Environment variable expansion (`${VAR}`, `${VAR:-default}`)
//! - Layered files merged in order
//! - Validation of routes, schemes, policies and engine limits
//! - Default values

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod merger;
pub mod types;
pub mod validator;

pub use builder::ConfigBuilder;
pub use loader::{load_and_merge, load_config, load_from_file, load_from_str};
pub use merger::merge_configs;
pub use types::{
    Config, EngineConfig, GlobalConfig, LogFormat, LoggingConfig, ModuleConfig,
    ObservabilityConfig, RouteConfig, SchemeConfig, ScriptSource,
};
pub use validator::validate_config;

use nautilus_core::{Error, Result};
use std::path::Path;

/// Serialization format of a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension, ignoring case
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                Error::Config(format!("{} has no format extension", path.display()))
            })?;

        Ok(match ext.as_str() {
            "yaml" | "yml" => ConfigFormat::Yaml,
            "toml" => ConfigFormat::Toml,
            "json" => ConfigFormat::Json,
            other => return Err(Error::Config(format!("Unsupported config format: {other}"))),
        })
    }

    /// Deserialize an already expanded document
    pub fn parse(self, content: &str) -> Result<Config> {
        let parsed = match self {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| Error::Config(format!("Failed to parse {}: {e}", self.name())))
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "YAML",
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Json => "JSON",
        }
    }
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::builder::ConfigBuilder;
    pub use crate::types::{Config, EngineConfig, RouteConfig, ScriptSource};
    pub use crate::ConfigFormat;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_from_extension() {
        let cases = [
            ("routes.yaml", ConfigFormat::Yaml),
            ("routes.YML", ConfigFormat::Yaml),
            ("engine.toml", ConfigFormat::Toml),
            ("auth.Json", ConfigFormat::Json),
        ];
        for (file, expected) in cases {
            assert_eq!(ConfigFormat::from_path(&PathBuf::from(file)).unwrap(), expected);
        }

        for file in ["routes.txt", "routes"] {
            assert!(ConfigFormat::from_path(&PathBuf::from(file)).is_err());
        }
    }

    #[test]
    fn test_parse_errors_name_the_format() {
        let err = ConfigFormat::Toml.parse("routes = [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }
}
