//! Configuration types

use nautilus_auth::{AuthPolicy, SchemeKind};
use nautilus_core::{DuplicatePolicy, ValueKind};
use nautilus_scripting::{ScriptLanguage, ScriptLimits, SessionPoolConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Shared globals seeded into the store
    #[serde(default)]
    pub globals: Vec<GlobalConfig>,

    /// Library modules available to imports
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,

    /// Authentication schemes
    #[serde(default)]
    pub schemes: Vec<SchemeConfig>,

    /// Authorization policies
    #[serde(default)]
    pub policies: Vec<AuthPolicy>,

    /// Script routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// What a duplicate (pattern, method) registration does
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Max request body size (bytes)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Per-invocation execution limits
    #[serde(default)]
    pub limits: ScriptLimits,

    /// Shell session pool
    #[serde(default)]
    pub session_pool: SessionPoolConfig,

    /// Host name reported to scripts
    #[serde(default = "default_host_name")]
    pub host_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            max_body_size: default_max_body_size(),
            limits: ScriptLimits::default(),
            session_pool: SessionPoolConfig::default(),
            host_name: default_host_name(),
        }
    }
}

/// Global store entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// Variable name
    pub name: String,

    /// Initial value
    #[serde(default)]
    pub value: Value,

    /// Declared kind; inferred from the value when unset
    #[serde(default)]
    pub kind: Option<ValueKind>,

    /// Reject later writes
    #[serde(default)]
    pub read_only: bool,
}

/// Where a script body comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptSource {
    /// Script language
    pub language: ScriptLanguage,

    /// Inline source
    #[serde(default)]
    pub source: Option<String>,

    /// Source file, read when the host starts
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Library modules to import
    #[serde(default)]
    pub imports: Vec<String>,

    /// Library files whose functions are merged in
    #[serde(default)]
    pub references: Vec<PathBuf>,

    /// Lines preceding the script in its origin document
    #[serde(default)]
    pub line_offset: usize,
}

impl ScriptSource {
    /// Inline script
    pub fn inline(language: ScriptLanguage, source: impl Into<String>) -> Self {
        Self {
            language,
            source: Some(source.into()),
            file: None,
            imports: Vec::new(),
            references: Vec::new(),
            line_offset: 0,
        }
    }

    /// Script read from a file
    pub fn file(language: ScriptLanguage, path: impl Into<PathBuf>) -> Self {
        Self {
            language,
            source: None,
            file: Some(path.into()),
            imports: Vec::new(),
            references: Vec::new(),
            line_offset: 0,
        }
    }
}

/// Library module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Module name used by imports
    pub name: String,

    /// Module body
    #[serde(flatten)]
    pub script: ScriptSource,
}

/// Authentication scheme
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemeConfig {
    /// Scheme name referenced by routes
    pub name: String,

    /// Credential format
    #[serde(flatten)]
    pub kind: SchemeKind,

    /// Realm advertised in challenges
    #[serde(default)]
    pub realm: Option<String>,

    /// Credential validator
    #[serde(default)]
    pub validator: Option<ScriptSource>,

    /// Claim issuer
    #[serde(default)]
    pub claim_issuer: Option<ScriptSource>,
}

/// Script route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Path pattern
    pub pattern: String,

    /// HTTP methods; `GET` when empty
    #[serde(default)]
    pub methods: Vec<String>,

    /// Handler name used in diagnostics
    #[serde(default)]
    pub name: Option<String>,

    /// Handler body
    #[serde(flatten)]
    pub script: ScriptSource,

    /// Extra typed locals
    #[serde(default)]
    pub locals: HashMap<String, Value>,

    /// Schemes tried in order
    #[serde(default)]
    pub auth_schemes: Vec<String>,

    /// Policies the caller must satisfy
    #[serde(default)]
    pub auth_policies: Vec<String>,

    /// Skip the rest of the pipeline
    #[serde(default)]
    pub short_circuit: bool,

    /// Emit CORS headers
    #[serde(default)]
    pub cors: bool,

    /// Named rate limit policy
    #[serde(default)]
    pub rate_limit_policy: Option<String>,

    /// Priority (higher = matched first)
    #[serde(default)]
    pub priority: i32,

    /// Duplicate handling for this route; the engine policy when unset
    #[serde(default)]
    pub duplicate_policy: Option<DuplicatePolicy>,

    /// Route metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

// Default functions
fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_host_name() -> String {
    "nautilus".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.duplicate_policy, DuplicatePolicy::Error);
        assert_eq!(config.engine.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.observability.logging.level, "info");
        assert_eq!(config.observability.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_route_flattens_script() {
        let route: RouteConfig = serde_json::from_str(
            r#"{
                "pattern": "/hello",
                "language": "rhai",
                "source": "response.status = 204;",
                "imports": ["helpers"]
            }"#,
        )
        .unwrap();

        assert_eq!(route.script.language, ScriptLanguage::Rhai);
        assert_eq!(route.script.imports, vec!["helpers"]);
        assert!(route.methods.is_empty());
        assert_eq!(route.priority, 0);
    }

    #[test]
    fn test_scheme_flattens_kind() {
        let scheme: SchemeConfig = serde_json::from_str(
            r#"{"name": "Keys", "type": "api_key", "header": "X-Key"}"#,
        )
        .unwrap();
        assert_eq!(
            scheme.kind,
            SchemeKind::ApiKey {
                header: "X-Key".to_string()
            }
        );
        assert!(scheme.validator.is_none());
    }
}
