//! Configuration loading

use crate::{Config, ConfigFormat};
use nautilus_core::{Error, Result};
use regex::{Captures, Regex};
use std::env;
use std::fs;
use std::path::Path;

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    // Regex to match ${VAR} or ${VAR:-default}
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))?;

    let mut missing = None;
    let expanded = re.replace_all(content, |cap: &Captures<'_>| {
        let var_name = &cap[1];
        match (env::var(var_name), cap.get(3)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(Error::Config(format!(
            "Environment variable '{var_name}' not set and no default provided"
        ))),
        None => Ok(expanded.into_owned()),
    }
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    format.parse(&expand_env_vars(content)?)
}

/// Load and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

/// Load and merge multiple configuration files
///
/// Files are merged in order, with later files overriding earlier ones.
///
/// # Example
///
/// ```no_run
/// use nautilus_config::load_and_merge;
///
/// let config = load_and_merge(vec![
///     "config/base.yaml",
///     "config/routes.yaml",
/// ])?;
/// # Ok::<(), nautilus_core::Error>(())
/// ```
pub fn load_and_merge<P: AsRef<Path>>(paths: Vec<P>) -> Result<Config> {
    if paths.is_empty() {
        return Err(Error::Config("No configuration files provided".to_string()));
    }

    let configs = paths
        .into_iter()
        .map(load_from_file)
        .collect::<Result<Vec<_>>>()?;

    let merged = crate::merger::merge_configs(configs)?;
    crate::validator::validate_config(&merged)?;

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogFormat;
    use nautilus_core::DuplicatePolicy;
    use nautilus_scripting::ScriptLanguage;

    const YAML_CONFIG: &str = r#"
engine:
  duplicate_policy: reject
  max_body_size: 1048576
  limits:
    max_operations: 5000
  session_pool:
    min_sessions: 2
    max_sessions: 4
    acquire_timeout: "5s"

globals:
  - name: greeting
    value: "Hello"
    read_only: true

modules:
  - name: helpers
    language: rhai
    source: "fn double(x) { x * 2 }"

schemes:
  - name: Admin
    type: basic
    validator:
      language: rhai
      source: 'username == "root"'

policies:
  - name: Admins
    schemes: [Admin]

routes:
  - pattern: "/hello"
    methods: ["GET"]
    language: rhai
    source: "response.status = 204;"
    auth_schemes: [Admin]
    priority: 10

observability:
  logging:
    level: "debug"
    format: "json"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.engine.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.engine.limits.max_operations, 5000);
        assert_eq!(config.engine.limits.max_call_depth, 64);
        assert_eq!(config.engine.session_pool.max_sessions, Some(4));
        assert_eq!(
            config.engine.session_pool.acquire_timeout,
            Some(std::time::Duration::from_secs(5))
        );
        assert_eq!(config.globals.len(), 1);
        assert_eq!(config.modules[0].script.language, ScriptLanguage::Rhai);
        assert!(config.schemes[0].validator.is_some());
        assert_eq!(config.policies[0].schemes, vec!["Admin"]);
        assert_eq!(config.routes[0].priority, 10);
        assert_eq!(config.observability.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_toml() {
        let toml = r#"
[engine]
host_name = "edge"

[[routes]]
pattern = "/ping"
language = "basic"
source = "Response.Status = 204"
"#;
        let config = load_from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.engine.host_name, "edge");
        assert_eq!(config.routes[0].script.language, ScriptLanguage::Basic);
    }

    #[test]
    fn test_invalid_yaml() {
        let invalid = "invalid: [yaml";
        let result = load_from_str(invalid, ConfigFormat::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("NAUTILUS_TEST_HOST_NAME", "edge-7");

        let config = load_from_str(
            "engine:\n  host_name: \"${NAUTILUS_TEST_HOST_NAME}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.engine.host_name, "edge-7");

        env::remove_var("NAUTILUS_TEST_HOST_NAME");
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("NAUTILUS_TEST_UNDEFINED");

        let config = load_from_str(
            "engine:\n  max_body_size: ${NAUTILUS_TEST_UNDEFINED:-2048}\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.engine.max_body_size, 2048);
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("NAUTILUS_TEST_MISSING");

        let result = load_from_str(
            "engine:\n  host_name: \"${NAUTILUS_TEST_MISSING}\"\n",
            ConfigFormat::Yaml,
        );
        assert!(result.unwrap_err().to_string().contains("NAUTILUS_TEST_MISSING"));
    }

    #[test]
    fn test_multiple_env_vars() {
        env::set_var("NAUTILUS_TEST_A", "one");
        env::set_var("NAUTILUS_TEST_B", "two");

        let expanded = expand_env_vars("${NAUTILUS_TEST_A}/${NAUTILUS_TEST_B}/${NAUTILUS_TEST_C:-three}").unwrap();
        assert_eq!(expanded, "one/two/three");

        env::remove_var("NAUTILUS_TEST_A");
        env::remove_var("NAUTILUS_TEST_B");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nautilus.json");
        fs::write(&path, r#"{"routes":[{"pattern":"/x","language":"shell","source":"'x'"}]}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.routes[0].script.language, ScriptLanguage::Shell);
    }
}
