//! Configuration validation

use crate::types::{Config, ScriptSource};
use nautilus_core::{Error, Method, Result, ValueKind};
use std::collections::HashSet;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_engine(config)?;
    validate_globals(config)?;
    validate_modules(config)?;
    validate_auth(config)?;
    validate_routes(config)?;

    Ok(())
}

fn validate_engine(config: &Config) -> Result<()> {
    let engine = &config.engine;

    if engine.max_body_size == 0 {
        return Err(Error::Config("max_body_size must be > 0".to_string()));
    }

    if engine.limits.max_operations == 0 {
        return Err(Error::Config("limits.max_operations must be > 0".to_string()));
    }
    if engine.limits.max_call_depth == 0 {
        return Err(Error::Config("limits.max_call_depth must be > 0".to_string()));
    }
    if engine.limits.max_string_size == 0 {
        return Err(Error::Config("limits.max_string_size must be > 0".to_string()));
    }

    let pool = &engine.session_pool;
    if pool.max_sessions == Some(0) {
        return Err(Error::Config(
            "session_pool.max_sessions must be > 0".to_string(),
        ));
    }
    if let Some(max) = pool.max_sessions {
        if pool.min_sessions > max {
            tracing::warn!(
                min_sessions = pool.min_sessions,
                max_sessions = max,
                "session_pool.min_sessions exceeds max_sessions and will be clamped"
            );
        }
    }
    if pool.open_spin_interval.is_zero() {
        return Err(Error::Config(
            "session_pool.open_spin_interval must be > 0".to_string(),
        ));
    }

    if engine.host_name.trim().is_empty() {
        return Err(Error::Config("host_name cannot be empty".to_string()));
    }

    Ok(())
}

fn validate_globals(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();

    for global in &config.globals {
        if global.name.is_empty() {
            return Err(Error::Config("global name cannot be empty".to_string()));
        }
        if !seen.insert(global.name.to_lowercase()) {
            return Err(Error::Config(format!(
                "global '{}' is declared twice",
                global.name
            )));
        }
        let kind = global.kind.unwrap_or_else(|| ValueKind::of(&global.value));
        if !kind.accepts(&global.value) {
            return Err(Error::Config(format!(
                "global '{}' is declared {kind} but its value is {}",
                global.name,
                ValueKind::of(&global.value)
            )));
        }
    }

    Ok(())
}

fn validate_modules(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();

    for module in &config.modules {
        if module.name.is_empty() {
            return Err(Error::Config("module name cannot be empty".to_string()));
        }
        if !seen.insert((module.script.language, module.name.to_lowercase())) {
            return Err(Error::Config(format!(
                "module '{}' is declared twice for {}",
                module.name, module.script.language
            )));
        }
        validate_script(&format!("module '{}'", module.name), &module.script)?;
    }

    Ok(())
}

fn validate_auth(config: &Config) -> Result<()> {
    let mut schemes = HashSet::new();
    for scheme in &config.schemes {
        if scheme.name.is_empty() {
            return Err(Error::Config("scheme name cannot be empty".to_string()));
        }
        if !schemes.insert(scheme.name.to_lowercase()) {
            return Err(Error::DuplicateScheme(scheme.name.clone()));
        }
        if let Some(validator) = &scheme.validator {
            validate_script(&format!("validator of scheme '{}'", scheme.name), validator)?;
        }
        if let Some(issuer) = &scheme.claim_issuer {
            validate_script(&format!("claim issuer of scheme '{}'", scheme.name), issuer)?;
        }
    }

    let mut policies = HashSet::new();
    for policy in &config.policies {
        if policy.name.is_empty() {
            return Err(Error::Config("policy name cannot be empty".to_string()));
        }
        if !policies.insert(policy.name.to_lowercase()) {
            return Err(Error::Config(format!(
                "policy '{}' is declared twice",
                policy.name
            )));
        }
        if let Some(missing) = policy
            .schemes
            .iter()
            .find(|s| !schemes.contains(&s.to_lowercase()))
        {
            return Err(Error::UnknownScheme(missing.clone()));
        }
    }

    Ok(())
}

fn validate_routes(config: &Config) -> Result<()> {
    let schemes: HashSet<String> = config.schemes.iter().map(|s| s.name.to_lowercase()).collect();
    let policies: HashSet<String> = config
        .policies
        .iter()
        .map(|p| p.name.to_lowercase())
        .collect();

    for route in &config.routes {
        if route.pattern.is_empty() {
            return Err(Error::Config("route pattern cannot be empty".to_string()));
        }

        if !route.pattern.starts_with('/') {
            return Err(Error::Config(format!(
                "route pattern '{}' must start with '/'",
                route.pattern
            )));
        }

        for method in &route.methods {
            if Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                return Err(Error::Config(format!(
                    "route '{}' has invalid method '{method}'",
                    route.pattern
                )));
            }
        }

        validate_script(&format!("route '{}'", route.pattern), &route.script)?;

        if let Some(missing) = route
            .auth_schemes
            .iter()
            .find(|s| !schemes.contains(&s.to_lowercase()))
        {
            return Err(Error::UnknownScheme(missing.clone()));
        }
        if let Some(missing) = route
            .auth_policies
            .iter()
            .find(|p| !policies.contains(&p.to_lowercase()))
        {
            return Err(Error::UnknownPolicy(missing.clone()));
        }
    }

    Ok(())
}

fn validate_script(owner: &str, script: &ScriptSource) -> Result<()> {
    match (&script.source, &script.file) {
        (Some(_), Some(_)) => Err(Error::Config(format!(
            "{owner} sets both source and file"
        ))),
        (None, None) => Err(Error::Config(format!(
            "{owner} needs either source or file"
        ))),
        (Some(source), None) if source.trim().is_empty() => {
            Err(Error::Config(format!("{owner} has empty source")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use nautilus_auth::{AuthPolicy, SchemeKind};
    use nautilus_scripting::ScriptLanguage;
    use serde_json::json;
    use std::collections::HashMap;

    fn route(pattern: &str) -> RouteConfig {
        RouteConfig {
            pattern: pattern.to_string(),
            methods: vec!["GET".to_string()],
            name: None,
            script: ScriptSource::inline(ScriptLanguage::Rhai, "response.status = 204;"),
            locals: HashMap::new(),
            auth_schemes: Vec::new(),
            auth_policies: Vec::new(),
            short_circuit: false,
            cors: false,
            rate_limit_policy: None,
            priority: 0,
            duplicate_policy: None,
            metadata: HashMap::new(),
        }
    }

    fn scheme(name: &str) -> SchemeConfig {
        SchemeConfig {
            name: name.to_string(),
            kind: SchemeKind::Basic,
            realm: None,
            validator: None,
            claim_issuer: None,
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let mut config = Config::default();
        config.routes.push(route("/hello"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_body_size() {
        let mut config = Config::default();
        config.engine.max_body_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = Config::default();
        config.engine.session_pool.max_sessions = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_route_pattern_rules() {
        for pattern in ["", "hello"] {
            let mut config = Config::default();
            config.routes.push(route(pattern));
            assert!(validate_config(&config).is_err());
        }

        let mut config = Config::default();
        let mut bad = route("/x");
        bad.methods = vec!["NOT A METHOD".to_string()];
        config.routes.push(bad);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_route_needs_exactly_one_source() {
        let mut config = Config::default();
        let mut both = route("/x");
        both.script.file = Some("x.rhai".into());
        config.routes.push(both);
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        let mut blank = route("/x");
        blank.script.source = Some("   ".to_string());
        config.routes.push(blank);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_route_references_unknown_scheme() {
        let mut config = Config::default();
        let mut admin = route("/admin");
        admin.auth_schemes.push("Admin".to_string());
        config.routes.push(admin);

        assert!(matches!(
            validate_config(&config),
            Err(Error::UnknownScheme(name)) if name == "Admin"
        ));

        config.schemes.push(scheme("admin"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_route_references_unknown_policy() {
        let mut config = Config::default();
        let mut admin = route("/admin");
        admin.auth_policies.push("Admins".to_string());
        config.routes.push(admin);

        assert!(matches!(
            validate_config(&config),
            Err(Error::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_duplicate_scheme_and_bad_policy() {
        let mut config = Config::default();
        config.schemes.push(scheme("Admin"));
        config.schemes.push(scheme("ADMIN"));
        assert!(matches!(
            validate_config(&config),
            Err(Error::DuplicateScheme(_))
        ));

        let mut config = Config::default();
        config
            .policies
            .push(AuthPolicy::new("Admins").require_scheme("Admin"));
        assert!(matches!(
            validate_config(&config),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_global_kind_mismatch() {
        let mut config = Config::default();
        config.globals.push(GlobalConfig {
            name: "limit".to_string(),
            value: json!("ten"),
            kind: Some(ValueKind::Int),
            read_only: false,
        });
        assert!(validate_config(&config).is_err());

        config.globals[0].value = json!(10);
        assert!(validate_config(&config).is_ok());
    }
}
