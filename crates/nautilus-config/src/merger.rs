//! Configuration file merging
//!
//! Later files override earlier files, allowing for layered configuration:
//! - base.yaml (engine defaults, shared globals)
//! - auth.yaml (schemes and policies)
//! - routes.yaml (handlers)

use crate::types::Config;
use nautilus_core::{Error, Result};

/// Merge multiple configurations together
///
/// Later configs override earlier configs. The engine and observability
/// sections are replaced wholesale; list entries are matched by name (routes
/// by pattern and methods) and replaced in place, new entries are appended.
pub fn merge_configs(configs: Vec<Config>) -> Result<Config> {
    let mut configs = configs.into_iter();
    let first = configs
        .next()
        .ok_or_else(|| Error::Config("No configurations to merge".to_string()))?;

    Ok(configs.fold(first, merge_two_configs))
}

/// Merge two configurations
fn merge_two_configs(mut base: Config, overlay: Config) -> Config {
    base.engine = overlay.engine;

    merge_by_key(&mut base.globals, overlay.globals, |g| g.name.to_lowercase());
    merge_by_key(&mut base.modules, overlay.modules, |m| {
        (m.script.language, m.name.to_lowercase())
    });
    merge_by_key(&mut base.schemes, overlay.schemes, |s| s.name.to_lowercase());
    merge_by_key(&mut base.policies, overlay.policies, |p| p.name.to_lowercase());
    merge_by_key(&mut base.routes, overlay.routes, |r| {
        let mut methods: Vec<String> = r.methods.iter().map(|m| m.to_uppercase()).collect();
        methods.sort();
        (r.pattern.trim_end_matches('/').to_lowercase(), methods)
    });

    base.observability = overlay.observability;
    base
}

fn merge_by_key<T, K, F>(base: &mut Vec<T>, overlay: Vec<T>, key: F)
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    for item in overlay {
        let k = key(&item);
        match base.iter_mut().find(|existing| key(existing) == k) {
            Some(existing) => *existing = item,
            None => base.push(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GlobalConfig, RouteConfig, ScriptSource};
    use nautilus_core::DuplicatePolicy;
    use nautilus_scripting::ScriptLanguage;
    use serde_json::json;
    use std::collections::HashMap;

    fn global(name: &str, value: serde_json::Value) -> GlobalConfig {
        GlobalConfig {
            name: name.to_string(),
            value,
            kind: None,
            read_only: false,
        }
    }

    fn route(pattern: &str, source: &str) -> RouteConfig {
        RouteConfig {
            pattern: pattern.to_string(),
            methods: vec!["get".to_string()],
            name: None,
            script: ScriptSource::inline(ScriptLanguage::Rhai, source),
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

    #[test]
    fn test_merge_two_configs() {
        let mut base = Config::default();
        base.globals.push(global("greeting", json!("Hello")));
        base.globals.push(global("limit", json!(3)));
        base.routes.push(route("/hello", "response.status = 200;"));

        let mut overlay = Config::default();
        overlay.engine.duplicate_policy = DuplicatePolicy::Reject;
        overlay.globals.push(global("GREETING", json!("Hi")));
        overlay.routes.push(route("/Hello/", "response.status = 204;"));
        overlay.routes.push(route("/bye", "response.status = 200;"));

        let merged = merge_configs(vec![base, overlay]).unwrap();

        assert_eq!(merged.engine.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(merged.globals.len(), 2);
        assert_eq!(merged.globals[0].value, json!("Hi"));
        assert_eq!(merged.routes.len(), 2);
        assert_eq!(
            merged.routes[0].script.source.as_deref(),
            Some("response.status = 204;")
        );
    }

    #[test]
    fn test_different_methods_are_separate_routes() {
        let mut base = Config::default();
        base.routes.push(route("/items", "response.status = 200;"));

        let mut overlay = Config::default();
        let mut post = route("/items", "response.status = 201;");
        post.methods = vec!["POST".to_string()];
        overlay.routes.push(post);

        let merged = merge_configs(vec![base, overlay]).unwrap();
        assert_eq!(merged.routes.len(), 2);
    }

    #[test]
    fn test_merge_empty_configs() {
        let result = merge_configs(vec![]);
        assert!(result.is_err());
    }
}
