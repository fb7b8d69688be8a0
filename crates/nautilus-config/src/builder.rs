//! Configuration builder

use crate::types::{
    Config, EngineConfig, GlobalConfig, ModuleConfig, RouteConfig, SchemeConfig, ScriptSource,
};
use nautilus_auth::{AuthPolicy, SchemeKind};
use nautilus_core::{DuplicatePolicy, Result};
use nautilus_scripting::{ScriptLanguage, ScriptLimits, SessionPoolConfig};
use serde_json::Value;
use std::collections::HashMap;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set engine configuration
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Set the duplicate registration policy
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.engine.duplicate_policy = policy;
        self
    }

    /// Set the request body limit
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.config.engine.max_body_size = bytes;
        self
    }

    /// Set execution limits
    pub fn limits(mut self, limits: ScriptLimits) -> Self {
        self.config.engine.limits = limits;
        self
    }

    /// Set the shell session pool configuration
    pub fn session_pool(mut self, pool: SessionPoolConfig) -> Self {
        self.config.engine.session_pool = pool;
        self
    }

    /// Add a global
    pub fn global(mut self, name: impl Into<String>, value: Value, read_only: bool) -> Self {
        self.config.globals.push(GlobalConfig {
            name: name.into(),
            value,
            kind: None,
            read_only,
        });
        self
    }

    /// Add an inline library module
    pub fn module(
        mut self,
        name: impl Into<String>,
        language: ScriptLanguage,
        source: impl Into<String>,
    ) -> Self {
        self.config.modules.push(ModuleConfig {
            name: name.into(),
            script: ScriptSource::inline(language, source),
        });
        self
    }

    /// Add a scheme
    pub fn scheme(mut self, name: impl Into<String>, kind: SchemeKind) -> Self {
        self.config.schemes.push(SchemeConfig {
            name: name.into(),
            kind,
            realm: None,
            validator: None,
            claim_issuer: None,
        });
        self
    }

    /// Add a fully specified scheme
    pub fn scheme_config(mut self, scheme: SchemeConfig) -> Self {
        self.config.schemes.push(scheme);
        self
    }

    /// Add a policy
    pub fn policy(mut self, policy: AuthPolicy) -> Self {
        self.config.policies.push(policy);
        self
    }

    /// Add an inline route
    pub fn route(
        mut self,
        method: impl Into<String>,
        pattern: impl Into<String>,
        language: ScriptLanguage,
        source: impl Into<String>,
    ) -> Self {
        self.config.routes.push(RouteConfig {
            pattern: pattern.into(),
            methods: vec![method.into()],
            name: None,
            script: ScriptSource::inline(language, source),
            locals: HashMap::new(),
            auth_schemes: Vec::new(),
            auth_policies: Vec::new(),
            short_circuit: false,
            cors: false,
            rate_limit_policy: None,
            priority: 0,
            duplicate_policy: None,
            metadata: HashMap::new(),
        });
        self
    }

    /// Add a fully specified route
    pub fn route_config(mut self, route: RouteConfig) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<Config> {
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}
