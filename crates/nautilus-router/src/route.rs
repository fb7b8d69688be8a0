//! Route definition and builder

use crate::matcher::PathPattern;
use http::Method;
use nautilus_core::{BindingTable, Error, Result};
use nautilus_scripting::{CompiledHandler, ScriptLanguage};
use std::collections::HashMap;

/// Per-route switches passed through to the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFlags {
    /// Skip the remaining pipeline once the handler completes
    pub short_circuit: bool,

    /// Emit CORS headers
    pub cors: bool,

    /// Named rate limit policy
    pub rate_limit_policy: Option<String>,
}

/// Registered route for one method
#[derive(Debug, Clone)]
pub struct Route {
    /// HTTP method
    pub method: Method,

    /// Path pattern (e.g., "/users/:id")
    pub pattern: PathPattern,

    /// Compiled handler
    pub handler: CompiledHandler,

    /// Per-route locals bound on every invocation
    pub locals: BindingTable,

    /// Schemes tried in order to authenticate the caller
    pub auth_schemes: Vec<String>,

    /// Policies the caller must satisfy
    pub auth_policies: Vec<String>,

    /// Transport flags
    pub flags: RouteFlags,

    /// Priority (higher = matched first)
    pub priority: i32,

    /// Route metadata
    pub metadata: HashMap<String, String>,
}

impl Route {
    /// Create a new route builder
    pub fn builder() -> RouteBuilder {
        RouteBuilder::new()
    }

    /// Pattern text
    pub fn path(&self) -> &str {
        self.pattern.as_str()
    }

    /// Handler language
    pub fn language(&self) -> ScriptLanguage {
        self.handler.language()
    }

    /// Whether callers must authenticate
    pub fn requires_auth(&self) -> bool {
        !self.auth_schemes.is_empty() || !self.auth_policies.is_empty()
    }
}

/// Builder for constructing routes
#[derive(Debug, Default)]
pub struct RouteBuilder {
    method: Option<Method>,
    path: Option<String>,
    handler: Option<CompiledHandler>,
    locals: BindingTable,
    auth_schemes: Vec<String>,
    auth_policies: Vec<String>,
    flags: RouteFlags,
    priority: i32,
    metadata: HashMap<String, String>,
}

impl RouteBuilder {
    /// Create a new route builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the path pattern
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the handler
    pub fn handler(mut self, handler: CompiledHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the locals bound on every invocation
    pub fn locals(mut self, locals: BindingTable) -> Self {
        self.locals = locals;
        self
    }

    /// Add an authentication scheme
    pub fn auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_schemes.push(scheme.into());
        self
    }

    /// Add an authorization policy
    pub fn auth_policy(mut self, policy: impl Into<String>) -> Self {
        self.auth_policies.push(policy.into());
        self
    }

    /// Set transport flags
    pub fn flags(mut self, flags: RouteFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the route
    pub fn build(self) -> Result<Route> {
        let method = self
            .method
            .ok_or_else(|| Error::validation("method is required"))?;

        let path = self
            .path
            .ok_or_else(|| Error::validation("path is required"))?;

        let handler = self
            .handler
            .ok_or_else(|| Error::validation("handler is required"))?;

        Ok(Route {
            method,
            pattern: PathPattern::parse(path)?,
            handler,
            locals: self.locals,
            auth_schemes: self.auth_schemes,
            auth_policies: self.auth_policies,
            flags: self.flags,
            priority: self.priority,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_handler;

    #[tokio::test]
    async fn test_route_builder() {
        let route = RouteBuilder::new()
            .method(Method::GET)
            .path("/users/:id")
            .handler(test_handler().await)
            .auth_scheme("Basic")
            .priority(10)
            .metadata("version", "v1")
            .build()
            .unwrap();

        assert_eq!(route.method, Method::GET);
        assert_eq!(route.path(), "/users/:id");
        assert_eq!(route.language(), ScriptLanguage::Rhai);
        assert_eq!(route.priority, 10);
        assert!(route.requires_auth());
        assert_eq!(route.metadata.get("version"), Some(&"v1".to_string()));
    }

    #[tokio::test]
    async fn test_route_builder_missing_fields() {
        assert!(RouteBuilder::new().path("/users").build().is_err());
        assert!(RouteBuilder::new().method(Method::GET).path("/users").build().is_err());
    }

    #[tokio::test]
    async fn test_route_builder_invalid_path() {
        let result = RouteBuilder::new()
            .method(Method::GET)
            .path("users")
            .handler(test_handler().await)
            .build();

        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
