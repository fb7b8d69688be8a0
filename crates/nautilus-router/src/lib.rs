//! # Nautilus Router
//!
//! Per-method trie router mapping request paths to compiled script handlers:
//! - Path parameter extraction (`/users/:id`)
//! - Trailing wildcard capture (`/static/*filepath`)
//! - Case-insensitive literal segments and optional trailing slash
//! - Priority-based matching, static before parameter before wildcard
//! - 404 vs 405 distinction when another method owns the path
//!
//! Registration is atomic per method: a duplicate pattern is rejected while
//! the method's trie is locked, so concurrent registrations of the same
//! pattern see exactly one winner.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod matcher;
pub mod route;
pub mod trie;

pub use matcher::{Match, Params, PathPattern, Segment};
pub use route::{Route, RouteBuilder, RouteFlags};
pub use trie::RouteTrie;

use dashmap::DashMap;
use http::Method;
use nautilus_core::{Error, Result};
use std::sync::Arc;

/// Router for managing and matching routes
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// Trie for each HTTP method
    tries: Arc<DashMap<Method, RouteTrie>>,
}

impl Router {
    /// Create a new router
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route
    pub fn add_route(&self, route: Route) -> Result<Arc<Route>> {
        let method = route.method.clone();

        let mut trie = self.tries.entry(method.clone()).or_insert_with(RouteTrie::new);
        let route = trie.insert(route)?;

        tracing::debug!(method = %method, path = %route.path(), "Route added to router");

        Ok(route)
    }

    /// Whether a structurally equivalent pattern is registered for a method
    pub fn contains(&self, method: &Method, pattern: &PathPattern) -> bool {
        self.tries
            .get(method)
            .map_or(false, |trie| trie.contains(pattern))
    }

    /// Remove a route
    pub fn remove_route(&self, method: &Method, pattern: &str) -> Result<Arc<Route>> {
        let pattern = PathPattern::parse(pattern)?;
        let mut trie = self
            .tries
            .get_mut(method)
            .ok_or_else(|| Error::RouteNotFound(pattern.as_str().to_string()))?;

        let removed = trie.remove(&pattern)?;
        tracing::debug!(method = %method, path = %pattern.as_str(), "Route removed from router");

        Ok(removed)
    }

    /// Match a request path
    ///
    /// Returns [`Error::MethodNotAllowed`] when the path matches under a
    /// different method and [`Error::RouteNotFound`] otherwise.
    pub fn match_route(&self, method: &Method, path: &str) -> Result<Match> {
        if let Some(found) = self.tries.get(method).and_then(|trie| trie.match_path(path)) {
            return Ok(found);
        }

        if self.allowed_methods(path).is_empty() {
            Err(Error::RouteNotFound(path.to_string()))
        } else {
            Err(Error::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            })
        }
    }

    /// Methods with a route matching the path, sorted by name
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let mut methods: Vec<Method> = self
            .tries
            .iter()
            .filter(|entry| entry.value().match_path(path).is_some())
            .map(|entry| entry.key().clone())
            .collect();
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods
    }

    /// Every registered route
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.tries
            .iter()
            .flat_map(|entry| entry.value().routes())
            .collect()
    }

    /// Get route count for a method
    pub fn route_count(&self, method: &Method) -> usize {
        self.tries.get(method).map(|trie| trie.len()).unwrap_or(0)
    }

    /// Get total route count across all methods
    pub fn len(&self) -> usize {
        self.tries.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether no routes are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all routes
    pub fn clear(&self) {
        self.tries.clear();
        tracing::debug!("All routes cleared");
    }
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::matcher::{Match, Params, PathPattern};
    pub use crate::route::{Route, RouteBuilder, RouteFlags};
    pub use crate::Router;
}

#[cfg(test)]
pub(crate) async fn test_handler() -> nautilus_scripting::CompiledHandler {
    use nautilus_scripting::{
        CompilationRequest, CompilerOptions, ModuleCatalog, ScriptCompiler, ScriptLanguage,
    };
    use nautilus_state::GlobalStore;

    ScriptCompiler::new(GlobalStore::new(), ModuleCatalog::new(), CompilerOptions::default())
        .compile(CompilationRequest::new(
            ScriptLanguage::Rhai,
            "response.status = 204;",
        ))
        .await
        .unwrap()
}
