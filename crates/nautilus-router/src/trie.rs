//! Trie-based route storage for one HTTP method

use crate::matcher::{Match, PathPattern, Segment};
use crate::route::Route;
use nautilus_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Node in the route trie
#[derive(Debug, Default)]
struct TrieNode {
    /// Static children keyed by lower-cased literal
    children: HashMap<String, TrieNode>,

    /// Parameter child (e.g., :id)
    param_child: Option<Box<TrieNode>>,

    /// Wildcard child (e.g., *filepath)
    wildcard_child: Option<Box<TrieNode>>,

    /// Route at this node (if terminal)
    route: Option<Arc<Route>>,
}

impl TrieNode {
    fn child_mut(&mut self, segment: &Segment) -> &mut TrieNode {
        match segment {
            Segment::Static(_) => self.children.entry(segment.key()).or_default(),
            Segment::Param(_) => &mut **self.param_child.get_or_insert_with(Box::default),
            Segment::Wildcard(_) => &mut **self.wildcard_child.get_or_insert_with(Box::default),
        }
    }

    fn child(&self, segment: &Segment) -> Option<&TrieNode> {
        match segment {
            Segment::Static(_) => self.children.get(&segment.key()),
            Segment::Param(_) => self.param_child.as_deref(),
            Segment::Wildcard(_) => self.wildcard_child.as_deref(),
        }
    }

    fn walk(&self, segments: &[Segment]) -> Option<&TrieNode> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.child(segment))
    }

    fn walk_mut(&mut self, segments: &[Segment]) -> Option<&mut TrieNode> {
        let Some((first, rest)) = segments.split_first() else {
            return Some(self);
        };
        let next = match first {
            Segment::Static(_) => self.children.get_mut(&first.key())?,
            Segment::Param(_) => self.param_child.as_deref_mut()?,
            Segment::Wildcard(_) => self.wildcard_child.as_deref_mut()?,
        };
        next.walk_mut(rest)
    }

    fn collect(&self, out: &mut Vec<Arc<Route>>) {
        out.extend(self.route.iter().cloned());
        for child in self.children.values() {
            child.collect(out);
        }
        for child in self.param_child.iter().chain(self.wildcard_child.iter()) {
            child.collect(out);
        }
    }
}

/// Trie for storing and matching routes
///
/// Two patterns that differ only in parameter names or literal case land on
/// the same node and are treated as duplicates.
#[derive(Debug, Default)]
pub struct RouteTrie {
    root: TrieNode,
    count: usize,
}

impl RouteTrie {
    /// Create a new route trie
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route into the trie
    pub fn insert(&mut self, route: Route) -> Result<Arc<Route>> {
        let mut current = &mut self.root;
        for segment in route.pattern.segments() {
            current = current.child_mut(segment);
        }

        if let Some(existing) = &current.route {
            return Err(Error::DuplicateRoute {
                pattern: existing.path().to_string(),
                method: route.method.to_string(),
            });
        }

        let route = Arc::new(route);
        current.route = Some(route.clone());
        self.count += 1;
        Ok(route)
    }

    /// Whether a structurally equivalent pattern is registered
    pub fn contains(&self, pattern: &PathPattern) -> bool {
        self.root
            .walk(pattern.segments())
            .map_or(false, |node| node.route.is_some())
    }

    /// Remove the route registered under a pattern
    pub fn remove(&mut self, pattern: &PathPattern) -> Result<Arc<Route>> {
        let removed = self
            .root
            .walk_mut(pattern.segments())
            .and_then(|node| node.route.take())
            .ok_or_else(|| Error::RouteNotFound(pattern.as_str().to_string()))?;

        self.count -= 1;
        Ok(removed)
    }

    /// Match a path against routes in the trie
    ///
    /// Candidates are gathered static first, then parameter, then wildcard,
    /// and stably sorted by descending priority.
    pub fn match_path(&self, path: &str) -> Option<Match> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut matches = Vec::new();
        Self::match_recursive(&self.root, path, &segments, 0, &mut matches);

        matches.sort_by(|a, b| b.route.priority.cmp(&a.route.priority));
        matches.into_iter().next()
    }

    fn match_recursive(
        node: &TrieNode,
        path: &str,
        segments: &[&str],
        index: usize,
        matches: &mut Vec<Match>,
    ) {
        if index == segments.len() {
            if let Some(route) = &node.route {
                if let Some(params) = route.pattern.matches(path) {
                    matches.push(Match {
                        route: route.clone(),
                        params,
                        wildcard: None,
                    });
                }
            }
            return;
        }

        let segment = segments[index];

        if let Some(child) = node.children.get(&segment.to_lowercase()) {
            Self::match_recursive(child, path, segments, index + 1, matches);
        }

        if let Some(child) = &node.param_child {
            Self::match_recursive(child, path, segments, index + 1, matches);
        }

        if let Some(route) = node.wildcard_child.as_ref().and_then(|c| c.route.as_ref()) {
            if let Some(params) = route.pattern.matches(path) {
                matches.push(Match {
                    route: route.clone(),
                    params,
                    wildcard: Some(segments[index..].join("/")),
                });
            }
        }
    }

    /// All routes in the trie
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut out = Vec::with_capacity(self.count);
        self.root.collect(&mut out);
        out
    }

    /// Get the number of routes
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if the trie is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_handler;
    use http::Method;

    async fn route(path: &str, priority: i32) -> Route {
        Route::builder()
            .method(Method::GET)
            .path(path)
            .handler(test_handler().await)
            .priority(priority)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_match() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/users", 0).await).unwrap();
        trie.insert(route("/users/:id", 0).await).unwrap();
        trie.insert(route("/static/*filepath", 0).await).unwrap();
        assert_eq!(trie.len(), 3);

        let m = trie.match_path("/users").unwrap();
        assert_eq!(m.route.path(), "/users");
        assert!(m.params.is_empty());

        let m = trie.match_path("/users/123").unwrap();
        assert_eq!(m.route.path(), "/users/:id");
        assert_eq!(m.params.get("id").map(String::as_str), Some("123"));

        let m = trie.match_path("/static/css/style.css").unwrap();
        assert_eq!(m.route.path(), "/static/*filepath");
        assert_eq!(m.wildcard.as_deref(), Some("css/style.css"));

        assert!(trie.match_path("/nothing").is_none());
    }

    #[tokio::test]
    async fn test_static_beats_param_at_equal_priority() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/users/:id", 0).await).unwrap();
        trie.insert(route("/users/me", 0).await).unwrap();

        assert_eq!(trie.match_path("/users/me").unwrap().route.path(), "/users/me");
        assert_eq!(trie.match_path("/users/7").unwrap().route.path(), "/users/:id");
    }

    #[tokio::test]
    async fn test_priority_overrides_specificity() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/files/readme", 0).await).unwrap();
        trie.insert(route("/files/*path", 5).await).unwrap();

        assert_eq!(
            trie.match_path("/files/readme").unwrap().route.path(),
            "/files/*path"
        );
    }

    #[tokio::test]
    async fn test_duplicates_are_structural() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/users/:id", 0).await).unwrap();

        let err = trie.insert(route("/USERS/:name", 0).await).unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute { .. }));
        assert_eq!(trie.len(), 1);
        assert!(trie.contains(&PathPattern::parse("/users/:other").unwrap()));
    }

    #[tokio::test]
    async fn test_case_insensitive_literals() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/Hello", 0).await).unwrap();
        assert!(trie.match_path("/hello").is_some());
        assert!(trie.match_path("/HELLO/").is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/users/:id", 0).await).unwrap();

        trie.remove(&PathPattern::parse("/users/:id").unwrap()).unwrap();
        assert!(trie.is_empty());
        assert!(trie.match_path("/users/1").is_none());

        let err = trie
            .remove(&PathPattern::parse("/users/:id").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(_)));
    }

    #[tokio::test]
    async fn test_routes_lists_everything() {
        let mut trie = RouteTrie::new();
        trie.insert(route("/", 0).await).unwrap();
        trie.insert(route("/a/:b", 0).await).unwrap();
        trie.insert(route("/c/*d", 0).await).unwrap();

        let mut paths: Vec<String> = trie.routes().iter().map(|r| r.path().to_string()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/", "/a/:b", "/c/*d"]);
    }
}
