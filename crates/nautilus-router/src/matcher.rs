//! Path pattern parsing and matching

use crate::route::Route;
use nautilus_core::{Error, Result};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Route parameters extracted from a path
pub type Params = BTreeMap<String, String>;

/// Result of a successful route match
#[derive(Debug, Clone)]
pub struct Match {
    /// The matched route
    pub route: Arc<Route>,

    /// Extracted path parameters
    pub params: Params,

    /// Remainder captured by a wildcard segment
    pub wildcard: Option<String>,
}

/// One segment of a route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, compared case-insensitively
    Static(String),
    /// `:name`, one path segment
    Param(String),
    /// `*name`, the rest of the path
    Wildcard(String),
}

impl Segment {
    /// Trie key: lower-cased literal or a fixed marker for dynamic segments
    pub fn key(&self) -> String {
        match self {
            Segment::Static(text) => text.to_lowercase(),
            Segment::Param(_) => ":".to_string(),
            Segment::Wildcard(_) => "*".to_string(),
        }
    }
}

/// Compiled path pattern
///
/// Patterns:
/// - `/users` - static path
/// - `/users/:id` - one parameter per segment
/// - `/static/*filepath` - wildcard, last segment only
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    segments: Vec<Segment>,
    regex: Regex,
    param_names: Vec<String>,
}

impl PathPattern {
    /// Parse and validate a pattern
    pub fn parse(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(Error::validation("route pattern is empty"));
        }
        if !pattern.starts_with('/') {
            return Err(Error::validation(format!(
                "route pattern '{pattern}' must start with '/'"
            )));
        }

        let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut param_names: Vec<String> = Vec::new();

        for (i, segment) in raw.iter().enumerate() {
            let parsed = if let Some(name) = segment.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else if let Some(name) = segment.strip_prefix('*') {
                if i + 1 != raw.len() {
                    return Err(Error::validation(format!(
                        "wildcard '{segment}' must be the last segment of '{pattern}'"
                    )));
                }
                Segment::Wildcard(name.to_string())
            } else {
                Segment::Static(segment.to_string())
            };

            if let Segment::Param(name) | Segment::Wildcard(name) = &parsed {
                if name.is_empty() {
                    return Err(Error::validation(format!(
                        "unnamed parameter in route pattern '{pattern}'"
                    )));
                }
                if param_names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    return Err(Error::validation(format!(
                        "parameter '{name}' appears twice in '{pattern}'"
                    )));
                }
                param_names.push(name.clone());
            }
            segments.push(parsed);
        }

        let regex = Self::to_regex(&segments)?;
        Ok(Self {
            pattern,
            segments,
            regex,
            param_names,
        })
    }

    fn to_regex(segments: &[Segment]) -> Result<Regex> {
        let mut regex_str = String::from("^");
        for segment in segments {
            regex_str.push('/');
            match segment {
                Segment::Static(text) => regex_str.push_str(&regex::escape(text)),
                Segment::Param(_) => regex_str.push_str("([^/]+)"),
                Segment::Wildcard(_) => regex_str.push_str("(.+)"),
            }
        }
        if segments.is_empty() {
            regex_str.push('/');
        }
        regex_str.push_str("/?$");

        RegexBuilder::new(&regex_str)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::validation(format!("invalid route pattern: {e}")))
    }

    /// Match a request path, returning the extracted parameters
    pub fn matches(&self, path: &str) -> Option<Params> {
        let captures = self.regex.captures(path)?;
        let mut params = Params::new();
        for (i, name) in self.param_names.iter().enumerate() {
            if let Some(matched) = captures.get(i + 1) {
                params.insert(name.clone(), matched.as_str().to_string());
            }
        }
        Some(params)
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Parsed segments
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the pattern has no parameters
    pub fn is_static(&self) -> bool {
        self.param_names.is_empty()
    }

    /// Whether the pattern ends in a wildcard
    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard(_)))
    }

    /// Parameter names in order
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Wildcard parameter name, if any
    pub fn wildcard_name(&self) -> Option<&str> {
        match self.segments.last() {
            Some(Segment::Wildcard(name)) => Some(name),
            _ => None,
        }
    }
}
