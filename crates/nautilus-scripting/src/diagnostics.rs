//! Compiler diagnostics and runtime stream reports

use crate::error::ScriptError;
use crate::language::ScriptLanguage;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, trace, warn};

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks compilation
    Error,
    /// Logged only
    Warning,
    /// Logged only
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Position in script source (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    /// Line number
    pub line: usize,
    /// Column number
    pub column: usize,
}

/// Structured compiler message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Severity
    pub severity: Severity,
    /// Message text
    pub message: String,
    /// Location in source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// Back-end specific code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    /// Create a diagnostic
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
            code: None,
        }
    }

    /// Error diagnostic
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// Warning diagnostic
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    /// Informational diagnostic
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Attach a location
    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.location = Some(SourceLocation { line, column });
        self
    }

    /// Attach a code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether this diagnostic blocks compilation
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.location {
            write!(f, "{}:{}: ", loc.line, loc.column)?;
        }
        match &self.code {
            Some(code) => write!(f, "{}[{}]: {}", self.severity, code, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Diagnostics collected by one compilation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a diagnostic
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// Add an error at a location
    pub fn error_at(&mut self, message: impl Into<String>, line: usize, column: usize) {
        self.push(Diagnostic::error(message).at(line, column));
    }

    /// Add a warning at a location
    pub fn warning_at(&mut self, message: impl Into<String>, line: usize, column: usize) {
        self.push(Diagnostic::warning(message).at(line, column));
    }

    /// Append every diagnostic from another list
    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    /// Iterate all diagnostics
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Error-severity diagnostics
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.is_error())
    }

    /// Non-error diagnostics
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| !d.is_error())
    }

    /// Number of errors
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    /// Whether any error is present
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(Diagnostic::is_error)
    }

    /// Number of diagnostics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into errors and the rest
    pub fn partition(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        self.entries.into_iter().partition(Diagnostic::is_error)
    }

    /// Shift every located diagnostic down by `offset` lines
    pub fn with_line_offset(mut self, offset: usize) -> Self {
        if offset > 0 {
            for loc in self.entries.iter_mut().filter_map(|d| d.location.as_mut()) {
                loc.line += offset;
            }
        }
        self
    }

    /// Format every diagnostic, one per line
    pub fn format(&self, language: ScriptLanguage, name: &str) -> String {
        self.entries
            .iter()
            .map(|d| format!("{language}({name}) {d}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log every diagnostic at its severity
    pub fn log(&self, language: ScriptLanguage, name: &str) {
        for diagnostic in &self.entries {
            match diagnostic.severity {
                Severity::Error => error!(%language, script = %name, "{diagnostic}"),
                Severity::Warning => warn!(%language, script = %name, "{diagnostic}"),
                Severity::Info => info!(%language, script = %name, "{diagnostic}"),
            }
        }
    }

    /// Log everything, then fail with the errors if any are present;
    /// otherwise return the non-fatal diagnostics
    pub fn finish(self, language: ScriptLanguage, name: &str) -> Result<Diagnostics, ScriptError> {
        self.log(language, name);
        if self.has_errors() {
            let (errors, _) = self.partition();
            return Err(ScriptError::Compilation {
                language,
                name: name.to_string(),
                diagnostics: errors.into_iter().collect(),
            });
        }
        Ok(self)
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Shell output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Failure channel; any record fails the request
    Error,
    /// Verbose channel
    Verbose,
    /// Warning channel
    Warning,
    /// Debug channel
    Debug,
    /// Informational channel
    Information,
}

impl StreamKind {
    /// Annotation prefix used in merged reports
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Verbose => "VERBOSE",
            Self::Warning => "WARNING",
            Self::Debug => "DEBUG",
            Self::Information => "INFO",
        }
    }
}

/// One record written to a shell output channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    /// Channel
    pub kind: StreamKind,
    /// Message
    pub message: String,
    /// Script line that produced the record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}: {} (line {})", self.kind.prefix(), self.message, line),
            None => write!(f, "{}: {}", self.kind.prefix(), self.message),
        }
    }
}

/// Records from every shell output channel, in the order they were written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    records: Vec<StreamRecord>,
}

impl StreamReport {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record without location
    pub fn push(&mut self, kind: StreamKind, message: impl Into<String>) {
        self.records.push(StreamRecord {
            kind,
            message: message.into(),
            line: None,
        });
    }

    /// Add a record at a script line
    pub fn push_at(&mut self, kind: StreamKind, message: impl Into<String>, line: usize) {
        self.records.push(StreamRecord {
            kind,
            message: message.into(),
            line: Some(line),
        });
    }

    /// Records of one channel
    pub fn channel(&self, kind: StreamKind) -> impl Iterator<Item = &StreamRecord> {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    /// All records
    pub fn records(&self) -> &[StreamRecord] {
        &self.records
    }

    /// Whether the failure channel has output
    pub fn is_failed(&self) -> bool {
        self.records.iter().any(|r| r.kind == StreamKind::Error)
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Annotated report, one record per line
    pub fn format(&self) -> String {
        self.records
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log every record at the level of its channel
    pub fn log(&self, script: &str) {
        for record in &self.records {
            let message = record.message.as_str();
            match record.kind {
                StreamKind::Error => error!(script = %script, line = ?record.line, "{message}"),
                StreamKind::Warning => warn!(script = %script, line = ?record.line, "{message}"),
                StreamKind::Information => info!(script = %script, "{message}"),
                StreamKind::Debug => debug!(script = %script, "{message}"),
                StreamKind::Verbose => trace!(script = %script, "{message}"),
            }
        }
    }
}

impl fmt::Display for StreamReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
