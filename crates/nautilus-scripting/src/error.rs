//! Script compilation and execution error types

use crate::diagnostics::{Diagnostics, StreamReport};
use crate::language::ScriptLanguage;

/// Script result type
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Script compilation and execution error
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// Compilation failed; carries every error diagnostic
    #[error("{language} compilation of '{name}' failed with {} error(s)", .diagnostics.error_count())]
    Compilation {
        /// Source language
        language: ScriptLanguage,
        /// Handler name
        name: String,
        /// Error diagnostics
        diagnostics: Diagnostics,
    },

    /// Language is declared but has no back-end
    #[error("Script language '{language}' is not implemented")]
    NotImplemented {
        /// Requested language
        language: ScriptLanguage,
    },

    /// Language name is not recognized
    #[error("Unsupported script language: {0}")]
    UnsupportedLanguage(String),

    /// Source rejected before compilation
    #[error("Invalid script source: {0}")]
    InvalidSource(String),

    /// Script failed while running
    #[error("Script runtime error: {message}{}", at_line(.line))]
    Runtime {
        /// Error message
        message: String,
        /// Script line where the error occurred
        line: Option<usize>,
    },

    /// Shell script wrote to its error stream
    #[error("Script reported failure:\n{0}")]
    ScriptFailure(StreamReport),

    /// Value conversion failed
    #[error("Script type error: {0}")]
    TypeError(String),

    /// Interpreter session could not be provided
    #[error("Session pool error: {0}")]
    SessionPool(String),

    /// Reading script files failed
    #[error("Script IO error: {0}")]
    Io(String),
}

fn at_line(line: &Option<usize>) -> String {
    line.map(|l| format!(" (line {l})")).unwrap_or_default()
}

impl ScriptError {
    /// Create a runtime error without location
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
            line: None,
        }
    }

    /// Create a runtime error at a line
    pub fn runtime_at<S: Into<String>>(message: S, line: usize) -> Self {
        Self::Runtime {
            message: message.into(),
            line: Some(line),
        }
    }

    /// Create a type error
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::TypeError(message.into())
    }

    /// Check if this error blocks registration rather than a single request
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            Self::Compilation { .. }
                | Self::NotImplemented { .. }
                | Self::UnsupportedLanguage(_)
                | Self::InvalidSource(_)
        )
    }

    /// Diagnostics attached to a compilation failure
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Self::Compilation { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Full text suitable for a plain-text error response
    pub fn report_text(&self) -> String {
        match self {
            Self::Compilation {
                language,
                name,
                diagnostics,
            } => format!("{self}\n{}", diagnostics.format(*language, name)),
            Self::ScriptFailure(report) => report.format(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        Self::TypeError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostic, StreamKind};

    #[test]
    fn test_runtime_display() {
        assert_eq!(
            ScriptError::runtime_at("division by zero", 4).to_string(),
            "Script runtime error: division by zero (line 4)"
        );
        assert_eq!(
            ScriptError::runtime("boom").to_string(),
            "Script runtime error: boom"
        );
    }

    #[test]
    fn test_compilation_report_lists_diagnostics() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::error("Name 'x' is not declared").at(3, 5));
        diagnostics.push(Diagnostic::warning("Variable 'y' is never used").at(2, 5));

        let err = ScriptError::Compilation {
            language: ScriptLanguage::Basic,
            name: "GET /hello".to_string(),
            diagnostics,
        };

        assert!(err.is_compile_time());
        assert!(err.to_string().contains("1 error(s)"));
        let text = err.report_text();
        assert!(text.contains("basic(GET /hello) 3:5: error: Name 'x' is not declared"));
        assert!(text.contains("warning: Variable 'y' is never used"));
    }

    #[test]
    fn test_not_implemented_is_distinct() {
        let err = ScriptError::NotImplemented {
            language: ScriptLanguage::Python,
        };
        assert!(err.is_compile_time());
        assert!(err.diagnostics().is_none());
        assert_eq!(err.to_string(), "Script language 'python' is not implemented");
    }

    #[test]
    fn test_failure_report_text() {
        let mut report = StreamReport::new();
        report.push(StreamKind::Warning, "slow path");
        report.push(StreamKind::Error, "user not found");
        let err = ScriptError::ScriptFailure(report);
        assert_eq!(err.report_text(), "WARNING: slow path\nERROR: user not found");
        assert!(!err.is_compile_time());
    }
}
