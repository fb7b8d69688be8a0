//! Supported script languages

use crate::error::ScriptError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported scripting languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Rhai, a curly-brace language compiled to a cached AST
    Rhai,
    /// Line-oriented BASIC dialect with declared types
    #[serde(alias = "vb")]
    Basic,
    /// Object-pipeline shell language run in pooled sessions
    #[serde(alias = "ps")]
    Shell,
    /// ML-family scripts (not implemented)
    #[serde(alias = "ml", alias = "fsharp")]
    Ocaml,
    /// Python (not implemented)
    #[serde(alias = "py")]
    Python,
    /// JavaScript (not implemented)
    #[serde(alias = "js")]
    JavaScript,
}

/// How a language turns source into a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFamily {
    /// Whole program checked and compiled at registration
    Compiled,
    /// Body attached lazily and run inside a pooled interpreter session
    Session,
    /// Declared but without a back-end
    Unimplemented,
}

impl ScriptLanguage {
    /// Every declared language
    pub const ALL: [ScriptLanguage; 6] = [
        Self::Rhai,
        Self::Basic,
        Self::Shell,
        Self::Ocaml,
        Self::Python,
        Self::JavaScript,
    ];

    /// Compilation family of this language
    pub fn family(&self) -> LanguageFamily {
        match self {
            Self::Rhai | Self::Basic => LanguageFamily::Compiled,
            Self::Shell => LanguageFamily::Session,
            Self::Ocaml | Self::Python | Self::JavaScript => LanguageFamily::Unimplemented,
        }
    }

    /// Whether the language has a working back-end
    pub fn is_implemented(&self) -> bool {
        self.family() != LanguageFamily::Unimplemented
    }

    /// Get file extension for this language
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Rhai => "rhai",
            Self::Basic => "bas",
            Self::Shell => "psh",
            Self::Ocaml => "ml",
            Self::Python => "py",
            Self::JavaScript => "js",
        }
    }

    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "rhai" => Some(Self::Rhai),
            "bas" | "vb" => Some(Self::Basic),
            "psh" | "ps1" => Some(Self::Shell),
            "ml" | "fsx" => Some(Self::Ocaml),
            "py" => Some(Self::Python),
            "js" | "mjs" => Some(Self::JavaScript),
            _ => None,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rhai => "rhai",
            Self::Basic => "basic",
            Self::Shell => "shell",
            Self::Ocaml => "ocaml",
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptLanguage {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rhai" => Ok(Self::Rhai),
            "basic" | "vb" => Ok(Self::Basic),
            "shell" | "ps" => Ok(Self::Shell),
            "ocaml" | "ml" | "fsharp" => Ok(Self::Ocaml),
            "python" | "py" => Ok(Self::Python),
            "javascript" | "js" => Ok(Self::JavaScript),
            other => Err(ScriptError::UnsupportedLanguage(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("RHAI".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::Rhai);
        assert_eq!("vb".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::Basic);
        assert_eq!("ps".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::Shell);
        assert_eq!("fsharp".parse::<ScriptLanguage>().unwrap(), ScriptLanguage::Ocaml);
    }

    #[test]
    fn test_unknown_language_is_typed_error() {
        let err = "cobol".parse::<ScriptLanguage>().unwrap_err();
        assert!(matches!(err, ScriptError::UnsupportedLanguage(ref name) if name == "cobol"));
    }

    #[test]
    fn test_families() {
        assert_eq!(ScriptLanguage::Rhai.family(), LanguageFamily::Compiled);
        assert_eq!(ScriptLanguage::Basic.family(), LanguageFamily::Compiled);
        assert_eq!(ScriptLanguage::Shell.family(), LanguageFamily::Session);
        for language in [ScriptLanguage::Ocaml, ScriptLanguage::Python, ScriptLanguage::JavaScript] {
            assert!(!language.is_implemented());
        }
    }

    #[test]
    fn test_serde_alias() {
        let lang: ScriptLanguage = serde_json::from_str("\"js\"").unwrap();
        assert_eq!(lang, ScriptLanguage::JavaScript);
        assert_eq!(serde_json::to_string(&ScriptLanguage::Basic).unwrap(), "\"basic\"");
    }

    #[test]
    fn test_extension_roundtrip() {
        for language in ScriptLanguage::ALL {
            assert_eq!(ScriptLanguage::from_extension(language.extension()), Some(language));
        }
    }
}
