//! Shared validation error types.
//!
//! `ScriptValidator` and `CollectionValidator` in `questrunner-core` produce
//! these, and `ProtocolPlugin::validate`/`AuthPlugin::validate` return them
//! too, so a single aggregated error list can be built across every source.

use serde::{Deserialize, Serialize};

/// Where a [`ValidationError`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationSource {
    /// A user script failed a static check.
    Script,
    /// A `ProtocolPlugin::validate` call rejected a request.
    Protocol,
    /// An `AuthPlugin::validate` call rejected an auth block.
    Auth,
    /// A `ValueProvider` configuration was rejected.
    Vault,
    /// A JSON-schema/data-shape check failed.
    Schema,
}

/// A source location within a script, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceLocation {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

/// Extra structured detail attached to a [`ValidationError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationDetails {
    /// Line the error occurred on, if known.
    pub line: Option<u32>,
    /// Column the error occurred on, if known.
    pub column: Option<u32>,
    /// A suggested fix, when the validator has one.
    pub suggestion: Option<String>,
}

/// A single validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    /// Human-readable description of the failure.
    pub message: String,
    /// Where in the offending script the failure occurred, if applicable.
    pub location: Option<SourceLocation>,
    /// Which subsystem raised the error.
    pub source: ValidationSource,
    /// The script slot this error was found in (`request-post`, `folder-pre`, …).
    pub script_type: Option<String>,
    /// Structured detail for tooling to render without re-parsing `message`.
    pub details: ValidationDetails,
}

impl ValidationError {
    /// Build a script-sourced validation error.
    pub fn script<S: Into<String>>(message: S, script_type: Option<&str>) -> Self {
        Self {
            message: message.into(),
            location: None,
            source: ValidationSource::Script,
            script_type: script_type.map(ToString::to_string),
            details: ValidationDetails::default(),
        }
    }

    /// Attach a source location.
    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation { line, column });
        self.details.line = Some(line);
        self.details.column = Some(column);
        self
    }

    /// Attach a suggested fix.
    pub fn with_suggestion<S: Into<String>>(mut self, suggestion: S) -> Self {
        self.details.suggestion = Some(suggestion.into());
        self
    }

    /// Build a non-script validation error from a plugin.
    pub fn from_plugin<S: Into<String>>(source: ValidationSource, message: S) -> Self {
        Self {
            message: message.into(),
            location: None,
            source,
            script_type: None,
            details: ValidationDetails::default(),
        }
    }
}

/// Outcome of a plugin-level `validate` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the validated object is acceptable.
    pub valid: bool,
    /// Errors found, empty iff `valid`.
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// A successful validation with no errors.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failed validation carrying the given errors.
    pub fn failed(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}
