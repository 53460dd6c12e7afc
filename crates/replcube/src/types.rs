use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Stable diagnostic codes produced by the pipeline itself.
///
/// Compiler diagnostics carry the front-end's own codes (`CS0103`, ...).
pub mod codes {
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const FORBIDDEN_API: &str = "FORBIDDEN_API";
    pub const RUNTIME_ERROR: &str = "RUNTIME_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";
    pub const MEMORY_LIMIT: &str = "MEMORY_LIMIT";
    pub const PACKAGE_NOT_FOUND: &str = "PACKAGE_NOT_FOUND";
    pub const STATE_RESET: &str = "STATE_RESET";
    pub const ISOLATION_UNAVAILABLE: &str = "ISOLATION_UNAVAILABLE";
    pub const CLEANUP_DEGRADED: &str = "CLEANUP_DEGRADED";
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// A 1-based position in submitted source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.line, self.column)
    }
}

/// A structured error or warning returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable code callers can branch on
    pub code: String,

    /// Human readable description
    pub message: String,

    pub severity: Severity,

    #[serde(default)]
    pub line: Option<u32>,

    #[serde(default)]
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: Severity::Error,
            line: None,
            column: None,
        }
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    /// Attach a source location
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.line = Some(location.line);
        self.column = Some(location.column);
        self
    }

    /// Re-label this diagnostic as an error, keeping code and location
    pub fn into_error(mut self) -> Self {
        self.severity = Severity::Error;
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "({line},{column}): {kind} {}: {}", self.code, self.message)
            }
            _ => write!(f, "{kind} {}: {}", self.code, self.message),
        }
    }
}

/// Split a list of diagnostics into (errors, warnings)
pub fn partition_diagnostics(
    diagnostics: impl IntoIterator<Item = Diagnostic>,
) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
    diagnostics.into_iter().partition(Diagnostic::is_error)
}

/// A value produced by an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    /// Name of the value's type as reported in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// An external package reference: a name plus a version or "latest"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalReference {
    pub name: String,

    /// `None` means the latest available version
    #[serde(default)]
    pub version: Option<String>,
}

impl ExternalReference {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Parse `Name` or `Name@1.2.3`
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => (name.trim(), Some(version.trim())),
            None => (spec, None),
        };
        if name.is_empty() {
            return None;
        }
        let version = version
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("latest"))
            .map(str::to_string);
        Some(Self::new(name, version))
    }

    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or("latest")
    }

    /// Whether two references name the same package and version, ignoring name case
    pub fn same_as(&self, other: &ExternalReference) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.version == other.version
    }
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version_label())
    }
}

/// Request to run a source fragment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source: String,

    /// Existing session to run in. Blank ids are treated as absent.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Packages to merge into the session before compiling
    #[serde(default)]
    pub packages: Vec<ExternalReference>,

    /// Keep the session (and the state this run produces) after returning
    #[serde(default)]
    pub persist_session: bool,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self.persist_session = true;
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist_session = persist;
        self
    }

    pub fn with_package(mut self, reference: ExternalReference) -> Self {
        self.packages.push(reference);
        self
    }

    /// The requested session id, with blank ids folded into `None`
    pub fn requested_session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Result of an execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Value of the trailing expression, if the fragment ended with one
    pub return_value: Option<Value>,

    /// Everything the fragment wrote to its output
    pub output: String,

    pub errors: Vec<Diagnostic>,

    pub warnings: Vec<Diagnostic>,

    pub elapsed: Duration,

    /// Session the request ran in. Never set for ephemeral requests.
    pub session_id: Option<SessionId>,

    /// Set when releasing the isolation unit did not complete cleanly
    pub cleanup_degraded: bool,
}

impl ExecutionResult {
    /// A failed result carrying the given diagnostics
    pub fn failure(diagnostics: impl IntoIterator<Item = Diagnostic>) -> Self {
        let (errors, warnings) = partition_diagnostics(diagnostics);
        Self {
            success: false,
            errors,
            warnings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success && self.errors.is_empty()
    }

    /// All diagnostics, errors first
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.errors.iter().chain(self.warnings.iter())
    }

    /// Check whether any error carries `code`
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|d| d.code == code)
    }

    /// Check whether any warning carries `code`
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|d| d.code == code)
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            success: false,
            return_value: None,
            output: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
            session_id: None,
            cleanup_degraded: false,
        }
    }
}

/// Result of compiling without executing
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn from_diagnostics(diagnostics: impl IntoIterator<Item = Diagnostic>) -> Self {
        let (errors, warnings) = partition_diagnostics(diagnostics);
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}
