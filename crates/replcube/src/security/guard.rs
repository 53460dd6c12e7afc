//! Pre-compilation policy check
//!
//! [`StaticGuard`] scans source text against a [`SecurityPolicy`] before any
//! compiler or isolation resource is touched. It is a pattern-based filter over
//! the names and literals the source mentions, not a sandbox: code that builds
//! a name or path at run time (string concatenation, data read from input) is
//! outside what a lexical scan can see. The authoritative boundary is the
//! host's process-level isolation.

use thiserror::Error;
use tracing::{debug, warn};

use crate::security::policy::SecurityPolicy;
use crate::security::scan::{ScanItem, scan};
use crate::types::{Diagnostic, ExternalReference, SourceLocation, codes};

/// A policy match that stops a request before compilation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("reference to forbidden API '{pattern}' at {location}")]
    ForbiddenApi {
        pattern: String,
        location: SourceLocation,
    },

    #[error("reference to blocked library '{library}' at {location}")]
    BlockedLibrary {
        library: String,
        location: SourceLocation,
    },

    #[error("path '{path}' falls under blocked location '{rule}' at {location}")]
    BlockedPath {
        path: String,
        rule: String,
        location: SourceLocation,
    },

    #[error("path '{path}' is outside the allowed locations at {location}")]
    PathNotAllowed {
        path: String,
        location: SourceLocation,
    },

    #[error("source could not be scanned ({reason}) at {location}")]
    Unscannable {
        reason: String,
        location: SourceLocation,
    },

    #[error("source is {size} bytes, exceeding the {limit} byte limit")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("package '{package}' is blocked by policy rule '{library}'")]
    BlockedPackage { package: String, library: String },
}

impl GuardViolation {
    /// The policy entry (or scan condition) that matched
    pub fn matched_pattern(&self) -> &str {
        match self {
            GuardViolation::ForbiddenApi { pattern, .. } => pattern,
            GuardViolation::BlockedLibrary { library, .. } => library,
            GuardViolation::BlockedPath { rule, .. } => rule,
            GuardViolation::PathNotAllowed { path, .. } => path,
            GuardViolation::Unscannable { reason, .. } => reason,
            GuardViolation::SourceTooLarge { .. } => "max_source_bytes",
            GuardViolation::BlockedPackage { library, .. } => library,
        }
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            GuardViolation::ForbiddenApi { location, .. }
            | GuardViolation::BlockedLibrary { location, .. }
            | GuardViolation::BlockedPath { location, .. }
            | GuardViolation::PathNotAllowed { location, .. }
            | GuardViolation::Unscannable { location, .. } => Some(*location),
            GuardViolation::SourceTooLarge { .. } | GuardViolation::BlockedPackage { .. } => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = Diagnostic::error(codes::FORBIDDEN_API, self.to_string());
        match self.location() {
            Some(location) => diagnostic.at(location),
            None => diagnostic,
        }
    }
}

/// Lexical policy scanner
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGuard;

impl StaticGuard {
    /// Check source text against `policy`
    ///
    /// The size limit always applies. Name, library and path rules apply when
    /// API restrictions are enabled. The first match is returned.
    pub fn check(source: &str, policy: &SecurityPolicy) -> Result<(), GuardViolation> {
        if source.len() > policy.max_source_bytes() {
            return Err(GuardViolation::SourceTooLarge {
                size: source.len(),
                limit: policy.max_source_bytes(),
            });
        }

        if !policy.api_restrictions_enabled() {
            return Ok(());
        }

        let rules = Rules::from_policy(policy);
        let items = scan(source).map_err(|e| GuardViolation::Unscannable {
            reason: e.reason.to_string(),
            location: e.location,
        })?;

        for item in &items {
            let result = match item {
                ScanItem::QualifiedName { name, location } => rules.check_name(name, *location),
                ScanItem::StringLiteral { value, location } => {
                    rules.check_literal(value, *location)
                }
            };
            if let Err(violation) = result {
                warn!(%violation, "source rejected by static guard");
                return Err(violation);
            }
        }

        debug!(items = items.len(), "static guard passed");
        Ok(())
    }

    /// Check requested package names against the blocked library list
    pub fn check_packages(
        packages: &[ExternalReference],
        policy: &SecurityPolicy,
    ) -> Result<(), GuardViolation> {
        if !policy.api_restrictions_enabled() {
            return Ok(());
        }
        for package in packages {
            let name = package.name.to_lowercase();
            for library in policy.blocked_libraries() {
                let blocked = library.to_lowercase();
                if name == blocked || name.starts_with(&format!("{blocked}.")) {
                    warn!(package = %package, library, "package rejected by static guard");
                    return Err(GuardViolation::BlockedPackage {
                        package: package.name.clone(),
                        library: library.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

struct Pattern {
    original: String,
    segments: Vec<String>,
}

impl Pattern {
    fn new(original: &str) -> Option<Self> {
        let segments: Vec<String> = original
            .split('.')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        (!segments.is_empty()).then(|| Self {
            original: original.to_string(),
            segments,
        })
    }

    /// Pattern segments appear contiguously somewhere in `chain`
    fn occurs_in(&self, chain: &[String]) -> bool {
        chain
            .windows(self.segments.len())
            .any(|window| window == self.segments.as_slice())
    }

    /// A proper tail of the pattern appears anywhere in `chain`, as happens
    /// when the leading namespaces were imported or aliased with a `using`
    /// directive (`using N = System.Net;` then `N.Sockets.TcpClient`)
    fn tail_occurs_in(&self, chain: &[String]) -> bool {
        (1..self.segments.len()).any(|skip| {
            let tail = &self.segments[skip..];
            chain.windows(tail.len()).any(|window| window == tail)
        })
    }
}

struct Rules {
    forbidden: Vec<Pattern>,
    libraries: Vec<Pattern>,
    blocked_paths: Vec<(String, String)>,
    allowed_paths: Vec<String>,
}

impl Rules {
    fn from_policy(policy: &SecurityPolicy) -> Self {
        Self {
            forbidden: policy
                .forbidden_apis()
                .iter()
                .filter_map(|p| Pattern::new(p))
                .collect(),
            libraries: policy
                .blocked_libraries()
                .iter()
                .filter_map(|p| Pattern::new(p))
                .collect(),
            blocked_paths: policy
                .blocked_filesystem_paths()
                .iter()
                .map(|p| (p.clone(), normalize_path(p)))
                .collect(),
            allowed_paths: policy
                .allowed_filesystem_paths()
                .iter()
                .map(|p| normalize_path(p))
                .collect(),
        }
    }

    fn check_name(&self, name: &str, location: SourceLocation) -> Result<(), GuardViolation> {
        let chain: Vec<String> = name.split('.').map(str::to_lowercase).collect();

        if let Some(pattern) = self.forbidden.iter().find(|p| p.occurs_in(&chain)) {
            return Err(GuardViolation::ForbiddenApi {
                pattern: pattern.original.clone(),
                location,
            });
        }

        if let Some(library) = self
            .libraries
            .iter()
            .find(|p| p.occurs_in(&chain) || p.tail_occurs_in(&chain))
        {
            return Err(GuardViolation::BlockedLibrary {
                library: library.original.clone(),
                location,
            });
        }

        Ok(())
    }

    fn check_literal(&self, value: &str, location: SourceLocation) -> Result<(), GuardViolation> {
        // names passed to reflection-style lookups: "System.Diagnostics.Process, System"
        let candidate = value.split(',').next().unwrap_or_default().trim();
        if !candidate.is_empty()
            && candidate
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.check_name(candidate, location)?;
        }

        let Some(path) = path_literal(value) else {
            return Ok(());
        };

        if path.starts_with('~') {
            return Err(GuardViolation::BlockedPath {
                path: value.to_string(),
                rule: "~".to_string(),
                location,
            });
        }

        if path.split('/').any(|segment| segment == "..") {
            return Err(GuardViolation::BlockedPath {
                path: value.to_string(),
                rule: "..".to_string(),
                location,
            });
        }

        if let Some((rule, _)) = self
            .blocked_paths
            .iter()
            .find(|(_, root)| is_under(&path, root))
        {
            return Err(GuardViolation::BlockedPath {
                path: value.to_string(),
                rule: rule.clone(),
                location,
            });
        }

        if !self.allowed_paths.is_empty()
            && !self.allowed_paths.iter().any(|root| is_under(&path, root))
        {
            return Err(GuardViolation::PathNotAllowed {
                path: value.to_string(),
                location,
            });
        }

        Ok(())
    }
}

/// Lowercase, forward slashes, no duplicate or trailing separators
fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = path
        .strip_prefix("file://")
        .or_else(|| path.strip_prefix("FILE://"))
        .unwrap_or(path);
    let mut normalized = String::with_capacity(path.len());
    let mut last_slash = false;
    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        normalized.extend(c.to_lowercase());
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Return the normalized form of `value` if it reads as a filesystem path
fn path_literal(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    let looks_like_path = drive
        || trimmed.starts_with('/')
        || trimmed.starts_with('\\')
        || trimmed.starts_with('~')
        || trimmed.starts_with("./")
        || trimmed.starts_with("../")
        || trimmed.starts_with(".\\")
        || trimmed.starts_with("..\\")
        || trimmed.to_lowercase().starts_with("file://");
    looks_like_path.then(|| normalize_path(trimmed))
}

fn is_under(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
