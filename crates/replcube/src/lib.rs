//! Session-aware execution of untrusted script fragments.
//!
//! Replcube accepts source fragments from callers, compiles and runs each one
//! in a disposable isolation unit, and returns structured results: the
//! trailing expression's value, captured output and diagnostics. Fragments
//! can share variables through persistent sessions or run single-shot.
//!
//! # Features
//!
//! - **Sessions** with continuation state, idle expiry and per-session serialization.
//! - **Security policy** with execution timeout, memory ceiling and API, library and path rules.
//! - **Static guard** that rejects policy matches before anything is compiled.
//! - **Isolation units** released on every path, with cooperative cancellation.
//! - **Package references** resolved from an in-memory catalogue or a local cache.
//! - **TOML configuration** with production and permissive presets.
//!
//! # Example
//!
//! ```no_run
//! use replcube::{Config, ExecutionPipeline, ExecutionRequest};
//!
//! # async fn demo() {
//! let pipeline = ExecutionPipeline::from_config(&Config::default());
//! let first = pipeline
//!     .execute(ExecutionRequest::new("var a = 5;").persist(true))
//!     .await;
//! let session = first.session_id.unwrap();
//! let second = pipeline
//!     .execute(ExecutionRequest::new("a + 1").in_session(session.as_str()))
//!     .await;
//! assert_eq!(second.return_value.unwrap().to_string(), "6");
//! # }
//! ```

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, PolicyPreset};
pub use engine::{
    Compilation, CompiledUnit, Compiler, ContinuationToken, DirectoryPackageResolver, EngineInfo,
    ExecutionContext, ExecutionFault, PackageResolver, ResolvedReference, StaticPackageResolver,
};
pub use isolation::{DomainStats, IsolationDomain, IsolationError, IsolationUnit, ResourceMonitor, RunOutcome};
pub use pipeline::{
    ExecutionPipeline, PackageLoadResult, PipelineError, PipelineSettings, ReplState, ResetOutcome,
};
pub use script::ScriptCompiler;
pub use security::{GuardViolation, SecurityPolicy, StaticGuard};
pub use session::{EphemeralSession, SessionError, SessionId, SessionMetadata, SessionRegistry};
pub use types::{
    Diagnostic, ExecutionRequest, ExecutionResult, ExternalReference, Severity, Value,
    ValidationResult, codes,
};

pub mod config;
pub mod engine;
pub mod isolation;
pub mod pipeline;
pub mod script;
pub mod security;
pub mod session;
pub mod types;
