//! Request orchestration
//!
//! [`ExecutionPipeline`] ties the registry, the guard, the compiler and the
//! isolation domain together. Each request runs these steps in order:
//!
//! 1. resolve the session (an existing id, a new persistent session, or an
//!    ephemeral one removed before returning)
//! 2. reject blocked packages, resolve the rest and merge them into the session
//! 3. scan the source with [`StaticGuard`]
//! 4. compile against the session's references and continuation state
//! 5. load a fresh [`IsolationUnit`](crate::isolation::IsolationUnit) and run
//!    it under the timeout, the caller's abort signal and the memory monitor
//! 6. release the unit, persist the continuation and fold warnings
//!
//! Requests against one session are serialized by that session's gate.
//! Failures never escape as errors; they come back as diagnostics on an
//! [`ExecutionResult`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::engine::{
    Compiler, DirectoryPackageResolver, EngineInfo, PackageResolver, StaticPackageResolver,
};
use crate::isolation::{DomainStats, IsolationDomain, IsolationError, ResourceMonitor, RunOutcome};
use crate::script::ScriptCompiler;
use crate::security::{GuardViolation, SecurityPolicy, StaticGuard};
use crate::session::{
    EphemeralSession, SessionError, SessionGuard, SessionId, SessionMetadata, SessionRegistry,
};
use crate::types::{
    Diagnostic, ExecutionRequest, ExecutionResult, ExternalReference, ValidationResult, codes,
    partition_diagnostics,
};

/// Cancellation is cooperative: a stopped submission is only abandoned, so
/// callers are told that code which never yields keeps running
const UNYIELDING_CODE_NOTE: &str = "The pipeline stopped waiting for the submission; \
     code that never yields (a tight loop or a blocking call) may keep running until it exits";

/// Why a request stopped before producing a run outcome
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Guard(#[from] GuardViolation),

    #[error("compilation failed with {} diagnostic(s)", .0.len())]
    Compilation(Vec<Diagnostic>),

    #[error("none of the requested packages could be resolved")]
    Packages(Vec<Diagnostic>),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error("request was cancelled before execution started")]
    Cancelled,
}

impl PipelineError {
    /// Diagnostics reported to the caller for this error
    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        match self {
            PipelineError::Session(e) => {
                vec![Diagnostic::error(codes::SESSION_NOT_FOUND, e.to_string())]
            }
            PipelineError::Guard(violation) => vec![violation.to_diagnostic()],
            PipelineError::Compilation(diagnostics) => diagnostics,
            PipelineError::Packages(diagnostics) => {
                diagnostics.into_iter().map(Diagnostic::into_error).collect()
            }
            PipelineError::Isolation(e) => {
                vec![Diagnostic::error(codes::ISOLATION_UNAVAILABLE, e.to_string())]
            }
            PipelineError::Cancelled => vec![Diagnostic::error(
                codes::CANCELLED,
                "The request was cancelled before execution started",
            )],
        }
    }
}

/// Tunables that are not part of the security policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_output_bytes: usize,
    pub memory_poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::empty())
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            session_ttl: config.sessions.ttl(),
            sweep_interval: config.sessions.sweep_interval(),
            max_output_bytes: config.isolation.max_output_bytes,
            memory_poll_interval: config.isolation.memory_poll_interval(),
        }
    }
}

/// Outcome of a reset request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ResetOutcome {
    Session { id: String, removed: bool },
    All { removed: usize },
}

/// Snapshot returned by [`ExecutionPipeline::inspect`]
#[derive(Debug, Clone, Serialize)]
pub struct ReplState {
    pub engine: EngineInfo,
    pub active_sessions: usize,
    pub policy: SecurityPolicy,
    pub isolation: DomainStats,

    /// Present when a session id was given
    pub session: Option<SessionMetadata>,
}

/// Outcome of attaching packages to a session without running code
#[derive(Debug, Clone, Default, Serialize)]
pub struct PackageLoadResult {
    pub success: bool,
    pub session_id: Option<SessionId>,
    pub added: Vec<ExternalReference>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

enum SessionHandle {
    Persistent(SessionId),
    Ephemeral(EphemeralSession),
}

impl SessionHandle {
    fn id(&self) -> &SessionId {
        match self {
            SessionHandle::Persistent(id) => id,
            SessionHandle::Ephemeral(session) => session.id(),
        }
    }
}

/// Runs requests against sessions under a security policy
pub struct ExecutionPipeline {
    registry: Arc<SessionRegistry>,
    domain: Arc<IsolationDomain>,
    policy: Arc<SecurityPolicy>,
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn PackageResolver>,
    settings: PipelineSettings,
}

impl fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("sessions", &self.registry.len())
            .field("domain", &self.domain.stats())
            .field("compiler", &self.compiler.info().language)
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ExecutionPipeline {
    /// Pipeline with an empty package catalogue and default settings
    pub fn new(compiler: Arc<dyn Compiler>, policy: SecurityPolicy) -> Self {
        let settings = PipelineSettings::default();
        Self {
            registry: Arc::new(SessionRegistry::new()),
            domain: Arc::new(IsolationDomain::new(
                Config::empty().isolation.max_concurrent_units,
            )),
            policy: Arc::new(policy),
            compiler,
            resolver: Arc::new(StaticPackageResolver::new()),
            settings,
        }
    }

    /// Pipeline running the script front-end, configured from `config`
    pub fn from_config(config: &Config) -> Self {
        let resolver: Arc<dyn PackageResolver> = match &config.packages.cache_dir {
            Some(dir) => Arc::new(DirectoryPackageResolver::new(dir.clone())),
            None => Arc::new(StaticPackageResolver::new()),
        };
        Self {
            registry: Arc::new(SessionRegistry::new()),
            domain: Arc::new(IsolationDomain::new(config.isolation.max_concurrent_units)),
            policy: Arc::new(config.security_policy()),
            compiler: Arc::new(ScriptCompiler::new()),
            resolver,
            settings: PipelineSettings::from(config),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PackageResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_domain(mut self, domain: Arc<IsolationDomain>) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn domain(&self) -> &Arc<IsolationDomain> {
        &self.domain
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run a request to completion
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_with_abort(request, CancellationToken::new())
            .await
    }

    /// Run a request that the caller can abort through `abort`
    ///
    /// Dropping the returned future also cleans up: an ephemeral session is
    /// removed and a loaded unit is released by its `Drop`.
    #[instrument(
        skip_all,
        fields(session = request.requested_session().unwrap_or("-"), persist = request.persist_session)
    )]
    pub async fn execute_with_abort(
        &self,
        request: ExecutionRequest,
        abort: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        let mut result = match self.open_session(&request) {
            Err(error) => ExecutionResult::failure(error.into_diagnostics()),
            Ok(handle) => {
                let persist = match &handle {
                    SessionHandle::Persistent(_) => request.persist_session,
                    SessionHandle::Ephemeral(_) => false,
                };
                let mut result = self.execute_in(&request, handle.id(), persist, &abort).await;
                if let SessionHandle::Persistent(id) = &handle {
                    result.session_id = Some(id.clone());
                }
                result
            }
        };

        result.elapsed = started.elapsed();
        info!(
            success = result.success,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "request finished"
        );
        result
    }

    /// Compile without executing
    ///
    /// Uses the session's references and state when an id is given. Never
    /// creates a session.
    #[instrument(skip(self, source), fields(len = source.len()))]
    pub async fn validate(&self, source: &str, session_id: Option<&str>) -> ValidationResult {
        let session_id = session_id.map(str::trim).filter(|id| !id.is_empty());
        match self.compile_only(source, session_id).await {
            Ok(warnings) => ValidationResult::from_diagnostics(warnings),
            Err(error) => ValidationResult::from_diagnostics(error.into_diagnostics()),
        }
    }

    /// Remove one session, or every session when no id is given
    pub fn reset(&self, session_id: Option<&str>) -> ResetOutcome {
        match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                let removed = self.registry.remove(id);
                info!(session = id, removed, "session reset");
                ResetOutcome::Session {
                    id: id.to_string(),
                    removed,
                }
            }
            None => ResetOutcome::All {
                removed: self.registry.clear(),
            },
        }
    }

    /// Engine, policy and isolation overview, plus one session's metadata
    pub fn inspect(&self, session_id: Option<&str>) -> Result<ReplState, PipelineError> {
        let session = match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                self.registry.touch(id);
                Some(
                    self.registry
                        .get_metadata(id)
                        .ok_or_else(|| SessionError::NotFound(id.to_string()))?,
                )
            }
            None => None,
        };

        Ok(ReplState {
            engine: self.compiler.info(),
            active_sessions: self.registry.len(),
            policy: self.policy.as_ref().clone(),
            isolation: self.domain.stats(),
            session,
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionMetadata> {
        self.registry.list_metadata()
    }

    /// Attach packages to an existing session without running code
    #[instrument(skip(self, packages), fields(packages = packages.len()))]
    pub async fn load_packages(
        &self,
        session_id: &str,
        packages: &[ExternalReference],
    ) -> PackageLoadResult {
        let mut warnings = Vec::new();
        let outcome = async {
            let guard = self.registry.lock(session_id).await?;
            StaticGuard::check_packages(packages, &self.policy)?;
            let added = self.attach(guard.id(), packages, &mut warnings).await?;
            Ok::<_, PipelineError>((guard.id().clone(), added))
        }
        .await;

        match outcome {
            Ok((id, added)) => PackageLoadResult {
                success: true,
                session_id: Some(id),
                added,
                errors: Vec::new(),
                warnings,
            },
            Err(error) => {
                let (errors, rest) = partition_diagnostics(error.into_diagnostics());
                warnings.extend(rest);
                PackageLoadResult {
                    errors,
                    warnings,
                    ..PackageLoadResult::default()
                }
            }
        }
    }

    /// Sweep idle sessions in the background until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.registry.spawn_sweeper(
            self.settings.sweep_interval,
            self.settings.session_ttl,
            cancel,
        )
    }

    fn open_session(&self, request: &ExecutionRequest) -> Result<SessionHandle, PipelineError> {
        match request.requested_session() {
            Some(id) => match self.registry.get_metadata(id) {
                Some(metadata) => Ok(SessionHandle::Persistent(metadata.id)),
                None => {
                    warn!(session = id, "unknown session requested");
                    Err(SessionError::NotFound(id.to_string()).into())
                }
            },
            None if request.persist_session => {
                Ok(SessionHandle::Persistent(self.registry.create()))
            }
            None => Ok(SessionHandle::Ephemeral(EphemeralSession::create(
                &self.registry,
            ))),
        }
    }

    async fn execute_in(
        &self,
        request: &ExecutionRequest,
        id: &SessionId,
        persist: bool,
        abort: &CancellationToken,
    ) -> ExecutionResult {
        let mut notes = Vec::new();
        let mut result = match self.run_steps(request, id, persist, abort, &mut notes).await {
            Ok(result) => result,
            Err(error) => {
                debug!(%error, "request stopped before running");
                ExecutionResult::failure(error.into_diagnostics())
            }
        };
        // merge notes come first: they happened before compilation
        notes.append(&mut result.warnings);
        result.warnings = notes;
        result
    }

    async fn run_steps(
        &self,
        request: &ExecutionRequest,
        id: &SessionId,
        persist: bool,
        abort: &CancellationToken,
        notes: &mut Vec<Diagnostic>,
    ) -> Result<ExecutionResult, PipelineError> {
        let _guard = self.lock_session(id, abort).await?;

        StaticGuard::check_packages(&request.packages, &self.policy)?;
        self.attach(id, &request.packages, notes).await?;

        StaticGuard::check(&request.source, &self.policy)?;

        let references = self.registry.references(id.as_str())?;
        let prior = self.registry.get_state(id.as_str())?;
        let compilation = self
            .compiler
            .compile(&request.source, &references, prior.as_ref())
            .await
            .map_err(PipelineError::Compilation)?;

        let mut unit = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(PipelineError::Cancelled),
            loaded = self.domain.load(compilation.unit, self.settings.max_output_bytes) => loaded?,
        };

        let monitor = ResourceMonitor::from_policy(&self.policy)
            .with_poll_interval(self.settings.memory_poll_interval);
        let outcome = unit
            .run(self.policy.effective_timeout(), abort, &monitor)
            .await;
        let output = unit.output();
        let cleanup_degraded = match unit.unload() {
            Ok(()) => false,
            Err(error) => {
                warn!(%error, "isolation unit cleanup degraded");
                true
            }
        };

        let mut result = ExecutionResult {
            output,
            cleanup_degraded,
            warnings: compilation.warnings,
            ..ExecutionResult::default()
        };
        if cleanup_degraded {
            result.warnings.push(Diagnostic::warning(
                codes::CLEANUP_DEGRADED,
                "The submission did not stop when asked and may still be running on a worker thread",
            ));
        }

        match outcome? {
            RunOutcome::Completed {
                value,
                continuation,
            } => {
                if persist {
                    // the sweeper may have removed the session mid-run; keep
                    // what the run produced and report the lost state
                    if let Err(error) = self.registry.update_state(id.as_str(), continuation) {
                        warn!(%error, "session gone after run, continuation dropped");
                        result
                            .errors
                            .push(Diagnostic::error(codes::SESSION_NOT_FOUND, error.to_string()));
                    }
                } else {
                    self.registry.touch(id.as_str());
                }
                result.success = result.errors.is_empty();
                result.return_value = value;
            }
            RunOutcome::Faulted(fault) => {
                result
                    .errors
                    .push(Diagnostic::error(codes::RUNTIME_ERROR, fault.to_string()));
            }
            RunOutcome::TimedOut(limit) => {
                result.errors.push(Diagnostic::error(
                    codes::TIMEOUT,
                    format!(
                        "Execution exceeded the time limit of {} ms. {UNYIELDING_CODE_NOTE}",
                        limit.as_millis()
                    ),
                ));
            }
            RunOutcome::Cancelled => {
                result.errors.push(Diagnostic::error(
                    codes::CANCELLED,
                    format!("Execution was cancelled by the caller. {UNYIELDING_CODE_NOTE}"),
                ));
            }
            RunOutcome::MemoryExceeded { usage, limit } => {
                result.errors.push(Diagnostic::error(
                    codes::MEMORY_LIMIT,
                    format!(
                        "Memory usage of {usage} bytes exceeded the limit of {limit} bytes"
                    ),
                ));
            }
        }
        Ok(result)
    }

    async fn lock_session(
        &self,
        id: &SessionId,
        abort: &CancellationToken,
    ) -> Result<SessionGuard, PipelineError> {
        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(PipelineError::Cancelled),
            guard = self.registry.lock(id.as_str()) => Ok(guard?),
        }
    }

    /// Resolve `packages` and merge the ones that resolve into the session
    ///
    /// Per-reference failures become warnings in `notes`; only a request in
    /// which nothing resolves fails.
    async fn attach(
        &self,
        id: &SessionId,
        packages: &[ExternalReference],
        notes: &mut Vec<Diagnostic>,
    ) -> Result<Vec<ExternalReference>, PipelineError> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }

        let mut resolved = Vec::with_capacity(packages.len());
        let mut failures = Vec::new();
        for reference in packages {
            match self.resolver.resolve(reference).await {
                Ok(found) => resolved.push(found),
                Err(error) => {
                    warn!(package = %reference, %error, "package resolution failed");
                    failures.push(Diagnostic::warning(
                        codes::PACKAGE_NOT_FOUND,
                        error.to_string(),
                    ));
                }
            }
        }

        if resolved.is_empty() {
            return Err(PipelineError::Packages(failures));
        }
        notes.extend(failures);

        let outcome = self.registry.merge_references(id.as_str(), resolved)?;
        if outcome.state_discarded {
            let added: Vec<String> = outcome.added.iter().map(ToString::to_string).collect();
            notes.push(Diagnostic::warning(
                codes::STATE_RESET,
                format!(
                    "Adding {} reset the session state; variables from earlier submissions are no longer defined",
                    added.join(", ")
                ),
            ));
        }
        Ok(outcome.added)
    }

    async fn compile_only(
        &self,
        source: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<Diagnostic>, PipelineError> {
        let (references, prior) = match session_id {
            Some(id) => (self.registry.references(id)?, self.registry.get_state(id)?),
            None => (Vec::new(), None),
        };

        StaticGuard::check(source, &self.policy)?;

        let compilation = self
            .compiler
            .compile(source, &references, prior.as_ref())
            .await
            .map_err(PipelineError::Compilation)?;
        Ok(compilation.warnings)
    }
}
