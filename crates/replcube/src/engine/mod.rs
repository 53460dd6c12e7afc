//! Contracts for the language front-end and package resolution
//!
//! The pipeline drives these collaborators but never looks inside what they
//! produce: compiled units are run and dropped, continuation tokens are stored
//! and handed back to the compiler on the next submission.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use crate::engine::packages::{
    DirectoryPackageResolver, PackageResolver, ResolveError, StaticPackageResolver,
};
use crate::types::{Diagnostic, ExternalReference, Value};

mod packages;

/// Opaque "everything defined so far" handle produced by running a unit
///
/// Cloning shares the underlying state; only the compiler that created a
/// token knows how to read it.
#[derive(Clone)]
pub struct ContinuationToken(Arc<dyn Any + Send + Sync>);

impl ContinuationToken {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    /// Borrow the state as `T` if that is what it holds
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two tokens share the same state
    pub fn ptr_eq(&self, other: &ContinuationToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContinuationToken(..)")
    }
}

/// A reference after resolution to loadable artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    pub reference: ExternalReference,
    pub artifacts: Vec<PathBuf>,
}

/// Text written by a running unit
///
/// Shared between the unit and its isolation unit so output produced before
/// a timeout or fault is still returned. Writes beyond the limit are dropped
/// and a truncation marker is appended once.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<OutputState>>,
}

#[derive(Debug)]
struct OutputState {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    const TRUNCATED: &'static str = "\n[output truncated]";

    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputState {
                text: String::new(),
                limit,
                truncated: false,
            })),
        }
    }

    pub fn write(&self, text: &str) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.truncated {
            return;
        }
        let room = state.limit.saturating_sub(state.text.len());
        if text.len() <= room {
            state.text.push_str(text);
            return;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        state.text.push_str(&text[..cut]);
        state.text.push_str(Self::TRUNCATED);
        state.truncated = true;
    }

    pub fn write_line(&self, text: &str) {
        self.write(text);
        self.write("\n");
    }

    /// Copy of everything captured so far
    pub fn contents(&self) -> String {
        match self.inner.lock() {
            Ok(state) => state.text.clone(),
            Err(poisoned) => poisoned.into_inner().text.clone(),
        }
    }
}

/// Handed to a compiled unit when it runs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    output: OutputBuffer,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, output: OutputBuffer) -> Self {
        Self { cancel, output }
    }

    /// Fires when the orchestrator stops waiting (timeout, abort, memory)
    ///
    /// Units must poll or await this to be stoppable; nothing interrupts a
    /// unit that never yields.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }
}

/// A runtime exception raised by executing code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFault {
    /// Exception type name, e.g. `DivideByZeroException`
    pub kind: String,
    pub message: String,
}

impl ExecutionFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new("OperationCanceledException", "The operation was canceled.")
    }
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Value and follow-on state of a unit that ran to completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub value: Option<Value>,
    pub continuation: ContinuationToken,
}

/// A compiled, runnable submission
#[async_trait]
pub trait CompiledUnit: Send {
    /// Run the unit to completion, consuming it
    async fn run(self: Box<Self>, ctx: ExecutionContext) -> Result<Completion, ExecutionFault>;
}

impl fmt::Debug for dyn CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledUnit(..)")
    }
}

/// Successful compile output
#[derive(Debug)]
pub struct Compilation {
    pub unit: Box<dyn CompiledUnit>,

    /// Non-fatal diagnostics reported alongside the unit
    pub warnings: Vec<Diagnostic>,
}

/// Identity of a front-end, reported by inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub language: String,
    pub version: String,
    pub features: Vec<String>,
}

/// The language front-end
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `source` against `references`, continuing from `prior` if given
    ///
    /// Compile failures come back as diagnostics; they are never fatal.
    async fn compile(
        &self,
        source: &str,
        references: &[ResolvedReference],
        prior: Option<&ContinuationToken>,
    ) -> Result<Compilation, Vec<Diagnostic>>;

    fn info(&self) -> EngineInfo;
}
