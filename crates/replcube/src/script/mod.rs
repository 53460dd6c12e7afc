//! Reference language front-end
//!
//! A small C#-flavoured script dialect: `var` declarations, assignment,
//! integer/string/bool arithmetic, `Console.WriteLine`, `await Task.Delay`,
//! `throw new ...Exception(..)` and `using` directives, with a trailing
//! expression as the submission's value. Diagnostics use the C# compiler's
//! codes so callers can branch on them.
//!
//! State carries across submissions through the [`ContinuationToken`] each
//! successful run produces.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::engine::{
    Compilation, CompiledUnit, Compiler, Completion, ContinuationToken, EngineInfo,
    ExecutionContext, ExecutionFault, ResolvedReference,
};
use crate::types::{Diagnostic, Value};

pub use crate::script::check::{BUILTIN_NAMESPACES, Type};

mod check;
mod eval;
mod lexer;
mod parser;

/// A named value and its static type
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub ty: Type,
    pub value: Value,
}

/// Everything defined by the submissions of one session so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptState {
    pub bindings: BTreeMap<String, Binding>,
    pub usings: BTreeSet<String>,
}

impl ScriptState {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name).map(|binding| &binding.value)
    }
}

/// A checked submission ready to run
#[derive(Debug)]
pub(crate) struct Program {
    statements: Vec<parser::Stmt>,
    declared_types: Vec<Type>,
    returns_value: bool,
}

struct ScriptUnit {
    program: Program,
    prior: ScriptState,
}

#[async_trait]
impl CompiledUnit for ScriptUnit {
    async fn run(self: Box<Self>, ctx: ExecutionContext) -> Result<Completion, ExecutionFault> {
        let ScriptUnit { program, prior } = *self;
        let (value, state) = eval::execute(&program, prior, &ctx).await?;
        Ok(Completion {
            value,
            continuation: ContinuationToken::new(state),
        })
    }
}

/// Compiler for the script dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCompiler;

impl ScriptCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Parse and check without producing a runnable unit
    fn front_end(
        source: &str,
        references: &[ResolvedReference],
        prior: &ScriptState,
    ) -> Result<(Program, Vec<Diagnostic>), Vec<Diagnostic>> {
        let tokens = lexer::tokenize(source)?;
        let statements = parser::parse(tokens)?;
        let checked = check::check(&statements, prior, references)?;
        Ok((
            Program {
                statements,
                declared_types: checked.declared_types,
                returns_value: checked.returns_value,
            },
            checked.warnings,
        ))
    }
}

#[async_trait]
impl Compiler for ScriptCompiler {
    #[instrument(skip_all, fields(len = source.len(), references = references.len()))]
    async fn compile(
        &self,
        source: &str,
        references: &[ResolvedReference],
        prior: Option<&ContinuationToken>,
    ) -> Result<Compilation, Vec<Diagnostic>> {
        let prior = match prior.map(|token| token.downcast_ref::<ScriptState>()) {
            Some(Some(state)) => state.clone(),
            Some(None) => {
                warn!("continuation token was not produced by this compiler; starting fresh");
                ScriptState::default()
            }
            None => ScriptState::default(),
        };

        let (program, warnings) = Self::front_end(source, references, &prior).inspect_err(|errors| {
            debug!(errors = errors.len(), "compilation failed");
        })?;

        Ok(Compilation {
            unit: Box::new(ScriptUnit { program, prior }),
            warnings,
        })
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            language: "csharp-script".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: [
                "var",
                "assignment",
                "int",
                "string",
                "bool",
                "console-output",
                "await-task-delay",
                "throw",
                "using",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}
