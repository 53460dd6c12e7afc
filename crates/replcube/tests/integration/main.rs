//! Integration tests for replcube
//!
//! These drive the public pipeline end to end with the script front-end.
//! Fixtures live under `tests/fixtures`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use replcube::engine::{
    Compilation, Compiler, ContinuationToken, EngineInfo, ResolvedReference,
};
use replcube::{
    Diagnostic, ExecutionPipeline, ScriptCompiler, SecurityPolicy, StaticPackageResolver,
};

mod config_loading;
mod isolation;
mod packages;
mod scenarios;
mod security;
mod sessions;

pub(crate) const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Script compiler that counts how often it is asked to compile
#[derive(Debug, Default)]
pub(crate) struct CountingCompiler {
    inner: ScriptCompiler,
    calls: AtomicUsize,
}

impl CountingCompiler {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compiler for CountingCompiler {
    async fn compile(
        &self,
        source: &str,
        references: &[ResolvedReference],
        prior: Option<&ContinuationToken>,
    ) -> Result<Compilation, Vec<Diagnostic>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(source, references, prior).await
    }

    fn info(&self) -> EngineInfo {
        self.inner.info()
    }
}

/// Pipeline over the script front-end with a small package catalogue
pub(crate) fn test_pipeline(policy: SecurityPolicy) -> ExecutionPipeline {
    ExecutionPipeline::new(Arc::new(ScriptCompiler::new()), policy).with_resolver(Arc::new(catalogue()))
}

/// Same as [`test_pipeline`] but exposes the compiler's call count
pub(crate) fn counting_pipeline(policy: SecurityPolicy) -> (ExecutionPipeline, Arc<CountingCompiler>) {
    let compiler = Arc::new(CountingCompiler::default());
    let pipeline = ExecutionPipeline::new(compiler.clone(), policy).with_resolver(Arc::new(catalogue()));
    (pipeline, compiler)
}

pub(crate) fn catalogue() -> StaticPackageResolver {
    StaticPackageResolver::new()
        .with_package("Contoso.Json", "1.2.0", ["/packages/contoso.json/1.2.0/Contoso.Json.dll"])
        .with_package("Contoso.Json", "1.10.0", ["/packages/contoso.json/1.10.0/Contoso.Json.dll"])
        .with_package("Fabrikam.Text", "2.0.0", ["/packages/fabrikam.text/2.0.0/Fabrikam.Text.dll"])
        .with_package("System.Net.Sockets", "4.3.0", ["/packages/system.net.sockets/4.3.0/System.Net.Sockets.dll"])
}
