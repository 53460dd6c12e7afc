//! Replcube CLI
//!
//! A command-line front end for running script fragments in replcube sessions.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use replcube::{
    Config, EXAMPLE_CONFIG, ExecutionPipeline, ExecutionRequest, ExecutionResult,
    ExternalReference, PolicyPreset, SessionId,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replcube")]
#[command(about = "Run untrusted script fragments under a security policy")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Replace the configured policy with a preset
    #[arg(long, global = true, value_enum)]
    preset: Option<Preset>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Production,
    Permissive,
}

impl From<Preset> for PolicyPreset {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Production => PolicyPreset::Production,
            Preset::Permissive => PolicyPreset::Permissive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: replcube.toml)
        #[arg(short, long, default_value = "replcube.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Execute a script once in a throwaway session
    Exec {
        /// Script file ("-" for stdin)
        #[arg(value_name = "FILE", required_unless_present = "eval")]
        source: Option<PathBuf>,

        /// Script text given inline
        #[arg(short, long, conflicts_with = "source")]
        eval: Option<String>,

        /// Package reference (Name or Name@version), repeatable
        #[arg(short, long = "package")]
        packages: Vec<String>,
    },

    /// Compile a script without running it
    Validate {
        /// Script file ("-" for stdin)
        #[arg(value_name = "FILE", required_unless_present = "eval")]
        source: Option<PathBuf>,

        /// Script text given inline
        #[arg(short, long, conflicts_with = "source")]
        eval: Option<String>,
    },

    /// Interactive session; one submission per line
    Repl {
        /// Package reference loaded before the first submission, repeatable
        #[arg(short, long = "package")]
        packages: Vec<String>,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };
    if let Some(preset) = cli.preset {
        config = config.with_preset(preset.into());
    }

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Exec {
            source,
            eval,
            packages,
        } => {
            let source = read_source(source.as_deref(), eval).await?;
            let packages = parse_packages(&packages)?;
            run_exec(&config, source, packages, cli.json).await
        }
        Commands::Validate { source, eval } => {
            let source = read_source(source.as_deref(), eval).await?;
            run_validate(&config, &source, cli.json).await
        }
        Commands::Repl { packages } => {
            let packages = parse_packages(&packages)?;
            run_repl(&config, packages, cli.json).await
        }
        Commands::ShowConfig => show_config(&config, cli.json),
    }
}

async fn read_source(path: Option<&Path>, inline: Option<String>) -> Result<String> {
    if let Some(text) = inline {
        return Ok(text);
    }
    match path {
        Some(path) if path != Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read source file '{}'", path.display())),
        _ => {
            let mut text = String::new();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
                text.push_str(&line);
                text.push('\n');
            }
            Ok(text)
        }
    }
}

fn parse_packages(specs: &[String]) -> Result<Vec<ExternalReference>> {
    specs
        .iter()
        .map(|spec| {
            ExternalReference::parse(spec)
                .with_context(|| format!("invalid package reference '{spec}'"))
        })
        .collect()
}

/// Cancel `abort` on Ctrl-C so a running script stops instead of the process
fn abort_on_ctrl_c(abort: &CancellationToken) {
    let abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling execution");
            abort.cancel();
        }
    });
}

async fn run_exec(
    config: &Config,
    source: String,
    packages: Vec<ExternalReference>,
    json: bool,
) -> Result<()> {
    let pipeline = ExecutionPipeline::from_config(config);

    let mut request = ExecutionRequest::new(source);
    request.packages = packages;

    let abort = CancellationToken::new();
    abort_on_ctrl_c(&abort);
    let result = pipeline.execute_with_abort(request, abort).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    info!(
        success = result.success,
        elapsed = format_args!("{:.3}s", result.elapsed.as_secs_f64()),
        degraded = result.cleanup_degraded,
        "execution result"
    );

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_validate(config: &Config, source: &str, json: bool) -> Result<()> {
    let pipeline = ExecutionPipeline::from_config(config);
    let result = pipeline.validate(source, None).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for diagnostic in result.errors.iter().chain(result.warnings.iter()) {
            eprintln!("{diagnostic}");
        }
        if result.is_valid {
            println!("Validation successful");
        } else {
            println!("Validation failed");
        }
    }

    if result.is_valid {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_repl(config: &Config, packages: Vec<ExternalReference>, json: bool) -> Result<()> {
    let pipeline = ExecutionPipeline::from_config(config);
    let sweeper_stop = CancellationToken::new();
    let sweeper = pipeline.spawn_sweeper(sweeper_stop.clone());

    let mut session: Option<SessionId> = None;
    if !packages.is_empty() {
        let id = pipeline.registry().create();
        let loaded = pipeline.load_packages(id.as_str(), &packages).await;
        for diagnostic in loaded.errors.iter().chain(loaded.warnings.iter()) {
            eprintln!("{diagnostic}");
        }
        session = Some(id);
    }

    println!("replcube {} (:help for commands)", env!("CARGO_PKG_VERSION"));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            let (name, arg) = command
                .split_once(char::is_whitespace)
                .map(|(name, arg)| (name, arg.trim()))
                .unwrap_or((command, ""));
            match name {
                "quit" | "exit" => break,
                "help" => print_repl_help(),
                "reset" => {
                    if let Some(id) = session.take() {
                        pipeline.reset(Some(id.as_str()));
                    }
                    println!("Session reset");
                }
                "state" => {
                    let state = pipeline
                        .inspect(session.as_ref().map(SessionId::as_str))
                        .context("failed to inspect session")?;
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                "sessions" => {
                    println!("{}", serde_json::to_string_pretty(&pipeline.list_sessions())?);
                }
                "load" => {
                    let Some(reference) = ExternalReference::parse(arg) else {
                        eprintln!("usage: :load Name[@version]");
                        continue;
                    };
                    let id = match &session {
                        Some(id) => id.clone(),
                        None => pipeline.registry().create(),
                    };
                    let loaded = pipeline.load_packages(id.as_str(), &[reference]).await;
                    for diagnostic in loaded.errors.iter().chain(loaded.warnings.iter()) {
                        eprintln!("{diagnostic}");
                    }
                    for added in &loaded.added {
                        println!("Loaded {added}");
                    }
                    session = Some(id);
                }
                other => eprintln!("unknown command ':{other}' (try :help)"),
            }
            continue;
        }

        let request = match &session {
            Some(id) => ExecutionRequest::new(line).in_session(id.as_str()),
            None => ExecutionRequest::new(line).persist(true),
        };
        let abort = CancellationToken::new();
        let result = tokio::select! {
            result = pipeline.execute_with_abort(request, abort.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                abort.cancel();
                eprintln!("interrupted");
                continue;
            }
        };

        if session.is_none() {
            session = result.session_id.clone();
        }
        if json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            print_result(&result);
        }
    }

    sweeper_stop.cancel();
    sweeper.await.context("session sweeper panicked")?;
    Ok(())
}

fn print_repl_help() {
    println!(":reset            discard the current session");
    println!(":state            show engine, policy and session state");
    println!(":sessions         list active sessions");
    println!(":load Name[@ver]  add a package to the session");
    println!(":quit             leave");
}

fn print_result(result: &ExecutionResult) {
    if !result.output.is_empty() {
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
    }
    if let Some(value) = &result.return_value {
        println!("{value}");
    }
    for diagnostic in result.diagnostics() {
        eprintln!("{diagnostic}");
    }
}

fn show_config(config: &Config, json: bool) -> Result<()> {
    let policy = config.security_policy();
    if json {
        let view = serde_json::json!({
            "config": config,
            "effective_policy": policy,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Policy preset: {:?}", config.policy.preset);
    println!(
        "  Execution timeout: {:?} (enabled: {})",
        policy.execution_timeout(),
        policy.timeout_enabled()
    );
    println!(
        "  Memory limit: {} bytes (enabled: {})",
        policy.max_memory_bytes(),
        policy.memory_limit_enabled()
    );
    println!(
        "  API restrictions: {}",
        policy.api_restrictions_enabled()
    );
    println!("  Forbidden APIs: {}", policy.forbidden_apis().len());
    println!("  Blocked libraries: {}", policy.blocked_libraries().len());
    println!("  Max source size: {} bytes", policy.max_source_bytes());
    println!();
    println!("Session TTL: {}s", config.sessions.ttl_secs);
    println!("Sweep interval: {}s", config.sessions.sweep_interval_secs);
    println!(
        "Max concurrent units: {}",
        config.isolation.max_concurrent_units
    );
    match &config.packages.cache_dir {
        Some(dir) => println!("Package cache: {}", dir.display()),
        None => println!("Package cache: none"),
    }
    Ok(())
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
