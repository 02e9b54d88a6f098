use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mars_core::{load_json_file, Mutation, OrchestratorConfig, SandboxPlatform};
use mars_local::{LocalBackend, TemplateMatcher};
use mars_runner::{Callbacks, Collaborators, Orchestrator, SearchReport};
use mars_search::extract_guards;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mars", version = "0.3.0", about = "Mutation-driven repair experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// YAML configuration; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the orchestrator over HTTP.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Compute baseline coverage and write it to the configured cache.
    Precompute,
    /// Collect `if` guards from the baseline into a donor pool.
    ExtractDonors {
        #[arg(long)]
        output: Option<PathBuf>,
        files: Vec<String>,
    },
    Files,
    Lines,
    Perturbations {
        file: String,
        #[arg(long)]
        line: Option<usize>,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Perturb once, search for a repair and report the outcome.
    Run {
        /// JSON file holding the mutation to inject.
        #[arg(long, conflicts_with = "file")]
        mutation: Option<PathBuf>,
        /// Inject the first perturbation found in this file.
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        line: Option<usize>,
        #[arg(long)]
        operator: Option<String>,
        #[arg(long)]
        minutes: Option<u64>,
        #[arg(long)]
        attempts: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Session {
    config: OrchestratorConfig,
    backend: Arc<LocalBackend>,
    orchestrator: Orchestrator,
}

fn open(config: Option<&PathBuf>, callbacks: Callbacks) -> Result<Session> {
    let config = OrchestratorConfig::load_or_default(config.map(|p| p.as_path()))?;
    let backend = Arc::new(LocalBackend::new(config.local.root.clone())?);
    let orchestrator = Orchestrator::new(
        config.clone(),
        Collaborators {
            platform: backend.clone(),
            engine: backend.clone(),
            matcher: Arc::new(TemplateMatcher),
            analyzer: backend.clone(),
        },
        callbacks,
    )?;
    Ok(Session {
        config,
        backend,
        orchestrator,
    })
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let json = cli.json;
    let config = cli.config.as_ref();
    match cli.command {
        Commands::Serve { port } => {
            let session = open(config, Callbacks::new())?;
            let port = port.unwrap_or(session.config.server.port);
            let orchestrator = Arc::new(session.orchestrator);
            let served = mars_server::serve(orchestrator.clone(), port);
            orchestrator.shutdown();
            served?;
        }
        Commands::Precompute => {
            let session = open(config, Callbacks::new())?;
            if session.config.coverage_cache.is_none() {
                warn!("no coverage_cache configured; coverage will not be persisted");
            }
            let coverage = session.orchestrator.precompute_coverage()?;
            let lines = coverage.lines().len();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "precompute",
                    "tests": coverage.len(),
                    "lines": lines,
                    "path": session.config.coverage_cache
                })));
            }
            println!("tests: {}", coverage.len());
            println!("lines: {}", lines);
            if let Some(path) = &session.config.coverage_cache {
                println!("path: {}", path.display());
            }
        }
        Commands::ExtractDonors { output, files } => {
            let session = open(config, Callbacks::new())?;
            let path = output
                .or_else(|| session.config.donor_pool.clone())
                .ok_or_else(|| anyhow!("pass --output or configure donor_pool"))?;
            let files = if files.is_empty() {
                session.orchestrator.files()?
            } else {
                files
            };
            let snapshot = session.backend.snapshot(&session.config.baseline)?;
            let pool = extract_guards(session.backend.as_ref(), &TemplateMatcher, &snapshot, &files)?;
            pool.save(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "extract-donors",
                    "files": files.len(),
                    "snippets": pool.len(),
                    "path": path
                })));
            }
            println!("snippets: {}", pool.len());
            println!("path: {}", path.display());
        }
        Commands::Files => {
            let session = open(config, Callbacks::new())?;
            let files = session.orchestrator.files()?;
            if json {
                return Ok(Some(json!({ "ok": true, "command": "files", "files": files })));
            }
            for file in files {
                println!("{}", file);
            }
        }
        Commands::Lines => {
            let session = open(config, Callbacks::new())?;
            let lines: Vec<String> = session
                .orchestrator
                .lines()?
                .iter()
                .map(|l| l.to_string())
                .collect();
            if json {
                return Ok(Some(json!({ "ok": true, "command": "lines", "lines": lines })));
            }
            for line in lines {
                println!("{}", line);
            }
        }
        Commands::Perturbations {
            file,
            line,
            operator,
        } => {
            let session = open(config, Callbacks::new())?;
            let mutations = session
                .orchestrator
                .perturbations(&file, line, operator.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "perturbations",
                    "perturbations": mutations
                })));
            }
            for mutation in mutations {
                println!(
                    "{} {} -> {:?}",
                    mutation.operator, mutation.location, mutation.replacement
                );
            }
        }
        Commands::Run {
            mutation,
            file,
            line,
            operator,
            minutes,
            attempts,
        } => {
            let (done_tx, done_rx) = mpsc::channel::<SearchReport>();
            let (error_tx, error_rx) = mpsc::channel::<(String, String)>();
            let callbacks = Callbacks::new()
                .on_progress(|evaluation, patches| {
                    info!(
                        repair = evaluation.is_repair,
                        patches = patches.len(),
                        "evaluated candidate"
                    );
                })
                .on_done(move |report| {
                    let _ = done_tx.send(report.clone());
                })
                .on_error(move |kind, message| {
                    let _ = error_tx.send((kind.to_string(), message.to_string()));
                });
            let session = open(config, callbacks)?;
            let orchestrator = &session.orchestrator;
            let searched = (|| -> Result<SearchReport> {
                let mutation = match (mutation, file) {
                    (Some(path), _) => load_json_file::<Mutation>(&path)?,
                    (None, Some(file)) => orchestrator
                        .perturbations(&file, line, operator.as_deref())?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow!("no perturbations available in {}", file))?,
                    (None, None) => return Err(anyhow!("pass --mutation or --file")),
                };
                info!(operator = %mutation.operator, location = %mutation.location, "injecting");
                orchestrator.perturb(mutation)?;
                orchestrator.adapt(minutes, attempts)?;
                orchestrator.wait();
                if let Ok((kind, message)) = error_rx.try_recv() {
                    return Err(anyhow!("search failed ({}): {}", kind, message));
                }
                done_rx
                    .try_recv()
                    .map_err(|_| anyhow!("search ended without a report"))
            })();
            orchestrator.shutdown();
            let report = searched?;

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "outcome": report.outcome,
                    "attempts": report.attempts,
                    "elapsed": report.elapsed,
                    "patches": report.patches().iter().map(|p| p.diff()).collect::<Vec<_>>()
                })));
            }
            println!("outcome: {}", report.outcome);
            println!("attempts: {}", report.attempts);
            println!("elapsed: {:.1}s", report.elapsed);
            for patch in report.patches() {
                println!("{}", patch.diff());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
