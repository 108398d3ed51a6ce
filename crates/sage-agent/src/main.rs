//! # sage
//!
//! Command-line entry point. Wires the store, lock manager, model client and
//! orchestrator together, runs one request and prints the cleaned fragment
//! stream to stdout as NDJSON. Logs go to stderr.

#![deny(unsafe_code)]

mod request;
mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sage_core::SessionId;
use sage_core::tools::CompositeToolProvider;
use sage_llm::{OpenAiCompatClient, OpenAiConfig};
use sage_runtime::{LockManager, Orchestrator, OrchestratorConfig, RunOutcome, SessionRegistry, SessionRun};
use sage_settings::SageSettings;
use sage_store::{Database, SessionRepo, SqlitePersister};
use sage_wire::{ContentCleaner, encode_stream, write_stream};

use crate::request::RequestFile;
use crate::tools::BuiltinTools;

/// Multi-agent session orchestrator.
#[derive(Parser, Debug)]
#[command(name = "sage", about = "Multi-agent session orchestrator")]
struct Cli {
    /// Settings file (defaults to `~/.sage/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a request file and stream fragments as NDJSON.
    Run {
        /// JSON file with `query` or `messages`.
        request: PathBuf,

        /// Session to create or resume (overrides the file).
        #[arg(long)]
        session_id: Option<String>,

        /// Iteration limit for this run (overrides settings and the file).
        #[arg(long)]
        max_loop_count: Option<usize>,
    },
    /// Print a stored session, or list recent ones.
    Show {
        /// Session id. Omit to list.
        session_id: Option<String>,

        /// How many sessions to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Print the effective settings.
    Config,
}

fn load_settings(path: Option<&Path>) -> Result<SageSettings> {
    let settings = match path {
        Some(path) => sage_settings::load_settings_from_path(path),
        None => sage_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn db_path(settings: &SageSettings) -> PathBuf {
    if settings.store.db_path.is_empty() {
        sage_settings::sage_home().join("sage.db")
    } else {
        PathBuf::from(&settings.store.db_path)
    }
}

fn open_database(settings: &SageSettings) -> Result<Database> {
    let path = db_path(settings);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let db = Database::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))?;
    info!(path = %path.display(), "database opened");
    Ok(db)
}

fn build_orchestrator(settings: &SageSettings, db: Database) -> Result<Orchestrator> {
    let persister = Arc::new(SqlitePersister::new(db.clone()));
    let locks = LockManager::from_settings(&settings.lock, Some(db)).context("Failed to create lock manager")?;
    let model = OpenAiCompatClient::new(OpenAiConfig::from_settings(&settings.model))
        .context("Failed to create model client")?;
    let tools = CompositeToolProvider::new().with(Arc::new(BuiltinTools));
    let registry = Arc::new(SessionRegistry::from_settings(&settings.budget));

    Ok(Orchestrator::new(
        registry,
        locks,
        Arc::new(model),
        Arc::new(tools),
        persister,
        OrchestratorConfig::from_settings(&settings.orchestration),
    )
    .with_temperature(settings.model.temperature))
}

async fn run(
    settings: &SageSettings,
    request: &Path,
    session_id: Option<String>,
    max_loop_count: Option<usize>,
) -> Result<()> {
    let request = RequestFile::load(request)?.into_request(session_id, max_loop_count)?;
    let orchestrator = build_orchestrator(settings, open_database(settings)?)?;

    let SessionRun {
        session_id,
        messages,
        outcome,
    } = orchestrator.run_stream(request).await.context("Failed to start run")?;
    info!(%session_id, "run started");

    let interrupter = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(%session_id, "interrupt requested");
                let _ = orchestrator.interrupt(&session_id);
            }
        })
    };

    let lines = encode_stream(session_id.clone(), messages, ContentCleaner::default());
    let mut stdout = tokio::io::stdout();
    let written = write_stream(&mut stdout, lines).await.context("Failed to write output")?;
    let outcome = outcome.await.context("Run task panicked")?;
    interrupter.abort();
    info!(%session_id, lines = written, ?outcome, "run finished");

    match outcome {
        RunOutcome::Failed { category, message } => bail!("run failed [{category}]: {message}"),
        RunOutcome::NeedsContinuation => {
            eprintln!("iteration limit reached; run again with --session-id {session_id} to continue");
            Ok(())
        }
        RunOutcome::NeedsUserInput => {
            eprintln!("more input needed; reply with --session-id {session_id}");
            Ok(())
        }
        RunOutcome::Completed | RunOutcome::Interrupted => Ok(()),
    }
}

fn show(settings: &SageSettings, session_id: Option<String>, limit: u32) -> Result<()> {
    let repo = SessionRepo::new(open_database(settings)?);
    let rendered = match session_id {
        Some(id) => {
            let id = SessionId::from(id);
            let Some(snapshot) = repo.load(&id).context("Failed to load session")? else {
                bail!("no stored session {id}");
            };
            serde_json::to_string_pretty(&snapshot)?
        }
        None => serde_json::to_string_pretty(&repo.list(limit).context("Failed to list sessions")?)?,
    };
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    sage_logging::init_subscriber(&settings.logging.level, settings.logging.json);

    match cli.command {
        Command::Run {
            request,
            session_id,
            max_loop_count,
        } => run(&settings, &request, session_id, max_loop_count).await,
        Command::Show { session_id, limit } => show(&settings, session_id, limit),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}
