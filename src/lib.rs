//! Hybrid retrieval and fusion ranking for matching candidates against job postings.
//!
//! Entities of both classes are indexed twice: an embedding in a per-class
//! [`VectorIndexStore`](search::vector_index::VectorIndexStore) and a document plus
//! structured attributes in a per-class [`TextIndexStore`](search::text_index::TextIndexStore).
//! Writes flow through the [`IndexCoordinator`](indexer::coordinator::IndexCoordinator),
//! queries through the [`QueryPlanner`](search::planner::QueryPlanner), and the
//! [`FusionRanker`](search::fusion::FusionRanker) turns the merged signals into one ranking.

pub mod config;
pub mod engine;
pub mod indexer;
pub mod model;
pub mod search;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, EngineConfig};
use crate::engine::{Engine, default_data_dir};
use crate::indexer::coordinator::CheckpointSummary;
use crate::indexer::ledger::FaultKind;
use crate::indexer::worker::{PropagationReport, WorkerError};
use crate::model::types::{EntityClass, IndexWriteRecord};
use crate::search::planner::{QueryError, QueryResponse, RetrievalRequest};
use crate::search::vector_index::VectorStoreInfo;

/// Environment variable holding the log filter; falls back to `RUST_LOG`.
pub const LOG_ENV: &str = "TALENT_MATCH_LOG";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "talent-match",
    version,
    about = "Hybrid vector + full-text matching of candidates and job postings"
)]
pub struct Cli {
    /// Directory holding vector snapshots, the text index and the version ledger
    #[arg(long, global = true, env = "TALENT_MATCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to `$XDG_CONFIG_HOME/talent-match/engine.toml`)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Apply write records from a JSON Lines file (`-` for stdin) and checkpoint
    Index {
        #[arg(long)]
        records: PathBuf,
    },
    /// Run one retrieval request read from a JSON file (`-` for stdin)
    Query {
        #[arg(long)]
        request: PathBuf,
    },
    /// Show index sizes and write-path counters
    Stats,
    /// List writes that did not complete cleanly and await re-application
    Faults,
    /// Print the effective configuration
    Config {
        /// Print the config file location instead
        #[arg(long)]
        path: bool,
    },
}

/// A failure reported by the CLI with a stable exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CliError {
    pub code: i32,
    pub kind: &'static str,
    pub message: String,
    pub hint: Option<String>,
    pub retryable: bool,
}

pub type CliResult<T = ()> = Result<T, CliError>;

impl CliError {
    fn new(code: i32, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            hint: None,
            retryable: false,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    fn internal(err: anyhow::Error) -> Self {
        Self::new(1, "internal", format!("{err:#}"))
    }

    fn invalid_input(err: anyhow::Error) -> Self {
        Self::new(2, "invalid_input", format!("{err:#}"))
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::new(3, "config", err.to_string())
            .with_hint("check engine.toml and TALENT_MATCH_* environment variables")
    }
}

impl From<QueryError> for CliError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidQuery(_) | QueryError::DimensionMismatch { .. } => {
                Self::new(2, "invalid_query", err.to_string())
            }
            QueryError::SourcesUnavailable(_) => {
                Self::new(5, "unavailable", err.to_string()).retryable()
            }
            QueryError::Cancelled => Self::new(130, "cancelled", err.to_string()),
        }
    }
}

impl From<WorkerError> for CliError {
    fn from(err: WorkerError) -> Self {
        Self::new(1, "internal", err.to_string())
    }
}

/// Parse arguments; help and version requests come back as errors with code 0.
pub fn parse_cli<I, T>(args: I) -> CliResult<Cli>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|err| CliError {
        code: err.exit_code(),
        kind: "usage",
        message: err.render().to_string(),
        hint: None,
        retryable: false,
    })
}

/// Install the global subscriber, writing to stderr.
pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run(cli: Cli) -> CliResult {
    init_tracing(cli.verbose);

    if let Commands::Config { path: true } = cli.command {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => EngineConfig::config_path()?,
        };
        println!("{}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    if let Commands::Config { .. } = cli.command {
        if cli.json {
            return emit_json(&config);
        }
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    debug!(data_dir = %data_dir.display(), "opening engine");
    let engine = Engine::open(&data_dir, &config).map_err(CliError::internal)?;

    match &cli.command {
        Commands::Index { records } => run_index(&engine, records, cli.json),
        Commands::Query { request } => run_query(&engine, request, cli.json),
        Commands::Stats => {
            let stats = engine.stats().map_err(CliError::internal)?;
            if cli.json {
                return emit_json(&stats);
            }
            for class in EntityClass::ALL {
                let store = engine.coordinator().vector_store(class);
                let info = VectorStoreInfo::from_store(store.as_ref());
                println!(
                    "{class}: {info}, {} lists, {} documents",
                    stats.vectors.get(class).lists,
                    stats.text_documents.get(class),
                );
            }
            let c = &stats.coordinator;
            println!(
                "writes: {} applied, {} reconciled, {} duplicate, {} stale, {} rejected",
                c.applied, c.reconciled, c.duplicate, c.stale, c.rejected
            );
            println!(
                "faults: {} degraded, {} failed, {} pending",
                c.degraded, c.failed, c.fault_marks
            );
            println!("tracked ids: {}", c.tracked_ids);
            Ok(())
        }
        Commands::Faults => {
            let marks = engine.coordinator().fault_marks();
            if cli.json {
                return emit_json(&marks);
            }
            if marks.is_empty() {
                println!("no pending fault marks");
            }
            for mark in marks {
                let kind = match &mark.kind {
                    FaultKind::Degraded { failed } => format!("degraded ({failed} failed)"),
                    FaultKind::Failed => "failed".to_string(),
                };
                println!(
                    "{} {} v{} {kind} at {}: {}",
                    mark.class,
                    mark.id,
                    mark.version,
                    mark.marked_at.to_rfc3339(),
                    mark.cause
                );
            }
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

#[derive(Debug, Serialize)]
struct IndexSummary {
    propagation: PropagationReport,
    checkpoint: CheckpointSummary,
}

fn run_index(engine: &Engine, path: &Path, json: bool) -> CliResult {
    let input = read_input(path).map_err(CliError::invalid_input)?;
    let records = parse_records(&input).map_err(CliError::invalid_input)?;
    info!(records = records.len(), "submitting write records");

    let (handle, join) = engine.spawn_propagation().map_err(CliError::internal)?;
    for record in records {
        handle.submit(record)?;
    }
    handle.flush()?;
    handle.shutdown()?;
    let report = join
        .join()
        .map_err(|_| CliError::new(1, "internal", "propagation worker panicked"))?;
    let checkpoint = engine.checkpoint().map_err(CliError::internal)?;

    let failures = report.failed;
    let received = report.received;
    let summary = IndexSummary {
        propagation: report,
        checkpoint,
    };
    if json {
        emit_json(&summary)?;
    } else {
        let r = &summary.propagation;
        println!(
            "{} records: {} applied, {} reconciled, {} duplicate, {} stale, {} superseded, {} failed",
            r.received, r.applied, r.reconciled, r.duplicate, r.stale, r.compacted, failures
        );
        for err in &r.errors {
            eprintln!("  {err}");
        }
        println!(
            "checkpoint: {} vectors, {} ledger entries, {} fault marks",
            checkpoint.vectors, checkpoint.ledger_entries, checkpoint.fault_marks
        );
    }

    if failures > 0 {
        return Err(CliError::new(
            6,
            "write_failed",
            format!("{failures} of {received} writes did not complete"),
        )
        .with_hint("re-submit the same records to reconcile; see `talent-match faults`")
        .retryable());
    }
    Ok(())
}

fn run_query(engine: &Engine, path: &Path, json: bool) -> CliResult {
    let input = read_input(path).map_err(CliError::invalid_input)?;
    let request: RetrievalRequest = serde_json::from_str(&input)
        .with_context(|| format!("parsing retrieval request {}", path.display()))
        .map_err(CliError::invalid_input)?;
    let response = engine.query(&request)?;
    if json {
        return emit_json(&response);
    }
    print_response(&response);
    Ok(())
}

fn print_response(response: &QueryResponse) {
    if response.partial {
        eprintln!("warning: results are partial (a source failed or a write was not yet visible)");
    }
    if response.results.is_empty() {
        println!("no matches");
        return;
    }
    for hit in &response.results {
        let distance = hit
            .vector_distance
            .map_or_else(|| "-".to_string(), |d| format!("{d:.4}"));
        let text = hit
            .text_score
            .map_or_else(|| "-".to_string(), |s| format!("{s:.3}"));
        println!(
            "{:>3}. {:<24} score {:.4}  distance {distance}  text {text}  v{}",
            hit.rank, hit.id, hit.fused_score, hit.version
        );
    }
}

fn emit_json<T: Serialize>(value: &T) -> CliResult {
    let out = serde_json::to_string_pretty(value)
        .context("serializing output")
        .map_err(CliError::internal)?;
    println!("{out}");
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Parse JSON Lines write records; blank lines are skipped.
pub fn parse_records(input: &str) -> anyhow::Result<Vec<IndexWriteRecord>> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid write record", idx + 1))
        })
        .collect()
}
