use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codenexus::config::load_config;
use codenexus::embedder::global_embedder;
use codenexus::history;
use codenexus::orchestrator::index_project;
use codenexus::query;
use codenexus::server::run_stdio_server;
use codenexus::store::Store;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

const SPINNER_TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn phase_spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(SPINNER_TICKS),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

#[derive(Debug, Parser)]
#[command(name = "codenexus")]
#[command(version)]
#[command(about = "Local per-project code-intelligence index: symbol extraction, hybrid BM25+vector search, and git history over an MCP stdio server.")]
struct Cli {
    /// Project directory. Defaults to the current directory.
    #[arg(long, global = true)]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server
    Mcp,
    /// Run a full incremental index pass over the project
    Index,
    /// Print index status and row counts
    Status,
    /// Hybrid search over indexed symbols
    SearchCode {
        query: String,
        #[arg(long, default_value = "topic_discovery")]
        search_type: String,
    },
    /// Hybrid search over indexed documentation
    SearchDocs {
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Query local git history
    SearchHistory {
        #[arg(long, default_value = "commits")]
        search_type: String,
        query: Option<String>,
        #[arg(long)]
        target_file: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if matches!(cli.cmd, Command::Mcp) {
        return run_stdio_server(cli.directory);
    }

    let directory = match cli.directory {
        Some(d) => d,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    match cli.cmd {
        Command::Mcp => unreachable!(),
        Command::Index => {
            let cfg = load_config(&directory);
            let embedder = global_embedder(&cfg.embedding.model)?;
            let db_path = cfg.db_path(&directory);
            let mut store = Store::open(&db_path, embedder.model_name(), embedder.dimension())?;
            let mut spinner: Option<ProgressBar> = None;
            let mut last_phase = String::new();
            let mut progress = |current: usize, total: usize, phase: &str| {
                if phase != last_phase {
                    if let Some(bar) = spinner.take() {
                        bar.finish_and_clear();
                    }
                    last_phase = phase.to_string();
                    spinner = Some(phase_spinner());
                }
                if let Some(bar) = &spinner {
                    bar.set_message(format!("{phase}: {current}/{total}"));
                }
            };
            let report = index_project(&directory, &cfg, &mut store, &embedder, &mut progress)?;
            if let Some(bar) = spinner.take() {
                bar.finish_with_message("indexing complete");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status => {
            let cfg = load_config(&directory);
            let db_path = cfg.db_path(&directory);
            if !std::fs::metadata(&db_path).map(|m| m.len() > 0).unwrap_or(false) {
                println!("{}", serde_json::json!({ "indexed": false }));
            } else {
                let store = Store::open_for_read(&db_path)?;
                let stats = store.index_stats()?;
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "indexed": true, "stats": stats }))?);
            }
        }
        Command::SearchCode { query: q, search_type } => {
            let cfg = load_config(&directory);
            let embedder = global_embedder(&cfg.embedding.model)?;
            let db_path = cfg.db_path(&directory);
            let store = Store::open(&db_path, embedder.model_name(), embedder.dimension())?;
            let out = match search_type.as_str() {
                "definition" => serde_json::to_value(query::find_definition(&store, &embedder, &q, true)?)?,
                "references" => serde_json::to_value(query::find_references(&store, &directory, &q, true)?)?,
                "file_structure" => serde_json::to_value(query::get_file_structure(&store, &directory, &q)?)?,
                _ => serde_json::to_value(query::discover_topic(&store, &embedder, &q, 15, true)?)?,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::SearchDocs { query: q, top_k } => {
            let cfg = load_config(&directory);
            let embedder = global_embedder(&cfg.embedding.model)?;
            let db_path = cfg.db_path(&directory);
            let store = Store::open(&db_path, embedder.model_name(), embedder.dimension())?;
            let out = query::search_documentation(&store, &embedder, &q, top_k, true)?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::SearchHistory { search_type, query: q, target_file } => {
            let repo = history::resolve(&directory)?;
            let out = match search_type.as_str() {
                "file_history" => {
                    let path = target_file.context("--target-file is required for file_history")?;
                    serde_json::to_value(history::file_history(&repo, &path, 20)?)?
                }
                "blame" => {
                    let path = target_file.context("--target-file is required for blame")?;
                    serde_json::to_value(history::blame(&repo, &path, None)?)?
                }
                "commit_detail" => {
                    let hash = q.context("commit hash is required for commit_detail")?;
                    serde_json::to_value(history::commit_detail(&repo, &hash, target_file.as_deref())?)?
                }
                _ => serde_json::to_value(history::search_commits(&repo, q.as_deref().unwrap_or(""), target_file.as_deref(), 20)?)?,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}
