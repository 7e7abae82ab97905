//! # Index Harness CLI (`ixh`)
//!
//! The `ixh` binary registers repositories, indexes them inline, manages the
//! job queue, and runs the background worker.
//!
//! ## Usage
//!
//! ```bash
//! ixh --config ./config/ixh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ixh init` | Create the SQLite database and run schema migrations |
//! | `ixh source add <name>` | Register a local path or a git URL |
//! | `ixh source list` | List sources and their statuses |
//! | `ixh source remove <name>` | Purge a source's indexed data and forget it |
//! | `ixh index <source>` | Run one indexing pass inline |
//! | `ixh job enqueue <source>` | Queue a job for the worker |
//! | `ixh job cancel <id>` | Request cancellation of a job |
//! | `ixh job list` | List recent jobs |
//! | `ixh job logs <id>` | Print a job's log |
//! | `ixh worker` | Process queued jobs until Ctrl-C |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use index_harness::context::IndexOptions;
use index_harness::models::{JobStatus, JobType};
use index_harness::progress::ProgressMode;
use index_harness::{config, ingest, jobs, migrate, sources, worker};

/// Index Harness CLI: incremental, symbol-aware code indexing.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "ixh",
    about = "Index Harness: incremental, symbol-aware code indexing with a crash-safe job worker",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ixh.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// again is safe.
    Init,

    /// Manage registered sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Index a source inline, without the job queue.
    Index {
        /// Source name or id.
        source: String,

        /// Re-process every file regardless of stored fingerprints.
        #[arg(long)]
        force: bool,

        /// Report what would change without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Skip LLM summarization.
        #[arg(long)]
        skip_llm: bool,

        /// Only index paths matching this glob (repeatable).
        #[arg(long = "include")]
        include: Vec<String>,

        /// Skip paths matching this glob (repeatable).
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Progress output: off, human, or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Manage the job queue.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Run the background worker until interrupted.
    Worker,
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a local directory or a remote git repository.
    Add {
        name: String,

        /// Local directory to index.
        #[arg(long, conflicts_with = "url")]
        path: Option<PathBuf>,

        /// Git URL to clone.
        #[arg(long, required_unless_present = "path")]
        url: Option<String>,

        /// Branch to check out (remote sources only).
        #[arg(long, requires = "url")]
        branch: Option<String>,
    },

    /// List sources and their index/snippet/wiki statuses.
    List,

    /// Delete a source's file metadata and vectors, then the source itself.
    Remove { name: String },
}

#[derive(Subcommand)]
enum JobAction {
    /// Queue a job.
    Enqueue {
        /// Source name or id.
        source: String,

        /// full-index, incremental, snippet-generate, or wiki-generate.
        #[arg(long = "type", default_value = "incremental")]
        job_type: JobType,
    },

    /// Request cancellation of a pending or running job.
    Cancel { id: String },

    /// List recent jobs, newest first.
    List {
        /// Filter by status (pending, running, completed, failed, cancelled).
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print a job's log lines.
    Logs { id: String },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Source { action } => match action {
            SourceAction::Add {
                name,
                path,
                url,
                branch,
            } => {
                sources::add_source(&cfg, &name, path.as_deref(), url.as_deref(), branch).await?;
            }
            SourceAction::List => {
                sources::list_sources(&cfg).await?;
            }
            SourceAction::Remove { name } => {
                sources::remove_source(&cfg, &name).await?;
            }
        },
        Commands::Index {
            source,
            force,
            dry_run,
            skip_llm,
            include,
            exclude,
            progress,
        } => {
            let options = IndexOptions {
                skip_llm,
                force,
                dry_run,
                verbose: cli.verbose,
                include,
                exclude,
                ..Default::default()
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_index(&cfg, &source, options, mode).await?;
        }
        Commands::Job { action } => match action {
            JobAction::Enqueue { source, job_type } => {
                jobs::enqueue_job(&cfg, &source, job_type).await?;
            }
            JobAction::Cancel { id } => {
                jobs::cancel_job(&cfg, &id).await?;
            }
            JobAction::List { status, limit } => {
                jobs::list_jobs(&cfg, status, limit).await?;
            }
            JobAction::Logs { id } => {
                jobs::show_logs(&cfg, &id).await?;
            }
        },
        Commands::Worker => {
            worker::run_worker(&cfg).await?;
        }
    }

    Ok(())
}
