use std::path::PathBuf;

use anyhow::Result;
use autotest::config::{AppConfig, LogFormat, LoggingConfig};
use autotest::storage::{RunStore, SqliteRunStore};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "autotest",
    about = "Background browser test runs with live event streams",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $AUTOTEST_CONFIG, then /etc/autotest/autotest.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding run records
    #[arg(long, global = true, env = "AUTOTEST_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + run queue)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Maximum number of runs executing at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Inspect stored runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Mark every run still QUEUED or RUNNING as failed. Run only while the daemon is stopped.
    Repair,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent runs
    List {
        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one run with its events
    Show {
        /// Run id
        id: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteRunStore> {
    let pool = autotest::storage::open_pool(&config.storage.db_path)?;
    Ok(SqliteRunStore::new(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind, concurrency } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(n) = concurrency {
                config.queue.concurrency = n;
            }
            tracing::info!(bind = %config.server.bind, "Starting autotest daemon");
            autotest::serve(config).await?;
        }
        Commands::Runs { action } => {
            let store = open_store(&config)?;
            match action {
                RunsAction::List { limit, json } => {
                    let runs = store.list(limit).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&runs)?);
                    } else if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!("{:<36} | {:<9} | {:<25} | Error", "Id", "Status", "Created");
                        println!("{:-<36}-|-{:-<9}-|-{:-<25}-|-{:-<20}", "", "", "", "");
                        for run in runs {
                            println!(
                                "{:<36} | {:<9} | {:<25} | {}",
                                run.id,
                                run.status,
                                run.created_at.to_rfc3339(),
                                run.error.as_deref().unwrap_or("")
                            );
                        }
                    }
                }
                RunsAction::Show { id, json } => {
                    let Some(run) = store.get(&id).await? else {
                        anyhow::bail!("Run '{}' not found", id);
                    };
                    if json {
                        println!("{}", serde_json::to_string_pretty(&run)?);
                    } else {
                        println!("\nRun {}", run.id);
                        println!("Status:    {}", run.status);
                        if let Some(started) = run.started_at {
                            println!("Started:   {}", started.to_rfc3339());
                        }
                        if let Some(completed) = run.completed_at {
                            println!("Completed: {}", completed.to_rfc3339());
                        }
                        if let Some(error) = &run.error {
                            println!("Error:     {}", error);
                        }
                        println!("\nEvents:");
                        for event in run.events() {
                            match event {
                                autotest::model::Event::Log { data, .. } => {
                                    println!(" - [{:?}] {}", data.level, data.message)
                                }
                                autotest::model::Event::Screenshot { data, .. } => {
                                    println!(" - [screenshot] {}", data.label)
                                }
                            }
                        }
                        println!();
                    }
                }
            }
        }
        Commands::Repair => {
            let store = open_store(&config)?;
            let repaired = autotest::stream::fail_orphans(&store).await?;
            if repaired.is_empty() {
                println!("No orphaned runs found.");
            } else {
                for id in &repaired {
                    println!("Marked {} as FAIL", id);
                }
            }
        }
    }

    Ok(())
}
