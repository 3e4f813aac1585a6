use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use letsmeet_storage::{EntityStore, MemoryStore, PgStore};
use letsmeet_sync::{report_markdown, CommitMode, ImportConfig, ImportPipeline, SourceStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "letsmeet-cli")]
#[command(about = "Let's Meet legacy data import")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every enabled source from the registry.
    Import {
        /// Run against an in-memory store instead of PostgreSQL.
        #[arg(long)]
        dry_run: bool,
        /// per-source or per-record.
        #[arg(long)]
        commit_mode: Option<CommitMode>,
    },
    /// Apply the schema migrations.
    Migrate,
    /// Summarize recent import reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = ImportConfig::from_env();

    match cli.command.unwrap_or(Commands::Import {
        dry_run: false,
        commit_mode: None,
    }) {
        Commands::Import { dry_run, commit_mode } => {
            if let Some(mode) = commit_mode {
                config.commit_mode = mode;
            }
            let mut store: Box<dyn EntityStore> = if dry_run {
                Box::new(MemoryStore::new())
            } else {
                let store = PgStore::connect(&config.database_url, config.max_connections)
                    .await
                    .context("connecting to the target database")?;
                store.migrate().await.context("applying migrations")?;
                Box::new(store)
            };

            let pipeline = ImportPipeline::new(config);
            let summary = pipeline.run_once(store.as_mut()).await?;
            println!(
                "import complete: run_id={} backend={} committed={} failed={} reports={}",
                summary.run_id,
                summary.backend,
                summary.committed_sources(),
                summary.failed_sources(),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
            for source in &summary.sources {
                if source.status == SourceStatus::Failed {
                    eprintln!(
                        "source {} failed: {}",
                        source.source_id,
                        source.message.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if let Some(t) = summary.totals {
                println!(
                    "totals: addresses={} users={} hobbies={} user_hobbies={} friendships={}",
                    t.addresses, t.users, t.hobbies, t.user_hobbies, t.friendships
                );
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.max_connections)
                .await
                .context("connecting to the target database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Report { runs } => {
            print!("{}", report_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
