use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "muster")]
#[command(about = "Community event aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass against the upstream API.
    Import,
    /// Run the periodic import scheduler until interrupted.
    Schedule,
    /// Serve the read API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Import) {
        Commands::Import => {
            let record = muster_importer::run_import_once_from_env().await?;
            println!(
                "import complete: run_id={} saved={} ok=[{}] failed=[{}] errors={}",
                record.id,
                record.total_events_saved,
                record.success_group_names.join(", "),
                record.failed_group_names.join(", "),
                record.errors.len()
            );
        }
        Commands::Schedule => {
            let config = muster_importer::ImporterConfig::from_env();
            match muster_importer::maybe_build_scheduler(&config).await? {
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
                None => {
                    eprintln!("scheduler disabled; set MUSTER_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
        Commands::Serve => {
            let config = muster_importer::ImporterConfig::from_env();
            let store = muster_store::FileEventStore::open(config.data_dir.clone())
                .await
                .context("opening event store")?;
            let raw_keys = std::env::var("MUSTER_API_KEYS").unwrap_or_default();
            let api_keys = raw_keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
            let state = muster_web::AppState::new(Arc::new(store), api_keys);
            muster_web::serve_from_env(state).await?;
        }
    }

    Ok(())
}
