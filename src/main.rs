// GTFS schedule sync - entry point
// `serve` exposes the HTTP trigger, `update` runs the pipeline once, `check-flags` guards deploys.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use gtfs_schedule_sync::logging::{init_logging, LogFormat};
use gtfs_schedule_sync::server::{run_server, AppState};
use gtfs_schedule_sync::{Config, Pipeline, Store};

#[derive(Parser)]
#[command(name = "gtfs-schedule-sync", version, about = "Sync the published GTFS schedule into a local store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve POST /update and the read-only endpoints
    Serve {
        #[arg(long, env = "SERVER_HOST")]
        host: Option<String>,
        #[arg(long, env = "SERVER_PORT")]
        port: Option<u16>,
    },
    /// Run the pipeline once and print the outcome as JSON
    Update,
    /// Fail if any test-only flag is enabled
    CheckFlags,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(LogFormat::from_env());

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Command::CheckFlags => {
            let violations = config.flags.production_violations();
            if violations.is_empty() {
                info!("All test flags are off");
                return Ok(());
            }
            for name in &violations {
                error!(flag = name, "Test flag is enabled, must be off before deploying");
            }
            std::process::exit(1);
        }
        Command::Update => {
            let store = Store::connect(&config.database_url, config.database_max_connections)
                .await
                .context("Failed to open store")?;
            let pipeline = Pipeline::new(config, store);

            match pipeline.run().await {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Update failed");
                    std::process::exit(1);
                }
            }
        }
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server_host.clone());
            let port = port.unwrap_or(config.server_port);

            let store = Store::connect(&config.database_url, config.database_max_connections)
                .await
                .context("Failed to open store")?;
            let state = AppState::new(Pipeline::new(config, store));

            run_server(state, &host, port).await?;
            Ok(())
        }
    }
}
