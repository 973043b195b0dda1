use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dg_server::bootstrap::{self, RuntimeConfig};
use dg_server::config::AppConfig;
use dg_server::handler::{self, AppState};
use tracing::info;

#[derive(Parser)]
#[command(name = "dg", about = "datagen dataset catalog and job pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Validate configuration file and exit.
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let runtime = match load_runtime(&cli.config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Config invalid: {e:#}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::Validate) => {
            println!("Config valid: {}", cli.config.display());
        }
        Some(Command::Serve) | None => {
            if let Err(e) = serve(runtime).await {
                eprintln!("Server error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

fn load_runtime(path: &Path) -> Result<RuntimeConfig, anyhow::Error> {
    let config = AppConfig::from_file(path)
        .with_context(|| format!("reading {}", path.display()))?;
    bootstrap::into_runtime(config)
}

async fn serve(runtime: RuntimeConfig) -> Result<(), anyhow::Error> {
    bootstrap::init_tracing(&runtime.log_level, runtime.log_format)?;

    let service = bootstrap::build_service(&runtime)?;
    let state = Arc::new(AppState::new(service));
    let shutdown = state.shutdown.clone();
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(&runtime.listen_addr)
        .await
        .with_context(|| format!("binding {}", runtime.listen_addr))?;
    info!(addr = %runtime.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        })
        .await
        .context("serving http")?;
    Ok(())
}
