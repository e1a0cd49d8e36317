mod cli;
mod config;
mod error;
mod handlers;
mod models;
mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::config::{Environment, ServerSettings};
use crate::error::AppError;
use crate::store::FileStore;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct AppState {
    pub store: FileStore,
    pub settings: ServerSettings,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gokapi=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    // Resolved exactly once; read-only from here on
    let env = Environment::new();

    let result = match cli.command {
        None | Some(Commands::Serve) => serve(&env).await,
        Some(Commands::Env { json }) => {
            cli::print_environment(&env, json);
            Ok(())
        }
        Some(Commands::Files(command)) => cli::run_file_command(command, &env),
    };

    if let Err(e) = result {
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }
}

async fn serve(env: &Environment) -> Result<(), AppError> {
    let settings = ServerSettings::from_environment(env)?;
    let store = FileStore::new(&settings.data_dir, settings.length_id, &settings.salt_files)?;

    tracing::info!("Configuration: {}", env.config_path);
    tracing::info!("Data directory: {}", settings.data_dir);
    if settings.remote_storage {
        tracing::warn!(
            "AWS bucket '{}' is configured, but this build stores files locally",
            env.aws_bucket
        );
    }
    if settings.admin_name.is_empty() || settings.admin_password_hash.is_empty() {
        tracing::warn!(
            "GOKAPI_USERNAME or GOKAPI_PASSWORD not set, the API will reject all requests"
        );
    }

    let state = Arc::new(AppState {
        store,
        settings: settings.clone(),
    });

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match cleanup_state.store.cleanup_expired(Utc::now().timestamp()) {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed {} expired file(s)", n),
                Err(e) => tracing::warn!("Cleanup failed: {}", e),
            }
        }
    });

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Starting Gokapi on http://{} (public URL {})", addr, settings.server_url);

    axum::serve(listener, handlers::app(state)).await?;
    Ok(())
}
