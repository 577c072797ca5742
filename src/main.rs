use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod backends;
mod config;
mod logging;
mod orchestrator;
mod resilience;
mod server;
mod streaming;
mod types;

use config::{config_from_env, load_config, Config, LogFormat, LoggingConfig};
use logging::RequestLogger;
use orchestrator::{ModelRouter, RequestOrchestrator};
use server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let from_file = Path::new(&config_path).exists();
    let config = if from_file {
        load_config(&config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path))?
    } else {
        config_from_env().context("Failed to build configuration from environment")?
    };

    init_tracing(&config.logging);

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }
    if from_file {
        tracing::info!(path = %config_path, "Configuration loaded from file");
    } else {
        tracing::info!(path = %config_path, "No configuration file, using environment");
    }
    log_config_summary(&config);

    let logger = RequestLogger::new(config.logging.clone());
    let router = Arc::new(ModelRouter::new(&config, logger.clone())?);
    let orchestrator = Arc::new(RequestOrchestrator::new(router));
    let app = build_router(AppState::new(orchestrator, logger, config.server.job_ttl()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gemini_gateway={},tower_http={}",
            logging.level, logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn log_config_summary(config: &Config) {
    let mut models: Vec<&String> = config.models.keys().collect();
    models.sort();
    tracing::info!(
        models = ?models,
        default_model = ?config.default_model,
        credentials = config.credentials.source.name(),
        "Configuration loaded successfully with {} models",
        config.models.len()
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
