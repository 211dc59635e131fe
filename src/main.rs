//! # asr-server - Main Application Entry Point
//!
//! HTTP front end for a Whisper speech-to-text model.
//!
//! ## Application Architecture:
//! - **config**: startup configuration (defaults, optional file, environment)
//! - **state**: the configuration and model handle shared by handlers
//! - **health**: liveness endpoint
//! - **handlers**: the transcription endpoint
//! - **scratch**: per-request temporary audio files
//! - **transcription**: the speech model seam and the Whisper runtime
//! - **audio**: decoding, voice activity detection and mel filters
//! - **middleware**: request logging
//! - **error**: error types and their HTTP responses
//!
//! ## Startup:
//! The model is loaded before the listener binds. If it cannot be loaded the
//! process exits with an error instead of serving 503s forever.

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod scratch;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::WhisperEngine;

#[actix_web::main]
async fn main() -> Result<()> {
    // a missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    info!("Starting asr-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {} (model={}, device={}, compute_type={}, language={}, beam_size={})",
        config.bind_addr(),
        config.asr.model_id,
        config.asr.device,
        config.asr.compute_type,
        config.asr.language,
        config.asr.beam_size
    );

    let load_start = std::time::Instant::now();
    let engine = WhisperEngine::load(&config.asr)
        .await
        .with_context(|| format!("loading speech model '{}'", config.asr.model_id))?;
    info!(
        "Speech model ready in {:.2}s",
        load_start.elapsed().as_secs_f64()
    );

    let bind_addr = config.bind_addr();
    let leaked_scratch_files = Arc::new(AtomicUsize::new(0));
    let app_state = AppState::new(config)
        .with_model(Arc::new(engine))
        .with_cleanup_observer(Arc::new(move |path: &Path, err: &std::io::Error| {
            let total = leaked_scratch_files.fetch_add(1, Ordering::Relaxed) + 1;
            error!(
                path = ?path,
                error = %err,
                leaked_total = total,
                "Scratch file left behind"
            );
        }));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure_routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `asr_server=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("initialising tracing")?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
