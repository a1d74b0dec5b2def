//! # call-bridge - Main Application Entry Point
//!
//! Starts the HTTP server that telephony platforms connect to.
//!
//! ## Routes:
//! - `GET /llm-websocket`: one WebSocket per phone call
//! - `GET /health`: liveness and call/turn counters
//!
//! ## Startup Order:
//! 1. `.env` and logging
//! 2. Configuration: loaded, then validated (invalid config aborts startup)
//! 3. Completion relay built once and shared by every call
//! 4. Server bound; runs until SIGINT/SIGTERM, then stops gracefully

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use call_bridge::config::AppConfig;
use call_bridge::relay::OpenAiRelay;
use call_bridge::state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // Fine if there is no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        provider = %config.provider.base_url,
        model = %config.provider.model,
        streaming = config.provider.stream,
        "Configuration loaded"
    );
    if config.provider.api_key.is_empty() {
        warn!("No provider API key configured; every turn will be refused by the provider");
    }

    let relay = OpenAiRelay::new(
        &config.provider,
        config.prompt.technical_incident_message.clone(),
    )?;
    let bind_addr = config.bind_address();
    let app_state = AppState::new(config, Arc::new(relay));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(TracingLogger::default())
            .configure(call_bridge::routes)
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

/// Structured console logging.
///
/// `RUST_LOG` controls the filter; defaults to `call_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the corresponding signal is simply not
/// waited for; the server keeps running.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
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
        _ = interrupt => {}
        _ = terminate => {}
    }
}
