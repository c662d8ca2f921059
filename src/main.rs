//! # Realtime Voice Relay - Main Application Entry Point
//!
//! A WebSocket bridge between small voice devices (ESP32-class boards with a
//! microphone and a speaker) and a realtime speech-to-speech service. Each
//! device connection gets its own upstream connection; audio is resampled and
//! re-framed in both directions.
//!
//! ## Key Rust Concepts Used:
//! - **actors**: every device connection is an actix actor owning its session
//! - **tasks and channels**: every upstream connection runs in its own tokio task
//!   and talks to its actor over bounded channels
//! - **Result<T, E>**: fallible operations return errors instead of panicking
//!
//! ## Application Architecture:
//! - **config**: configuration from defaults, `config.toml` and environment variables
//! - **state**: read-only state shared by handlers
//! - **audio**: PCM frames, resampling, base64 codec, output framing
//! - **protocol**: the upstream JSON event vocabulary
//! - **upstream**: the outbound WebSocket connector
//! - **relay**: per-session routing rules and lifecycle
//! - **websocket**: the device-facing actor and upgrade endpoint
//! - **health** / **handlers**: HTTP endpoints for operators
//! - **error**: HTTP errors and the relay error taxonomy

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod protocol;
mod relay;
mod state;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Configures the HTTP server** with the device route and operator routes
/// 4. **Handles graceful shutdown** on SIGINT/SIGTERM
///
/// Configuration problems (missing credential, bad URL) stop the process here,
/// before any device can connect.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;
    upstream::connector::install_crypto_provider();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        "Relaying {} Hz device audio to {} at {} Hz",
        config.audio.device_sample_rate,
        config.upstream_host(),
        config.audio.upstream_sample_rate
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let device_path = config.server.device_path.clone();
    let app_state = web::Data::new(AppState::new(config));

    info!("Accepting devices on ws://{}{}", bind_addr, device_path);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(|cfg| routes(cfg, &device_path))
    })
    .disable_signals()
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Route table, shared with the handler tests.
pub fn routes(cfg: &mut web::ServiceConfig, device_path: &str) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/config", web::get().to(handlers::get_config)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws/device", web::get().to(websocket::device_websocket));

    if device_path != "/ws/device" {
        cfg.route(device_path, web::get().to(websocket::device_websocket));
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: overrides the filter (e.g. `realtime_voice_relay=trace`)
/// - If not set, defaults to `realtime_voice_relay=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
///
/// If a handler cannot be installed the failure is logged and the other
/// signal still works; with neither, Ctrl+C through `tokio::signal::ctrl_c`
/// is the last resort.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| warn!("Failed to install SIGTERM handler: {}", e))
        .ok();
    let sigint = signal(SignalKind::interrupt())
        .map_err(|e| warn!("Failed to install SIGINT handler: {}", e))
        .ok();

    match (sigterm, sigint) {
        (Some(mut sigterm), Some(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        (Some(mut sigterm), None) => {
            sigterm.recv().await;
            info!("Received SIGTERM");
        }
        (None, Some(mut sigint)) => {
            sigint.recv().await;
            info!("Received SIGINT");
        }
        (None, None) => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    fn app_state() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.upstream.api_key = "sk-secret".to_string();
        web::Data::new(AppState::new(config))
    }

    #[actix_web::test]
    async fn test_health_is_served_on_both_paths() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .configure(|cfg| routes(cfg, "/")),
        )
        .await;

        for uri in ["/health", "/api/v1/health"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn test_plain_http_on_device_path_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .configure(|cfg| routes(cfg, "/")),
        )
        .await;

        // no Upgrade headers: the handshake fails before any upstream is dialed
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "bad_request");
    }
}
