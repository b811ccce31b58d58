#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # quickgate
//!
//! Browser remote-access gateway. A web client opens interactive sessions to
//! SSH, RDP, VNC, Telnet, and Kubernetes targets over a single WebSocket;
//! graphical protocols are proxied through a guacd daemon speaking the
//! Guacamole wire protocol, SSH terminals are bridged natively.
//!
//! ## API surface
//!
//! | Method | Path                      | Description                          |
//! |--------|---------------------------|--------------------------------------|
//! | GET    | `/api/health`             | Liveness probe                       |
//! | POST   | `/quick`                  | Allocate a session id                |
//! | GET    | `/quick/{id}/tunnel`      | Guacamole proxy WebSocket            |
//! | GET    | `/quick/{id}/ssh`         | Native terminal WebSocket            |
//! | GET    | `/quick/{id}/monitor`     | Read-only observer WebSocket         |
//! | POST   | `/quick/{id}/disconnect`  | Force-close a session                |
//! | POST   | `/quick/{id}/ls`          | List directory                       |
//! | GET    | `/quick/{id}/download`    | Download file                        |
//! | POST   | `/quick/{id}/upload`      | Upload files (multipart)             |
//! | POST   | `/quick/{id}/edit`        | Replace text file content            |
//! | POST   | `/quick/{id}/mkdir`       | Create directory                     |
//! | POST   | `/quick/{id}/rm`          | Remove file or directory             |
//! | POST   | `/quick/{id}/rename`      | Rename file or directory             |
//!
//! File-management calls route by the `{protocol}_` session-id prefix: ssh
//! sessions use the live connection's SFTP channel, everything else a
//! sandboxed local folder under the drive root.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use quickgate::routes;
use quickgate::sessions::codes;
use quickgate::ws;
use quickgate::{AppState, Config, SessionRegistry};

/// Browser remote-access gateway.
#[derive(Parser)]
#[command(name = "quickgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("quickgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("guacd at {}", config.guacd.addr());
    info!("Listening on {}", config.server.listen);

    if let Err(err) = config.ensure_directories().await {
        error!("Cannot create data directories: {err}");
        std::process::exit(1);
    }

    let state = AppState {
        config: Arc::new(config),
        registry: SessionRegistry::new(),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/quick", post(routes::session::create))
        .route("/quick/{id}/disconnect", post(routes::session::disconnect))
        .route("/quick/{id}/tunnel", get(ws::guac::tunnel_ws))
        .route("/quick/{id}/ssh", get(ws::term::term_ws))
        .route("/quick/{id}/monitor", get(ws::term::monitor_ws))
        .route("/quick/{id}/ls", post(routes::storage::ls))
        .route("/quick/{id}/download", get(routes::storage::download))
        .route("/quick/{id}/upload", post(routes::storage::upload))
        .route("/quick/{id}/edit", post(routes::storage::edit))
        .route("/quick/{id}/mkdir", post(routes::storage::mkdir))
        .route("/quick/{id}/rm", post(routes::storage::rm))
        .route("/quick/{id}/rename", post(routes::storage::rename))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Cannot bind {}: {err}", state.config.server.listen);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        error!("Server error: {err}");
    }

    // Tear down every live session before exiting so clients get a close
    // notification instead of a dropped socket.
    state
        .registry
        .clear(codes::NORMAL, "Server shutting down")
        .await;
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(err) => {
                error!("Cannot register SIGTERM handler: {err}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
