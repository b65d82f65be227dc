//! ObfusQ Server
//!
//! HTTP server that accepts Luau scripts from the browser front-end,
//! runs them through the external obfuscator and returns the result.

mod assets;
mod errors;
mod handlers;

pub use errors::ApiError;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use obfusq_core::{ObfusqConfig, Pipeline, PresetSelection, ServerSection, DEFAULT_MAX_SOURCE_BYTES};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Largest accepted request body
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            max_payload_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            port: section.port,
            host: section.host.clone(),
            max_payload_bytes: section.max_payload_bytes,
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Runs obfuscation requests
    pub pipeline: Pipeline,

    /// Used by the raw text endpoint when no preset is given
    pub default_selection: PresetSelection,
}

impl AppState {
    pub fn new(pipeline: Pipeline, default_selection: PresetSelection) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            default_selection,
        })
    }

    pub fn from_config(config: &ObfusqConfig) -> Arc<Self> {
        Self::new(config.build_pipeline(), config.obfuscator.default_selection())
    }
}

/// Create the main router
pub fn create_router(state: Arc<AppState>, max_payload_bytes: usize) -> Router {
    Router::new()
        // Front-end
        .route("/", get(assets::serve_index))
        .route("/index.html", get(assets::serve_index))
        .route("/app.js", get(assets::serve_js))
        .route("/styles.css", get(assets::serve_css))
        // Obfuscation endpoints (JSON and raw text profiles)
        .route("/api/obfuscate", post(handlers::handle_obfuscate_json))
        .route("/obfuscate", post(handlers::handle_obfuscate_raw))
        .route("/api/presets", get(handlers::handle_presets))
        // Health check
        .route("/health", get(handle_health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// A configured server that has not been started yet
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Bind the listener and start serving in the background
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = listener.local_addr()?;

        let router = create_router(self.state, self.config.max_payload_bytes);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    // A dropped sender also counts as a stop request
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
        });

        tracing::info!("ObfusQ server listening on http://{}", local_addr);

        Ok(ServerHandle {
            local_addr,
            shutdown: ShutdownTrigger(Arc::new(shutdown_tx)),
            task,
        })
    }
}

/// Requests a graceful shutdown. Clones share the same server.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    /// Ask the server to stop. Returns `true` only for the call that
    /// actually initiated shutdown.
    pub fn trigger(&self) -> bool {
        let initiated = self.0.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if initiated {
            tracing::info!("Shutting down server");
        }
        initiated
    }
}

/// Handle to a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: ShutdownTrigger,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Ask the server to stop; see [`ShutdownTrigger::trigger`]
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger()
    }

    /// Wait until the server has stopped and in-flight requests finished
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task
            .await
            .context("Server task panicked")?
            .context("Server error")
    }

    /// Shut down and wait
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown();
        self.wait().await
    }
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM, returning the signal name
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Start the server and run until a shutdown signal arrives
pub async fn run_server(config: ServerConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let handle = Server::new(config, state).start().await?;
    tracing::info!("API endpoint: http://{}/api/obfuscate", handle.local_addr());
    tracing::info!("Health check: http://{}/health", handle.local_addr());

    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        tracing::info!("{} received, shutting down gracefully", signal);
        trigger.trigger();
    });

    handle.wait().await
}
