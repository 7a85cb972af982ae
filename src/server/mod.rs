//! Stand-in database server
//!
//! Serves a `MemoryTransport` over HTTP with axum, speaking the same REST
//! contract as a real CouchDB-style server. Used by `divan serve` and by the
//! end-to-end tests of `HttpTransport`.

pub mod handlers;
pub mod routes;

use axum::{extract::Extension, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::transport::{MemoryTransport, Request, Transport};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Databases created before the first request is served
    pub databases: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1".to_string(),
            http_port: 5984,
            databases: Vec::new(),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: MemoryTransport,
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("databases", &self.engine.database_names())
            .finish()
    }
}

impl AppState {
    pub fn new(engine: MemoryTransport, config: ServerConfig) -> Self {
        Self { engine, config }
    }
}

/// Router serving the REST contract
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::couch_routes())
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until the task is dropped
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    for name in &state.config.databases {
        let response = state.engine.send(Request::put().segment(name.clone())).await?;
        if response.is_success() {
            info!(database = %name, "Database created");
        } else {
            anyhow::bail!("Cannot create database {}: {}", name, response.reason());
        }
    }

    let addr = listener.local_addr()?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, router(state)).await.map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server failed: {}", e)
    })
}

/// Bind the configured address and serve
pub async fn start_server(config: ServerConfig, engine: MemoryTransport) -> anyhow::Result<()> {
    info!(
        addr = %config.http_addr,
        port = config.http_port,
        "Starting Divan stand-in server"
    );

    let addr = format!("{}:{}", config.http_addr, config.http_port);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, AppState::new(engine, config)).await
}
