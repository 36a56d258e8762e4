//! HTTP control server

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::call::CallManager;
use crate::config::AppConfig;
use crate::discovery::DiscoveryService;
use crate::ui::handlers;

/// Shared state behind every handler
pub struct AppState {
    pub calls: Arc<CallManager>,
    pub discovery: Arc<DiscoveryService>,
    config: Mutex<AppConfig>,
    config_path: Option<PathBuf>,
    started_at: Instant,
}

impl AppState {
    /// `config_path` is where settings changes are written back; `None` keeps them in memory
    pub fn new(
        calls: Arc<CallManager>,
        discovery: Arc<DiscoveryService>,
        config: AppConfig,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            calls,
            discovery,
            config: Mutex::new(config),
            config_path,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config.lock().clone()
    }

    /// Apply `change` and persist the result
    ///
    /// A failed write is logged; the in-memory change stands.
    pub fn update_config(&self, change: impl FnOnce(&mut AppConfig)) {
        let snapshot = {
            let mut config = self.config.lock();
            change(&mut config);
            config.clone()
        };
        if let Some(path) = &self.config_path {
            if let Err(e) = snapshot.save(path) {
                tracing::warn!("Failed to save config to {}: {}", path.display(), e);
            }
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/peers", get(handlers::get_peers))
        .route("/peers/discover", post(handlers::discover))
        .route("/call", post(handlers::start_call))
        .route("/accept", post(handlers::accept))
        .route("/reject", post(handlers::reject))
        .route("/hangup", post(handlers::hangup))
        .route("/volume", get(handlers::get_volume).post(handlers::set_volume))
        .route("/devices", get(handlers::get_devices))
        .route("/user", get(handlers::get_user).post(handlers::set_user))
        .route("/audio-devices", post(handlers::set_audio_devices))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Local HTTP control surface
pub struct ControlApi {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl ControlApi {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Control API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
