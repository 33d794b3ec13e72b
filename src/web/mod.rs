//! HTTP surface of the merger: the merged playlist, the proxied stream
//! and segment endpoints, and the logo pass-through. Handlers stay thin
//! and hand the real work to the processor, the load balancer and the
//! stream coordinator.

use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::processor::PlaylistProcessor;
use crate::proxy::LoadBalancer;
use crate::streaming::CoordinatorRegistry;

pub mod handlers;

/// Shared handler state: configuration plus the long-lived service objects.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub processor: Arc<PlaylistProcessor>,
    pub balancer: Arc<LoadBalancer>,
    pub registry: Arc<CoordinatorRegistry>,
    /// Plain client for the logo pass-through
    pub client: reqwest::Client,
}

/// Bound router waiting to serve.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let app = Self::create_router(state);
        Ok(Self { app, addr })
    }

    /// Assemble every route plus the tracing and CORS layers.
    pub fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/playlist.m3u", get(handlers::serve_playlist))
            // Stream endpoints: the playlist emits the /p/ form, the bare
            // /stream/ form is equivalent.
            .route("/stream/:slug", get(handlers::serve_stream))
            .route("/p/:subpath/:slug", get(handlers::serve_stream_subpath))
            .route("/segment/:slug", get(handlers::serve_segment))
            .route("/a/:logo", get(handlers::serve_logo))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the listener and run until the process exits.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Listening on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
