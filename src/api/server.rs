// API server implementation using actix-web

use crate::api::{middleware, routes};
use crate::orchestrator::Syncer;
use crate::util::env as env_util;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;

/// Shared handler state
pub struct AppState {
    pub syncer: Arc<Syncer>,
    pub started_at: Instant,
}

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub allowed_origins: String,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        env_util::init_env();

        let host = env_util::env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match env_util::env_opt("API_PORT") {
            Some(raw) => raw.trim().parse().context("Invalid API_PORT")?,
            None => 8080,
        };
        let allowed_origins = env_util::env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            host,
            port,
            allowed_origins,
        })
    }

    /// Apply CLI overrides on top of the environment.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Start the HTTP server
    pub async fn run(self, syncer: Arc<Syncer>) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            "Starting gallery-sync API server"
        );

        let state = web::Data::new(AppState {
            syncer,
            started_at: Instant::now(),
        });
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);

            App::new()
                .app_data(state.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(cors)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
