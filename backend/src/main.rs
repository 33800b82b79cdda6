//! # VPS Broker Backend Service
//!
//! Entry point of the broker that sells and runs VPS instances on top of
//! a remote automation backend. It provides:
//!
//! - REST API for orders, payments, renewals, resizes and refunds
//! - WebSocket push of user notifications
//! - Background provision worker and lifecycle scheduler
//! - PostgreSQL (or in-memory) storage for orders, instances and wallets
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BROKER SERVICE                           │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Background Services   │  │
//! │  │  (Actix)    │  │  Server     │  │  • Provision Worker     │  │
//! │  │  /users/..  │  │  /ws/{uid}  │  │  • Scheduler            │  │
//! │  │  /admin/..  │  │             │  │    (lifecycle, resize,  │  │
//! │  │             │  │             │  │     reconcile)          │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                │                     │                 │
//! │         └────────────────┴─────────────────────┘                 │
//! │                          │                                       │
//! │  ┌───────────────────────┴───────────────────────────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  Orders · Payments · Requests · Pricing · Lifecycle        │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                       │
//! │         ┌────────────────┴────────────────┐                     │
//! │         │                                 │                      │
//! │  ┌──────┴──────┐                   ┌──────┴──────┐              │
//! │  │ PostgreSQL  │                   │ Automation  │              │
//! │  │ / memory    │                   │ HTTP / RPC  │              │
//! │  └─────────────┘                   └─────────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Set up PostgreSQL and create the database
//! 2. Copy `.env.example` to `.env` and configure
//! 3. Start the server: `cargo run` (migrations run on startup)
//!
//! `STORAGE_BACKEND=memory` runs without a database.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod automation;
mod config;
mod db;
mod errors;
mod models;
mod services;
#[cfg(test)]
mod testing;
mod utils;
mod websocket;

use automation::{GoodsTypeResolver, HttpAutomationClient};
use config::settings::SettingsReader;
use config::{AppConfig, StorageBackend};
use db::{Database, MemoryStore, PgStore, Repositories};
use services::{ServiceContext, Services};
use websocket::WsRegistry;

/// Application state shared across all handlers.
pub struct AppState {
    /// Order, payment and lifecycle services.
    pub services: Services,

    /// WebSocket connection registry for real-time notifications
    pub ws_registry: WsRegistry,
}

fn io_error(what: &str, err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", what, err))
}

/// Main entry point for the broker.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Opens the configured storage
/// 3. Wires the automation resolver and services
/// 4. Starts the provision worker and scheduler
/// 5. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vps_broker_backend=debug,broker_backend=debug"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| io_error("tracing subscriber", e))?;

    info!("🚀 Starting VPS Broker Backend Service");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| io_error("configuration", e))?;

    info!("📋 Configuration loaded");
    info!("   Storage: {:?}", config.storage_backend);
    info!("   Plugins: {}", config.automation_plugins.len());

    // =========================================
    // STEP 3: Initialize Storage
    // =========================================
    let repos = match config.storage_backend {
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| io_error("configuration", "DATABASE_URL is required"))?;
            let db = Database::connect(url).await.map_err(|e| io_error("database", e))?;
            info!("🗄️  Database connected");

            db.run_migrations().await.map_err(|e| io_error("migrations", e))?;
            info!("📦 Database migrations complete");

            Repositories::from_store(Arc::new(PgStore::new(db)))
        }
        StorageBackend::Memory => {
            warn!("⚠️  Using in-memory storage; state is lost on restart");
            Repositories::from_store(Arc::new(MemoryStore::new()))
        }
    };

    // =========================================
    // STEP 4: Initialize Services
    // =========================================
    let settings = SettingsReader::new(repos.settings.clone())
        .with_env_fallback(&config.automation_base_url, &config.automation_api_key);

    let resolver = GoodsTypeResolver::new(
        repos.catalog.clone(),
        config.automation_plugins.clone(),
        Duration::from_secs(config.plugin_rpc_timeout_secs),
        settings.clone(),
        repos.automation_logs.clone(),
    )
    .with_fallback(Arc::new(HttpAutomationClient::new(settings.clone())));

    let ws_registry = WsRegistry::new();
    info!("🔌 WebSocket registry initialized");

    let shutdown = CancellationToken::new();
    let ctx = ServiceContext::new(
        repos,
        settings,
        Arc::new(resolver),
        Arc::new(ws_registry.clone()),
        shutdown.clone(),
    );
    let services = Services::new(ctx);

    info!("🔧 Services initialized");

    // =========================================
    // STEP 5: Start Background Services
    // =========================================
    tokio::spawn(
        services
            .worker
            .clone()
            .run(Duration::from_secs(config.provision_tick_secs), shutdown.clone()),
    );
    info!("👁️  Provision worker started");

    tokio::spawn(
        services
            .scheduler
            .clone()
            .run(Duration::from_secs(config.scheduler_tick_secs), shutdown.clone()),
    );
    info!("⏰ Scheduler started");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("🛑 Shutdown signal received");
        signal_token.cancel();
    });

    let app_state = Arc::new(AppState {
        services,
        ws_registry,
    });

    // =========================================
    // STEP 6: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .configure(api::configure_routes)
            .configure(websocket::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await;

    shutdown.cancel();
    info!("👋 Broker stopped");
    result
}
