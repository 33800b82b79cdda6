//! # Database Module
//!
//! This module handles all persistence for the broker. PostgreSQL holds:
//!
//! - Orders, items, payments and the per-order event log
//! - Materialized VPS instances, provision jobs and resize tasks
//! - Wallet balances with their transaction ledger
//! - Settings, automation logs, scheduled task runs and audit rows
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DATABASE LAYER                              │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │              Repository traits (repos.rs)                 │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                 │                              │                 │
//! │                 ▼                              ▼                 │
//! │  ┌──────────────────────────┐    ┌──────────────────────────┐   │
//! │  │  PgStore (queries.rs)    │    │  MemoryStore (memory.rs) │   │
//! │  │  deadpool-postgres pool  │    │  mutex-guarded state     │   │
//! │  └──────────────────────────┘    └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod models;
pub mod queries;
pub mod repos;

use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::{Config as TokioConfig, NoTls};
use tracing::{debug, error, info, warn};

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A wallet debit would take the balance below zero
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    /// A stored value could not be decoded into its model type
    #[error("Row decode failed: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl DatabaseError {
    /// Map a unique-violation into `Conflict`, passing other errors through.
    pub fn from_write(err: tokio_postgres::Error, what: &str) -> Self {
        let unique_violation = err
            .code()
            .map(|c| c == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
            .unwrap_or(false);
        if unique_violation {
            DatabaseError::Conflict(what.to_string())
        } else {
            DatabaseError::QueryError(err)
        }
    }
}

/// Database connection wrapper.
///
/// Wraps the connection pool shared by [`queries::PgStore`].
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...").await?;
/// db.run_migrations().await?;
/// let store = PgStore::new(db);
/// ```
#[derive(Clone)]
pub struct Database {
    /// The connection pool
    pool: Pool,
}

impl Database {
    /// Connect to the PostgreSQL database.
    ///
    /// Creates a pool of at most 16 connections and verifies it with a
    /// trivial query.
    ///
    /// ## Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        let tokio_config = database_url
            .parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: 16,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    ///
    /// Executes `migrations/001_initial_schema.sql` as one batch. Objects
    /// that already exist are tolerated so restarts are harmless.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        let migration_paths = [
            "migrations/001_initial_schema.sql",
            "backend/migrations/001_initial_schema.sql",
            "../migrations/001_initial_schema.sql",
        ];

        let mut migration_sql = None;
        for path in &migration_paths {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    info!("Found migration file at: {}", path);
                    migration_sql = Some(content);
                    break;
                }
                Err(e) => debug!("Tried path '{}': {}", path, e),
            }
        }

        let migration_sql = migration_sql.ok_or_else(|| {
            error!("Could not find migration file. Tried paths: {:?}", migration_paths);
            DatabaseError::MigrationError(format!(
                "Could not find migration file. Tried paths: {:?}",
                migration_paths
            ))
        })?;

        match client.batch_execute(&migration_sql).await {
            Ok(_) => {
                info!("Migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                // 42P07 = duplicate_table, 42710 = duplicate_object
                let duplicate = e
                    .code()
                    .map(|code| matches!(code.code(), "42P07" | "42710"))
                    .unwrap_or(false);
                if duplicate || e.to_string().contains("already exists") {
                    warn!("Some database objects already exist: {}", e);
                    Ok(())
                } else {
                    error!("Migration execution error: {}", e);
                    Err(DatabaseError::MigrationError(e.to_string()))
                }
            }
        }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

pub use memory::MemoryStore;
pub use models::*;
pub use queries::PgStore;
pub use repos::*;
