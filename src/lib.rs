//! Elidune lending engine
//!
//! Lending policy for the Elidune library system: a hierarchy of subject
//! domains, per-reader borrowing limits with staff privileges, copy
//! availability and the borrow, extend and return workflow that enforces
//! them atomically against a record store.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod logging;
pub mod models;
pub mod policy;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

use policy::StaticPolicy;
use repository::{MemoryRecordStore, PgRecordStore, RecordStore};
use services::{Services, SystemClock};

/// Configuration and services shared by every caller
#[derive(Clone)]
pub struct LendingState {
    pub config: Arc<AppConfig>,
    pub services: Arc<Services>,
}

impl LendingState {
    /// Connect to Postgres, apply migrations and build the services
    pub async fn connect(config: AppConfig) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await?;
        tracing::info!("Connected to database");

        let store = PgRecordStore::new(pool);
        store.migrate().await?;
        tracing::info!("Database migrations completed");

        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build the services over the in-process store
    pub fn in_memory(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryRecordStore::new()))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn RecordStore>) -> Self {
        let policy = Arc::new(StaticPolicy::new(config.lending.clone()));
        let services = Services::new(store, policy, Arc::new(SystemClock), &config.workflow);
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
        }
    }
}
