//! # tally-db
//!
//! Storage layer for tally.
//!
//! This crate provides:
//! - Connection pool management
//! - A PostgreSQL job store (`FOR UPDATE SKIP LOCKED` claim, lease-token CAS)
//! - A PostgreSQL transaction store with targeted partial updates
//! - In-memory equivalents for tests and database-less local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use tally_db::Storage;
//! use tally_core::JobStoreConfig;
//!
//! // Database-backed:
//! let storage = Storage::connect("postgres://localhost/tally", JobStoreConfig::default()).await?;
//! // Or ephemeral:
//! let storage = Storage::in_memory(JobStoreConfig::default());
//! ```

pub mod jobs;
pub mod memory;
pub mod pool;
pub mod transactions;

use std::sync::Arc;

pub use jobs::PgJobStore;
pub use memory::{MemoryJobStore, MemoryTransactionStore};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use transactions::PgTransactionStore;

// Re-export core types
pub use tally_core::*;

/// Bundle of storage handles with a clear lifecycle: constructed once at
/// startup and passed in, never ambient process-wide state.
#[derive(Clone)]
pub struct Storage {
    pub jobs: Arc<dyn JobStore>,
    pub transactions: Arc<dyn TransactionStore>,
}

impl Storage {
    /// Ephemeral in-memory storage.
    pub fn in_memory(config: JobStoreConfig) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new(config)),
            transactions: Arc::new(MemoryTransactionStore::new()),
        }
    }

    /// Connect to PostgreSQL and bootstrap the schema.
    pub async fn connect(database_url: &str, config: JobStoreConfig) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        let jobs = PgJobStore::new(pool.clone(), config);
        jobs.ensure_schema().await?;
        let transactions = PgTransactionStore::new(pool);
        transactions.ensure_schema().await?;
        Ok(Self {
            jobs: Arc::new(jobs),
            transactions: Arc::new(transactions),
        })
    }
}
