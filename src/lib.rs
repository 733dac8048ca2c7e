//! Main library entry point for postgres-reorg.

pub mod args;
pub mod capture;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod interrupt;
pub mod lock;
pub mod metadata;
pub mod replay;
pub mod session;
pub mod snapshot;
pub mod sql;
pub mod swap;
pub mod target;
pub mod version;

// Re-export key types for ergonomic access

pub use config::{OrderMode, ReorgConfig, Scope};
pub use coordinator::{ConnectorFactory, Coordinator, DatabaseReport, TableOutcome, TableReport};
pub use error::{ConfigError, DbError, ReorgError};
pub use session::{Backend, Canceller, Connector, Session, SessionSet};
pub use target::ReorgTarget;

use std::sync::Arc;

use anyhow::{Context, Result};
use session::PgConnector;

/// Reorganize what `config` selects against a live server.
pub fn run(config: &ReorgConfig) -> Result<Vec<DatabaseReport>> {
    let base = config.connection.clone();
    let pool_size = config.pool_size();
    let factory = move |database: &str| -> error::Result<Arc<dyn Connector>> {
        let connector =
            PgConnector::new(&base, database, pool_size).map_err(|e| ReorgError::Connect {
                database: database.to_string(),
                reason: e.message,
            })?;
        Ok(Arc::new(connector))
    };
    Coordinator::new(config)
        .run(&factory)
        .with_context(|| format!("could not repack database \"{}\"", config.dbname))
}
