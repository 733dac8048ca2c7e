use std::time::Duration;

use crate::args::Args;
use crate::error::ConfigError;

/// How the shadow copy is ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderMode {
    /// Re-cluster on the table's cluster key (CLUSTER).
    ClusterKey,
    /// Order by user-supplied columns.
    Columns(String),
    /// No ORDER BY: plain compaction (VACUUM FULL).
    Unordered,
}

impl OrderMode {
    pub fn from_flags(order_by: Option<String>, no_order: bool) -> Result<Self, ConfigError> {
        match (order_by, no_order) {
            (Some(_), true) => Err(ConfigError::InvalidOptions(
                "--order-by and --no-order cannot be used together".into(),
            )),
            (Some(columns), false) if columns.trim().is_empty() => Ok(OrderMode::Unordered),
            (Some(columns), false) => Ok(OrderMode::Columns(columns)),
            (None, true) => Ok(OrderMode::Unordered),
            (None, false) => Ok(OrderMode::ClusterKey),
        }
    }

    /// The ORDER BY key for a table whose cluster key is `ckey`. `None` inside
    /// `Ok` means an unordered copy; `Err(())` means cluster-key mode was asked
    /// for and the table has none.
    pub fn order_key<'a>(&'a self, ckey: Option<&'a str>) -> Result<Option<&'a str>, ()> {
        match self {
            OrderMode::ClusterKey => ckey.map(Some).ok_or(()),
            OrderMode::Columns(columns) => Ok(Some(columns.as_str())),
            OrderMode::Unordered => Ok(None),
        }
    }
}

/// Which tables one run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every eligible table of one database.
    Database,
    /// The named tables of one database.
    Tables(Vec<String>),
    /// Every eligible table of every database that accepts connections.
    AllDatabases,
}

#[derive(Debug, Clone)]
pub struct ReorgConfig {
    pub connection: postgres::Config,
    pub dbname: String,
    pub scope: Scope,
    pub order: OrderMode,
    pub wait_timeout: Duration,
    pub jobs: usize,
    pub analyze: bool,
    pub dry_run: bool,
}

impl ReorgConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let connection: postgres::Config = args
            .uri
            .parse()
            .map_err(|e| ConfigError::InvalidOptions(format!("invalid connection string: {e}")))?;
        let scope = match (args.all, args.tables.is_empty()) {
            (true, false) => {
                return Err(ConfigError::InvalidOptions(
                    "cannot reorganize specific table(s) in all databases".into(),
                ));
            }
            (true, true) => Scope::AllDatabases,
            (false, false) => Scope::Tables(args.tables.clone()),
            (false, true) => Scope::Database,
        };
        let dbname = args
            .dbname
            .clone()
            .or_else(|| connection.get_dbname().map(str::to_string))
            .or_else(|| connection.get_user().map(str::to_string))
            .unwrap_or_else(|| "postgres".to_string());
        Ok(ReorgConfig {
            connection,
            dbname,
            scope,
            order: OrderMode::from_flags(args.order_by.clone(), args.no_order)?,
            wait_timeout: Duration::from_secs(args.wait_timeout),
            jobs: args.jobs,
            analyze: !args.no_analyze,
            dry_run: args.dry_run,
        })
    }

    /// Exactly one `--table`: failures abort the run instead of being skipped.
    pub fn single_table(&self) -> bool {
        matches!(&self.scope, Scope::Tables(tables) if tables.len() == 1)
    }

    pub fn tables(&self) -> &[String] {
        match &self.scope {
            Scope::Tables(tables) => tables,
            _ => &[],
        }
    }

    /// Sessions one database needs: primary, peer, workers, and one spare
    /// for reconnects during cleanup.
    pub fn pool_size(&self) -> u32 {
        let workers = if self.jobs > 1 { self.jobs } else { 0 };
        (workers + 3) as u32
    }
}
