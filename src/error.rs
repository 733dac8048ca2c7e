use std::time::Duration;
use thiserror::Error;

/// SQLSTATE raised when a statement is cancelled, including by `statement_timeout`.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";
/// SQLSTATE raised when the `repack` support schema does not exist.
pub const SQLSTATE_INVALID_SCHEMA_NAME: &str = "3F000";

/// A failed database call, carrying the statement that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("query failed: {message} (sqlstate {}), query was: {statement}", .sqlstate.as_deref().unwrap_or("none"))]
pub struct DbError {
    pub statement: String,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(statement: &str, sqlstate: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            statement: statement.to_string(),
            sqlstate: sqlstate.map(str::to_string),
            message: message.into(),
        }
    }

    /// Lock-wait cancelled by `statement_timeout` or by a cancel request.
    pub fn is_query_canceled(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_QUERY_CANCELED)
    }

    /// The reorganizer's support schema is not installed in this database.
    pub fn is_not_installed(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_INVALID_SCHEMA_NAME)
    }
}

/// Per-table or per-database configuration problems. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("relation \"{table}\" must have a primary key or not-null unique keys")]
    NoPrimaryKey { table: String },

    #[error("relation \"{table}\" has no cluster key")]
    NoClusterKey { table: String },

    #[error("trigger {trigger} conflicted for {table}")]
    TriggerConflict { table: String, trigger: String },

    #[error("another reorganizer is already working on \"{table}\"")]
    AlreadyRunning { table: String },

    #[error("pg_repack is not installed in the database \"{database}\"")]
    NotInstalled { database: String },

    #[error("{0}")]
    VersionMismatch(String),

    #[error("you must be a superuser to use pg_repack")]
    NotSuperuser,

    #[error("unsupported server version {0}")]
    UnsupportedServer(i32),

    #[error("unexpected index definition: {0}")]
    UnexpectedIndexDef(String),

    #[error("{0}")]
    InvalidOptions(String),
}

#[derive(Error, Debug)]
pub enum ReorgError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("error with create index {index}: {source}")]
    IndexBuild {
        index: String,
        #[source]
        source: DbError,
    },

    #[error("could not lock \"{table}\" within {elapsed:?}")]
    LockTimeout { table: String, elapsed: Duration },

    #[error("could not connect to database \"{database}\": {reason}")]
    Connect { database: String, reason: String },

    #[error("connection lost on {session} session: {reason}")]
    ConnectionLost { session: String, reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error("{session} session is {actual}, expected {expected}")]
    SessionState {
        session: String,
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T, E = ReorgError> = std::result::Result<T, E>;

impl ReorgError {
    /// Errors after which no further table or database may be attempted.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::ConnectionLost { .. } | Self::Interrupted
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Whether the failure means the support schema is missing from the database.
    pub fn is_not_installed(&self) -> bool {
        match self {
            Self::Config(ConfigError::NotInstalled { .. }) => true,
            Self::Db(e) => e.is_not_installed(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Connect { .. } | Self::ConnectionLost { .. } => 3,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}
