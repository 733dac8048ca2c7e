//! Fixed statements issued by the reorganizer itself. Per-table statements
//! come from the `repack.tables` view and are executed verbatim.

/// Application name every reorganizer session connects with, so that peer
/// reorganizers can be left out of each other's transaction snapshots.
pub const APPLICATION_NAME: &str = "pg_repack";

/// Name of the capture trigger. Triggers fire in name order, so this must sort last.
pub const CAPTURE_TRIGGER: &str = "z_repack_trigger";

pub const SESSION_SETUP: &[&str] = &[
    "SET statement_timeout = 0",
    "SET search_path = pg_catalog, pg_temp, public",
    "SET client_min_messages = warning",
];

pub const BEGIN_READ_COMMITTED: &str = "BEGIN ISOLATION LEVEL READ COMMITTED";
pub const BEGIN_SERIALIZABLE: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";
pub const RESET_STATEMENT_TIMEOUT: &str = "RESET statement_timeout";

pub const SERVER_VERSION: &str = "SHOW server_version_num";
pub const IS_SUPERUSER: &str = "SELECT current_setting('is_superuser')";
pub const SUPPORT_VERSION: &str = "SELECT repack.version(), repack.version_sql()";
pub const LIST_DATABASES: &str = "SELECT datname FROM pg_database WHERE datallowconn ORDER BY 1";

pub const TRY_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1::bigint)";
pub const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1::bigint)";

pub const CONFLICTED_TRIGGERS: &str = "SELECT repack.conflicted_triggers($1::oid)";
pub const DISABLE_AUTOVACUUM: &str = "SELECT repack.disable_autovacuum($1::text::regclass)";

pub const COPY_WORK_MEM: &str =
    "SELECT set_config('work_mem', current_setting('maintenance_work_mem'), true)";
pub const DISABLE_SYNC_SEQSCANS: &str = "SET LOCAL synchronize_seqscans = off";

/// Active virtual transactions, leaving out our own sessions, the bgwriter
/// lock of a freshly promoted server, peer reorganizers, and sessions
/// connected to other databases.
pub const XID_SNAPSHOT_90200: &str = "SELECT array_agg(l.virtualtransaction) \
      FROM pg_locks AS l \
      LEFT JOIN pg_stat_activity AS a \
        ON l.pid = a.pid \
      WHERE l.locktype = 'virtualxid' \
      AND l.pid NOT IN (pg_backend_pid(), $1::integer) \
      AND (l.virtualxid, l.virtualtransaction) <> ('1/1', '-1/0') \
      AND (a.application_name IS NULL OR a.application_name <> $2::text) \
      AND (a.datname IS NULL OR a.datname = current_database())";

pub const XID_SNAPSHOT_90000: &str = "SELECT array_agg(l.virtualtransaction) \
      FROM pg_locks AS l \
      LEFT JOIN pg_stat_activity AS a \
        ON l.pid = a.procpid \
      WHERE l.locktype = 'virtualxid' \
      AND l.pid NOT IN (pg_backend_pid(), $1::integer) \
      AND (l.virtualxid, l.virtualtransaction) <> ('1/1', '-1/0') \
      AND (a.application_name IS NULL OR a.application_name <> $2::text)";

/// Backends still running one of the transactions captured in a snapshot.
pub const XID_ALIVE: &str = "SELECT pid FROM pg_locks WHERE locktype = 'virtualxid' \
      AND pid <> pg_backend_pid() AND virtualtransaction = ANY($1::text[])";

/// Any session holding or awaiting a lock on the relation.
pub const CANCEL_CONFLICTING: &str = "SELECT pg_cancel_backend(pid) FROM pg_locks \
      WHERE locktype = 'relation' AND relation = $1::oid AND pid <> pg_backend_pid()";
pub const TERMINATE_CONFLICTING: &str = "SELECT pg_terminate_backend(pid) FROM pg_locks \
      WHERE locktype = 'relation' AND relation = $1::oid AND pid <> pg_backend_pid()";

/// Ungranted ACCESS EXCLUSIVE waiters only: disallowed DDL queued behind us.
pub const CANCEL_COMPETING_DDL: &str = "SELECT pg_cancel_backend(pid) FROM pg_locks \
      WHERE locktype = 'relation' AND granted = false AND relation = $1::oid \
      AND mode = 'AccessExclusiveLock' AND pid <> pg_backend_pid()";
pub const TERMINATE_COMPETING_DDL: &str = "SELECT pg_terminate_backend(pid) FROM pg_locks \
      WHERE locktype = 'relation' AND granted = false AND relation = $1::oid \
      AND mode = 'AccessExclusiveLock' AND pid <> pg_backend_pid()";

pub const INVALID_INDEXES: &str =
    "SELECT pg_get_indexdef(indexrelid) FROM pg_index WHERE indrelid = $1::oid AND NOT indisvalid";
pub const VALID_INDEXES: &str = "SELECT indexrelid, pg_get_indexdef(indexrelid) \
      FROM pg_index WHERE indrelid = $1::oid AND indisvalid ORDER BY indexrelid";

pub const APPLY_LOG: &str = "SELECT repack.repack_apply($1::text::cstring, $2::text::cstring, \
      $3::text::cstring, $4::text::cstring, $5::text::cstring, $6::integer)";
pub const SWAP: &str = "SELECT repack.repack_swap($1::oid)";
pub const DROP: &str = "SELECT repack.repack_drop($1::oid)";

pub fn set_local_statement_timeout(msec: u64) -> String {
    format!("SET LOCAL statement_timeout = {msec}")
}

pub fn lock_access_share(table: &str) -> String {
    format!("LOCK TABLE {table} IN ACCESS SHARE MODE")
}

pub fn analyze(table: &str) -> String {
    format!("ANALYZE {table}")
}

pub fn savepoint(name: &str) -> String {
    format!("SAVEPOINT {name}")
}

pub fn rollback_to_savepoint(name: &str) -> String {
    format!("ROLLBACK TO SAVEPOINT {name}")
}
