// metadata.rs
//! Reads per-database checks and per-table statement fragments from the
//! support schema.

use itertools::Itertools;
use tracing::debug;

use crate::config::OrderMode;
use crate::error::{ConfigError, DbError, Result};
use crate::session::{Param, Session, TextRow};
use crate::{params, sql};
use crate::target::{ReorgTarget, ReplayStatements};
use crate::version::program_version;

pub const TABLE_COLUMNS: [&str; 17] = [
    "relname",
    "relid",
    "pkid",
    "create_pktype",
    "create_log",
    "create_trigger",
    "enable_trigger",
    "create_table",
    "drop_columns",
    "delete_log",
    "lock_table",
    "ckey",
    "sql_peek",
    "sql_insert",
    "sql_delete",
    "sql_update",
    "sql_pop",
];

/// Query for the candidate tables. Named tables are bound as `$1..$n`;
/// without names every table with the keys `order` needs is selected.
pub fn tables_query(tables: &[String], order: &OrderMode) -> String {
    let filter = if tables.is_empty() {
        match order {
            OrderMode::ClusterKey => "pkid IS NOT NULL AND ckid IS NOT NULL".to_string(),
            _ => "pkid IS NOT NULL".to_string(),
        }
    } else {
        (1..=tables.len())
            .map(|i| format!("relid = ${i}::text::regclass"))
            .join(" OR ")
    };
    // relname is a regclass; read every column back as text
    format!(
        "SELECT {} FROM repack.tables WHERE {filter}",
        TABLE_COLUMNS.iter().map(|c| format!("{c}::text")).join(", ")
    )
}

/// One row of `repack.tables`, not yet checked against the requested order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub relname: String,
    pub relid: u32,
    pub pk_oid: Option<u32>,
    pub create_pktype: String,
    pub create_log: String,
    pub create_trigger: String,
    pub enable_trigger: String,
    pub create_table: String,
    pub drop_columns: Option<String>,
    pub delete_log: String,
    pub lock_table: String,
    pub ckey: Option<String>,
    pub replay: ReplayStatements,
}

impl TableRow {
    pub fn from_row(row: &TextRow) -> Result<Self, DbError> {
        let malformed = |what: &str| DbError::new("SELECT ... FROM repack.tables", None, format!("malformed {what}"));
        if row.len() < TABLE_COLUMNS.len() {
            return Err(malformed("row"));
        }
        let text = |i: usize| row[i].clone().filter(|s| !s.is_empty());
        let required = |i: usize| text(i).ok_or_else(|| malformed(TABLE_COLUMNS[i]));
        let oid = |i: usize| -> Result<Option<u32>, DbError> {
            match text(i) {
                None => Ok(None),
                Some(s) => s
                    .parse::<u32>()
                    .map(|v| (v != 0).then_some(v))
                    .map_err(|_| malformed(TABLE_COLUMNS[i])),
            }
        };
        Ok(TableRow {
            relname: required(0)?,
            relid: oid(1)?.ok_or_else(|| malformed("relid"))?,
            pk_oid: oid(2)?,
            create_pktype: text(3).unwrap_or_default(),
            create_log: text(4).unwrap_or_default(),
            create_trigger: text(5).unwrap_or_default(),
            enable_trigger: text(6).unwrap_or_default(),
            create_table: required(7)?,
            drop_columns: text(8),
            delete_log: text(9).unwrap_or_default(),
            lock_table: required(10)?,
            ckey: text(11),
            replay: ReplayStatements {
                peek: text(12).unwrap_or_default(),
                insert: text(13).unwrap_or_default(),
                delete: text(14).unwrap_or_default(),
                update: text(15).unwrap_or_default(),
                pop: text(16).unwrap_or_default(),
            },
        })
    }

    /// Check the keys this table has against what `order` needs.
    pub fn into_target(self, order: &OrderMode) -> Result<ReorgTarget, ConfigError> {
        if self.pk_oid.is_none() {
            return Err(ConfigError::NoPrimaryKey { table: self.relname });
        }
        let create_table = match order.order_key(self.ckey.as_deref()) {
            Ok(Some(key)) => format!("{} ORDER BY {key}", self.create_table),
            Ok(None) => self.create_table.clone(),
            Err(()) => return Err(ConfigError::NoClusterKey { table: self.relname }),
        };
        Ok(ReorgTarget {
            name: self.relname,
            oid: self.relid,
            create_pktype: self.create_pktype,
            create_log: self.create_log,
            create_trigger: self.create_trigger,
            enable_trigger: self.enable_trigger,
            create_table,
            drop_columns: self.drop_columns,
            delete_log: self.delete_log,
            lock_table: self.lock_table,
            replay: self.replay,
        })
    }
}

/// Every candidate table, each either ready to reorganize or carrying the
/// configuration problem that rules it out.
pub fn fetch_targets(
    session: &mut Session,
    tables: &[String],
    order: &OrderMode,
) -> Result<Vec<(String, Result<ReorgTarget, ConfigError>)>> {
    let query = tables_query(tables, order);
    let params: Vec<Param> = tables.iter().map(|t| Box::new(t.clone()) as Param).collect();
    let rows = session.execute(&query, params)?;
    let mut targets = Vec::with_capacity(rows.len());
    for row in &rows {
        let row = TableRow::from_row(row)?;
        let name = row.relname.clone();
        targets.push((name, row.into_target(order)));
    }
    debug!("{} candidate table(s)", targets.len());
    Ok(targets)
}

/// Both halves of the support schema must match this program's version.
pub fn check_support_version(session: &mut Session, database: &str) -> Result<()> {
    let rows = match session.try_execute(sql::SUPPORT_VERSION, params![])? {
        Ok(rows) => rows,
        Err(e) if e.is_not_installed() => {
            return Err(ConfigError::NotInstalled {
                database: database.to_string(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };
    let expected = program_version();
    let (library, extension) = rows
        .into_iter()
        .next()
        .map(|row| {
            let mut cols = row.into_iter();
            (cols.next().flatten(), cols.next().flatten())
        })
        .unwrap_or((None, None));
    let library = library.unwrap_or_default();
    if library != expected {
        return Err(ConfigError::VersionMismatch(format!(
            "program '{expected}' does not match database library '{library}'"
        ))
        .into());
    }
    let extension = extension.unwrap_or_default();
    if extension != expected {
        return Err(ConfigError::VersionMismatch(format!(
            "extension '{expected}' required, found extension '{extension}'"
        ))
        .into());
    }
    Ok(())
}

pub fn check_superuser(session: &mut Session) -> Result<()> {
    match session.query_value(sql::IS_SUPERUSER, params![])?.as_deref() {
        Some("on") => Ok(()),
        _ => Err(ConfigError::NotSuperuser.into()),
    }
}

pub fn list_databases(session: &mut Session) -> Result<Vec<String>> {
    Ok(session
        .execute(sql::LIST_DATABASES, params![])?
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}
