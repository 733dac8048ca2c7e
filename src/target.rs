// target.rs
// One table being reorganized, as described by the repack.tables view.

use std::fmt;

/// Statements the replay primitive runs for each batch of log rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStatements {
    pub peek: String,
    pub insert: String,
    pub delete: String,
    pub update: String,
    pub pop: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgTarget {
    /// Display name, schema-qualified.
    pub name: String,
    pub oid: u32,
    pub create_pktype: String,
    pub create_log: String,
    pub create_trigger: String,
    pub enable_trigger: String,
    /// `CREATE TABLE AS SELECT`, with the ORDER BY already appended.
    pub create_table: String,
    pub drop_columns: Option<String>,
    pub delete_log: String,
    pub lock_table: String,
    pub replay: ReplayStatements,
}

impl ReorgTarget {
    pub fn log_table(&self) -> String {
        format!("repack.log_{}", self.oid)
    }

    pub fn shadow_table(&self) -> String {
        format!("repack.table_{}", self.oid)
    }

    pub fn pk_type(&self) -> String {
        format!("repack.pk_{}", self.oid)
    }

    /// Name of the shadow copy of index `index_oid`.
    pub fn shadow_index(index_oid: u32) -> String {
        format!("index_{index_oid}")
    }
}

impl fmt::Display for ReorgTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
