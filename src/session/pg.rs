use std::sync::Arc;

use postgres::types::{ToSql, Type};
use postgres::{CancelToken, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;

use super::{Backend, Canceller, Connector, TextRow};
use crate::error::DbError;
use crate::sql;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Hands out pooled connections to one database, tagged with the
/// reorganizer's application name.
pub struct PgConnector {
    pool: PgPool,
    database: String,
}

impl PgConnector {
    pub fn new(base: &postgres::Config, database: &str, max_size: u32) -> Result<Self, DbError> {
        let mut config = base.clone();
        config.dbname(database);
        config.application_name(sql::APPLICATION_NAME);
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .build(manager)
            .map_err(|e| DbError::new("connect", None, e.to_string()))?;
        Ok(Self {
            pool,
            database: database.to_string(),
        })
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> Result<Box<dyn Backend>, DbError> {
        let client = self
            .pool
            .get()
            .map_err(|e| DbError::new("connect", None, e.to_string()))?;
        Ok(Box::new(PgBackend::new(client)?))
    }

    fn database(&self) -> &str {
        &self.database
    }
}

pub struct PgBackend {
    client: PooledConnection<PostgresConnectionManager<NoTls>>,
    pid: i32,
}

impl PgBackend {
    pub fn new(
        mut client: PooledConnection<PostgresConnectionManager<NoTls>>,
    ) -> Result<Self, DbError> {
        let statement = "SELECT pg_backend_pid()";
        let pid = client
            .query_one(statement, &[])
            .and_then(|row| row.try_get(0))
            .map_err(|e| to_db_error(statement, &e))?;
        Ok(Self { client, pid })
    }
}

impl Backend for PgBackend {
    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<TextRow>, DbError> {
        let rows = self
            .client
            .query(sql, params)
            .map_err(|e| to_db_error(sql, &e))?;
        rows.iter()
            .map(|row| text_row(row).map_err(|e| to_db_error(sql, &e)))
            .collect()
    }

    fn backend_pid(&self) -> i32 {
        self.pid
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn canceller(&self) -> Arc<dyn Canceller> {
        Arc::new(PgCanceller(self.client.cancel_token()))
    }
}

struct PgCanceller(CancelToken);

impl Canceller for PgCanceller {
    fn cancel(&self) -> Result<(), DbError> {
        self.0
            .cancel_query(NoTls)
            .map_err(|e| DbError::new("cancel", None, e.to_string()))
    }
}

/// Render every column the way `psql` would print it: booleans as `t`/`f`,
/// arrays as `{a,b}`, `void` as NULL.
fn text_row(row: &Row) -> Result<TextRow, postgres::Error> {
    (0..row.len()).map(|i| column_text(row, i)).collect()
}

fn column_text(row: &Row, i: usize) -> Result<Option<String>, postgres::Error> {
    let ty = row.columns()[i].type_();
    let text = if *ty == Type::VOID {
        None
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i)?
            .map(|b| if b { "t" } else { "f" }.to_string())
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i)?.map(|v| v.to_string())
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i)?.map(|v| v.to_string())
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i)?.map(|v| v.to_string())
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(i)?.map(|v| v.to_string())
    } else if *ty == Type::TEXT_ARRAY {
        row.try_get::<_, Option<Vec<String>>>(i)?
            .map(|values| format!("{{{}}}", values.join(",")))
    } else {
        row.try_get::<_, Option<String>>(i)?
    };
    Ok(text)
}

fn to_db_error(statement: &str, e: &postgres::Error) -> DbError {
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    DbError::new(statement, e.code().map(|c| c.code()), message)
}
