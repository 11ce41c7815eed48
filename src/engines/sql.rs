//! SQL connection layer shared by the MySQL and PostgreSQL managers.
//!
//! [`SqlClient`] is the seam role detectors talk to.  Production uses the
//! sqlx pools below; tests substitute a scripted client.  Statements are
//! sent unprepared so that `SHOW ...` and `SET GLOBAL ...` behave exactly
//! as they would from a console.

use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, Executor, Row, ValueRef};
use tracing::debug;

use super::manager::{DbFuture, StatementRunner, UnitFuture};
use super::status_row::{rows_to_json, Cell, StatusRow};
use crate::config::{MysqlConfig, PostgresConfig};
use crate::errors::DbError;

/// Minimal statement interface over a pooled SQL connection.
pub trait SqlClient: Send + Sync {
    /// Round-trip a trivial request to prove the server is reachable.
    fn ping(&self) -> DbFuture<'_, ()>;

    /// Run a statement and return every row in engine order.
    fn query_rows<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<StatusRow>>;

    /// Run a statement and return the affected row count.
    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64>;

    /// Close the pool.  Pending checkouts are allowed to finish.
    fn close(&self) -> UnitFuture<'_> {
        Box::pin(async {})
    }
}

/// Run `sql` and return only the first row, or `None` for an empty result.
pub async fn query_first(client: &dyn SqlClient, sql: &str) -> Result<Option<StatusRow>, DbError> {
    Ok(client.query_rows(sql).await?.into_iter().next())
}

// -- Error mapping ------------------------------------------------------------

/// Translate a sqlx error.  `code_of` extracts the engine-native error code.
fn map_sqlx_error(
    err: sqlx::Error,
    code_of: impl Fn(&dyn sqlx::error::DatabaseError) -> Option<String>,
) -> DbError {
    match err {
        sqlx::Error::Database(db) => DbError::Engine {
            code: code_of(db.as_ref()),
            message: db.message().to_string(),
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => DbError::decode("sql", err.to_string()),
        sqlx::Error::Configuration(_) => DbError::config(err.to_string()),
        other => DbError::Transient(anyhow::Error::new(other)),
    }
}

/// MySQL reports numeric error codes (e.g. `1040`) separately from SQLSTATE.
fn mysql_error(err: sqlx::Error) -> DbError {
    map_sqlx_error(err, |db| {
        db.try_downcast_ref::<MySqlDatabaseError>()
            .map(|e| e.number().to_string())
            .or_else(|| db.code().map(|c| c.into_owned()))
    })
}

fn postgres_error(err: sqlx::Error) -> DbError {
    map_sqlx_error(err, |db| db.code().map(|c| c.into_owned()))
}

// -- Cell decoding ------------------------------------------------------------

/// Try each type in turn and stringify the first that decodes.  Falls back
/// to a lossy read of the raw bytes.
macro_rules! decode_cell {
    ($row:expr, $idx:expr, $($ty:ty),+ $(,)?) => {{
        let row = $row;
        let idx = $idx;
        let null = row
            .try_get_raw(idx)
            .map(|raw| raw.is_null())
            .unwrap_or(true);
        if null {
            None
        } else {
            let mut cell: Cell = None;
            $(
                if cell.is_none() {
                    if let Ok(v) = row.try_get::<$ty, _>(idx) {
                        cell = Some(v.to_string());
                    }
                }
            )+
            cell.or_else(|| {
                row.try_get_unchecked::<Vec<u8>, _>(idx)
                    .ok()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
            })
        }
    }};
}

fn mysql_row(row: &MySqlRow) -> StatusRow {
    StatusRow::new(
        row.columns()
            .iter()
            .map(|col| {
                let i = col.ordinal();
                (col.name().to_string(), decode_cell!(row, i, String, i64, u64, f64, bool))
            })
            .collect(),
    )
}

fn postgres_row(row: &PgRow) -> StatusRow {
    StatusRow::new(
        row.columns()
            .iter()
            .map(|col| {
                let i = col.ordinal();
                (
                    col.name().to_string(),
                    decode_cell!(row, i, String, bool, i64, i32, i16, f64, f32),
                )
            })
            .collect(),
    )
}

// -- MySQL --------------------------------------------------------------------

/// Pooled MySQL client.
#[derive(Clone)]
pub struct MySqlClient {
    pool: MySqlPool,
}

impl MySqlClient {
    /// Build a lazily-connecting pool; no I/O happens until first use.
    pub fn connect_lazy(cfg: &MysqlConfig) -> Self {
        let mut opts = MySqlConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password);
        if let Some(db) = &cfg.database {
            opts = opts.database(db);
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .connect_lazy_with(opts);
        debug!("MySQL pool configured for {}:{}", cfg.host, cfg.port);
        Self { pool }
    }
}

impl SqlClient for MySqlClient {
    fn ping(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(mysql_error)?;
            conn.ping().await.map_err(mysql_error)
        })
    }

    fn query_rows<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<StatusRow>> {
        Box::pin(async move {
            let rows = (&self.pool).fetch_all(sql).await.map_err(mysql_error)?;
            Ok(rows.iter().map(mysql_row).collect())
        })
    }

    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let result = (&self.pool).execute(sql).await.map_err(mysql_error)?;
            Ok(result.rows_affected())
        })
    }

    fn close(&self) -> UnitFuture<'_> {
        Box::pin(async move { self.pool.close().await })
    }
}

// -- PostgreSQL ---------------------------------------------------------------

/// Pooled PostgreSQL client.
#[derive(Clone)]
pub struct PgClient {
    pool: PgPool,
}

impl PgClient {
    pub fn connect_lazy(cfg: &PostgresConfig) -> Self {
        let opts = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database);
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .connect_lazy_with(opts);
        debug!("PostgreSQL pool configured for {}:{}", cfg.host, cfg.port);
        Self { pool }
    }
}

impl SqlClient for PgClient {
    fn ping(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(postgres_error)?;
            conn.ping().await.map_err(postgres_error)
        })
    }

    fn query_rows<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<StatusRow>> {
        Box::pin(async move {
            let rows = (&self.pool).fetch_all(sql).await.map_err(postgres_error)?;
            Ok(rows.iter().map(postgres_row).collect())
        })
    }

    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let result = (&self.pool).execute(sql).await.map_err(postgres_error)?;
            Ok(result.rows_affected())
        })
    }

    fn close(&self) -> UnitFuture<'_> {
        Box::pin(async move { self.pool.close().await })
    }
}

// -- Statements ---------------------------------------------------------------

/// [`StatementRunner`] that forwards to a [`SqlClient`].
pub struct SqlStatements {
    client: Arc<dyn SqlClient>,
}

impl SqlStatements {
    pub fn new(client: Arc<dyn SqlClient>) -> Self {
        Self { client }
    }
}

impl StatementRunner for SqlStatements {
    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let affected = self.client.exec(sql).await?;
            debug!("exec affected {} rows", affected);
            Ok(affected)
        })
    }

    fn query<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let rows = self.client.query_rows(sql).await?;
            Ok(rows_to_json(&rows))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        let err = mysql_error(sqlx::Error::PoolTimedOut);
        assert_eq!(err.code(), "TransientError");
    }

    #[tokio::test]
    async fn test_statements_render_json() {
        let sql = Arc::new(crate::engines::testing::ScriptedSql::new());
        sql.on_query(
            "select 1 as one",
            vec![StatusRow::from_pairs([("one", "1")])],
        );
        let runner = SqlStatements::new(sql.clone());
        let body = runner.query("select 1 as one").await.unwrap();
        assert_eq!(body, br#"[{"one":"1"}]"#.to_vec());
        runner.exec("delete from t").await.unwrap();
        assert_eq!(sql.executed(), vec!["delete from t".to_string()]);
    }

    #[test]
    fn test_decode_errors_are_decode() {
        let err = postgres_error(sqlx::Error::ColumnNotFound("role".to_string()));
        assert_eq!(err.code(), "DecodeError");
    }
}
