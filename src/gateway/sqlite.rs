//! SQLite backend over an sqlx pool.
//!
//! SQLite has no native timestamp or JSON types, so timestamps are bound as
//! integer microseconds since the Unix epoch (keeping `>`/`<` comparisons
//! exact) and JSON documents as TEXT. [`Row`] getters undo both.
//!
//! There are no row locks: a writing transaction holds the database-wide
//! write lock until it ends, so `lock_clause` keeps its empty default.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use super::{ErrorClass, Executor, GatewayError, PersistenceGateway, Row, SqlValue, Transaction};

const SCHEMA: &str = include_str!("../../schema/sqlite.sql");

/// Gateway backed by an sqlx SQLite pool.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    /// Opens (or creates) the database at `url`, e.g. `sqlite://redactor.db`.
    ///
    /// Foreign keys are enforced on every connection.
    pub async fn open(url: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        tracing::info!(url, "SQLite pool initialized");
        Ok(Self { pool })
    }

    /// Creates a private in-memory database with the schema applied.
    ///
    /// An in-memory SQLite database lives and dies with its connection, so
    /// the pool is pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let gateway = Self { pool };
        gateway.migrate().await?;
        Ok(gateway)
    }

    /// Applies the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::debug!("SQLite schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway")
            .field("connections", &self.pool.size())
            .finish()
    }
}

/// A pooled SQLite connection.
pub struct SqliteConnection(PoolConnection<Sqlite>);

/// An sqlx transaction; sqlx rolls it back when dropped uncommitted.
pub struct SqliteTransaction(sqlx::Transaction<'static, Sqlite>);

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    type Conn = SqliteConnection;
    type Tx = SqliteTransaction;

    async fn connect(&self) -> Result<SqliteConnection, GatewayError> {
        Ok(SqliteConnection(self.pool.acquire().await?))
    }

    async fn begin(&self) -> Result<SqliteTransaction, GatewayError> {
        Ok(SqliteTransaction(self.pool.begin().await?))
    }

    fn classify(&self, err: &GatewayError) -> ErrorClass {
        match err {
            GatewayError::NoRows | GatewayError::Sqlite(sqlx::Error::RowNotFound) => {
                ErrorClass::NotFound
            }
            GatewayError::Sqlite(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                ErrorClass::Duplicate {
                    field: unique_violation_field(db.message()),
                }
            }
            _ => ErrorClass::Other,
        }
    }
}

#[async_trait]
impl Executor for SqliteConnection {
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
        let result = bind_all(stmt, args).execute(&mut *self.0).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
        let rows = bind_all(stmt, args).fetch_all(&mut *self.0).await?;
        rows.iter().map(convert_row).collect()
    }

    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError> {
        let row = bind_all(stmt, args).fetch_optional(&mut *self.0).await?;
        row.as_ref().map(convert_row).transpose()
    }
}

#[async_trait]
impl Executor for SqliteTransaction {
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
        let result = bind_all(stmt, args).execute(&mut *self.0).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
        let rows = bind_all(stmt, args).fetch_all(&mut *self.0).await?;
        rows.iter().map(convert_row).collect()
    }

    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError> {
        let row = bind_all(stmt, args).fetch_optional(&mut *self.0).await?;
        row.as_ref().map(convert_row).transpose()
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(self) -> Result<(), GatewayError> {
        self.0.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), GatewayError> {
        self.0.rollback().await?;
        Ok(())
    }
}

fn bind_all<'q>(stmt: &'q str, args: &'q [SqlValue]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    args.iter().fold(sqlx::query(stmt), |query, arg| match arg {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Int(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.as_str()),
        SqlValue::Timestamp(value) => query.bind(value.timestamp_micros()),
        SqlValue::Json(value) => query.bind(value.to_string()),
        SqlValue::Bool(value) => query.bind(*value),
    })
}

fn convert_row(row: &SqliteRow) -> Result<Row, GatewayError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            // Runtime storage class of the value, not the declared column type.
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => SqlValue::Int(row.try_get::<i64, _>(idx)?),
                "TEXT" => SqlValue::Text(row.try_get::<String, _>(idx)?),
                other => return Err(GatewayError::UnsupportedType(other.to_string())),
            }
        };

        columns.push(column.name().to_string());
        values.push(value);
    }

    Ok(Row::new(columns, values))
}

/// Extracts the column from `UNIQUE constraint failed: sessions.token_id`.
fn unique_violation_field(message: &str) -> String {
    message
        .split_once("constraint failed: ")
        .and_then(|(_, cols)| cols.split(',').next())
        .map(|col| {
            let col = col.trim();
            col.rsplit_once('.').map_or(col, |(_, name)| name).to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}
