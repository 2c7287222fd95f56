//! PostgreSQL backend over a deadpool-postgres pool.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Client, Pool};
use postgres_types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::error::SqlState;

use super::{
    ErrorClass, Executor, GatewayError, PersistenceGateway, Row, RowLock, SqlValue, Transaction,
};

const SCHEMA: &str = include_str!("../../schema/postgres.sql");

/// Gateway backed by a pooled PostgreSQL connection set.
#[derive(Clone)]
pub struct PgGateway {
    pool: Pool,
}

impl PgGateway {
    /// Wraps an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Builds a pool for `database_url` and wraps it.
    pub fn from_url(database_url: &str, max_size: usize) -> Result<Self, GatewayError> {
        let pool = crate::db::create_pool(database_url, max_size)?;
        tracing::info!(max_size, "PostgreSQL pool initialized");
        Ok(Self { pool })
    }

    /// Applies the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), GatewayError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        tracing::info!("PostgreSQL schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl std::fmt::Debug for PgGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgGateway")
            .field("pool", &self.pool.status())
            .finish()
    }
}

/// A pooled connection used for single-statement work.
pub struct PgConnection(Client);

/// A transaction on a dedicated pooled connection.
///
/// Until `commit`/`rollback` has succeeded the handle owns the connection.
/// Dropping it earlier (an error path, a cancelled `begin`, or a cancelled or
/// failed COMMIT) detaches the connection from the pool and closes it, which
/// makes the server abort the open transaction.
pub struct PgTransaction {
    client: Option<Client>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client, GatewayError> {
        self.client.as_ref().ok_or(GatewayError::TransactionFinished)
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tracing::debug!("transaction dropped before completion, discarding connection");
            drop(deadpool::managed::Object::take(client));
        }
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    type Conn = PgConnection;
    type Tx = PgTransaction;

    async fn connect(&self) -> Result<PgConnection, GatewayError> {
        Ok(PgConnection(self.pool.get().await?))
    }

    async fn begin(&self) -> Result<PgTransaction, GatewayError> {
        // Guard first: if this future is dropped while BEGIN is in flight the
        // connection is detached instead of going back to the pool mid-transaction.
        let tx = PgTransaction {
            client: Some(self.pool.get().await?),
        };
        tx.client()?.batch_execute("BEGIN").await?;
        Ok(tx)
    }

    fn lock_clause(&self, lock: RowLock) -> &'static str {
        match lock {
            RowLock::Update => " FOR UPDATE",
            RowLock::Share => " FOR SHARE",
        }
    }

    fn classify(&self, err: &GatewayError) -> ErrorClass {
        match err {
            GatewayError::NoRows => ErrorClass::NotFound,
            GatewayError::Postgres(e) => match e.as_db_error() {
                Some(db) if db.code() == &SqlState::UNIQUE_VIOLATION => ErrorClass::Duplicate {
                    field: unique_violation_field(db.detail(), db.constraint()),
                },
                _ => ErrorClass::Other,
            },
            _ => ErrorClass::Other,
        }
    }
}

#[async_trait]
impl Executor for PgConnection {
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
        execute_on(&self.0, stmt, args).await
    }

    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
        query_on(&self.0, stmt, args).await
    }

    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError> {
        query_opt_on(&self.0, stmt, args).await
    }
}

#[async_trait]
impl Executor for PgTransaction {
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
        execute_on(self.client()?, stmt, args).await
    }

    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
        query_on(self.client()?, stmt, args).await
    }

    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError> {
        query_opt_on(self.client()?, stmt, args).await
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    // The client is released to the pool only once the statement succeeded.
    // A failed or cancelled COMMIT/ROLLBACK leaves it in place for `Drop`.
    async fn commit(mut self) -> Result<(), GatewayError> {
        self.client()?.batch_execute("COMMIT").await?;
        drop(self.client.take());
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), GatewayError> {
        self.client()?.batch_execute("ROLLBACK").await?;
        drop(self.client.take());
        Ok(())
    }
}

fn as_params(args: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|arg| arg as &(dyn ToSql + Sync)).collect()
}

async fn execute_on(client: &Client, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError> {
    let statement = client.prepare_cached(stmt).await?;
    Ok(client.execute(&statement, &as_params(args)).await?)
}

async fn query_on(client: &Client, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError> {
    let statement = client.prepare_cached(stmt).await?;
    client
        .query(&statement, &as_params(args))
        .await?
        .iter()
        .map(convert_row)
        .collect()
}

async fn query_opt_on(
    client: &Client,
    stmt: &str,
    args: &[SqlValue],
) -> Result<Option<Row>, GatewayError> {
    let statement = client.prepare_cached(stmt).await?;
    client
        .query_opt(&statement, &as_params(args))
        .await?
        .as_ref()
        .map(convert_row)
        .transpose()
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row, GatewayError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if ty == &Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if ty == &Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if ty == &Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if ty == &Type::TEXT || ty == &Type::VARCHAR || ty == &Type::BPCHAR {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        } else if ty == &Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(SqlValue::Timestamp)
        } else if ty == &Type::JSON || ty == &Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(idx)?
                .map(SqlValue::Json)
        } else if ty == &Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
        } else {
            return Err(GatewayError::UnsupportedType(ty.name().to_string()));
        };

        columns.push(column.name().to_string());
        values.push(value.unwrap_or(SqlValue::Null));
    }

    Ok(Row::new(columns, values))
}

/// Extracts the offending column from a unique-violation error.
///
/// PostgreSQL reports `Key (token_id)=(abc) already exists.` in the detail;
/// the constraint name is the fallback (`*_pkey` maps to `id`).
fn unique_violation_field(detail: Option<&str>, constraint: Option<&str>) -> String {
    let from_detail = detail
        .and_then(|d| d.strip_prefix("Key ("))
        .and_then(|rest| rest.split_once(")="))
        .and_then(|(cols, _)| cols.split(',').next())
        .map(|col| col.trim().to_string());

    if let Some(field) = from_detail {
        return field;
    }

    match constraint {
        Some(name) if name.ends_with("_pkey") => "id".to_string(),
        Some(name) => name.trim_end_matches("_key").to_string(),
        None => "unknown".to_string(),
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Int(value) if ty == &Type::INT4 => {
                i32::try_from(*value)?.to_sql_checked(ty, out)
            }
            SqlValue::Int(value) if ty == &Type::INT2 => {
                i16::try_from(*value)?.to_sql_checked(ty, out)
            }
            SqlValue::Int(value) => value.to_sql_checked(ty, out),
            SqlValue::Text(value) => value.to_sql_checked(ty, out),
            SqlValue::Timestamp(value) => value.to_sql_checked(ty, out),
            SqlValue::Json(value) => value.to_sql_checked(ty, out),
            SqlValue::Bool(value) => value.to_sql_checked(ty, out),
        }
    }

    // Each variant checks its own wire type in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
