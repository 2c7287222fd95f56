//! Backend-neutral persistence gateway.
//!
//! Stores never talk to a database driver directly. They issue parameterized
//! statements through an [`Executor`], open transactions with
//! [`PersistenceGateway::begin`], and ask the gateway to [`classify`] driver
//! errors so that constraint violations can be reported without knowing which
//! backend produced them.
//!
//! Two backends ship with the crate:
//! - [`postgres::PgGateway`]: deadpool-postgres pool (production).
//! - [`sqlite::SqliteGateway`]: sqlx SQLite pool (embedded use and tests).
//!
//! [`classify`]: PersistenceGateway::classify

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A value bound to, or read back from, a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value.into())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        SqlValue::Json(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Builds a `&[SqlValue]` argument slice.
///
/// ```
/// use redactor_store::params;
/// let args = params![42i64, "token"];
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::gateway::SqlValue]
    };
    ($($value:expr),+ $(,)?) => {
        &[$($crate::gateway::SqlValue::from($value)),+]
    };
}

/// A fully materialized result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Creates a row from parallel column/value vectors.
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the raw value of `column`.
    pub fn get(&self, column: &str) -> Result<&SqlValue, GatewayError> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| &self.values[idx])
            .ok_or_else(|| GatewayError::MissingColumn(column.to_string()))
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, GatewayError> {
        match self.get(column)? {
            SqlValue::Int(value) => Ok(*value),
            _ => Err(GatewayError::decode(column, "an integer")),
        }
    }

    pub fn get_string(&self, column: &str) -> Result<String, GatewayError> {
        match self.get(column)? {
            SqlValue::Text(value) => Ok(value.clone()),
            _ => Err(GatewayError::decode(column, "text")),
        }
    }

    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>, GatewayError> {
        match self.get(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(value) => Ok(Some(value.clone())),
            _ => Err(GatewayError::decode(column, "nullable text")),
        }
    }

    /// Reads a timestamp. Backends without a native timestamp type store
    /// integer microseconds since the Unix epoch.
    pub fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>, GatewayError> {
        match self.get(column)? {
            SqlValue::Timestamp(value) => Ok(*value),
            SqlValue::Int(micros) => DateTime::from_timestamp_micros(*micros)
                .ok_or_else(|| GatewayError::decode(column, "a timestamp in range")),
            SqlValue::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| GatewayError::decode(column, "an RFC 3339 timestamp")),
            _ => Err(GatewayError::decode(column, "a timestamp")),
        }
    }

    /// Reads a JSON document, parsing it when the backend stored it as text.
    pub fn get_json(&self, column: &str) -> Result<serde_json::Value, GatewayError> {
        match self.get(column)? {
            SqlValue::Json(value) => Ok(value.clone()),
            SqlValue::Text(text) => serde_json::from_str(text)
                .map_err(|_| GatewayError::decode(column, "a JSON document")),
            _ => Err(GatewayError::decode(column, "JSON")),
        }
    }

    pub fn get_bool(&self, column: &str) -> Result<bool, GatewayError> {
        match self.get(column)? {
            SqlValue::Bool(value) => Ok(*value),
            SqlValue::Int(value) => Ok(*value != 0),
            _ => Err(GatewayError::decode(column, "a boolean")),
        }
    }
}

/// Errors raised by a gateway backend.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A PostgreSQL driver error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// A PostgreSQL pool checkout error.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The PostgreSQL pool could not be built from its configuration.
    #[error("connection pool configuration error: {0}")]
    PoolConfig(#[from] deadpool_postgres::CreatePoolError),

    /// A SQLite (sqlx) error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// `query_one` matched no row.
    #[error("query returned no rows")]
    NoRows,

    /// The row has no column with this name.
    #[error("missing column `{0}`")]
    MissingColumn(String),

    /// The column holds a value of an unexpected type.
    #[error("column `{column}` is not {expected}")]
    Decode {
        column: String,
        expected: &'static str,
    },

    /// The backend returned a column type the gateway cannot represent.
    #[error("unsupported column type `{0}`")]
    UnsupportedType(String),

    /// A transaction handle was used after it finished.
    #[error("transaction already finished")]
    TransactionFinished,
}

impl GatewayError {
    fn decode(column: &str, expected: &'static str) -> Self {
        GatewayError::Decode {
            column: column.to_string(),
            expected,
        }
    }
}

/// Backend-agnostic classification of a [`GatewayError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// A uniqueness constraint fired on `field` (a column name).
    Duplicate { field: String },
    /// The statement expected a row and found none.
    NotFound,
    Other,
}

/// Row lock taken by a `SELECT` inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// Exclusive: blocks concurrent writers and other lockers.
    Update,
    /// Shared: blocks writers, not other sharers.
    Share,
}

/// Runs parameterized statements.
#[async_trait]
pub trait Executor: Send {
    /// Runs a statement and returns the number of rows it affected.
    async fn execute(&mut self, stmt: &str, args: &[SqlValue]) -> Result<u64, GatewayError>;

    /// Runs a query and materializes every row.
    async fn query(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Vec<Row>, GatewayError>;

    /// Runs a query expected to yield at most one row.
    async fn query_opt(
        &mut self,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Option<Row>, GatewayError>;

    /// Runs a query expected to yield exactly one row.
    async fn query_one(&mut self, stmt: &str, args: &[SqlValue]) -> Result<Row, GatewayError> {
        self.query_opt(stmt, args).await?.ok_or(GatewayError::NoRows)
    }
}

/// An open transaction. Dropping it without [`commit`](Transaction::commit)
/// rolls it back.
#[async_trait]
pub trait Transaction: Executor {
    async fn commit(self) -> Result<(), GatewayError>;

    async fn rollback(self) -> Result<(), GatewayError>;
}

/// Entry point to a relational backend.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    type Conn: Executor;
    type Tx: Transaction;

    /// Checks out a connection for single-statement work.
    async fn connect(&self) -> Result<Self::Conn, GatewayError>;

    /// Opens a transaction on a dedicated connection.
    async fn begin(&self) -> Result<Self::Tx, GatewayError>;

    /// Maps a backend error onto [`ErrorClass`].
    fn classify(&self, err: &GatewayError) -> ErrorClass;

    /// Suffix appended to a `SELECT` to take `lock` on the selected rows.
    ///
    /// Empty for backends whose transactions already serialize writers at a
    /// coarser level.
    fn lock_clause(&self, lock: RowLock) -> &'static str {
        let _ = lock;
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(pairs: Vec<(&str, SqlValue)>) -> Row {
        let (columns, values) = pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .unzip();
        Row::new(columns, values)
    }

    #[test]
    fn timestamps_decode_from_native_and_micros() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let r = row(vec![
            ("native", SqlValue::Timestamp(ts)),
            ("micros", SqlValue::Int(ts.timestamp_micros())),
        ]);
        assert_eq!(r.get_timestamp("native").unwrap(), ts);
        assert_eq!(r.get_timestamp("micros").unwrap(), ts);
    }

    #[test]
    fn json_decodes_from_text() {
        let r = row(vec![("schema", SqlValue::Text(r#"{"a":[1,2]}"#.into()))]);
        assert_eq!(r.get_json("schema").unwrap(), serde_json::json!({"a": [1, 2]}));
    }

    #[test]
    fn missing_and_mistyped_columns_are_reported() {
        let r = row(vec![("id", SqlValue::Text("abc".into()))]);
        assert!(matches!(r.get_i64("id"), Err(GatewayError::Decode { .. })));
        assert!(matches!(r.get_i64("nope"), Err(GatewayError::MissingColumn(c)) if c == "nope"));
    }

    #[test]
    fn bools_accept_integer_storage() {
        let r = row(vec![("exists", SqlValue::Int(1)), ("missing", SqlValue::Int(0))]);
        assert!(r.get_bool("exists").unwrap());
        assert!(!r.get_bool("missing").unwrap());
    }

    #[test]
    fn params_macro_converts_values() {
        let args = crate::params![7i64, "x", None::<String>];
        assert_eq!(
            args,
            &[SqlValue::Int(7), SqlValue::Text("x".into()), SqlValue::Null]
        );
    }
}
