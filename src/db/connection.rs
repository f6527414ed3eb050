//! Unit-of-work connections.
//!
//! [`DbConnection`] is the seam every provider service works against: it
//! exposes transaction state, begin/complete/abort and statement execution.
//! [`SqlxConnection`] is the physical implementation over a pooled sqlx
//! connection; interceptors wrap it with further behaviour.

use crate::db::params::{bind_postgres_param, bind_sqlite_param};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ProviderName, Row, SqlValue};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Postgres, Sqlite};
use std::time::Duration;
use tracing::{debug, warn};

/// How a transaction acquires its locks on backends that distinguish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Locks are taken when first needed (SQLite `BEGIN DEFERRED`)
    Deferred,
    /// Write lock taken at begin (SQLite `BEGIN IMMEDIATE`)
    #[default]
    Immediate,
}

/// A statement with positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Client-side statement timeout
    pub timeout: Option<Duration>,
    /// Safe to run again unchanged after a transient fault
    pub retry_safe: bool,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_params(mut self, params: Vec<SqlValue>) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the command idempotent so retry policies may re-run it.
    pub fn retry_safe(mut self) -> Self {
        self.retry_safe = true;
        self
    }
}

/// A unit of work over one database connection.
#[async_trait]
pub trait DbConnection: Send {
    fn provider(&self) -> &ProviderName;

    fn in_transaction(&self) -> bool;

    /// False once a failure has left the connection in an unknown state.
    /// Every further statement on it fails, so retrying on it is pointless.
    fn is_usable(&self) -> bool {
        true
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> DbResult<()>;

    /// Commit the active transaction.
    async fn complete_transaction(&mut self) -> DbResult<()>;

    /// Roll back the active transaction.
    async fn abort_transaction(&mut self) -> DbResult<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, command: &Command) -> DbResult<u64>;

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>>;
}

/// Pooled sqlx connection for one of the supported backends.
pub enum PhysicalConnection {
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PhysicalConnection")
            .field(&self.db_type())
            .finish()
    }
}

impl PhysicalConnection {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            PhysicalConnection::Postgres(_) => DatabaseType::PostgreSQL,
            PhysicalConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn raw_execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        impl_conn_dispatch!(self, {
            Postgres(c) => sqlx::Executor::execute(&mut **c, sqlx::raw_sql(sql)).await.map(|r| r.rows_affected()),
            SQLite(c) => sqlx::Executor::execute(&mut **c, sqlx::raw_sql(sql)).await.map(|r| r.rows_affected()),
        })
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, sqlx::Error> {
        match self {
            PhysicalConnection::Postgres(c) => {
                let mut query = sqlx::query(&command.sql);
                for param in &command.params {
                    query = bind_postgres_param(query, param);
                }
                query.execute(&mut **c).await.map(|r| r.rows_affected())
            }
            PhysicalConnection::SQLite(c) => {
                let mut query = sqlx::query(&command.sql);
                for param in &command.params {
                    query = bind_sqlite_param(query, param);
                }
                query.execute(&mut **c).await.map(|r| r.rows_affected())
            }
        }
    }

    async fn query(&mut self, command: &Command) -> Result<Vec<Row>, sqlx::Error> {
        match self {
            PhysicalConnection::Postgres(c) => {
                let mut query = sqlx::query(&command.sql);
                for param in &command.params {
                    query = bind_postgres_param(query, param);
                }
                let rows = query.fetch_all(&mut **c).await?;
                Ok(rows.iter().map(RowToJson::to_row).collect())
            }
            PhysicalConnection::SQLite(c) => {
                let mut query = sqlx::query(&command.sql);
                for param in &command.params {
                    query = bind_sqlite_param(query, param);
                }
                let rows = query.fetch_all(&mut **c).await?;
                Ok(rows.iter().map(RowToJson::to_row).collect())
            }
        }
    }

    /// Take the connection out of the pool so it is closed instead of reused.
    fn discard(self) {
        impl_conn_dispatch!(self, {
            Postgres(c) => drop(c.detach()),
            SQLite(c) => drop(c.detach()),
        })
    }
}

/// The physical [`DbConnection`].
///
/// Transactions are driven with plain `BEGIN`/`COMMIT`/`ROLLBACK`. A
/// connection dropped mid-transaction, or after a statement timed out, is
/// discarded rather than returned to the pool.
#[derive(Debug)]
pub struct SqlxConnection {
    provider: ProviderName,
    conn: Option<PhysicalConnection>,
    in_transaction: bool,
    include_error_detail: bool,
    close_on_drop: bool,
    broken: bool,
}

impl SqlxConnection {
    pub fn new(provider: ProviderName, conn: PhysicalConnection) -> Self {
        Self {
            provider,
            conn: Some(conn),
            in_transaction: false,
            include_error_detail: false,
            close_on_drop: false,
            broken: false,
        }
    }

    pub fn with_error_detail(mut self, include_error_detail: bool) -> Self {
        self.include_error_detail = include_error_detail;
        self
    }

    /// Close the physical connection on drop instead of returning it to the pool.
    pub fn close_on_drop(mut self, close: bool) -> Self {
        self.close_on_drop = close;
        self
    }

    pub fn db_type(&self) -> Option<DatabaseType> {
        self.conn.as_ref().map(PhysicalConnection::db_type)
    }

    fn physical(&mut self) -> DbResult<&mut PhysicalConnection> {
        if self.broken {
            return Err(DbError::connection(
                "Connection is in an unknown state after a timeout or failed commit",
                "Open a new unit of work",
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("Connection already released"))
    }

    fn map_err(&self, err: sqlx::Error) -> DbError {
        DbError::from_sqlx(err, self.include_error_detail)
    }

    async fn run_raw(&mut self, sql: &str) -> DbResult<()> {
        let result = self.physical()?.raw_execute(sql).await;
        result.map(|_| ()).map_err(|e| self.map_err(e))
    }

    fn begin_sql(&self, mode: TransactionMode) -> &'static str {
        match (self.db_type(), mode) {
            (Some(DatabaseType::SQLite), TransactionMode::Deferred) => "BEGIN DEFERRED",
            (Some(DatabaseType::SQLite), TransactionMode::Immediate) => "BEGIN IMMEDIATE",
            _ => "BEGIN ISOLATION LEVEL READ COMMITTED",
        }
    }
}

#[async_trait]
impl DbConnection for SqlxConnection {
    fn provider(&self) -> &ProviderName {
        &self.provider
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_usable(&self) -> bool {
        !self.broken && self.conn.is_some()
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> DbResult<()> {
        if self.in_transaction {
            return Err(DbError::transaction(
                "A transaction is already active on this connection",
                "begin",
            ));
        }
        let sql = self.begin_sql(mode);
        self.run_raw(sql).await?;
        self.in_transaction = true;
        debug!(provider = %self.provider, mode = ?mode, "Transaction started");
        Ok(())
    }

    async fn complete_transaction(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::transaction("No active transaction", "complete"));
        }
        match self.run_raw("COMMIT").await {
            Ok(()) => {
                self.in_transaction = false;
                debug!(provider = %self.provider, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                // State is unknown; never hand this connection back to the pool.
                self.broken = true;
                Err(e)
            }
        }
    }

    async fn abort_transaction(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::transaction("No active transaction", "abort"));
        }
        let result = self.run_raw("ROLLBACK").await;
        self.in_transaction = false;
        if result.is_err() {
            self.broken = true;
        }
        debug!(provider = %self.provider, "Transaction rolled back");
        result
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        let timeout = command.timeout;
        let conn = self.physical()?;
        let fut = conn.execute(command);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
            None => Some(fut.await),
        };
        match outcome {
            Some(result) => result.map_err(|e| self.map_err(e)),
            None => {
                self.broken = true;
                Err(statement_timeout(timeout))
            }
        }
    }

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>> {
        let timeout = command.timeout;
        let conn = self.physical()?;
        let fut = conn.query(command);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
            None => Some(fut.await),
        };
        match outcome {
            Some(result) => result.map_err(|e| self.map_err(e)),
            None => {
                self.broken = true;
                Err(statement_timeout(timeout))
            }
        }
    }
}

fn statement_timeout(timeout: Option<Duration>) -> DbError {
    let secs = timeout.map(|t| t.as_secs_f64().ceil() as u32).unwrap_or(0);
    DbError::timeout("statement", secs)
}

impl Drop for SqlxConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_transaction || self.broken || self.close_on_drop {
            if self.in_transaction {
                warn!(provider = %self.provider, "Connection dropped inside a transaction; discarding");
            }
            conn.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = Command::new("UPDATE t SET v = $1 WHERE id = $2")
            .bind(1)
            .bind("x")
            .with_timeout(Duration::from_secs(2))
            .retry_safe();
        assert_eq!(cmd.params, vec![SqlValue::Int(1), SqlValue::Text("x".into())]);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(2)));
        assert!(cmd.retry_safe);
        assert!(!Command::new("SELECT 1").retry_safe);
    }

    #[test]
    fn test_statement_timeout_rounds_up() {
        let err = statement_timeout(Some(Duration::from_millis(1500)));
        assert!(matches!(err, DbError::Timeout { elapsed_secs: 2, .. }));
    }

    #[test]
    fn test_default_transaction_mode() {
        assert_eq!(TransactionMode::default(), TransactionMode::Immediate);
    }
}
