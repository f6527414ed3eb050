//! Distributed locking on a lock table.
//!
//! Every lockable resource has a pre-seeded row in the lock table. A write
//! lock is an `UPDATE` of that row inside the caller's transaction, so it is
//! held until the transaction commits or rolls back. Read locks rely on the
//! transaction's isolation unless [`ReadLockStrategy::SharedRow`] is chosen.
//! Nothing is released explicitly: dropping a [`DistributedLock`] only logs.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDistributedLockingMechanism;
pub use sqlite::SqliteDistributedLockingMechanism;

use crate::db::{Command, DbConnection, TransactionMode};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnDefinition, ColumnType, TableDefinition};
use crate::syntax::SqlSyntaxProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TABLE: &str = "dblock";
pub const DEFAULT_READ_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of a row in the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub i32);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for LockId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "ReadLock"),
            LockType::Write => write!(f, "WriteLock"),
        }
    }
}

/// How a read lock is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadLockStrategy {
    /// Rely on the transaction's isolation level; no statement is run
    #[default]
    Isolation,
    /// Read the lock row with a shared row lock
    SharedRow,
}

impl FromStr for ReadLockStrategy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "isolation" => Ok(Self::Isolation),
            "shared_row" => Ok(Self::SharedRow),
            other => Err(DbError::configuration(format!(
                "Unknown read lock strategy '{}'. Use isolation or shared_row",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub enabled: bool,
    pub table: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_strategy: ReadLockStrategy,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            table: DEFAULT_LOCK_TABLE.to_string(),
            read_timeout: DEFAULT_READ_LOCK_TIMEOUT,
            write_timeout: DEFAULT_WRITE_LOCK_TIMEOUT,
            read_strategy: ReadLockStrategy::Isolation,
        }
    }
}

impl LockSettings {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_read_strategy(mut self, strategy: ReadLockStrategy) -> Self {
        self.read_strategy = strategy;
        self
    }

    pub fn timeout_for(&self, lock_type: LockType, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(match lock_type {
            LockType::Read => self.read_timeout,
            LockType::Write => self.write_timeout,
        })
    }
}

/// Whole seconds for a lock timeout, rounded up, never below one.
pub fn command_timeout_secs(timeout: Duration) -> u64 {
    (timeout.as_secs_f64().ceil() as u64).max(1)
}

/// A held lock. Released when the enclosing transaction ends.
#[derive(Debug)]
pub struct DistributedLock {
    id: LockId,
    lock_type: LockType,
    acquired_at: Instant,
}

impl DistributedLock {
    fn acquired(id: LockId, lock_type: LockType) -> Self {
        debug!(lock_id = %id, "Acquired {} for id {}", lock_type, id);
        Self {
            id,
            lock_type,
            acquired_at: Instant::now(),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

impl fmt::Display for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistributedLock({})", self.id)
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        debug!(lock_id = %self.id, "Dropped {} for id {}", self.lock_type, self.id);
    }
}

#[async_trait]
pub trait DistributedLockingMechanism: Send + Sync + fmt::Debug {
    fn enabled(&self) -> bool;

    fn settings(&self) -> &LockSettings;

    /// Obtain a read lock inside the active transaction of `conn`.
    async fn read_lock(
        &self,
        conn: &mut dyn DbConnection,
        id: LockId,
        timeout: Option<Duration>,
    ) -> DbResult<DistributedLock>;

    /// Obtain a write lock inside the active transaction of `conn`.
    async fn write_lock(
        &self,
        conn: &mut dyn DbConnection,
        id: LockId,
        timeout: Option<Duration>,
    ) -> DbResult<DistributedLock>;
}

fn require_transaction(conn: &dyn DbConnection, lock_type: LockType, id: LockId) -> DbResult<()> {
    debug!(lock_id = %id, provider = %conn.provider(), "Requesting {} for id {}", lock_type, id);
    if conn.in_transaction() {
        Ok(())
    } else {
        Err(DbError::transaction(
            format!(
                "A transaction is required to obtain a {} for id {}",
                lock_type, id
            ),
            "lock",
        ))
    }
}

/// Map a fault raised while locking. Only backend faults become lock timeouts.
fn lock_failure(err: DbError, lock_type: LockType, id: LockId) -> DbError {
    if !err.is_backend_fault() {
        return err;
    }
    debug!(lock_id = %id, error = %err, "Failed to obtain {} for id {}", lock_type, id);
    match lock_type {
        LockType::Read => DbError::read_lock_timeout(id.0),
        LockType::Write => DbError::write_lock_timeout(id.0),
    }
}

/// Flip the value of the lock row. Zero affected rows means a missing row.
fn write_lock_command(syntax: &dyn SqlSyntaxProvider, table: &str, id: LockId) -> Command {
    let value = syntax.quote_column_name("value");
    Command::new(format!(
        "UPDATE {} SET {value} = (CASE WHEN ({value}=1) THEN -1 ELSE 1 END) WHERE {} = {}",
        syntax.quote_table_name(table),
        syntax.quote_column_name("id"),
        syntax.parameter(1),
        value = value,
    ))
    .bind(id.0)
}

fn read_lock_command(
    syntax: &dyn SqlSyntaxProvider,
    table: &str,
    id: LockId,
    suffix: &str,
) -> Command {
    Command::new(format!(
        "SELECT {} FROM {} WHERE {} = {}{}",
        syntax.quote_column_name("value"),
        syntax.quote_table_name(table),
        syntax.quote_column_name("id"),
        syntax.parameter(1),
        suffix
    ))
    .bind(id.0)
}

/// Schema of the lock table.
pub fn lock_table_definition(table: &str) -> TableDefinition {
    TableDefinition::new(table)
        .with_column(
            ColumnDefinition::new("id", ColumnType::Integer)
                .with_primary_key(true)
                .with_primary_key_name(format!("PK_{}", table)),
        )
        .with_column(ColumnDefinition::new("value", ColumnType::Integer))
        .with_column(ColumnDefinition::new(
            "name",
            ColumnType::String { length: Some(64) },
        ))
}

/// Insert lock rows that do not exist yet. Existing rows are left untouched.
///
/// Returns the number of rows inserted.
pub async fn install_lock_rows(
    conn: &mut dyn DbConnection,
    syntax: &dyn SqlSyntaxProvider,
    table: &str,
    rows: &[(LockId, &str)],
) -> DbResult<u64> {
    let sql = format!(
        "INSERT INTO {} ({}, {}, {}) VALUES ({}, 1, {}) ON CONFLICT ({}) DO NOTHING",
        syntax.quote_table_name(table),
        syntax.quote_column_name("id"),
        syntax.quote_column_name("value"),
        syntax.quote_column_name("name"),
        syntax.parameter(1),
        syntax.parameter(2),
        syntax.quote_column_name("id"),
    );

    let mut inserted = 0;
    for (id, name) in rows {
        let command = Command::new(sql.as_str()).bind(id.0).bind(*name).retry_safe();
        inserted += conn.execute(&command).await?;
    }
    info!(table = %table, requested = rows.len(), inserted = inserted, "Installed lock rows");
    Ok(inserted)
}

/// Create the lock table when it is missing and seed `rows`, all in one
/// transaction.
///
/// Returns the number of lock rows inserted.
pub async fn install_lock_table(
    conn: &mut dyn DbConnection,
    syntax: &dyn SqlSyntaxProvider,
    table: &str,
    rows: &[(LockId, &str)],
) -> DbResult<u64> {
    conn.begin_transaction(TransactionMode::Immediate).await?;

    let result = async {
        if !syntax.does_table_exist(&mut *conn, table).await? {
            syntax
                .create_table(&mut *conn, &lock_table_definition(table), false)
                .await?;
        }
        install_lock_rows(&mut *conn, syntax, table, rows).await
    }
    .await;

    match result {
        Ok(inserted) => {
            conn.complete_transaction().await?;
            Ok(inserted)
        }
        Err(e) => {
            if let Err(abort_err) = conn.abort_transaction().await {
                warn!(error = %abort_err, "Failed to roll back lock table installation");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{Call, RecordingConnection};
    use crate::syntax::PostgresSyntaxProvider;

    #[test]
    fn test_command_timeout_rounds_up() {
        assert_eq!(command_timeout_secs(Duration::from_millis(1)), 1);
        assert_eq!(command_timeout_secs(Duration::ZERO), 1);
        assert_eq!(command_timeout_secs(Duration::from_millis(1500)), 2);
        assert_eq!(command_timeout_secs(Duration::from_secs(5)), 5);
    }

    #[test]
    fn test_default_settings() {
        let settings = LockSettings::default();
        assert_eq!(settings.table, "dblock");
        assert_eq!(settings.timeout_for(LockType::Read, None), Duration::from_secs(60));
        assert_eq!(settings.timeout_for(LockType::Write, None), Duration::from_secs(5));
        assert_eq!(
            settings.timeout_for(LockType::Write, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_read_lock_strategy_from_str() {
        assert_eq!(
            "shared-row".parse::<ReadLockStrategy>().unwrap(),
            ReadLockStrategy::SharedRow
        );
        assert!("nope".parse::<ReadLockStrategy>().is_err());
    }

    #[test]
    fn test_lock_failure_mapping() {
        let backend = DbError::database("canceling statement due to lock timeout", Some("55P03".into()), "");
        assert!(matches!(
            lock_failure(backend, LockType::Write, LockId(5)),
            DbError::WriteLockTimeout { lock_id: 5 }
        ));
        assert!(matches!(
            lock_failure(DbError::timeout("statement", 2), LockType::Read, LockId(5)),
            DbError::ReadLockTimeout { lock_id: 5 }
        ));
        assert!(matches!(
            lock_failure(DbError::lock_not_found(5), LockType::Write, LockId(5)),
            DbError::LockNotFound { .. }
        ));
    }

    #[test]
    fn test_lock_table_definition_is_valid() {
        let table = lock_table_definition("dblock");
        table.validate().unwrap();
        assert_eq!(table.primary_key_columns().count(), 1);
    }

    #[tokio::test]
    async fn test_install_lock_rows_inserts_only() {
        let syntax = PostgresSyntaxProvider::new();
        let mut conn = RecordingConnection::postgres().with_execute_results(vec![Ok(1), Ok(0)]);
        let inserted = install_lock_rows(
            &mut conn,
            &syntax,
            "dblock",
            &[(LockId(-331), "Servers"), (LockId(-333), "ContentTree")],
        )
        .await
        .unwrap();
        assert_eq!(inserted, 1);

        let calls = conn.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Execute(cmd) => {
                assert_eq!(
                    cmd.sql,
                    "INSERT INTO \"dblock\" (\"id\", \"value\", \"name\") VALUES ($1, 1, $2) \
                     ON CONFLICT (\"id\") DO NOTHING"
                );
                assert!(!cmd.sql.contains("UPDATE"));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_install_lock_table_creates_missing_table() {
        let syntax = PostgresSyntaxProvider::new();
        let mut conn = RecordingConnection::postgres();
        install_lock_table(&mut conn, &syntax, "dblock", &[(LockId(-331), "Servers")])
            .await
            .unwrap();

        let calls = conn.calls();
        assert_eq!(calls.first(), Some(&Call::Begin(TransactionMode::Immediate)));
        assert_eq!(calls.last(), Some(&Call::Complete));
        let sql = conn.executed_sql();
        assert!(sql.iter().any(|s| s.starts_with("CREATE TABLE \"dblock\"")));
        assert!(sql.iter().any(|s| s.starts_with("INSERT INTO \"dblock\"")));
    }

    #[tokio::test]
    async fn test_install_lock_table_rolls_back_on_failure() {
        let syntax = PostgresSyntaxProvider::new();
        let mut conn = RecordingConnection::postgres().with_execute_results(vec![
            Ok(0),
            Err(DbError::database("permission denied", Some("42501".into()), "")),
        ]);
        let err = install_lock_table(&mut conn, &syntax, "dblock", &[(LockId(1), "a")])
            .await
            .unwrap_err();
        assert_eq!(err.sql_state(), Some("42501"));
        assert_eq!(conn.calls().last(), Some(&Call::Abort));
    }
}
