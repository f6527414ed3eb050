//! Locking for SQLite.
//!
//! SQLite allows one writer at a time. A write lock is the first write of a
//! deferred transaction, which makes SQLite take its database write lock;
//! `busy_timeout` bounds the wait for a concurrent writer.

use super::{
    DistributedLock, DistributedLockingMechanism, LockId, LockSettings, LockType,
    ReadLockStrategy, command_timeout_secs, lock_failure, read_lock_command, require_transaction,
    write_lock_command,
};
use crate::db::{Command, DbConnection};
use crate::error::{DbError, DbResult};
use crate::syntax::SqlSyntaxProvider;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SqliteDistributedLockingMechanism {
    settings: LockSettings,
    syntax: Arc<dyn SqlSyntaxProvider>,
}

impl SqliteDistributedLockingMechanism {
    pub fn new(settings: LockSettings, syntax: Arc<dyn SqlSyntaxProvider>) -> Self {
        Self { settings, syntax }
    }

    async fn busy_timeout(conn: &mut dyn DbConnection) -> DbResult<Option<i64>> {
        let rows = conn.query(&Command::new("PRAGMA busy_timeout")).await?;
        Ok(rows.first().and_then(|row| row.get_i64("timeout")))
    }

    async fn set_busy_timeout(conn: &mut dyn DbConnection, millis: i64) -> DbResult<()> {
        conn.execute(&Command::new(format!("PRAGMA busy_timeout = {}", millis)))
            .await
            .map(|_| ())
    }

    /// Run `command` with `busy_timeout` set to `timeout` in whole seconds,
    /// restoring the previous value afterwards whatever the outcome.
    async fn with_busy_timeout(
        &self,
        conn: &mut dyn DbConnection,
        timeout: Duration,
        command: Command,
    ) -> DbResult<u64> {
        let previous = Self::busy_timeout(conn).await?;
        let millis = i64::try_from(command_timeout_secs(timeout))
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        Self::set_busy_timeout(conn, millis).await?;

        let result = conn.execute(&command).await;

        if let Some(previous) = previous {
            if let Err(e) = Self::set_busy_timeout(conn, previous).await {
                warn!(error = %e, "Failed to restore busy_timeout");
            }
        }
        result
    }
}

#[async_trait]
impl DistributedLockingMechanism for SqliteDistributedLockingMechanism {
    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn settings(&self) -> &LockSettings {
        &self.settings
    }

    async fn read_lock(
        &self,
        conn: &mut dyn DbConnection,
        id: LockId,
        _timeout: Option<Duration>,
    ) -> DbResult<DistributedLock> {
        require_transaction(&*conn, LockType::Read, id)?;

        if self.settings.read_strategy == ReadLockStrategy::SharedRow {
            // Reading inside the transaction pins its snapshot.
            let command = read_lock_command(self.syntax.as_ref(), &self.settings.table, id, "");
            let rows = conn
                .query(&command)
                .await
                .map_err(|e| lock_failure(e, LockType::Read, id))?;
            if rows.is_empty() {
                return Err(DbError::lock_not_found(id.0));
            }
        }

        Ok(DistributedLock::acquired(id, LockType::Read))
    }

    async fn write_lock(
        &self,
        conn: &mut dyn DbConnection,
        id: LockId,
        timeout: Option<Duration>,
    ) -> DbResult<DistributedLock> {
        require_transaction(&*conn, LockType::Write, id)?;

        let timeout = self.settings.timeout_for(LockType::Write, timeout);
        let command = write_lock_command(self.syntax.as_ref(), &self.settings.table, id);
        let rows = self
            .with_busy_timeout(conn, timeout, command)
            .await
            .map_err(|e| lock_failure(e, LockType::Write, id))?;

        if rows == 0 {
            return Err(DbError::lock_not_found(id.0));
        }
        Ok(DistributedLock::acquired(id, LockType::Write))
    }
}
