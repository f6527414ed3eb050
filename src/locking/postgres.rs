//! Row-lock based locking for PostgreSQL.
//!
//! The server enforces the wait through `SET LOCAL lock_timeout`, scoped to
//! the current transaction. The statement also carries a client-side timeout
//! slightly above it in case the server never answers.

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

/// Extra client-side slack on top of the server lock timeout.
const BACKSTOP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PostgresDistributedLockingMechanism {
    settings: LockSettings,
    syntax: Arc<dyn SqlSyntaxProvider>,
}

impl PostgresDistributedLockingMechanism {
    pub fn new(settings: LockSettings, syntax: Arc<dyn SqlSyntaxProvider>) -> Self {
        Self { settings, syntax }
    }

    /// Run `command` with `lock_timeout` set for the duration of the statement
    /// and return the number of rows it touched.
    ///
    /// The reset is skipped when the statement failed: the transaction is
    /// aborted and would reject it anyway.
    async fn with_lock_timeout(
        &self,
        conn: &mut dyn DbConnection,
        timeout: Duration,
        command: Command,
        run: Run,
    ) -> DbResult<u64> {
        let secs = command_timeout_secs(timeout);
        conn.execute(&Command::new(format!("SET LOCAL lock_timeout = '{}s'", secs)))
            .await?;

        let command = command.with_timeout(Duration::from_secs(secs) + BACKSTOP);
        let rows = match run {
            Run::Execute => conn.execute(&command).await?,
            Run::Query => conn.query(&command).await?.len() as u64,
        };

        conn.execute(&Command::new("SET LOCAL lock_timeout TO DEFAULT"))
            .await?;
        Ok(rows)
    }
}

enum Run {
    Execute,
    Query,
}

#[async_trait]
impl DistributedLockingMechanism for PostgresDistributedLockingMechanism {
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
        timeout: Option<Duration>,
    ) -> DbResult<DistributedLock> {
        require_transaction(&*conn, LockType::Read, id)?;

        if self.settings.read_strategy == ReadLockStrategy::SharedRow {
            let timeout = self.settings.timeout_for(LockType::Read, timeout);
            let command =
                read_lock_command(self.syntax.as_ref(), &self.settings.table, id, " FOR SHARE");
            let rows = self
                .with_lock_timeout(conn, timeout, command, Run::Query)
                .await
                .map_err(|e| lock_failure(e, LockType::Read, id))?;
            if rows == 0 {
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
            .with_lock_timeout(conn, timeout, command, Run::Execute)
            .await
            .map_err(|e| lock_failure(e, LockType::Write, id))?;

        if rows == 0 {
            return Err(DbError::lock_not_found(id.0));
        }
        Ok(DistributedLock::acquired(id, LockType::Write))
    }
}
