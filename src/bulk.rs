//! Bulk insert strategies.
//!
//! A [`RecordBatch`] is a homogeneous set of rows for one table. PostgreSQL
//! inserts it with multi-row `VALUES` statements; SQLite falls back to one
//! statement per row. Either way the whole batch is one transaction: the
//! caller's, when one is active, or one opened and finished here.

use crate::db::{Command, DbConnection, TransactionMode};
use crate::error::{DbError, DbResult};
use crate::models::{ProviderName, SqlValue};
use crate::syntax::SqlSyntaxProvider;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// PostgreSQL wire protocol limit on bind parameters per statement.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// A value type that maps onto one row of a table.
pub trait BulkRecord {
    fn table_name() -> &'static str;

    fn column_names() -> Vec<&'static str>;

    /// Values in `column_names` order.
    fn values(&self) -> Vec<SqlValue>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RecordBatch {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_records<'a, T, I>(records: I) -> DbResult<Self>
    where
        T: BulkRecord + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut batch = Self::new(T::table_name(), T::column_names());
        for record in records {
            batch.push_row(record.values())?;
        }
        Ok(batch)
    }

    pub fn push_row(&mut self, row: Vec<SqlValue>) -> DbResult<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::invalid_input(format!(
                "Row {} of '{}' has {} values, expected {}",
                self.rows.len(),
                self.table,
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.table.trim().is_empty() {
            return Err(DbError::invalid_input("Bulk insert target table is empty"));
        }
        if self.columns.is_empty() {
            return Err(DbError::invalid_input(format!(
                "Bulk insert into '{}' has no columns",
                self.table
            )));
        }
        if let Some((idx, row)) = self
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.columns.len())
        {
            return Err(DbError::invalid_input(format!(
                "Row {} of '{}' has {} values, expected {}",
                idx,
                self.table,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }
}

/// `INSERT INTO t (c1, c2) VALUES (p1, p2), (p3, p4) ...`
fn insert_command(
    syntax: &dyn SqlSyntaxProvider,
    table: &str,
    columns: &[String],
    rows: &[Vec<SqlValue>],
) -> Command {
    let quoted: Vec<String> = columns.iter().map(|c| syntax.quote_column_name(c)).collect();

    let mut index = 0;
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let placeholders: Vec<String> = row
                .iter()
                .map(|_| {
                    index += 1;
                    syntax.parameter(index)
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        syntax.quote_table_name(table),
        quoted.join(", "),
        tuples.join(", ")
    );
    Command::new(sql).with_params(rows.iter().flatten().cloned().collect())
}

#[async_trait]
pub trait BulkInsertProvider: Send + Sync + std::fmt::Debug {
    fn provider_name(&self) -> ProviderName;

    /// Insert every row of `batch`. Runs inside an active transaction.
    async fn insert_rows(&self, conn: &mut dyn DbConnection, batch: &RecordBatch)
    -> DbResult<u64>;

    /// Insert `batch` as one unit, returning the number of inserted rows.
    async fn bulk_insert(&self, conn: &mut dyn DbConnection, batch: &RecordBatch) -> DbResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        batch.validate()?;

        if conn.in_transaction() {
            return self.insert_rows(conn, batch).await;
        }

        conn.begin_transaction(TransactionMode::Immediate).await?;
        match self.insert_rows(conn, batch).await {
            Ok(inserted) => {
                conn.complete_transaction().await?;
                Ok(inserted)
            }
            Err(err) => {
                if let Err(rollback) = conn.abort_transaction().await {
                    warn!(table = %batch.table, error = %rollback, "Rollback after failed bulk insert failed");
                }
                Err(err)
            }
        }
    }
}

/// Set-oriented insert using multi-row `VALUES` lists.
#[derive(Debug, Clone)]
pub struct PostgresBulkInsertProvider {
    syntax: Arc<dyn SqlSyntaxProvider>,
}

impl PostgresBulkInsertProvider {
    pub fn new(syntax: Arc<dyn SqlSyntaxProvider>) -> Self {
        Self { syntax }
    }

    fn rows_per_statement(columns: usize) -> usize {
        (MAX_BIND_PARAMETERS / columns.max(1)).max(1)
    }
}

#[async_trait]
impl BulkInsertProvider for PostgresBulkInsertProvider {
    fn provider_name(&self) -> ProviderName {
        self.syntax.provider_name()
    }

    async fn insert_rows(
        &self,
        conn: &mut dyn DbConnection,
        batch: &RecordBatch,
    ) -> DbResult<u64> {
        let chunk_size = Self::rows_per_statement(batch.columns.len());
        let mut inserted = 0;
        for chunk in batch.rows.chunks(chunk_size) {
            let command = insert_command(self.syntax.as_ref(), &batch.table, &batch.columns, chunk);
            inserted += conn.execute(&command).await?;
        }
        debug!(table = %batch.table, rows = inserted, "Bulk insert complete");
        Ok(inserted)
    }
}

/// One `INSERT` per row, for backends without a set-oriented path.
#[derive(Debug, Clone)]
pub struct RowByRowBulkInsertProvider {
    syntax: Arc<dyn SqlSyntaxProvider>,
}

impl RowByRowBulkInsertProvider {
    pub fn new(syntax: Arc<dyn SqlSyntaxProvider>) -> Self {
        Self { syntax }
    }
}

#[async_trait]
impl BulkInsertProvider for RowByRowBulkInsertProvider {
    fn provider_name(&self) -> ProviderName {
        self.syntax.provider_name()
    }

    async fn insert_rows(
        &self,
        conn: &mut dyn DbConnection,
        batch: &RecordBatch,
    ) -> DbResult<u64> {
        let mut inserted = 0;
        for row in &batch.rows {
            let command = insert_command(
                self.syntax.as_ref(),
                &batch.table,
                &batch.columns,
                std::slice::from_ref(row),
            );
            inserted += conn.execute(&command).await?;
        }
        debug!(table = %batch.table, rows = inserted, "Row-by-row insert complete");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{Call, RecordingConnection};
    use crate::syntax::{PostgresSyntaxProvider, SqliteSyntaxProvider};

    struct Tag {
        id: i64,
        text: &'static str,
    }

    impl BulkRecord for Tag {
        fn table_name() -> &'static str {
            "cmsTags"
        }

        fn column_names() -> Vec<&'static str> {
            vec!["id", "tag"]
        }

        fn values(&self) -> Vec<SqlValue> {
            vec![self.id.into(), self.text.into()]
        }
    }

    fn tags() -> RecordBatch {
        RecordBatch::from_records(&[
            Tag { id: 1, text: "a" },
            Tag { id: 2, text: "b" },
            Tag { id: 3, text: "c" },
        ])
        .unwrap()
    }

    fn postgres() -> PostgresBulkInsertProvider {
        PostgresBulkInsertProvider::new(Arc::new(PostgresSyntaxProvider::new()))
    }

    #[test]
    fn test_push_row_rejects_wrong_width() {
        let mut batch = RecordBatch::new("t", ["a", "b"]);
        assert!(batch.push_row(vec![1.into()]).is_err());
        assert!(batch.push_row(vec![1.into(), 2.into()]).is_ok());
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let mut conn = RecordingConnection::postgres();
        let batch = RecordBatch::new("cmsTags", ["id"]);
        assert_eq!(postgres().bulk_insert(&mut conn, &batch).await.unwrap(), 0);
        assert!(conn.calls().is_empty());
    }

    #[tokio::test]
    async fn test_opens_and_completes_own_transaction() {
        let mut conn = RecordingConnection::postgres().with_execute_results(vec![Ok(3)]);
        let inserted = postgres().bulk_insert(&mut conn, &tags()).await.unwrap();
        assert_eq!(inserted, 3);

        let calls = conn.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], Call::Begin(TransactionMode::Immediate));
        match &calls[1] {
            Call::Execute(cmd) => {
                assert_eq!(
                    cmd.sql,
                    "INSERT INTO \"cmstags\" (\"id\", \"tag\") VALUES ($1, $2), ($3, $4), ($5, $6)"
                );
                assert_eq!(cmd.params.len(), 6);
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(calls[2], Call::Complete);
    }

    #[tokio::test]
    async fn test_participates_in_caller_transaction() {
        let mut conn = RecordingConnection::postgres().in_transaction_already();
        postgres().bulk_insert(&mut conn, &tags()).await.unwrap();
        assert!(
            conn.calls()
                .iter()
                .all(|c| matches!(c, Call::Execute(_)))
        );
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn test_failure_aborts_own_transaction_and_keeps_error() {
        let mut conn = RecordingConnection::postgres().with_execute_results(vec![Err(
            DbError::database("duplicate key", Some("23505".into()), ""),
        )]);
        let err = postgres().bulk_insert(&mut conn, &tags()).await.unwrap_err();
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(conn.calls().last(), Some(&Call::Abort));
    }

    #[tokio::test]
    async fn test_failure_inside_caller_transaction_is_not_aborted() {
        let mut conn = RecordingConnection::postgres()
            .in_transaction_already()
            .with_execute_results(vec![Err(DbError::database("boom", None, ""))]);
        assert!(postgres().bulk_insert(&mut conn, &tags()).await.is_err());
        assert!(!conn.calls().contains(&Call::Abort));
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn test_chunks_under_parameter_limit() {
        let mut batch = RecordBatch::new("big", ["a", "b", "c"]);
        for i in 0..30_000i64 {
            batch.push_row(vec![i.into(), i.into(), i.into()]).unwrap();
        }
        let mut conn = RecordingConnection::postgres().in_transaction_already();
        postgres().bulk_insert(&mut conn, &batch).await.unwrap();

        let executes: Vec<_> = conn
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Execute(cmd) => Some(cmd.params.len()),
                _ => None,
            })
            .collect();
        assert_eq!(executes.len(), 2);
        assert!(executes.iter().all(|n| *n <= MAX_BIND_PARAMETERS));
        assert_eq!(executes.iter().sum::<usize>(), 90_000);
    }

    #[tokio::test]
    async fn test_row_by_row_fallback() {
        let provider = RowByRowBulkInsertProvider::new(Arc::new(SqliteSyntaxProvider::new()));
        let mut conn = RecordingConnection::sqlite();
        let inserted = provider.bulk_insert(&mut conn, &tags()).await.unwrap();
        assert_eq!(inserted, 3);

        let sql = conn.executed_sql();
        assert_eq!(sql.len(), 3);
        assert!(
            sql.iter()
                .all(|s| s == "INSERT INTO \"cmsTags\" (\"id\", \"tag\") VALUES (?1, ?2)")
        );
        assert_eq!(conn.calls().first(), Some(&Call::Begin(TransactionMode::Immediate)));
        assert_eq!(conn.calls().last(), Some(&Call::Complete));
    }
}
