//! In-memory `DbConnection` that records calls and replays scripted results.

use crate::db::connection::{Command, DbConnection, TransactionMode};
use crate::error::{DbError, DbResult};
use crate::models::{ProviderName, Row};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Begin(TransactionMode),
    Complete,
    Abort,
    Execute(Command),
    Query(Command),
}

#[derive(Debug)]
pub struct RecordingConnection {
    provider: ProviderName,
    in_transaction: bool,
    breaks_on_timeout: bool,
    broken: bool,
    calls: Arc<Mutex<Vec<Call>>>,
    execute_results: VecDeque<DbResult<u64>>,
    query_results: VecDeque<DbResult<Vec<Row>>>,
}

impl RecordingConnection {
    pub fn new(provider: ProviderName) -> Self {
        Self {
            provider,
            in_transaction: false,
            breaks_on_timeout: false,
            broken: false,
            calls: Arc::new(Mutex::new(Vec::new())),
            execute_results: VecDeque::new(),
            query_results: VecDeque::new(),
        }
    }

    pub fn postgres() -> Self {
        Self::new(ProviderName::postgres())
    }

    pub fn sqlite() -> Self {
        Self::new(ProviderName::sqlite())
    }

    pub fn in_transaction_already(mut self) -> Self {
        self.in_transaction = true;
        self
    }

    /// Behave like a physical connection: a scripted `Timeout` leaves the
    /// connection unusable and every later statement fails.
    pub fn breaks_on_timeout(mut self) -> Self {
        self.breaks_on_timeout = true;
        self
    }

    /// Results handed out by `execute`, in order; `Ok(1)` once exhausted.
    pub fn with_execute_results(mut self, results: Vec<DbResult<u64>>) -> Self {
        self.execute_results = results.into();
        self
    }

    /// Results handed out by `query`, in order; empty once exhausted.
    pub fn with_query_results(mut self, results: Vec<DbResult<Vec<Row>>>) -> Self {
        self.query_results = results.into();
        self
    }

    /// Shared handle to the call log, usable after the connection is boxed.
    pub fn call_log(&self) -> Arc<Mutex<Vec<Call>>> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Execute(cmd) | Call::Query(cmd) => Some(cmd.sql),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next<T>(&mut self, scripted: Option<DbResult<T>>, fallback: T) -> DbResult<T> {
        if self.broken {
            return Err(DbError::connection("Connection is in an unknown state", ""));
        }
        let result = scripted.unwrap_or(Ok(fallback));
        if self.breaks_on_timeout && matches!(result, Err(DbError::Timeout { .. })) {
            self.broken = true;
        }
        result
    }
}

#[async_trait]
impl DbConnection for RecordingConnection {
    fn provider(&self) -> &ProviderName {
        &self.provider
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> DbResult<()> {
        self.record(Call::Begin(mode));
        self.in_transaction = true;
        Ok(())
    }

    async fn complete_transaction(&mut self) -> DbResult<()> {
        self.record(Call::Complete);
        self.in_transaction = false;
        Ok(())
    }

    async fn abort_transaction(&mut self) -> DbResult<()> {
        self.record(Call::Abort);
        self.in_transaction = false;
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.record(Call::Execute(command.clone()));
        let scripted = self.execute_results.pop_front();
        self.next(scripted, 1)
    }

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>> {
        self.record(Call::Query(command.clone()));
        let scripted = self.query_results.pop_front();
        self.next(scripted, Vec::new())
    }
}
