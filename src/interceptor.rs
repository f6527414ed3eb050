//! Connection lifecycle interceptors.
//!
//! Every connection handed out by the connection manager passes through the
//! provider's [`InterceptorChain`]. An interceptor receives the connection
//! produced by the previous one and returns it, usually wrapped.

use crate::db::{Command, DbConnection, TransactionMode};
use crate::error::DbResult;
use crate::models::{ProviderName, Row};
use crate::retry::{RetryExecutor, RetrySafety};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub trait ConnectionInterceptor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn intercept(&self, conn: Box<dyn DbConnection>) -> DbResult<Box<dyn DbConnection>>;
}

/// Ordered list of interceptors.
#[derive(Debug, Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ConnectionInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: impl ConnectionInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn ConnectionInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Pass `conn` through every interceptor in order.
    pub fn apply(&self, conn: Box<dyn DbConnection>) -> DbResult<Box<dyn DbConnection>> {
        self.interceptors
            .iter()
            .try_fold(conn, |conn, interceptor| interceptor.intercept(conn))
    }
}

/// Logs every statement with its duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfilingInterceptor;

impl ConnectionInterceptor for ProfilingInterceptor {
    fn name(&self) -> &'static str {
        "profiling"
    }

    fn intercept(&self, conn: Box<dyn DbConnection>) -> DbResult<Box<dyn DbConnection>> {
        Ok(Box::new(ProfiledConnection { inner: conn }))
    }
}

struct ProfiledConnection {
    inner: Box<dyn DbConnection>,
}

#[async_trait]
impl DbConnection for ProfiledConnection {
    fn provider(&self) -> &ProviderName {
        self.inner.provider()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> DbResult<()> {
        self.inner.begin_transaction(mode).await
    }

    async fn complete_transaction(&mut self) -> DbResult<()> {
        self.inner.complete_transaction().await
    }

    async fn abort_transaction(&mut self) -> DbResult<()> {
        self.inner.abort_transaction().await
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        let start = Instant::now();
        let result = self.inner.execute(command).await;
        debug!(
            provider = %self.inner.provider(),
            sql = %command.sql,
            elapsed_ms = start.elapsed().as_millis() as u64,
            rows = result.as_ref().ok().copied(),
            ok = result.is_ok(),
            "Executed statement"
        );
        result
    }

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>> {
        let start = Instant::now();
        let result = self.inner.query(command).await;
        debug!(
            provider = %self.inner.provider(),
            sql = %command.sql,
            elapsed_ms = start.elapsed().as_millis() as u64,
            rows = result.as_ref().ok().map(Vec::len),
            ok = result.is_ok(),
            "Executed query"
        );
        result
    }
}

/// Begins every transaction deferred, so a transaction takes the SQLite
/// write lock only at its first write.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferDeferredInterceptor;

impl ConnectionInterceptor for PreferDeferredInterceptor {
    fn name(&self) -> &'static str {
        "prefer-deferred"
    }

    fn intercept(&self, conn: Box<dyn DbConnection>) -> DbResult<Box<dyn DbConnection>> {
        Ok(Box::new(DeferredConnection { inner: conn }))
    }
}

struct DeferredConnection {
    inner: Box<dyn DbConnection>,
}

#[async_trait]
impl DbConnection for DeferredConnection {
    fn provider(&self) -> &ProviderName {
        self.inner.provider()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    async fn begin_transaction(&mut self, _mode: TransactionMode) -> DbResult<()> {
        self.inner.begin_transaction(TransactionMode::Deferred).await
    }

    async fn complete_transaction(&mut self) -> DbResult<()> {
        self.inner.complete_transaction().await
    }

    async fn abort_transaction(&mut self) -> DbResult<()> {
        self.inner.abort_transaction().await
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.inner.execute(command).await
    }

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>> {
        self.inner.query(command).await
    }
}

/// Retries `retry_safe` commands that fail transiently outside a transaction.
#[derive(Debug, Clone)]
pub struct RetryPolicyInterceptor {
    executor: RetryExecutor,
}

impl RetryPolicyInterceptor {
    pub fn new(executor: RetryExecutor) -> Self {
        Self { executor }
    }
}

impl ConnectionInterceptor for RetryPolicyInterceptor {
    fn name(&self) -> &'static str {
        "retry-policy"
    }

    fn intercept(&self, conn: Box<dyn DbConnection>) -> DbResult<Box<dyn DbConnection>> {
        Ok(Box::new(RetryingConnection {
            inner: conn,
            executor: self.executor.clone(),
        }))
    }
}

struct RetryingConnection {
    inner: Box<dyn DbConnection>,
    executor: RetryExecutor,
}

type Statement<'c, T> = Pin<Box<dyn Future<Output = DbResult<T>> + Send + 'c>>;

fn execute_statement<'c>(conn: &'c mut dyn DbConnection, command: &'c Command) -> Statement<'c, u64> {
    conn.execute(command)
}

fn query_statement<'c>(
    conn: &'c mut dyn DbConnection,
    command: &'c Command,
) -> Statement<'c, Vec<Row>> {
    conn.query(command)
}

impl RetryingConnection {
    /// Inside a transaction a failed statement has already aborted the
    /// transaction on most backends, so only autocommit statements are retried.
    fn should_retry(&self, command: &Command) -> bool {
        command.retry_safe && !self.inner.in_transaction()
    }

    /// Run `statement`, retrying transient faults while the inner connection
    /// stays usable. The fault that ends the loop is returned unchanged.
    async fn run<T>(
        &mut self,
        command: &Command,
        statement: for<'c> fn(&'c mut dyn DbConnection, &'c Command) -> Statement<'c, T>,
    ) -> DbResult<T> {
        if !self.should_retry(command) {
            return statement(self.inner.as_mut(), command).await;
        }
        let mut attempts = self.executor.attempts(RetrySafety::Idempotent);
        loop {
            attempts.start();
            let err = match statement(self.inner.as_mut(), command).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.inner.is_usable() {
                debug!(
                    provider = %self.inner.provider(),
                    attempt = attempts.count(),
                    "Connection unusable after fault, not retrying"
                );
                return Err(attempts.give_up(err).into());
            }
            attempts.backoff(err).await?;
        }
    }
}

#[async_trait]
impl DbConnection for RetryingConnection {
    fn provider(&self) -> &ProviderName {
        self.inner.provider()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> DbResult<()> {
        self.inner.begin_transaction(mode).await
    }

    async fn complete_transaction(&mut self) -> DbResult<()> {
        self.inner.complete_transaction().await
    }

    async fn abort_transaction(&mut self) -> DbResult<()> {
        self.inner.abort_transaction().await
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.run(command, execute_statement).await
    }

    async fn query(&mut self, command: &Command) -> DbResult<Vec<Row>> {
        self.run(command, query_statement).await
    }
}
