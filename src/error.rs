//! Error types for the database provider layer.
//!
//! All faults raised by providers are expressed as [`DbError`]. The variants
//! map onto four kinds a caller cares about: configuration errors (never
//! retried), transient backend faults (retried by the retry executor),
//! lock timeouts (read or write, never retried by the locking mechanism) and
//! permanent backend faults.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE for PostgreSQL (e.g. "23505"), extended result code for SQLite (e.g. "5")
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Transaction error: {message} (operation: {operation})")]
    Transaction { message: String, operation: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Database provider '{provider}' is not registered")]
    ProviderNotFound { provider: String },

    #[error("LockObject with id={lock_id} does not exist")]
    LockNotFound { lock_id: i32 },

    #[error("Failed to acquire read lock for id {lock_id}")]
    ReadLockTimeout { lock_id: i32 },

    #[error("Failed to acquire write lock for id {lock_id}")]
    WriteLockTimeout { lock_id: i32 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a transaction usage error.
    pub fn transaction(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            operation: operation.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a provider not found error.
    pub fn provider_not_found(provider: impl Into<String>) -> Self {
        Self::ProviderNotFound {
            provider: provider.into(),
        }
    }

    pub fn lock_not_found(lock_id: i32) -> Self {
        Self::LockNotFound { lock_id }
    }

    pub fn read_lock_timeout(lock_id: i32) -> Self {
        Self::ReadLockTimeout { lock_id }
    }

    pub fn write_lock_timeout(lock_id: i32) -> Self {
        Self::WriteLockTimeout { lock_id }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::ProviderNotFound { .. } => {
                Some("Register the provider at startup or fix the configured provider name")
            }
            Self::LockNotFound { .. } => {
                Some("Seed the lock table row for this id before requesting a write lock")
            }
            _ => None,
        }
    }

    /// Get the SQLSTATE (PostgreSQL) or result code (SQLite) of a backend fault.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Fatal errors caused by configuration or malformed input, never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::ProviderNotFound { .. }
                | Self::LockNotFound { .. }
                | Self::Schema { .. }
                | Self::InvalidInput { .. }
        )
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            Self::ReadLockTimeout { .. } | Self::WriteLockTimeout { .. }
        )
    }

    /// Raised by the backend itself (including lost connections and timeouts).
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Convert a sqlx error, optionally keeping the server's detail and hint text.
    pub fn from_sqlx(err: sqlx::Error, include_error_detail: bool) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let mut message = db_err.message().to_string();
                if include_error_detail {
                    if let Some(pg) = db_err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                        if let Some(detail) = pg.detail() {
                            message = format!("{message} (detail: {detail})");
                        }
                        if let Some(hint) = pg.hint() {
                            message = format!("{message} (hint: {hint})");
                        }
                    }
                }
                let suggestion = suggestion_for_code(code.as_deref());
                DbError::database(message, code, suggestion)
            }
            other => other.into(),
        }
    }
}

fn suggestion_for_code(code: Option<&str>) -> &'static str {
    match code {
        Some(c) if c.starts_with("23") => "The statement violates a constraint; fix the data",
        Some(c) if c.starts_with("42") => "Check the SQL syntax and referenced objects",
        Some(c) if c.starts_with("28") => "Verify the username and password",
        Some("5") | Some("6") => "The database file is locked by another connection",
        _ => "Check the SQL syntax and referenced objects",
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::configuration(format!("Invalid connection settings: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = suggestion_for_code(code.as_deref());
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            // DbPool::acquire reports the configured limit; it is unknown here.
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out waiting for a pooled connection",
                "Raise acquire_timeout or max_connections",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            // Certificate and handshake failures do not go away on retry.
            sqlx::Error::Tls(tls_err) => DbError::configuration(format!(
                "TLS error: {}. Verify TLS configuration and certificates",
                tls_err
            )),
            sqlx::Error::Protocol(msg) => DbError::internal(format!(
                "Protocol error: {}. Check database server compatibility",
                msg
            )),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reopen the connection",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
