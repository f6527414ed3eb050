//! Database dispatch macros for reducing code duplication.
//!
//! The same body is expanded once per backend variant, so it may use
//! backend-specific types as long as the text compiles for each.

/// Macro for generating match arms over `DbPool` variants.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Macro for generating match arms over `PhysicalConnection` variants.
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::PhysicalConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;
pub use impl_db_dispatch;
