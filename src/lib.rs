//! db-provider library
//!
//! A pluggable database provider layer. Each provider (PostgreSQL, SQLite)
//! contributes a SQL dialect, bulk insert, distributed locking, transient
//! fault classification, connection interceptors and database creation,
//! looked up by name through the provider registry.

pub mod bulk;
pub mod config;
pub mod creator;
pub mod db;
pub mod error;
pub mod interceptor;
pub mod locking;
pub mod models;
pub mod registry;
pub mod retry;
pub mod syntax;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use registry::{ProviderRegistry, ProviderServices};
