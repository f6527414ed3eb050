//! Database access layer.
//!
//! This module provides:
//! - Connection pool management
//! - The unit-of-work connection abstraction and its sqlx implementation
//! - Parameter binding and row decoding
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod params;
pub mod pool;
pub mod types;

pub use connection::{Command, DbConnection, PhysicalConnection, SqlxConnection, TransactionMode};
pub use pool::{ConnectionManager, DbPool};

#[cfg(test)]
pub(crate) mod testing;
