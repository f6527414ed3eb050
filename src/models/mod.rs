//! Data models for the provider layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod provider;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, ConnectionInfo, DatabaseType};
pub use provider::{DatabaseModel, ProviderMetadata, ProviderName};
pub use schema::{
    ColumnDefault, ColumnDefinition, ColumnInfo, ColumnType, ConstraintPerColumn, DefinedIndex,
    ForeignKeyAction, ForeignKeyDefinition, IndexColumn, IndexDefinition, IndexType,
    SystemFunction, TableDefinition,
};
pub use value::{Row, SqlValue};
