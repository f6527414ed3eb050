//! PostgreSQL dialect.
//!
//! Unquoted PostgreSQL identifiers fold to lower case, so every identifier is
//! lower-cased before quoting. Mixed-case names in table definitions then
//! resolve the same way whether or not a caller quotes them.

use super::{
    IsolationLevel, SqlSyntaxProvider, column_constraints, column_infos, defined_indexes,
    double_quote, table_names,
};
use crate::db::{Command, DbConnection};
use crate::error::DbResult;
use crate::models::{
    ColumnInfo, ColumnType, ConstraintPerColumn, DatabaseType, DefinedIndex, ProviderName,
    SystemFunction,
};
use async_trait::async_trait;

mod queries {
    pub const TABLES: &str = r#"
        SELECT table_name::text AS table_name
        FROM information_schema.tables
        WHERE table_type = 'BASE TABLE'
          AND table_schema = CURRENT_SCHEMA()
        ORDER BY table_name
        "#;

    pub const COLUMNS: &str = r#"
        SELECT
            table_name::text AS table_name,
            column_name::text AS column_name,
            ordinal_position::int8 AS ordinal,
            (is_nullable = 'YES') AS is_nullable,
            data_type::text AS data_type,
            character_maximum_length::int8 AS max_length
        FROM information_schema.columns
        WHERE table_schema = CURRENT_SCHEMA()
        ORDER BY table_name, ordinal_position
        "#;

    pub const CONSTRAINTS: &str = r#"
        SELECT
            kcu.table_name::text AS table_name,
            kcu.column_name::text AS column_name,
            kcu.constraint_name::text AS constraint_name
        FROM information_schema.key_column_usage kcu
        WHERE kcu.table_schema = CURRENT_SCHEMA()
        ORDER BY kcu.table_name, kcu.constraint_name, kcu.ordinal_position
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            t.relname::text AS table_name,
            i.relname::text AS index_name,
            a.attname::text AS column_name,
            ix.indisunique AS is_unique
        FROM pg_catalog.pg_index ix
        JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
        JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = CURRENT_SCHEMA()
          AND NOT ix.indisprimary
        ORDER BY t.relname, i.relname, a.attnum
        "#;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSyntaxProvider;

impl PostgresSyntaxProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SqlSyntaxProvider for PostgresSyntaxProvider {
    fn provider_name(&self) -> ProviderName {
        ProviderName::postgres()
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn quote_identifier(&self, name: &str) -> String {
        double_quote(&name.to_lowercase())
    }

    fn parameter(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn orderable_integer_sql(&self, expr: &str) -> String {
        format!("reverse(substr(reverse('0000000000'||{}), 1, 10))", expr)
    }

    fn orderable_decimal_sql(&self, expr: &str) -> String {
        format!("to_char({}, 'FM0000000000.0000000000')", expr)
    }

    fn format_system_function(&self, function: SystemFunction) -> Option<&'static str> {
        match function {
            SystemFunction::NewGuid => Some("gen_random_uuid()"),
            SystemFunction::CurrentDateTime => Some("CURRENT_TIMESTAMP"),
            SystemFunction::CurrentUtcDateTime => Some("(CURRENT_TIMESTAMP AT TIME ZONE 'UTC')"),
        }
    }

    fn default_isolation_level(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Long => "BIGINT".to_string(),
            ColumnType::Bool => "BOOL".to_string(),
            ColumnType::Guid => "UUID".to_string(),
            ColumnType::DateTime => "TIMESTAMP WITHOUT TIME ZONE".to_string(),
            ColumnType::DateTimeOffset => "TIMESTAMP WITH TIME ZONE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::Decimal { precision, scale } => match (precision, scale) {
                (Some(p), Some(s)) => format!("NUMERIC({},{})", p, s),
                (Some(p), None) => format!("NUMERIC({})", p),
                _ => "NUMERIC".to_string(),
            },
            ColumnType::Double => "REAL".to_string(),
            ColumnType::String { length: Some(n) } => format!("VARCHAR({})", n),
            ColumnType::String { length: None } | ColumnType::Text => "TEXT".to_string(),
            ColumnType::FixedString { length } => format!("CHAR({})", length),
            ColumnType::Blob => "BYTEA".to_string(),
        }
    }

    fn format_identity(&self) -> &'static str {
        "PRIMARY KEY GENERATED BY DEFAULT AS IDENTITY"
    }

    async fn get_tables_in_schema(&self, conn: &mut dyn DbConnection) -> DbResult<Vec<String>> {
        table_names(conn.query(&Command::new(queries::TABLES)).await?)
    }

    async fn get_columns_in_schema(
        &self,
        conn: &mut dyn DbConnection,
    ) -> DbResult<Vec<ColumnInfo>> {
        column_infos(conn.query(&Command::new(queries::COLUMNS)).await?)
    }

    async fn get_constraints_per_column(
        &self,
        conn: &mut dyn DbConnection,
    ) -> DbResult<Vec<ConstraintPerColumn>> {
        column_constraints(conn.query(&Command::new(queries::CONSTRAINTS)).await?)
    }

    async fn get_defined_indexes(
        &self,
        conn: &mut dyn DbConnection,
    ) -> DbResult<Vec<DefinedIndex>> {
        defined_indexes(conn.query(&Command::new(queries::INDEXES)).await?)
    }
}
