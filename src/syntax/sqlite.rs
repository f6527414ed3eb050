//! SQLite dialect.
//!
//! SQLite keeps identifier case but compares names case-insensitively.
//! Foreign keys cannot be added after creation, so they are emitted inside
//! `CREATE TABLE`. Introspection reads `sqlite_master` joined with the
//! table-valued pragma functions.

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
        SELECT name AS table_name
        FROM sqlite_master
        WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#;

    pub const COLUMNS: &str = r#"
        SELECT
            m.name AS table_name,
            p.name AS column_name,
            p.cid + 1 AS ordinal,
            p."notnull" = 0 AS is_nullable,
            p.type AS data_type,
            NULL AS max_length
        FROM sqlite_master AS m
        JOIN pragma_table_info(m.name) AS p
        WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
        ORDER BY m.name, p.cid
        "#;

    // SQLite does not keep constraint names queryable; they are rebuilt with
    // the same conventions DDL generation uses.
    pub const CONSTRAINTS: &str = r#"
        SELECT
            m.name AS table_name,
            p.name AS column_name,
            'PK_' || m.name AS constraint_name
        FROM sqlite_master AS m
        JOIN pragma_table_info(m.name) AS p
        WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' AND p.pk > 0
        UNION ALL
        SELECT
            m.name AS table_name,
            f."from" AS column_name,
            'FK_' || m.name || '_' || f."table" || '_' || COALESCE(f."to", '') AS constraint_name
        FROM sqlite_master AS m
        JOIN pragma_foreign_key_list(m.name) AS f
        WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
        ORDER BY 1, 3
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            m.name AS table_name,
            il.name AS index_name,
            ii.name AS column_name,
            il."unique" AS is_unique
        FROM sqlite_master AS m
        JOIN pragma_index_list(m.name) AS il
        JOIN pragma_index_info(il.name) AS ii
        WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' AND il.origin = 'c'
        ORDER BY m.name, il.name, ii.seqno
        "#;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteSyntaxProvider;

impl SqliteSyntaxProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SqlSyntaxProvider for SqliteSyntaxProvider {
    fn provider_name(&self) -> ProviderName {
        ProviderName::sqlite()
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn quote_identifier(&self, name: &str) -> String {
        double_quote(name)
    }

    fn parameter(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn orderable_integer_sql(&self, expr: &str) -> String {
        format!("substr('0000000000'||{}, -10, 10)", expr)
    }

    fn orderable_decimal_sql(&self, expr: &str) -> String {
        format!("printf('%021.10f', {})", expr)
    }

    fn format_system_function(&self, function: SystemFunction) -> Option<&'static str> {
        match function {
            SystemFunction::NewGuid => None,
            // SQLite's clock is UTC.
            SystemFunction::CurrentDateTime | SystemFunction::CurrentUtcDateTime => {
                Some("CURRENT_TIMESTAMP")
            }
        }
    }

    fn default_isolation_level(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }

    fn column_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Integer | ColumnType::Long | ColumnType::Bool => "INTEGER",
            ColumnType::Decimal { .. } => "NUMERIC",
            ColumnType::Double => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Guid
            | ColumnType::DateTime
            | ColumnType::DateTimeOffset
            | ColumnType::Time
            | ColumnType::String { .. }
            | ColumnType::FixedString { .. }
            | ColumnType::Text => "TEXT",
        }
        .to_string()
    }

    fn format_identity(&self) -> &'static str {
        "PRIMARY KEY AUTOINCREMENT"
    }

    fn inline_foreign_keys(&self) -> bool {
        true
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::models::{
        ColumnDefault, ColumnDefinition, ForeignKeyAction, ForeignKeyDefinition, IndexDefinition,
        TableDefinition,
    };

    #[test]
    fn test_quoting_preserves_case() {
        let syntax = SqliteSyntaxProvider::new();
        assert_eq!(syntax.quote_table_name("umbracoNode"), "\"umbracoNode\"");
        assert_eq!(syntax.unquote_identifier("\"umbracoNode\""), "umbracoNode");
        let catalog = vec!["umbracoNode".to_string()];
        assert_eq!(
            syntax.resolve_table("UMBRACONODE", &catalog),
            Some("umbracoNode")
        );
    }

    #[test]
    fn test_parameter_placeholder() {
        assert_eq!(SqliteSyntaxProvider::new().parameter(2), "?2");
    }

    #[test]
    fn test_identity_is_integer_autoincrement() {
        let syntax = SqliteSyntaxProvider::new();
        let table = TableDefinition::new("umbracoNode")
            .with_column(ColumnDefinition::new("id", ColumnType::Long).identity())
            .with_column(ColumnDefinition::new("trashed", ColumnType::Bool));
        let sql = syntax.format_create_table(&table, false).unwrap();
        assert!(sql.contains("\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("CONSTRAINT \"PK_umbracoNode\" UNIQUE (\"id\")"));
    }

    #[test]
    fn test_foreign_keys_are_inline() {
        let syntax = SqliteSyntaxProvider::new();
        let table = TableDefinition::new("cmsContent")
            .with_column(ColumnDefinition::new("nodeId", ColumnType::Integer).with_primary_key(true))
            .with_foreign_key(
                ForeignKeyDefinition::new("cmsContent", "nodeId", "umbracoNode", "id")
                    .with_on_delete(ForeignKeyAction::SetNull),
            );
        let statements = syntax.create_table_statements(&table, false).unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains(
            "CONSTRAINT \"FK_cmsContent_umbracoNode_id\" FOREIGN KEY (\"nodeId\") \
             REFERENCES \"umbracoNode\" (\"id\") ON DELETE SET NULL"
        ));
        assert!(statements[0].contains("CONSTRAINT \"PK_cmsContent\" PRIMARY KEY (\"nodeId\")"));

        let skipped = syntax.create_table_statements(&table, true).unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(!skipped[0].contains("CONSTRAINT"));
    }

    #[test]
    fn test_new_guid_default_is_unsupported() {
        let syntax = SqliteSyntaxProvider::new();
        assert_eq!(syntax.format_system_function(SystemFunction::NewGuid), None);
        let table = TableDefinition::new("t").with_column(
            ColumnDefinition::new("key", ColumnType::Guid)
                .with_default(ColumnDefault::Function(SystemFunction::NewGuid)),
        );
        assert!(matches!(
            syntax.create_table_statements(&table, false),
            Err(DbError::Schema { .. })
        ));
    }

    #[test]
    fn test_unique_index() {
        let syntax = SqliteSyntaxProvider::new();
        let index = IndexDefinition::new("IX_umbracoNode_uniqueId", ["uniqueId"]).unique();
        assert_eq!(
            syntax.format_index("umbracoNode", &index),
            "CREATE UNIQUE INDEX \"IX_umbracoNode_uniqueId\" ON \"umbracoNode\" (\"uniqueId\")"
        );
    }

    #[test]
    fn test_orderable_fragments() {
        let syntax = SqliteSyntaxProvider::new();
        assert_eq!(
            syntax.orderable_integer_sql("level"),
            "substr('0000000000'||level, -10, 10)"
        );
        assert_eq!(
            syntax.orderable_decimal_sql("price"),
            "printf('%021.10f', price)"
        );
    }
}
