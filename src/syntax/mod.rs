//! SQL dialect translation.
//!
//! A [`SqlSyntaxProvider`] turns the backend-neutral schema model into DDL for
//! one backend and supplies the dialect fragments (quoting, pagination,
//! placeholders, orderable text encodings, system functions) the wider query
//! layer needs. Schema introspection runs through a [`DbConnection`] and only
//! looks at the active schema.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresSyntaxProvider;
pub use sqlite::SqliteSyntaxProvider;

use crate::db::{Command, DbConnection};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefault, ColumnDefinition, ColumnInfo, ColumnType, ConstraintPerColumn, DatabaseType,
    DefinedIndex, ForeignKeyDefinition, IndexDefinition, IndexType, ProviderName, Row,
    SystemFunction, TableDefinition,
};
use async_trait::async_trait;
use tracing::info;

/// Digits in the integer part of orderable encodings.
pub const ORDERABLE_WIDTH: usize = 10;

/// Digits in the fraction part of orderable decimal encodings.
pub const ORDERABLE_SCALE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Encode a non-negative integer as fixed-width zero-padded text.
///
/// For `0 <= a < b < 10^10`, `encode(a) < encode(b)` as plain string
/// comparison. Negative or wider values cannot be encoded.
pub fn encode_orderable_integer(value: i64) -> Option<String> {
    if value < 0 {
        return None;
    }
    let digits = value.to_string();
    if digits.len() > ORDERABLE_WIDTH {
        return None;
    }
    Some(format!("{:0>width$}", digits, width = ORDERABLE_WIDTH))
}

/// Encode a non-negative decimal as `IIIIIIIIII.FFFFFFFFFF`.
pub fn encode_orderable_decimal(value: f64) -> Option<String> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let width = ORDERABLE_WIDTH + 1 + ORDERABLE_SCALE;
    let encoded = format!("{:0width$.scale$}", value, width = width, scale = ORDERABLE_SCALE);
    // Rounding can carry into an eleventh integer digit.
    (encoded.len() == width).then_some(encoded)
}

/// Standard double-quote identifier quoting, embedded quotes doubled.
pub(crate) fn double_quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
pub trait SqlSyntaxProvider: Send + Sync + std::fmt::Debug {
    fn provider_name(&self) -> ProviderName;

    fn database_type(&self) -> DatabaseType;

    /// Quote an identifier according to the backend's case-folding rules.
    fn quote_identifier(&self, name: &str) -> String;

    fn quote_table_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    fn quote_column_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    fn quote_index_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    fn quote_constraint_name(&self, name: &str) -> String {
        self.quote_identifier(name)
    }

    /// Reverse [`quote_identifier`](Self::quote_identifier) quoting.
    fn unquote_identifier(&self, quoted: &str) -> String {
        let trimmed = quoted.trim();
        match trimmed
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
        {
            Some(inner) => inner.replace("\"\"", "\""),
            None => trimmed.to_string(),
        }
    }

    /// Whether two unquoted identifiers name the same object.
    fn identifiers_equal(&self, a: &str, b: &str) -> bool {
        a.eq_ignore_ascii_case(b)
    }

    /// Find `name` (quoted or not, any case) in a catalog listing.
    fn resolve_table<'a>(&self, name: &str, catalog: &'a [String]) -> Option<&'a str> {
        let wanted = self.unquote_identifier(name);
        catalog
            .iter()
            .find(|candidate| self.identifiers_equal(candidate, &wanted))
            .map(String::as_str)
    }

    /// Positional placeholder for the 1-based parameter `index`.
    fn parameter(&self, index: usize) -> String;

    /// Cap a query at `rows` rows.
    fn limit(&self, sql: &str, rows: u64) -> String {
        format!("{} LIMIT {}", sql.trim_end(), rows)
    }

    /// SQL producing the orderable text form of an integer expression.
    fn orderable_integer_sql(&self, expr: &str) -> String;

    /// SQL producing the orderable text form of a decimal expression.
    fn orderable_decimal_sql(&self, expr: &str) -> String;

    fn orderable_date_sql(&self, expr: &str) -> String {
        expr.to_string()
    }

    /// Native expression for a logical function; None when unsupported.
    fn format_system_function(&self, function: SystemFunction) -> Option<&'static str>;

    fn format_system_function_name(&self, name: &str) -> Option<&'static str> {
        SystemFunction::from_name(name).and_then(|f| self.format_system_function(f))
    }

    fn default_isolation_level(&self) -> IsolationLevel;

    fn supports_clustered_index(&self) -> bool {
        false
    }

    fn supports_identity_insert(&self) -> bool {
        true
    }

    /// Concrete type name for a semantic column type.
    fn column_type(&self, column_type: &ColumnType) -> String;

    /// Identity clause appended to an identity column.
    fn format_identity(&self) -> &'static str;

    fn format_default(&self, column: &ColumnDefinition) -> DbResult<Option<String>> {
        match &column.default {
            None => Ok(None),
            Some(ColumnDefault::Literal(expr)) => Ok(Some(format!("DEFAULT {}", expr))),
            Some(ColumnDefault::Function(function)) => self
                .format_system_function(*function)
                .map(|native| Some(format!("DEFAULT {}", native)))
                .ok_or_else(|| {
                    DbError::schema(
                        format!(
                            "{:?} is not supported by {}",
                            function,
                            self.database_type()
                        ),
                        &column.name,
                    )
                }),
        }
    }

    /// `name type NULL|NOT NULL [DEFAULT ..] [identity]`
    fn format_column(&self, column: &ColumnDefinition) -> DbResult<String> {
        let mut clauses = vec![
            self.quote_column_name(&column.name),
            self.column_type(&column.column_type),
            if column.nullable { "NULL" } else { "NOT NULL" }.to_string(),
        ];
        if let Some(default) = self.format_default(column)? {
            clauses.push(default);
        }
        if column.is_identity {
            clauses.push(self.format_identity().to_string());
        }
        Ok(clauses.join(" "))
    }

    /// Table-level primary key constraint, None when no column is a key.
    ///
    /// The constraint degrades to `UNIQUE` when the table has an identity
    /// column, since the identity column already carries the key inline.
    fn format_primary_key(&self, table: &TableDefinition) -> Option<String> {
        let first = table.columns.iter().find(|c| c.is_primary_key)?;

        let name = first
            .primary_key_name
            .clone()
            .unwrap_or_else(|| format!("PK_{}", table.name));

        let columns: Vec<String> = match &first.primary_key_columns {
            Some(explicit) if !explicit.is_empty() => explicit
                .iter()
                .map(|c| self.quote_column_name(c.trim()))
                .collect(),
            _ => table
                .primary_key_columns()
                .map(|c| self.quote_column_name(&c.name))
                .collect(),
        };

        let kind = if table.has_identity() {
            "UNIQUE"
        } else {
            "PRIMARY KEY"
        };

        Some(format!(
            "CONSTRAINT {} {} ({})",
            self.quote_constraint_name(&name),
            kind,
            columns.join(", ")
        ))
    }

    /// `CONSTRAINT .. FOREIGN KEY (..) REFERENCES .. (..) [ON DELETE ..] [ON UPDATE ..]`
    fn format_foreign_key_clause(&self, fk: &ForeignKeyDefinition) -> String {
        let foreign: Vec<String> = fk
            .foreign_columns
            .iter()
            .map(|c| self.quote_column_name(c))
            .collect();
        let primary: Vec<String> = fk
            .primary_columns
            .iter()
            .map(|c| self.quote_column_name(c))
            .collect();

        let mut sql = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote_constraint_name(&fk.constraint_name()),
            foreign.join(", "),
            self.quote_table_name(&fk.primary_table),
            primary.join(", ")
        );
        if let Some(action) = fk.on_delete.as_sql() {
            sql.push_str(" ON DELETE ");
            sql.push_str(action);
        }
        if let Some(action) = fk.on_update.as_sql() {
            sql.push_str(" ON UPDATE ");
            sql.push_str(action);
        }
        sql
    }

    /// Foreign keys go inside `CREATE TABLE` instead of a separate `ALTER TABLE`.
    fn inline_foreign_keys(&self) -> bool {
        false
    }

    fn format_foreign_key(&self, fk: &ForeignKeyDefinition) -> String {
        format!(
            "ALTER TABLE {} ADD {}",
            self.quote_table_name(&fk.foreign_table),
            self.format_foreign_key_clause(fk)
        )
    }

    fn index_type_keyword(&self, index_type: IndexType) -> &'static str {
        match index_type {
            IndexType::UniqueNonClustered => "UNIQUE",
            IndexType::NonClustered | IndexType::Clustered => "",
        }
    }

    fn format_index(&self, table_name: &str, index: &IndexDefinition) -> String {
        let columns: Vec<String> = index
            .columns
            .iter()
            .map(|c| {
                let quoted = self.quote_column_name(&c.name);
                if c.descending {
                    format!("{} DESC", quoted)
                } else {
                    quoted
                }
            })
            .collect();

        let keyword = self.index_type_keyword(index.index_type);
        let create = if keyword.is_empty() {
            "CREATE INDEX".to_string()
        } else {
            format!("CREATE {} INDEX", keyword)
        };

        format!(
            "{} {} ON {} ({})",
            create,
            self.quote_index_name(&index.name),
            self.quote_table_name(table_name),
            columns.join(", ")
        )
    }

    /// `CREATE TABLE` with the columns. Table-level key constraints are left
    /// out when `skip_keys` is set.
    fn format_create_table(&self, table: &TableDefinition, skip_keys: bool) -> DbResult<String> {
        table.validate()?;

        let mut lines = Vec::with_capacity(table.columns.len() + 1);
        for column in &table.columns {
            lines.push(self.format_column(column)?);
        }
        if !skip_keys {
            if let Some(pk) = self.format_primary_key(table) {
                lines.push(pk);
            }
            if self.inline_foreign_keys() {
                lines.extend(
                    table
                        .foreign_keys
                        .iter()
                        .map(|fk| self.format_foreign_key_clause(fk)),
                );
            }
        }

        Ok(format!(
            "CREATE TABLE {}\n(\n{}\n)",
            self.quote_table_name(&table.name),
            lines.join(",\n")
        ))
    }

    /// Every statement needed to create `table`: the table, its indexes, then
    /// its foreign keys. Nothing is returned for an invalid definition.
    fn create_table_statements(
        &self,
        table: &TableDefinition,
        skip_keys_and_indexes: bool,
    ) -> DbResult<Vec<String>> {
        let mut statements = vec![self.format_create_table(table, skip_keys_and_indexes)?];
        if skip_keys_and_indexes {
            return Ok(statements);
        }
        statements.extend(
            table
                .indexes
                .iter()
                .map(|index| self.format_index(&table.name, index)),
        );
        if !self.inline_foreign_keys() {
            statements.extend(table.foreign_keys.iter().map(|fk| self.format_foreign_key(fk)));
        }
        Ok(statements)
    }

    /// Run the statements from [`create_table_statements`](Self::create_table_statements).
    async fn create_table(
        &self,
        conn: &mut dyn DbConnection,
        table: &TableDefinition,
        skip_keys_and_indexes: bool,
    ) -> DbResult<()> {
        let statements = self.create_table_statements(table, skip_keys_and_indexes)?;
        for sql in statements {
            info!(table = %table.name, "Create table:\n {}", sql);
            conn.execute(&Command::new(sql)).await?;
        }
        Ok(())
    }

    /// Base tables in the active schema.
    async fn get_tables_in_schema(&self, conn: &mut dyn DbConnection) -> DbResult<Vec<String>>;

    async fn get_columns_in_schema(&self, conn: &mut dyn DbConnection)
    -> DbResult<Vec<ColumnInfo>>;

    async fn get_constraints_per_column(
        &self,
        conn: &mut dyn DbConnection,
    ) -> DbResult<Vec<ConstraintPerColumn>>;

    async fn get_defined_indexes(&self, conn: &mut dyn DbConnection)
    -> DbResult<Vec<DefinedIndex>>;

    async fn does_table_exist(&self, conn: &mut dyn DbConnection, name: &str) -> DbResult<bool> {
        let tables = self.get_tables_in_schema(conn).await?;
        Ok(self.resolve_table(name, &tables).is_some())
    }
}

fn required_string(row: &Row, column: &str) -> DbResult<String> {
    row.get_string(column).ok_or_else(|| {
        DbError::internal(format!("Introspection row is missing '{}'", column))
    })
}

/// Decode rows aliased `table_name`.
pub(crate) fn table_names(rows: Vec<Row>) -> DbResult<Vec<String>> {
    rows.iter()
        .map(|row| required_string(row, "table_name"))
        .collect()
}

/// Decode rows aliased `table_name, column_name, ordinal, is_nullable, data_type, max_length`.
pub(crate) fn column_infos(rows: Vec<Row>) -> DbResult<Vec<ColumnInfo>> {
    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                table_name: required_string(row, "table_name")?,
                column_name: required_string(row, "column_name")?,
                ordinal: row.get_i64("ordinal").unwrap_or_default(),
                is_nullable: row.get_bool("is_nullable").unwrap_or(true),
                data_type: required_string(row, "data_type")?,
                max_length: row.get_i64("max_length"),
            })
        })
        .collect()
}

/// Decode rows aliased `table_name, column_name, constraint_name`.
pub(crate) fn column_constraints(rows: Vec<Row>) -> DbResult<Vec<ConstraintPerColumn>> {
    rows.iter()
        .map(|row| {
            Ok(ConstraintPerColumn {
                table_name: required_string(row, "table_name")?,
                column_name: required_string(row, "column_name")?,
                constraint_name: required_string(row, "constraint_name")?,
            })
        })
        .collect()
}

/// Decode rows aliased `table_name, index_name, column_name, is_unique`.
pub(crate) fn defined_indexes(rows: Vec<Row>) -> DbResult<Vec<DefinedIndex>> {
    rows.iter()
        .map(|row| {
            Ok(DefinedIndex {
                table_name: required_string(row, "table_name")?,
                index_name: required_string(row, "index_name")?,
                column_name: required_string(row, "column_name")?,
                is_unique: row.get_bool("is_unique").unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_orderable_integer() {
        assert_eq!(encode_orderable_integer(0).as_deref(), Some("0000000000"));
        assert_eq!(encode_orderable_integer(42).as_deref(), Some("0000000042"));
        assert_eq!(
            encode_orderable_integer(9_999_999_999).as_deref(),
            Some("9999999999")
        );
        assert_eq!(encode_orderable_integer(10_000_000_000), None);
        assert_eq!(encode_orderable_integer(-1), None);
    }

    #[test]
    fn test_orderable_integer_preserves_order() {
        let samples: Vec<i64> = vec![
            0,
            1,
            2,
            9,
            10,
            11,
            99,
            100,
            999,
            1_000,
            65_535,
            1_000_000,
            123_456_789,
            999_999_999,
            1_000_000_000,
            9_999_999_999,
        ];
        for a in &samples {
            for b in &samples {
                if a < b {
                    let ea = encode_orderable_integer(*a).unwrap();
                    let eb = encode_orderable_integer(*b).unwrap();
                    assert!(ea < eb, "{a} -> {ea} should sort before {b} -> {eb}");
                }
            }
        }
    }

    #[test]
    fn test_orderable_decimal() {
        assert_eq!(
            encode_orderable_decimal(12.5).as_deref(),
            Some("0000000012.5000000000")
        );
        assert!(encode_orderable_decimal(3.25).unwrap() < encode_orderable_decimal(12.5).unwrap());
        assert!(encode_orderable_decimal(0.1).unwrap() < encode_orderable_decimal(0.25).unwrap());
        assert_eq!(encode_orderable_decimal(-0.5), None);
        assert_eq!(encode_orderable_decimal(f64::NAN), None);
        assert_eq!(encode_orderable_decimal(1e10), None);
    }

    #[test]
    fn test_double_quote_escapes() {
        assert_eq!(double_quote("a\"b"), "\"a\"\"b\"");
    }
}
