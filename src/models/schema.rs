//! Backend-neutral schema model.
//!
//! Migration code describes tables with these types; a syntax provider turns
//! them into dialect-specific DDL. Introspection results are also defined here.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Semantic column type, mapped to a concrete type name per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ColumnType {
    Integer,
    Long,
    Bool,
    Guid,
    DateTime,
    DateTimeOffset,
    Time,
    Decimal {
        precision: Option<u8>,
        scale: Option<u8>,
    },
    Double,
    /// Variable length; unbounded when `length` is None
    String {
        length: Option<u32>,
    },
    FixedString {
        length: u32,
    },
    Text,
    Blob,
}

/// Logical functions a column default or query may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemFunction {
    NewGuid,
    CurrentDateTime,
    CurrentUtcDateTime,
}

impl SystemFunction {
    /// Look up a logical function by name; unknown names yield None.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['_', ' '], "").as_str() {
            "newguid" | "newuniqueidentifier" => Some(Self::NewGuid),
            "currentdatetime" | "currenttimestamp" => Some(Self::CurrentDateTime),
            "currentutcdatetime" => Some(Self::CurrentUtcDateTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    /// Literal SQL expression, emitted as-is
    Literal(String),
    Function(SystemFunction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_name: Option<String>,
    /// Explicit column list for a composite key declared on this column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_columns: Option<Vec<String>>,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
}

impl ColumnDefinition {
    /// Create a new non-null column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            is_identity: false,
            is_primary_key: false,
            primary_key_name: None,
            primary_key_columns: None,
            is_unique: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark as identity; identity columns are always part of the primary key.
    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.is_primary_key = true;
        self
    }

    pub fn with_primary_key(mut self, is_pk: bool) -> Self {
        self.is_primary_key = is_pk;
        self
    }

    pub fn with_primary_key_name(mut self, name: impl Into<String>) -> Self {
        self.primary_key_name = Some(name.into());
        self
    }

    pub fn with_primary_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.is_unique = unique;
        self
    }

    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }
}

/// Foreign key referential action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    /// No clause is emitted; the backend default (NO ACTION) applies
    #[default]
    #[serde(alias = "no_action")]
    None,
    Cascade,
    SetNull,
    Restrict,
}

impl ForeignKeyAction {
    /// SQL keyword for the action, None when no clause should be emitted.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Cascade => Some("CASCADE"),
            Self::SetNull => Some("SET NULL"),
            Self::Restrict => Some("RESTRICT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub primary_table: String,
    pub primary_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKeyDefinition {
    /// Single-column foreign key from `foreign_table.column` to `primary_table.primary_column`.
    pub fn new(
        foreign_table: impl Into<String>,
        column: impl Into<String>,
        primary_table: impl Into<String>,
        primary_column: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            foreign_table: foreign_table.into(),
            foreign_columns: vec![column.into()],
            primary_table: primary_table.into(),
            primary_columns: vec![primary_column.into()],
            on_delete: ForeignKeyAction::None,
            on_update: ForeignKeyAction::None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn with_on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }

    /// Explicit name or `FK_<foreign>_<primary>_<first primary column>`.
    pub fn constraint_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "FK_{}_{}_{}",
                self.foreign_table,
                self.primary_table,
                self.primary_columns.first().map(String::as_str).unwrap_or("")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    #[default]
    NonClustered,
    UniqueNonClustered,
    Clustered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<IndexColumn>,
    #[serde(default)]
    pub index_type: IndexType,
}

impl IndexDefinition {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns
                .into_iter()
                .map(|c| IndexColumn {
                    name: c.into(),
                    descending: false,
                })
                .collect(),
            index_type: IndexType::NonClustered,
        }
    }

    pub fn unique(mut self) -> Self {
        self.index_type = IndexType::UniqueNonClustered;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a foreign key owned by this table.
    pub fn with_foreign_key(mut self, fk: ForeignKeyDefinition) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| c.is_primary_key)
    }

    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.is_identity)
    }

    /// Check structural invariants. DDL is never generated for an invalid table.
    pub fn validate(&self) -> DbResult<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::schema("Table name cannot be empty", ""));
        }
        if self.columns.is_empty() {
            return Err(DbError::schema("Table has no columns", &self.name));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(DbError::schema("Column name cannot be empty", &self.name));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(DbError::schema(
                    format!("Duplicate column '{}'", column.name),
                    &self.name,
                ));
            }
            if column.is_identity && !column.is_primary_key && !column.is_unique {
                return Err(DbError::schema(
                    format!(
                        "Identity column '{}' must be part of the primary key or unique",
                        column.name
                    ),
                    &self.name,
                ));
            }
            if let Some(pk_columns) = &column.primary_key_columns {
                self.require_columns(pk_columns, "primary key")?;
            }
        }

        for fk in &self.foreign_keys {
            self.validate_foreign_key(fk)?;
        }

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(DbError::schema(
                    format!("Index '{}' has no columns", index.name),
                    &self.name,
                ));
            }
            let names: Vec<String> = index.columns.iter().map(|c| c.name.clone()).collect();
            self.require_columns(&names, "index")?;
        }
        Ok(())
    }

    fn validate_foreign_key(&self, fk: &ForeignKeyDefinition) -> DbResult<()> {
        let name = fk.constraint_name();
        if !fk.foreign_table.eq_ignore_ascii_case(&self.name) {
            return Err(DbError::schema(
                format!(
                    "Foreign key '{}' belongs to table '{}'",
                    name, fk.foreign_table
                ),
                &self.name,
            ));
        }
        if fk.foreign_columns.is_empty() || fk.primary_columns.is_empty() {
            return Err(DbError::schema(
                format!("Foreign key '{}' has an empty column list", name),
                &self.name,
            ));
        }
        if fk.foreign_columns.len() != fk.primary_columns.len() {
            return Err(DbError::schema(
                format!(
                    "Foreign key '{}' maps {} columns onto {}",
                    name,
                    fk.foreign_columns.len(),
                    fk.primary_columns.len()
                ),
                &self.name,
            ));
        }
        self.require_columns(&fk.foreign_columns, "foreign key")?;

        // Self references can be checked against this table's keys.
        if fk.primary_table.eq_ignore_ascii_case(&self.name) {
            for column in &fk.primary_columns {
                let keyed = self
                    .column(column)
                    .is_some_and(|c| c.is_primary_key || c.is_unique);
                if !keyed {
                    return Err(DbError::schema(
                        format!(
                            "Foreign key '{}' references '{}', which is not a primary key or unique column",
                            name, column
                        ),
                        &self.name,
                    ));
                }
            }
        }
        Ok(())
    }

    fn require_columns(&self, columns: &[String], what: &str) -> DbResult<()> {
        for column in columns {
            if self.column(column).is_none() {
                return Err(DbError::schema(
                    format!("{} references unknown column '{}'", what, column),
                    &self.name,
                ));
            }
        }
        Ok(())
    }
}

/// A column as reported by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub table_name: String,
    pub column_name: String,
    pub ordinal: i64,
    pub is_nullable: bool,
    pub data_type: String,
    pub max_length: Option<i64>,
}

impl ColumnInfo {
    /// Base type combined with its length, e.g. `character varying(255)`.
    pub fn formatted_type(&self) -> String {
        match self.max_length {
            Some(len) if len > 0 => format!("{}({})", self.data_type, len),
            _ => self.data_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintPerColumn {
    pub table_name: String,
    pub column_name: String,
    pub constraint_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinedIndex {
    pub table_name: String,
    pub index_name: String,
    pub column_name: String,
    pub is_unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_table() -> TableDefinition {
        TableDefinition::new("umbracoNode")
            .with_column(ColumnDefinition::new("id", ColumnType::Integer).identity())
            .with_column(ColumnDefinition::new("parentId", ColumnType::Integer))
            .with_column(ColumnDefinition::new("uniqueId", ColumnType::Guid).with_unique(true))
            .with_column(
                ColumnDefinition::new("text", ColumnType::String { length: Some(255) }).nullable(),
            )
    }

    #[test]
    fn test_valid_table() {
        let table = node_table()
            .with_foreign_key(ForeignKeyDefinition::new(
                "umbracoNode",
                "parentId",
                "umbracoNode",
                "id",
            ))
            .with_index(IndexDefinition::new("IX_umbracoNode_text", ["text"]));
        assert!(table.validate().is_ok());
        assert!(table.has_identity());
        assert_eq!(table.primary_key_columns().count(), 1);
    }

    #[test]
    fn test_identity_requires_key() {
        let mut column = ColumnDefinition::new("id", ColumnType::Integer);
        column.is_identity = true;
        let table = TableDefinition::new("t").with_column(column);
        let err = table.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Identity column"));
    }

    #[test]
    fn test_foreign_key_unknown_column() {
        let table = node_table().with_foreign_key(ForeignKeyDefinition::new(
            "umbracoNode",
            "missing",
            "other",
            "id",
        ));
        assert!(matches!(table.validate(), Err(DbError::Schema { .. })));
    }

    #[test]
    fn test_foreign_key_column_count_mismatch() {
        let mut fk = ForeignKeyDefinition::new("umbracoNode", "parentId", "other", "id");
        fk.primary_columns.push("extra".to_string());
        let table = node_table().with_foreign_key(fk);
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("maps 1 columns onto 2"));
    }

    #[test]
    fn test_self_reference_must_target_key() {
        let table = node_table().with_foreign_key(ForeignKeyDefinition::new(
            "umbracoNode",
            "parentId",
            "umbracoNode",
            "text",
        ));
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("not a primary key or unique"));
    }

    #[test]
    fn test_duplicate_column() {
        let table = node_table().with_column(ColumnDefinition::new("ID", ColumnType::Long));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_foreign_key_default_name() {
        let fk = ForeignKeyDefinition::new("cmsContent", "nodeId", "umbracoNode", "id");
        assert_eq!(fk.constraint_name(), "FK_cmsContent_umbracoNode_id");
        assert_eq!(fk.with_name("FK_custom").constraint_name(), "FK_custom");
    }

    #[test]
    fn test_system_function_lookup() {
        assert_eq!(SystemFunction::from_name("NewGuid"), Some(SystemFunction::NewGuid));
        assert_eq!(
            SystemFunction::from_name("current_timestamp"),
            Some(SystemFunction::CurrentDateTime)
        );
        assert_eq!(SystemFunction::from_name("soundex"), None);
    }

    #[test]
    fn test_formatted_type() {
        let mut info = ColumnInfo {
            table_name: "t".to_string(),
            column_name: "c".to_string(),
            ordinal: 1,
            is_nullable: true,
            data_type: "character varying".to_string(),
            max_length: Some(255),
        };
        assert_eq!(info.formatted_type(), "character varying(255)");
        info.max_length = None;
        assert_eq!(info.formatted_type(), "character varying");
    }

    #[test]
    fn test_table_definition_from_json() {
        let json = r#"{
            "name": "dblock",
            "columns": [
                {"name": "id", "column_type": {"kind": "integer"}, "is_primary_key": true},
                {"name": "value", "column_type": {"kind": "integer"}},
                {"name": "name", "column_type": {"kind": "string", "length": 64}, "nullable": true}
            ]
        }"#;
        let table: TableDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(table.columns.len(), 3);
        assert_eq!(
            table.columns[2].column_type,
            ColumnType::String { length: Some(64) }
        );
        assert!(table.validate().is_ok());
    }
}
