//! Provider identity and installer-facing metadata.

use crate::error::{DbError, DbResult};
use crate::models::connection::DatabaseType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Identity of a registered backend ("postgres", "sqlite", ...).
///
/// Names compare case-insensitively; a few driver aliases normalise to the
/// canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ProviderName(String);

impl ProviderName {
    pub const POSTGRES: &'static str = "postgres";
    pub const SQLITE: &'static str = "sqlite";

    pub fn new(name: impl AsRef<str>) -> Self {
        let lower = name.as_ref().trim().to_ascii_lowercase();
        let canonical = match lower.as_str() {
            "postgresql" | "npgsql" | "pg" => Self::POSTGRES.to_string(),
            "sqlite3" => Self::SQLITE.to_string(),
            _ => lower,
        };
        Self(canonical)
    }

    pub fn postgres() -> Self {
        Self(Self::POSTGRES.to_string())
    }

    pub fn sqlite() -> Self {
        Self(Self::SQLITE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProviderName {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(DbError::configuration("Provider name cannot be empty"));
        }
        Ok(Self::new(s))
    }
}

/// Values entered by an installer to build a connection string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseModel {
    /// Host, optionally with ":port". Ignored by file-based providers.
    pub server: Option<String>,
    pub database_name: String,
    pub login: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub integrated_auth: bool,
}

/// Installer-facing description of a provider.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ProviderMetadata {
    pub id: Uuid,
    pub sort_order: i32,
    pub display_name: String,
    pub default_database_name: String,
    pub provider_name: ProviderName,
    pub database_type: DatabaseType,
    pub supports_quick_install: bool,
    pub is_available: bool,
    pub requires_server: bool,
    pub server_placeholder: Option<String>,
    pub requires_credentials: bool,
    pub supports_integrated_authentication: bool,
    pub requires_connection_test: bool,
    pub force_create_database: bool,
}

const POSTGRES_PROVIDER_ID: Uuid = Uuid::from_u128(0x3a20eba4_efa9_4128_927a_07742112dfd1);
const SQLITE_PROVIDER_ID: Uuid = Uuid::from_u128(0x530386a2_b219_4d5f_b68c_b965e14c9ac9);

impl ProviderMetadata {
    pub fn postgres() -> Self {
        Self {
            id: POSTGRES_PROVIDER_ID,
            sort_order: -1,
            display_name: "PostgreSQL".to_string(),
            default_database_name: "app".to_string(),
            provider_name: ProviderName::postgres(),
            database_type: DatabaseType::PostgreSQL,
            supports_quick_install: false,
            is_available: true,
            requires_server: true,
            server_placeholder: Some("localhost:5432".to_string()),
            requires_credentials: true,
            supports_integrated_authentication: false,
            requires_connection_test: true,
            force_create_database: false,
        }
    }

    pub fn sqlite() -> Self {
        Self {
            id: SQLITE_PROVIDER_ID,
            sort_order: -1000,
            display_name: "SQLite".to_string(),
            default_database_name: "app".to_string(),
            provider_name: ProviderName::sqlite(),
            database_type: DatabaseType::SQLite,
            supports_quick_install: true,
            is_available: true,
            requires_server: false,
            server_placeholder: None,
            requires_credentials: false,
            supports_integrated_authentication: false,
            requires_connection_test: false,
            force_create_database: true,
        }
    }

    /// Build a connection URL from installer input.
    ///
    /// PostgreSQL URLs carry host, database, credentials and the `pooling` /
    /// `include_error_detail` flags understood by [`crate::config::DatabaseConfig::parse`].
    pub fn generate_connection_string(&self, model: &DatabaseModel) -> DbResult<String> {
        if model.database_name.trim().is_empty() {
            return Err(DbError::invalid_input("Database name is required"));
        }
        if model.integrated_auth && !self.supports_integrated_authentication {
            return Err(DbError::configuration(format!(
                "{} does not support integrated authentication",
                self.display_name
            )));
        }

        match self.database_type {
            DatabaseType::PostgreSQL => {
                let server = model
                    .server
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| DbError::invalid_input("Server is required"))?;
                let mut url = Url::parse(&format!("postgres://{server}/"))
                    .map_err(|e| DbError::invalid_input(format!("Invalid server '{server}': {e}")))?;

                if self.requires_credentials {
                    let login = model
                        .login
                        .as_deref()
                        .ok_or_else(|| DbError::invalid_input("Login is required"))?;
                    url.set_username(login)
                        .map_err(|_| DbError::invalid_input("Login cannot be set on this URL"))?;
                    url.set_password(model.password.as_deref())
                        .map_err(|_| DbError::invalid_input("Password cannot be set on this URL"))?;
                }
                url.set_path(&model.database_name);
                url.query_pairs_mut()
                    .append_pair("pooling", "true")
                    .append_pair("include_error_detail", "true");
                Ok(url.to_string())
            }
            DatabaseType::SQLite => {
                let file = if model.database_name.ends_with(".db")
                    || model.database_name.ends_with(".sqlite")
                {
                    model.database_name.clone()
                } else {
                    format!("{}.sqlite", model.database_name)
                };
                let mode = if self.force_create_database { "rwc" } else { "rw" };
                Ok(format!("sqlite:{file}?mode={mode}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name_aliases() {
        assert_eq!(ProviderName::new("Npgsql"), ProviderName::postgres());
        assert_eq!(ProviderName::new("PostgreSQL"), ProviderName::postgres());
        assert_eq!(ProviderName::new(" SQLite "), ProviderName::sqlite());
        assert_eq!(ProviderName::new("SqlServer").as_str(), "sqlserver");
        assert!("".parse::<ProviderName>().is_err());
    }

    #[test]
    fn test_postgres_metadata_flags() {
        let meta = ProviderMetadata::postgres();
        assert_eq!(
            meta.id.to_string(),
            "3a20eba4-efa9-4128-927a-07742112dfd1"
        );
        assert!(!meta.supports_quick_install);
        assert!(meta.requires_server);
        assert!(meta.requires_credentials);
        assert!(meta.requires_connection_test);
    }

    #[test]
    fn test_postgres_connection_string() {
        let meta = ProviderMetadata::postgres();
        let model = DatabaseModel {
            server: Some("db.local:5433".to_string()),
            database_name: "cms".to_string(),
            login: Some("app".to_string()),
            password: Some("p@ss word".to_string()),
            integrated_auth: false,
        };
        let cs = meta.generate_connection_string(&model).unwrap();
        let url = Url::parse(&cs).unwrap();
        assert_eq!(url.host_str(), Some("db.local"));
        assert_eq!(url.port(), Some(5433));
        assert_eq!(url.path(), "/cms");
        assert_eq!(url.username(), "app");
        assert!(!cs.contains("p@ss word"));
        assert!(cs.contains("pooling=true"));
        assert!(cs.contains("include_error_detail=true"));
    }

    #[test]
    fn test_postgres_connection_string_requires_server() {
        let meta = ProviderMetadata::postgres();
        let model = DatabaseModel {
            database_name: "cms".to_string(),
            login: Some("app".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            meta.generate_connection_string(&model),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_integrated_auth_rejected() {
        let meta = ProviderMetadata::postgres();
        let model = DatabaseModel {
            server: Some("localhost".to_string()),
            database_name: "cms".to_string(),
            integrated_auth: true,
            ..Default::default()
        };
        let err = meta.generate_connection_string(&model).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_sqlite_connection_string() {
        let meta = ProviderMetadata::sqlite();
        let model = DatabaseModel {
            database_name: "cms".to_string(),
            ..Default::default()
        };
        assert_eq!(
            meta.generate_connection_string(&model).unwrap(),
            "sqlite:cms.sqlite?mode=rwc"
        );
    }
}
