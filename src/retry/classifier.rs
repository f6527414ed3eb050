//! Transient fault classification per backend.

use crate::error::DbError;

/// Decides whether a fault is worth retrying.
pub trait TransientFaultClassifier: Send + Sync + std::fmt::Debug {
    fn is_transient(&self, err: &DbError) -> bool;
}

/// SQLSTATE codes that are transient outside of their class.
const PG_TRANSIENT_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "55006", // object_in_use
    "57014", // query_canceled
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

/// Connection exception, insufficient resources, system error.
const PG_TRANSIENT_CLASSES: &[&str] = &["08", "53", "58"];

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresFaultClassifier;

impl TransientFaultClassifier for PostgresFaultClassifier {
    fn is_transient(&self, err: &DbError) -> bool {
        match err {
            DbError::Connection { .. } | DbError::Timeout { .. } => true,
            DbError::Database {
                sql_state: Some(code),
                ..
            } => {
                PG_TRANSIENT_CODES.contains(&code.as_str())
                    || PG_TRANSIENT_CLASSES
                        .iter()
                        .any(|class| code.starts_with(class))
            }
            _ => false,
        }
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteFaultClassifier;

impl TransientFaultClassifier for SqliteFaultClassifier {
    fn is_transient(&self, err: &DbError) -> bool {
        match err {
            DbError::Connection { .. } | DbError::Timeout { .. } => true,
            DbError::Database {
                sql_state: Some(code),
                ..
            } => match code.parse::<i32>() {
                // Extended codes keep the primary code in the low byte.
                Ok(extended) => matches!(extended & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
                Err(_) => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_err(code: &str) -> DbError {
        DbError::database("boom", Some(code.to_string()), "")
    }

    #[test]
    fn test_postgres_transient() {
        let c = PostgresFaultClassifier;
        assert!(c.is_transient(&DbError::connection("connection reset", "")));
        assert!(c.is_transient(&DbError::timeout("statement", 5)));
        assert!(c.is_transient(&db_err("40001")));
        assert!(c.is_transient(&db_err("40P01")));
        assert!(c.is_transient(&db_err("08006")));
        assert!(c.is_transient(&db_err("53300")));
        assert!(c.is_transient(&db_err("57P01")));
    }

    #[test]
    fn test_postgres_permanent() {
        let c = PostgresFaultClassifier;
        assert!(!c.is_transient(&db_err("23505")));
        assert!(!c.is_transient(&db_err("42601")));
        assert!(!c.is_transient(&db_err("28P01")));
        assert!(!c.is_transient(&DbError::database("no code", None, "")));
        assert!(!c.is_transient(&DbError::lock_not_found(1)));
        assert!(!c.is_transient(&DbError::write_lock_timeout(1)));
    }

    #[test]
    fn test_misconfiguration_is_permanent() {
        let faults: Vec<DbError> = vec![
            sqlx::Error::Configuration("invalid port number".into()).into(),
            sqlx::Error::Tls("certificate verify failed".into()).into(),
            sqlx::Error::Protocol("unexpected message".into()).into(),
        ];
        for err in &faults {
            assert!(!PostgresFaultClassifier.is_transient(err), "{err:?}");
            assert!(!SqliteFaultClassifier.is_transient(err), "{err:?}");
        }

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: DbError = sqlx::Error::Io(reset).into();
        assert!(PostgresFaultClassifier.is_transient(&err));
    }

    #[test]
    fn test_sqlite_busy_and_locked() {
        let c = SqliteFaultClassifier;
        assert!(c.is_transient(&db_err("5")));
        assert!(c.is_transient(&db_err("6")));
        assert!(c.is_transient(&db_err("517"))); // SQLITE_BUSY_SNAPSHOT
        assert!(c.is_transient(&db_err("262"))); // SQLITE_LOCKED_SHAREDCACHE
        assert!(!c.is_transient(&db_err("2067"))); // SQLITE_CONSTRAINT_UNIQUE
        assert!(!c.is_transient(&db_err("1")));
        assert!(c.is_transient(&DbError::connection("closed", "")));
    }
}
