//! Provider registry.
//!
//! Every provider contributes one [`ProviderServices`] bundle. Lookups are
//! plain map reads; registering under an existing name replaces the entry.

use crate::bulk::{BulkInsertProvider, PostgresBulkInsertProvider, RowByRowBulkInsertProvider};
use crate::config::ProviderSettings;
use crate::creator::{DatabaseCreator, PostgresDatabaseCreator, SqliteDatabaseCreator};
use crate::error::{DbError, DbResult};
use crate::interceptor::{
    InterceptorChain, PreferDeferredInterceptor, ProfilingInterceptor, RetryPolicyInterceptor,
};
use crate::locking::{
    DistributedLockingMechanism, PostgresDistributedLockingMechanism,
    SqliteDistributedLockingMechanism,
};
use crate::models::{ProviderMetadata, ProviderName};
use crate::retry::{
    PostgresFaultClassifier, RetryExecutor, SqliteFaultClassifier, TransientFaultClassifier,
};
use crate::syntax::{PostgresSyntaxProvider, SqlSyntaxProvider, SqliteSyntaxProvider};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, info};

/// Everything a provider contributes.
#[derive(Debug, Clone)]
pub struct ProviderServices {
    pub name: ProviderName,
    pub syntax: Arc<dyn SqlSyntaxProvider>,
    pub bulk_insert: Arc<dyn BulkInsertProvider>,
    pub locking: Arc<dyn DistributedLockingMechanism>,
    pub classifier: Arc<dyn TransientFaultClassifier>,
    pub retry: RetryExecutor,
    pub metadata: ProviderMetadata,
    pub interceptors: InterceptorChain,
    pub creator: Arc<dyn DatabaseCreator>,
}

impl ProviderServices {
    pub fn postgres(settings: &ProviderSettings) -> Self {
        let syntax: Arc<dyn SqlSyntaxProvider> = Arc::new(PostgresSyntaxProvider::new());
        let classifier: Arc<dyn TransientFaultClassifier> = Arc::new(PostgresFaultClassifier);
        let retry = RetryExecutor::new(Arc::new(settings.retry.to_policy()), classifier.clone());

        Self {
            name: ProviderName::postgres(),
            bulk_insert: Arc::new(PostgresBulkInsertProvider::new(syntax.clone())),
            locking: Arc::new(PostgresDistributedLockingMechanism::new(
                settings.lock.clone(),
                syntax.clone(),
            )),
            interceptors: InterceptorChain::new()
                .with(ProfilingInterceptor)
                .with(RetryPolicyInterceptor::new(retry.clone())),
            syntax,
            classifier,
            retry,
            metadata: ProviderMetadata::postgres(),
            creator: Arc::new(PostgresDatabaseCreator::new()),
        }
    }

    pub fn sqlite(settings: &ProviderSettings) -> Self {
        let syntax: Arc<dyn SqlSyntaxProvider> = Arc::new(SqliteSyntaxProvider::new());
        let classifier: Arc<dyn TransientFaultClassifier> = Arc::new(SqliteFaultClassifier);
        let retry = RetryExecutor::new(Arc::new(settings.retry.to_policy()), classifier.clone());

        Self {
            name: ProviderName::sqlite(),
            bulk_insert: Arc::new(RowByRowBulkInsertProvider::new(syntax.clone())),
            locking: Arc::new(SqliteDistributedLockingMechanism::new(
                settings.lock.clone(),
                syntax.clone(),
            )),
            interceptors: InterceptorChain::new()
                .with(ProfilingInterceptor)
                .with(PreferDeferredInterceptor),
            syntax,
            classifier,
            retry,
            metadata: ProviderMetadata::sqlite(),
            creator: Arc::new(SqliteDatabaseCreator::new()),
        }
    }
}

/// Provider services keyed by provider name.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderName, Arc<ProviderServices>>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in PostgreSQL and SQLite providers.
    pub fn with_defaults(settings: &ProviderSettings) -> Self {
        let registry = Self::new();
        registry.register(ProviderServices::postgres(settings));
        registry.register(ProviderServices::sqlite(settings));
        registry
    }

    /// Register a provider, returning the entry it replaced.
    pub fn register(&self, services: ProviderServices) -> Option<Arc<ProviderServices>> {
        let name = services.name.clone();
        let previous = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(services));

        if previous.is_some() {
            info!(provider = %name, "Replaced provider");
        } else {
            debug!(provider = %name, "Registered provider");
        }
        previous
    }

    /// Look up the services for `name`.
    pub fn resolve(&self, name: &ProviderName) -> DbResult<Arc<ProviderServices>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::provider_not_found(name.as_str()))
    }

    pub fn contains(&self, name: &ProviderName) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<ProviderName> {
        let mut names: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Fail on the first name that has no registered provider.
    pub fn validate(&self, names: &[ProviderName]) -> DbResult<()> {
        for name in names {
            self.resolve(name)?;
        }
        Ok(())
    }

    /// Metadata of every registered provider, ordered by `sort_order`.
    pub fn metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|services| services.metadata.clone())
            .collect();
        metadata.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.provider_name.cmp(&b.provider_name))
        });
        metadata
    }
}

static GLOBAL: OnceLock<RwLock<Arc<ProviderRegistry>>> = OnceLock::new();

fn global_slot() -> &'static RwLock<Arc<ProviderRegistry>> {
    GLOBAL.get_or_init(|| RwLock::new(Arc::new(ProviderRegistry::new())))
}

/// The process-wide registry. Empty until [`init_default_providers`] runs.
pub fn global() -> Arc<ProviderRegistry> {
    global_slot()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Install the built-in providers as the process-wide registry.
///
/// Calling it again replaces the registry; handles obtained earlier from
/// [`global`] keep the old one.
pub fn init_default_providers(settings: &ProviderSettings) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::with_defaults(settings));
    *global_slot().write().unwrap_or_else(PoisonError::into_inner) = registry.clone();
    info!(providers = ?registry.names(), "Initialized default providers");
    registry
}
