use std::path::PathBuf;

use anyhow::Result;
use identity_core::{resolve, IdentifyRequest, IdentifyResponse};
use identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};

/// Entry point shared by every front end. Each call opens its own connection, so
/// the facade itself carries no state between requests.
#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Apply pending migrations and report the resulting schema version.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a migration fails.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.schema_status()
    }

    /// Run storage health probes, including the one-primary-per-link check.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Reconcile one identity fragment and return the merged contact view.
    ///
    /// Validation runs before the database is opened. A rejected request fails with
    /// an [`identity_core::IdentityError::Validation`] root cause.
    ///
    /// # Errors
    /// Returns an error when validation fails, or when the store cannot be opened
    /// or queried. The schema must already be current; see [`IdentityApi::migrate`].
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse> {
        let fragment = request.normalize()?;
        let mut store = self.open_store()?;
        tracing::debug!(
            db = %self.db_path.display(),
            has_email = fragment.email().is_some(),
            has_phone_number = fragment.phone_number().is_some(),
            "resolving identity fragment"
        );
        let response = resolve(&mut store, &fragment)?;
        Ok(response)
    }
}
