//! Job Controller: accepts seed jobs, drives attempts with retry, and keeps
//! status in a [`StatusStore`].

pub mod controller;
pub mod retry;
pub mod store;

use std::sync::Arc;

use crate::config::Settings;
use crate::errors::StoreError;

pub use controller::JobController;
pub use retry::{AttemptOutcome, RetryPolicy, backoff_delay, classify};
pub use store::{JobRecords, MemoryStatusStore, SqliteStatusStore, StatusStore};

/// SQLite when `jobs.store_path` is set, otherwise in-memory.
pub fn store_from_settings(settings: &Settings) -> Result<Arc<dyn StatusStore>, StoreError> {
    match &settings.jobs.store_path {
        Some(path) => Ok(Arc::new(SqliteStatusStore::open(path)?)),
        None => Ok(Arc::new(MemoryStatusStore::new())),
    }
}
