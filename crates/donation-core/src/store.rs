use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::filter::SearchFilter;
use crate::record::{DonationRecord, StoredDonation};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// Connection, timeout, or transport failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend rejected the row at schema level.
    #[error("store constraint error: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Mysql,
}

impl StoreBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
        }
    }
}

/// Relational backend of record. Implementations bind every value as a
/// parameter and hold connections only for the duration of one call.
#[async_trait]
pub trait DonationStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Create the `donations` table and migration bookkeeping if absent.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be reached or the DDL fails.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Insert one record and return the id the backend assigned to it.
    ///
    /// # Errors
    /// [`StoreError::Unavailable`] on connection failure, [`StoreError::Constraint`]
    /// when the backend rejects the row.
    async fn insert(&self, record: &DonationRecord) -> Result<i64, StoreError>;

    /// Count records matching `filter`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the query cannot be executed.
    async fn count(&self, filter: &SearchFilter) -> Result<u64, StoreError>;

    /// One page of matching records, newest id first. `page` is 1-based.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the query cannot be executed.
    async fn search_page(
        &self,
        filter: &SearchFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<StoredDonation>, StoreError>;
}
