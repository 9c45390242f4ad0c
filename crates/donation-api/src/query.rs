use std::sync::Arc;

use donation_core::{
    page_count, parse_page_number, DonationStore, SearchFilter, StoreError, StoredDonation, PAGE_SIZE,
};
use serde::{Deserialize, Serialize};

/// One page of the operator search, with the totals needed to render paging.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchResults {
    pub records: Vec<StoredDonation>,
    pub total_count: u64,
    pub page_count: u64,
    pub current_page: u32,
    pub page_size: u32,
    /// The filter token as applied, empty when matching everything.
    pub query: String,
}

pub struct QueryService {
    store: Arc<dyn DonationStore>,
    page_size: u32,
}

impl QueryService {
    #[must_use]
    pub fn new(store: Arc<dyn DonationStore>) -> Self {
        Self { store, page_size: PAGE_SIZE }
    }

    /// Count and fetch one page. A page past the last one yields no records,
    /// not an error.
    ///
    /// # Errors
    /// Returns [`StoreError`] when either store query fails.
    pub async fn search(
        &self,
        raw_filter: &str,
        raw_page: Option<&str>,
    ) -> Result<SearchResults, StoreError> {
        let filter = SearchFilter::parse(raw_filter);
        let current_page = parse_page_number(raw_page);

        let total_count = self.store.count(&filter).await?;
        let records = self.store.search_page(&filter, current_page, self.page_size).await?;

        Ok(SearchResults {
            records,
            total_count,
            page_count: page_count(total_count, self.page_size),
            current_page,
            page_size: self.page_size,
            query: filter.token().unwrap_or_default().to_string(),
        })
    }
}
