//! Core types for the donation ledger: the normalized record, the validator that
//! produces it, search/pagination math, and the storage seam shared by every backend.

mod amount;
mod filter;
mod record;
mod sanitize;
mod store;
mod validate;

pub use amount::{normalize_usd_amount, MAX_USD_INTEGER_DIGITS};
pub use filter::{
    page_count, page_offset, parse_page_number, search_where_clause, SearchFilter, LIKE_ESCAPE,
    PAGE_SIZE, SEARCH_COLUMNS,
};
pub use record::{DonationRecord, StoredDonation, ANONYMOUS_NAME, FIELD_NAMES};
pub use sanitize::{strip_control_chars, trim_blank};
pub use store::{DonationStore, StoreBackend, StoreError};
pub use validate::{format_timestamp, is_valid_email, validate, validate_at, RawDonation, ValidationError};
