use serde::{Deserialize, Serialize};

/// Stored in place of a blank donor name.
pub const ANONYMOUS_NAME: &str = "(anonymous)";

/// Column order of the tabular mirror header and of every store schema.
pub const FIELD_NAMES: [&str; 7] =
    ["timestamp", "name", "email", "usd_amount", "crypto_amount", "network", "address"];

/// A validated, normalized donation as accepted from a client.
///
/// Carries no identity: the primary store assigns one on insert, and the backup
/// mirrors never see it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DonationRecord {
    pub timestamp: String,
    pub name: String,
    pub email: String,
    pub usd_amount: String,
    pub crypto_amount: String,
    pub network: String,
    pub address: String,
}

impl DonationRecord {
    /// Field values in [`FIELD_NAMES`] order.
    #[must_use]
    pub fn fields(&self) -> [&str; 7] {
        [
            &self.timestamp,
            &self.name,
            &self.email,
            &self.usd_amount,
            &self.crypto_amount,
            &self.network,
            &self.address,
        ]
    }
}

/// A record read back from the primary store together with its assigned id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredDonation {
    pub id: i64,
    #[serde(flatten)]
    pub record: DonationRecord,
}
