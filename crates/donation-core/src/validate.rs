use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::amount::normalize_usd_amount;
use crate::record::{DonationRecord, ANONYMOUS_NAME};
use crate::sanitize::{strip_control_chars, trim_blank};

/// Untyped key/value payload as decoded from the ingestion boundary.
pub type RawDonation = serde_json::Map<String, Value>;

const MAX_EMAIL_LEN: usize = 254;
const MAX_EMAIL_LOCAL_LEN: usize = 64;

const EMAIL_PATTERN: &str = concat!(
    r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*",
    r"@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+",
    r"[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$",
);

/// Rejection reasons; the display text is the caller-facing message.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("Invalid USD amount")]
    InvalidAmount,
    #[error("Address missing")]
    MissingAddress,
    #[error("Invalid email address")]
    InvalidEmail,
}

/// Validate and normalize a raw payload, defaulting the timestamp to now.
///
/// # Errors
/// Returns the first [`ValidationError`] hit, in amount, address, email order.
pub fn validate(raw: &RawDonation) -> Result<DonationRecord, ValidationError> {
    validate_at(raw, OffsetDateTime::now_utc())
}

/// Validate and normalize a raw payload, using `now` when no timestamp is given.
///
/// No partial record is produced on rejection.
///
/// # Errors
/// Returns the first [`ValidationError`] hit, in amount, address, email order.
pub fn validate_at(raw: &RawDonation, now: OffsetDateTime) -> Result<DonationRecord, ValidationError> {
    let name = field(raw, "name");
    let email = field(raw, "email");
    let usd_amount = field(raw, "usd_amount");
    let crypto_amount = field(raw, "crypto_amount");
    let network = field(raw, "network");
    let address = field(raw, "address");
    let timestamp = field(raw, "timestamp");

    let usd_amount = normalize_usd_amount(&usd_amount)?;

    if address.is_empty() {
        return Err(ValidationError::MissingAddress);
    }

    if !email.is_empty() && !is_valid_email(&email) {
        return Err(ValidationError::InvalidEmail);
    }

    let address = strip_control_chars(&address);
    if address.is_empty() {
        return Err(ValidationError::MissingAddress);
    }

    let name = strip_control_chars(&name);
    let timestamp = strip_control_chars(&timestamp);

    Ok(DonationRecord {
        timestamp: if timestamp.is_empty() { format_timestamp(now) } else { timestamp },
        name: if name.is_empty() { ANONYMOUS_NAME.to_string() } else { name },
        email: strip_control_chars(&email),
        usd_amount,
        crypto_amount: strip_control_chars(&crypto_amount),
        network: strip_control_chars(&network),
        address,
    })
}

/// Syntactic e-mail check: dotted atext local part, dotted LDH domain, at most 254 chars.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN {
        return false;
    }
    let Some((local, _domain)) = email.rsplit_once('@') else {
        return false;
    };
    if local.len() > MAX_EMAIL_LOCAL_LEN {
        return false;
    }
    email_pattern().is_some_and(|pattern| pattern.is_match(email))
}

/// ISO-8601 with an explicit numeric offset, e.g. `2026-10-18T09:30:00+00:00`.
#[must_use]
pub fn format_timestamp(now: OffsetDateTime) -> String {
    now.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
    ))
    .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(EMAIL_PATTERN).ok()).as_ref()
}

/// Read one field as a trimmed string; missing, null, and structured values read as empty.
fn field(raw: &RawDonation, key: &str) -> String {
    let text = match raw.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Number(value)) => value.to_string(),
        Some(Value::Bool(true)) => "1".to_string(),
        Some(Value::Bool(false) | Value::Null | Value::Array(_) | Value::Object(_)) | None => {
            String::new()
        }
    };
    trim_blank(&text).to_string()
}
