use std::sync::OnceLock;

use regex_lite::Regex;

use crate::validate::ValidationError;

const NUMERIC_PATTERN: &str = r"^[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?$";

/// Integer digits the `DECIMAL(12,2)` amount column holds; the embedded
/// backend's REAL column is exact to two places within the same range.
pub const MAX_USD_INTEGER_DIGITS: usize = 10;

// Any finite non-zero f64 has its leading digit within this many places of the point.
const MAX_POINT_SHIFT: i64 = 400;

fn numeric_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(NUMERIC_PATTERN).ok()).as_ref()
}

/// Normalize a trimmed USD amount to a non-negative decimal with exactly two
/// fraction digits, rounding half away from zero on the decimal text.
///
/// # Errors
/// Returns [`ValidationError::InvalidAmount`] when the value is empty, not a plain
/// decimal number, negative, or at least `10^10` once rounded.
pub fn normalize_usd_amount(raw: &str) -> Result<String, ValidationError> {
    if raw.is_empty() || !numeric_pattern().is_some_and(|pattern| pattern.is_match(raw)) {
        return Err(ValidationError::InvalidAmount);
    }

    let value = raw.parse::<f64>().map_err(|_| ValidationError::InvalidAmount)?;
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidAmount);
    }

    let normalized = round_to_cents(raw);
    let integer_digits = normalized.find('.').unwrap_or(normalized.len());
    if integer_digits > MAX_USD_INTEGER_DIGITS {
        return Err(ValidationError::InvalidAmount);
    }
    Ok(normalized)
}

/// Exact decimal rounding of an already-validated, non-negative numeric literal.
fn round_to_cents(literal: &str) -> String {
    let unsigned = literal.trim_start_matches(['+', '-']);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(index) => (&unsigned[..index], parse_exponent(&unsigned[index + 1..])),
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let all_digits = int_part.bytes().chain(frac_part.bytes()).map(|b| b - b'0').collect::<Vec<_>>();
    let Some(first_significant) = all_digits.iter().position(|digit| *digit != 0) else {
        return "0.00".to_string();
    };
    let digits = &all_digits[first_significant..];

    // Number of significant digits sitting left of the decimal point.
    let int_len = i64::try_from(int_part.len()).unwrap_or(MAX_POINT_SHIFT);
    let skipped = i64::try_from(first_significant).unwrap_or(MAX_POINT_SHIFT);
    let point = (int_len - skipped).saturating_add(exponent).clamp(-MAX_POINT_SHIFT, MAX_POINT_SHIFT);
    if point < -2 {
        return "0.00".to_string();
    }

    // `point + 2` leading digits form the integer number of cents.
    let keep = usize::try_from(point + 2).unwrap_or(0);
    let mut cents = (0..keep).map(|index| digits.get(index).copied().unwrap_or(0)).collect::<Vec<_>>();
    if digits.get(keep).is_some_and(|digit| *digit >= 5) {
        increment(&mut cents);
    }

    let mut text = cents.iter().map(|digit| char::from(b'0' + digit)).collect::<String>();
    while text.len() < 3 {
        text.insert(0, '0');
    }
    let split = text.len() - 2;
    format!("{}.{}", &text[..split], &text[split..])
}

fn parse_exponent(raw: &str) -> i64 {
    raw.parse::<i64>().unwrap_or(if raw.starts_with('-') { -MAX_POINT_SHIFT } else { MAX_POINT_SHIFT })
}

fn increment(digits: &mut Vec<u8>) {
    for digit in digits.iter_mut().rev() {
        if *digit == 9 {
            *digit = 0;
        } else {
            *digit += 1;
            return;
        }
    }
    digits.insert(0, 1);
}
