/// Fixed page size of the operator search.
pub const PAGE_SIZE: u32 = 30;

/// Escape character used in every `LIKE` clause built from a [`SearchFilter`].
pub const LIKE_ESCAPE: char = '!';

/// Columns a token filter is matched against, in bind order.
pub const SEARCH_COLUMNS: [&str; 4] = ["name", "email", "address", "network"];

/// `WHERE` clause for a token filter, folding case with the backend's
/// Unicode-aware `lower` function. Bind [`SearchFilter::like_pattern`] to each
/// of the four positional parameters.
#[must_use]
pub fn search_where_clause(lower: &str) -> String {
    let predicates = SEARCH_COLUMNS
        .iter()
        .map(|column| format!("{lower}({column}) LIKE {lower}(?) ESCAPE '{LIKE_ESCAPE}'"))
        .collect::<Vec<_>>();
    format!("WHERE {}", predicates.join(" OR "))
}

/// Either match every record or match a single free-text token by
/// case-insensitive substring across name, email, address, and network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SearchFilter {
    #[default]
    All,
    Contains(String),
}

impl SearchFilter {
    /// A blank (after trimming) filter text matches everything.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let token = raw.trim();
        if token.is_empty() {
            Self::All
        } else {
            Self::Contains(token.to_string())
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Contains(token) => Some(token),
        }
    }

    /// `%token%` with `LIKE` wildcards escaped so the token matches literally.
    #[must_use]
    pub fn like_pattern(&self) -> Option<String> {
        let token = self.token()?;
        let mut pattern = String::with_capacity(token.len() + 2);
        pattern.push('%');
        for c in token.chars() {
            if matches!(c, '%' | '_' | LIKE_ESCAPE) {
                pattern.push(LIKE_ESCAPE);
            }
            pattern.push(c);
        }
        pattern.push('%');
        Some(pattern)
    }

    /// In-memory equivalent of the SQL predicate.
    #[must_use]
    pub fn matches(&self, fields: [&str; 4]) -> bool {
        match self.token() {
            None => true,
            Some(token) => {
                let needle = token.to_lowercase();
                fields.iter().any(|field| field.to_lowercase().contains(&needle))
            }
        }
    }
}

/// Interpret a raw page parameter by its leading integer, clamping to at least 1.
///
/// `"3"`, `" 3"`, and `"3abc"` all give 3; `"abc"`, `"0"`, `"-2"`, and `None` give 1.
#[must_use]
pub fn parse_page_number(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return 1;
    };
    let text = raw.trim_start_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0B' | '\x0C'));
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let digits = unsigned.bytes().take_while(u8::is_ascii_digit).collect::<Vec<_>>();
    if negative || digits.is_empty() {
        return 1;
    }

    let value = digits.iter().fold(0_u64, |acc, digit| {
        acc.saturating_mul(10).saturating_add(u64::from(digit - b'0'))
    });
    u32::try_from(value).unwrap_or(u32::MAX).max(1)
}

/// `max(1, ceil(total / page_size))`.
#[must_use]
pub fn page_count(total: u64, page_size: u32) -> u64 {
    let size = u64::from(page_size.max(1));
    total.div_ceil(size).max(1)
}

/// `(page - 1) * page_size` for a 1-based page.
#[must_use]
pub fn page_offset(page: u32, page_size: u32) -> u64 {
    u64::from(page.saturating_sub(1)) * u64::from(page_size)
}
