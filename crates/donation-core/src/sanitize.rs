/// Trim the ASCII blank set (space, tab, CR, LF, NUL, vertical tab) from both ends.
#[must_use]
pub fn trim_blank(value: &str) -> &str {
    value.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r' | '\0' | '\x0B'))
}

/// Remove C0 control characters and DEL, then re-trim.
#[must_use]
pub fn strip_control_chars(value: &str) -> String {
    let stripped = value.chars().filter(|c| !is_control(*c)).collect::<String>();
    trim_blank(&stripped).to_string()
}

fn is_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}')
}
