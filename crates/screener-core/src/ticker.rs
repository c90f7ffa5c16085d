/// Normalize a raw ticker cell into the canonical key format: uppercase,
/// ASCII alphanumeric plus `.` and `-` only, with leading/trailing `.`/`-`
/// trimmed. Returns an empty string for cells with nothing usable.
pub fn normalize_ticker(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let filtered: String = upper
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect();
    filtered.trim_matches(|c| c == '.' || c == '-').to_string()
}

/// Normalize a company display name: trimmed and uppercased.
pub fn normalize_company(raw: &str) -> String {
    raw.trim().to_uppercase()
}
