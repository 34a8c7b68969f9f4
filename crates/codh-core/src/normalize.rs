//! Canonical-key normalization for dimension lookups.
//!
//! Every free-text dimension value (role, party, institution, territory
//! name, ...) passes through [`canonical_key`] before it is used as a
//! natural key, so that `"Diputado/a"`, `"diputado a"` and `"DIPUTADO-A"`
//! resolve to the same identity across feeds and runs.

use chrono::NaiveDate;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Literal country code passed through the territory rule unchanged.
pub const COUNTRY_CODE: &str = "ES";

/// Lowercase, strip accents, collapse whitespace and punctuation runs to a
/// single space. Empty or whitespace-only input yields `None`.
pub fn canonical_key(input: &str) -> Option<String> {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let key = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Three-way territory code rule: the literal country code passes through
/// uppercased, purely numeric codes (municipal/province codes) pass through
/// unchanged, everything else gets the standard canonical-key treatment.
pub fn territory_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case(COUNTRY_CODE) {
        return Some(COUNTRY_CODE.to_string());
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }
    canonical_key(trimmed)
}

/// Deterministic composite identity of a person. Absent parts collapse to
/// the empty string so the key stays stable as facts are learned later.
pub fn person_key(
    full_name: &str,
    birth_date: Option<NaiveDate>,
    territory_code: Option<&str>,
) -> Option<String> {
    let name_key = canonical_key(full_name)?;
    let birth = birth_date.map(|d| d.to_string()).unwrap_or_default();
    let territory = territory_code
        .and_then(territory_key)
        .unwrap_or_default();
    Some(format!("{name_key}|{birth}|{territory}"))
}

/// Permissive date parsing for feed values: ISO `YYYY-MM-DD` and the common
/// `DD/MM/YYYY` export form. Anything else is `None` — dates are never
/// guessed.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y"))
        .ok()
}
