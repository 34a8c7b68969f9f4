//! Locale-aware monetary amount parsing.
//!
//! Feed exports mix European (`1.234,56`) and Anglo (`1,234.56`) separator
//! conventions, often with a currency symbol attached. When both separators
//! are present the rightmost one is the decimal separator. With a single
//! separator, one or two trailing digits mean a decimal part and exactly
//! three mean a thousands group.

/// Parse a monetary string into an amount. Currency symbols, letters and
/// spaces are ignored. Returns `None` rather than a guessed value when the
/// input carries no digits.
pub fn parse_localized_amount(raw: &str) -> Option<f64> {
    let negative = raw.contains('-') || (raw.contains('(') && raw.contains(')'));
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let comma = cleaned.rfind(',');
    let dot = cleaned.rfind('.');
    let normalized = match (comma, dot) {
        (Some(c), Some(d)) => {
            let (decimal, thousands) = if c > d { (',', '.') } else { ('.', ',') };
            cleaned
                .chars()
                .filter(|ch| *ch != thousands)
                .map(|ch| if ch == decimal { '.' } else { ch })
                .collect::<String>()
        }
        (Some(pos), None) => normalize_single_separator(&cleaned, pos),
        (None, Some(pos)) => normalize_single_separator(&cleaned, pos),
        (None, None) => cleaned,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn normalize_single_separator(cleaned: &str, pos: usize) -> String {
    let trailing = cleaned.len() - pos - 1;
    let separator_count = cleaned.chars().filter(|c| *c == ',' || *c == '.').count();
    if separator_count == 1 && (1..=2).contains(&trailing) {
        cleaned
            .chars()
            .map(|c| if c == ',' { '.' } else { c })
            .collect()
    } else {
        // Thousands grouping, possibly repeated ("1.234.567").
        cleaned.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_separators_rightmost_wins() {
        assert_eq!(parse_localized_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_localized_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_localized_amount("12.345.678,90"), Some(12_345_678.90));
        assert_eq!(parse_localized_amount("12,345,678.90"), Some(12_345_678.90));
    }

    #[test]
    fn single_comma_short_tail_is_decimal() {
        assert_eq!(parse_localized_amount("1234,5"), Some(1234.5));
        assert_eq!(parse_localized_amount("1234,56"), Some(1234.56));
    }

    #[test]
    fn single_separator_three_digit_tail_is_thousands() {
        assert_eq!(parse_localized_amount("1.234"), Some(1234.0));
        assert_eq!(parse_localized_amount("1,234"), Some(1234.0));
        assert_eq!(parse_localized_amount("1.234.567"), Some(1_234_567.0));
    }

    #[test]
    fn currency_symbols_and_whitespace_are_ignored() {
        assert_eq!(parse_localized_amount("1.234,56 €"), Some(1234.56));
        assert_eq!(parse_localized_amount("$ 99.95"), Some(99.95));
        assert_eq!(parse_localized_amount("EUR 2.500,00"), Some(2500.0));
    }

    #[test]
    fn negatives_and_parenthesized_amounts() {
        assert_eq!(parse_localized_amount("-1.234,56"), Some(-1234.56));
        assert_eq!(parse_localized_amount("(500,00)"), Some(-500.0));
    }

    #[test]
    fn digitless_input_is_none() {
        assert_eq!(parse_localized_amount(""), None);
        assert_eq!(parse_localized_amount("n/a"), None);
        assert_eq!(parse_localized_amount("€"), None);
    }

    #[test]
    fn plain_integers_and_decimals_pass_through() {
        assert_eq!(parse_localized_amount("42"), Some(42.0));
        assert_eq!(parse_localized_amount("0,5"), Some(0.5));
        assert_eq!(parse_localized_amount("1234567"), Some(1_234_567.0));
    }
}
