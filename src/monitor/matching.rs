//! Keyword normalization and activity matching.

/// Label the platform attaches to activities that support scheduled purchase.
pub const TIMED_PURCHASE_LABEL: &str = "支持定时购票";

/// Lowercase and keep only letters (CJK ideographs included) and decimal
/// digits. Numeric symbols such as `²`, `①` or `Ⅷ` are dropped.
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .filter(|&c| is_letter(c) || is_decimal_digit(c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Letter numbers like `Ⅷ` are alphabetic to std but are not letters here.
fn is_letter(c: char) -> bool {
    c.is_alphabetic() && !c.is_numeric()
}

/// ASCII and full-width decimal digits.
fn is_decimal_digit(c: char) -> bool {
    c.is_ascii_digit() || ('\u{FF10}'..='\u{FF19}').contains(&c)
}

/// Substring match of an already-normalized keyword against a raw title.
/// A keyword that normalizes to nothing matches nothing.
pub fn keyword_matches(normalized_keyword: &str, title: &str) -> bool {
    if normalized_keyword.is_empty() {
        return false;
    }
    normalize(title).contains(normalized_keyword)
}

pub fn has_timed_label<S: AsRef<str>>(labels: &[S]) -> bool {
    labels.iter().any(|l| l.as_ref() == TIMED_PURCHASE_LABEL)
}
