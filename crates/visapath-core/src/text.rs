use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Merge key for an Organisation: trimmed, case-folded, single-spaced.
///
/// Punctuation is kept so that sponsors whose names differ only in punctuation stay
/// distinct nodes; matching uses [`clean_company_name`] on both sides instead.
pub fn canonical_org_key(name: &str) -> String {
    collapse_whitespace(&name.to_lowercase())
}

/// Cleaning rule shared by organisation names and job-ad company names before scoring.
///
/// Strips diacritics, drops apostrophes, turns any other non-alphanumeric character into a
/// word break, lower-cases, and collapses whitespace.
pub fn clean_company_name(input: &str) -> String {
    let folded = input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| !matches!(c, '\'' | '\u{2019}' | '`'))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    collapse_whitespace(&folded)
}

/// Whitespace tokens of an already-cleaned name.
pub fn tokens(cleaned: &str) -> impl Iterator<Item = &str> {
    cleaned.split_whitespace()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_key_folds_case_and_whitespace() {
        assert_eq!(canonical_org_key("  Acme   LTD "), "acme ltd");
        assert_eq!(canonical_org_key("acme ltd"), canonical_org_key("ACME\tLtd"));
        assert_eq!(canonical_org_key("A.B. Holdings"), "a.b. holdings");
    }

    #[test]
    fn clean_strips_punctuation_and_diacritics() {
        assert_eq!(clean_company_name("Café Nouveau (UK) Ltd."), "cafe nouveau uk ltd");
        assert_eq!(clean_company_name("McDonald's Restaurants"), "mcdonalds restaurants");
        assert_eq!(clean_company_name("Smith & Sons"), "smith sons");
        assert_eq!(clean_company_name("   "), "");
    }

    #[test]
    fn clean_is_idempotent() {
        let once = clean_company_name("Zürich-Insurance  PLC");
        assert_eq!(clean_company_name(&once), once);
        assert_eq!(once, "zurich insurance plc");
    }
}
