//! Text folding shared by name, city and vocabulary comparisons.

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Lowercase, strip diacritics, turn punctuation into spaces and collapse
/// whitespace. `"Saint-Étienne  CEDEX"` → `"saint etienne cedex"`.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_was_space = true;

    for ch in text.nfkd() {
        if is_combining_mark(ch) {
            continue;
        }
        for lower in ch.to_lowercase() {
            if lower.is_alphanumeric() {
                out.push(lower);
                prev_was_space = false;
            } else if !prev_was_space {
                out.push(' ');
                prev_was_space = true;
            }
        }
    }

    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Fold a field key for lookup: alphanumerics only. `"First Name"`,
/// `"first_name"` and `"FIRSTNAME"` all become `"firstname"`.
pub fn fold_key(key: &str) -> String {
    fold(key).chars().filter(|c| !c.is_whitespace()).collect()
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
