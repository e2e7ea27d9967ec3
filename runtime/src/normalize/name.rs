//! Person-name splitting.

use super::text::{collapse_whitespace, fold};

/// Courtesy titles dropped before splitting, in folded form.
const HONORIFICS: &[&str] = &[
    "me", "maitre", "mr", "mrs", "ms", "miss", "mx", "dr", "hon", "m", "mme", "mlle", "prof",
    "sir", "dame", "avv", "abogado", "lic",
];

/// Post-nominals dropped from the end of a name, in folded form.
const SUFFIXES: &[&str] = &["esq", "jr", "sr", "ii", "iii", "iv", "qc", "kc", "phd"];

/// A name split into given and family parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitName {
    pub given: String,
    pub family: String,
}

fn is_honorific(token: &str) -> bool {
    HONORIFICS.contains(&fold(token).as_str())
}

fn is_suffix(token: &str) -> bool {
    SUFFIXES.contains(&fold(token).as_str())
}

/// Split a combined name field.
///
/// With a comma, text before it is the family name and the first token
/// after it the given name (`"Smith, John A."` → John / Smith). Without one,
/// the first token is the given name and the last the family name. A name
/// with no delimiter at all cannot be split and yields `None`.
pub fn split_full_name(full: &str) -> Option<SplitName> {
    let full = collapse_whitespace(full);
    if full.is_empty() {
        return None;
    }

    if let Some((before, after)) = full.split_once(',') {
        let family_tokens: Vec<&str> = before
            .split_whitespace()
            .skip_while(|t| is_honorific(t))
            .collect();
        let family = family_tokens.join(" ");
        if family.is_empty() {
            return None;
        }
        let given = after
            .split_whitespace()
            .find(|t| !is_honorific(t) && !is_suffix(t))
            .map(|t| t.trim_end_matches('.').to_string())
            .unwrap_or_default();
        return Some(SplitName { given, family });
    }

    let mut tokens: Vec<&str> = full
        .split_whitespace()
        .skip_while(|t| is_honorific(t))
        .collect();
    while tokens.len() > 2 && tokens.last().is_some_and(|t| is_suffix(t)) {
        tokens.pop();
    }
    if tokens.len() < 2 {
        return None;
    }

    Some(SplitName {
        given: tokens[0].to_string(),
        family: tokens[tokens.len() - 1].to_string(),
    })
}

/// Compare a possibly truncated rendered name with a full one.
///
/// Rendered result feeds cut long names ("Cabinet Dupont & Asso…"), so two
/// names match when either folded form is a prefix of the other.
pub fn names_match(a: &str, b: &str) -> bool {
    let clean = |s: &str| fold(s.trim_end_matches(['…', '.']));
    let (a, b) = (clean(a), clean(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(&b) || b.starts_with(&a)
}
