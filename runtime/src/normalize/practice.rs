//! Resolution of requested practice areas to a source's vocabulary.

use super::text::fold;
use std::collections::BTreeMap;

/// A practice area resolved against the source's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPractice {
    /// What the caller asked for.
    pub label: String,
    /// The source's own code for it.
    pub code: String,
}

/// Resolve free text to the source's code.
///
/// Tried in order: exact label match, exact code match, then label
/// containment either way. `None` means the request is unknown to the
/// source; callers proceed unfiltered rather than failing.
pub fn resolve_practice_area(
    requested: &str,
    dictionary: &BTreeMap<String, String>,
) -> Option<ResolvedPractice> {
    let wanted = fold(requested);
    if wanted.is_empty() {
        return None;
    }
    let resolved = |code: &String| ResolvedPractice {
        label: requested.trim().to_string(),
        code: code.clone(),
    };

    if let Some((_, code)) = dictionary.iter().find(|(label, _)| fold(label) == wanted) {
        return Some(resolved(code));
    }
    if let Some(code) = dictionary.values().find(|code| fold(code) == wanted) {
        return Some(resolved(code));
    }
    dictionary
        .iter()
        .find(|(label, _)| {
            let label = fold(label);
            !label.is_empty() && (label.contains(&wanted) || wanted.contains(&label))
        })
        .map(|(_, code)| resolved(code))
}
