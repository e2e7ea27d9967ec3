//! City spelling normalization and target-city matching.

use super::text::fold;

/// Folded tokens that start an administrative suffix; they and everything
/// after them are dropped.
const CUT_MARKERS: &[&str] = &["cedex", "cs", "bp", "arrondissement", "arr"];

/// Whether a folded token is a postal code, branch number or ordinal
/// ("75008", "01", "8e", "1er", "8eme").
fn is_routing_token(token: &str) -> bool {
    if token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let digits = token.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    matches!(&token[digits..], "e" | "er" | "eme" | "re" | "nd" | "st" | "rd" | "th")
}

/// Reduce a source city spelling to a comparable key.
///
/// `"PARIS CEDEX 08"` → `"paris"`, `"MARSEILLE 01"` → `"marseille"`,
/// `"75008 Paris 8e"` → `"paris"`, `"Montréal, QC"` → `"montreal"`.
pub fn normalize_city(raw: &str) -> String {
    let head = raw.split(',').next().unwrap_or("");
    let folded = fold(head);

    let mut kept: Vec<&str> = Vec::new();
    for token in folded.split(' ') {
        if CUT_MARKERS.contains(&token) {
            break;
        }
        if token.is_empty() || is_routing_token(token) {
            continue;
        }
        kept.push(token);
    }
    kept.join(" ")
}

/// Case- and spelling-insensitive membership test against target cities.
#[derive(Debug, Clone, Default)]
pub struct CityFilter {
    targets: Vec<String>,
}

impl CityFilter {
    pub fn new<S: AsRef<str>>(targets: &[S]) -> Self {
        let mut targets: Vec<String> = targets
            .iter()
            .map(|t| normalize_city(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        targets.sort();
        targets.dedup();
        Self { targets }
    }

    /// No targets: everything passes.
    pub fn is_open(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn matches(&self, city: &str) -> bool {
        if self.is_open() {
            return true;
        }
        let key = normalize_city(city);
        !key.is_empty() && self.targets.iter().any(|t| *t == key)
    }
}

/// Whether a source city spelling matches one target city.
pub fn city_matches(city: &str, target: &str) -> bool {
    CityFilter::new(&[target]).matches(city)
}
