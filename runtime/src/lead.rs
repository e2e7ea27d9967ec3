//! The canonical lead record and the loose raw shape it is built from.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw record as returned by a strategy: loosely-typed named fields.
///
/// Bulk files produce string values keyed by header, APIs produce arbitrary
/// JSON objects, HTML and browser strategies produce string values keyed by
/// the configured column names.
pub type RawRecord = Map<String, Value>;

/// The normalized output unit consumed downstream.
///
/// Immutable once emitted by a [`crate::job::HarvestJob`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalLead {
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub firm_name: String,
    pub city: String,
    pub region: String,
    pub phone: String,
    pub email: String,
    pub website: String,
    /// Registration / bar number or any stable source identifier.
    pub external_id: String,
    /// Jurisdiction-specific free text ("Active", "Inscrit", ...).
    pub status: String,
    pub profile_url: String,
    pub practice_areas: Vec<String>,
    pub source: String,
}

impl CanonicalLead {
    /// Family name or display name is present.
    pub fn is_identifiable(&self) -> bool {
        !self.last_name.trim().is_empty() || !self.full_name.trim().is_empty()
    }

    pub fn has_email(&self) -> bool {
        !self.email.is_empty()
    }

    pub fn has_phone(&self) -> bool {
        !self.phone.is_empty()
    }

    /// Add a practice area unless the lead already lists it.
    pub fn add_practice_area(&mut self, area: &str) {
        if !self.practice_areas.iter().any(|p| p.eq_ignore_ascii_case(area)) {
            self.practice_areas.push(area.to_string());
        }
    }
}

/// Build a raw record from string pairs.
pub fn raw_record<K, V, I>(pairs: I) -> RawRecord
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), Value::String(v.into())))
        .collect()
}
