//! Mapping of arbitrary record shapes into [`CanonicalLead`]s.
//!
//! Source-specific knowledge lives in data: each canonical field has an
//! ordered list of candidate keys ([`FieldMap`]) and one generic resolver
//! walks that list. Keys are compared folded, so `"First Name"`,
//! `"first_name"` and `"FIRSTNAME"` are the same column, which absorbs most
//! header drift across historical versions of a bulk file.

pub mod geo;
pub mod name;
pub mod practice;
pub mod text;

pub use geo::{city_matches, normalize_city, CityFilter};
pub use name::{names_match, split_full_name, SplitName};
pub use practice::{resolve_practice_area, ResolvedPractice};

use crate::config::SourceConfig;
use crate::lead::{CanonicalLead, RawRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use text::{collapse_whitespace, fold_key};

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Ordered candidate keys per canonical field. Dotted keys address nested
/// objects (`"address.city"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub first_name: Vec<String>,
    pub last_name: Vec<String>,
    pub full_name: Vec<String>,
    pub firm_name: Vec<String>,
    pub city: Vec<String>,
    pub region: Vec<String>,
    pub phone: Vec<String>,
    pub email: Vec<String>,
    pub website: Vec<String>,
    pub external_id: Vec<String>,
    pub status: Vec<String>,
    pub profile_url: Vec<String>,
    pub practice_areas: Vec<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            first_name: keys(&["first_name", "firstname", "given_name", "prenom", "first"]),
            last_name: keys(&["last_name", "lastname", "surname", "family_name", "nom", "last"]),
            full_name: keys(&[
                "full_name", "name", "display_name", "nom_complet", "lawyer", "member",
            ]),
            firm_name: keys(&[
                "firm", "firm_name", "company", "organization", "organisation", "cabinet",
                "employer", "business_name",
            ]),
            city: keys(&["city", "ville", "locality", "town", "municipality", "address.city"]),
            region: keys(&["state", "province", "region", "jurisdiction", "address.state"]),
            phone: keys(&[
                "phone", "telephone", "tel", "phone_number", "work_phone", "office_phone",
            ]),
            email: keys(&["email", "e_mail", "courriel", "mail", "email_address"]),
            website: keys(&["website", "web", "site_web", "homepage", "url"]),
            external_id: keys(&[
                "bar_number", "license_number", "licence_number", "registration_number",
                "member_id", "numero", "id",
            ]),
            status: keys(&["status", "statut", "license_status", "member_status"]),
            profile_url: keys(&["profile_url", "profile", "detail_url", "link", "href"]),
            practice_areas: keys(&[
                "practice_areas", "practice_area", "specialties", "specialites", "domaines",
                "areas_of_practice",
            ]),
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => collapse_whitespace(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(obj) => obj.get("name").and_then(value_text).unwrap_or_default(),
        Value::Null => String::new(),
    };
    (!text.is_empty()).then_some(text)
}

fn lookup<'a>(record: &'a RawRecord, key: &str) -> Option<&'a Value> {
    let wanted = fold_key(key);
    if let Some((_, v)) = record.iter().find(|(k, _)| fold_key(k) == wanted) {
        return Some(v);
    }
    let (head, rest) = key.split_once('.')?;
    match lookup(record, head)? {
        Value::Object(inner) => lookup(inner, rest),
        _ => None,
    }
}

/// First non-empty value among `candidates`, compared case- and
/// punctuation-insensitively.
pub fn resolve_field(record: &RawRecord, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .find_map(|key| lookup(record, key).and_then(value_text))
}

fn clean_email(raw: &str) -> String {
    let email = raw.trim().trim_start_matches("mailto:").trim().to_lowercase();
    if email.contains('@') && !email.contains(' ') {
        email
    } else {
        String::new()
    }
}

fn clean_phone(raw: &str) -> String {
    collapse_whitespace(raw.trim().trim_start_matches("tel:"))
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split([';', '|', ','])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Turns raw records of one source into canonical leads.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    fields: FieldMap,
    source_id: String,
    default_region: String,
}

impl RecordNormalizer {
    pub fn new(source: &SourceConfig) -> Self {
        Self {
            fields: source.fields.clone(),
            source_id: source.id.clone(),
            default_region: source.region.clone(),
        }
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Resolve the city column of a raw record.
    pub fn city_of(&self, record: &RawRecord) -> Option<String> {
        resolve_field(record, &self.fields.city)
    }

    /// Resolve the family name of a raw record, splitting a combined name
    /// when no explicit one exists.
    pub fn family_name_of(&self, record: &RawRecord) -> Option<String> {
        resolve_field(record, &self.fields.last_name).or_else(|| {
            resolve_field(record, &self.fields.full_name)
                .and_then(|full| split_full_name(&full))
                .map(|n| n.family)
        })
    }

    /// Build a lead, or `None` when no family / display name can be derived.
    pub fn normalize(&self, record: &RawRecord) -> Option<CanonicalLead> {
        let f = &self.fields;
        let get = |candidates: &[String]| resolve_field(record, candidates).unwrap_or_default();

        let explicit_first = resolve_field(record, &f.first_name);
        let explicit_last = resolve_field(record, &f.last_name);
        let full = resolve_field(record, &f.full_name);

        let (first_name, last_name) = match (explicit_last, &full) {
            (Some(last), _) => {
                let given = explicit_first
                    .or_else(|| full.as_deref().and_then(split_full_name).map(|n| n.given))
                    .unwrap_or_default();
                (given, last)
            }
            (None, Some(full)) => {
                let split = split_full_name(full)?;
                (explicit_first.unwrap_or(split.given), split.family)
            }
            (None, None) => return None,
        };

        let full_name = full.unwrap_or_else(|| {
            collapse_whitespace(&format!("{first_name} {last_name}"))
        });

        let practice_areas = split_tags(&get(&f.practice_areas));

        let email = clean_email(&get(&f.email));
        let mut website = get(&f.website);
        if website.contains('@') {
            website.clear();
        }
        let region =
            resolve_field(record, &f.region).unwrap_or_else(|| self.default_region.clone());

        let lead = CanonicalLead {
            first_name,
            last_name,
            full_name,
            firm_name: get(&f.firm_name),
            city: get(&f.city),
            region,
            phone: clean_phone(&get(&f.phone)),
            email,
            website,
            external_id: get(&f.external_id),
            status: get(&f.status),
            profile_url: get(&f.profile_url),
            practice_areas,
            source: self.source_id.clone(),
        };
        lead.is_identifiable().then_some(lead)
    }
}
