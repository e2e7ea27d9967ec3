// Copyright 2026 Lead Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Items of a job's output sequence: leads interleaved with progress and
//! anomaly signals.
//!
//! Consumers tell them apart by marker key rather than by type tag, so a
//! lead serializes as a bare object while signals carry `_cityProgress` or
//! `_anomaly`. The JSON shape is what the CLI prints one item per line.

use crate::lead::CanonicalLead;
use serde::{Deserialize, Serialize};

/// Unit progress tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProgress {
    /// 1-based ordinal of the unit being started.
    pub current: usize,
    pub total: usize,
    pub unit: String,
}

/// Why a unit was cut short or could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Blocked beyond the retry budget.
    Blocked,
    /// A bot challenge page was served.
    Captcha,
    /// The response could not be interpreted.
    Structural,
    /// Too many consecutive empty pages while the server claimed more.
    EmptyThreshold,
    /// No strategy produced a usable endpoint.
    NoStrategy,
    /// The job's time budget ran out.
    TimeBudget,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::Captcha => "captcha",
            Self::Structural => "structural",
            Self::EmptyThreshold => "empty_threshold",
            Self::NoStrategy => "no_strategy",
            Self::TimeBudget => "time_budget",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub unit: String,
    /// 1-based page the unit stopped at.
    pub page: u32,
    pub reason: String,
}

/// One element of the output sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HarvestItem {
    Progress {
        #[serde(rename = "_cityProgress")]
        progress: UnitProgress,
    },
    Anomaly {
        #[serde(rename = "_anomaly")]
        anomaly: Anomaly,
    },
    Lead(CanonicalLead),
}

impl HarvestItem {
    pub fn progress(current: usize, total: usize, unit: impl Into<String>) -> Self {
        Self::Progress {
            progress: UnitProgress {
                current,
                total,
                unit: unit.into(),
            },
        }
    }

    pub fn anomaly(
        kind: AnomalyKind,
        unit: impl Into<String>,
        page: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self::Anomaly {
            anomaly: Anomaly {
                kind,
                unit: unit.into(),
                page,
                reason: reason.into(),
            },
        }
    }

    pub fn as_lead(&self) -> Option<&CanonicalLead> {
        match self {
            Self::Lead(lead) => Some(lead),
            _ => None,
        }
    }

    pub fn as_anomaly(&self) -> Option<&Anomaly> {
        match self {
            Self::Anomaly { anomaly } => Some(anomaly),
            _ => None,
        }
    }

    pub fn is_captcha(&self) -> bool {
        self.as_anomaly()
            .is_some_and(|a| a.kind == AnomalyKind::Captcha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signals_carry_marker_keys() {
        let p = serde_json::to_value(HarvestItem::progress(2, 5, "Lyon")).unwrap();
        assert_eq!(p, json!({"_cityProgress": {"current": 2, "total": 5, "unit": "Lyon"}}));

        let a = HarvestItem::anomaly(AnomalyKind::Captcha, "Paris", 3, "CAPTCHA encountered");
        let a = serde_json::to_value(a).unwrap();
        assert_eq!(a["_anomaly"]["kind"], "captcha");
        assert_eq!(a["_anomaly"]["page"], 3);
    }

    #[test]
    fn test_lead_is_bare_object() {
        let lead = CanonicalLead {
            last_name: "Smith".into(),
            source: "s".into(),
            ..CanonicalLead::default()
        };
        let v = serde_json::to_value(HarvestItem::Lead(lead.clone())).unwrap();
        assert_eq!(v["last_name"], "Smith");
        assert!(v.get("_anomaly").is_none());

        let back: HarvestItem = serde_json::from_value(v).unwrap();
        assert_eq!(back.as_lead(), Some(&lead));
    }

    #[test]
    fn test_signals_parse_back() {
        let line = r#"{"_anomaly": {"kind": "empty_threshold", "unit": "all", "page": 3, "reason": "x"}}"#;
        let item: HarvestItem = serde_json::from_str(line).unwrap();
        assert_eq!(item.as_anomaly().unwrap().kind, AnomalyKind::EmptyThreshold);
        assert!(!item.is_captcha());
    }
}
