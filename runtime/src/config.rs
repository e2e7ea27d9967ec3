//! Per-source static configuration.
//!
//! A source is described by one JSON document. Only `id` and `base_url` are
//! required; every section falls back to defaults that fit the common case,
//! so a minimal source file is two lines long.

use crate::acquisition::http_client::HttpMethod;
use crate::normalize::FieldMap;
use crate::pacing::PacingConfig;
use crate::selector::SelectionPolicy;
use crate::strategy::StrategyKind;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How a source's search space is partitioned into enumeration units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationMode {
    /// One unit per target city.
    Cities,
    /// One unit per alphabetic name prefix.
    Prefixes,
    /// A single unit covering the whole source.
    #[default]
    All,
}

/// Static description of one directory source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Region / jurisdiction code stamped on leads lacking one.
    #[serde(default)]
    pub region: String,
    pub base_url: String,
    /// Fixes a single strategy and disables fallback.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    #[serde(default = "default_strategy_order")]
    pub strategy_order: Vec<StrategyKind>,
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub enumeration: EnumerationMode,
    #[serde(default)]
    pub default_cities: Vec<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Requested practice-area label → the source's own code.
    #[serde(default)]
    pub practice_areas: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub bulk: BulkConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub html: HtmlFormConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_strategy_order() -> Vec<StrategyKind> {
    vec![
        StrategyKind::Bulk,
        StrategyKind::Api,
        StrategyKind::HtmlForm,
        StrategyKind::Browser,
    ]
}

fn default_page_size() -> u32 {
    50
}

/// Bulk download discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Known download links, tried first.
    pub urls: Vec<String>,
    /// Pages scraped for CSV / Excel anchors. Empty means `base_url`.
    pub listing_pages: Vec<String>,
    /// Conventional paths tried last, relative to `base_url`.
    pub conventional_paths: Vec<String>,
    /// A file with fewer data lines is not a bulk file.
    pub min_data_rows: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            listing_pages: Vec::new(),
            conventional_paths: vec![
                "/export.csv".into(),
                "/download.csv".into(),
                "/members.csv".into(),
            ],
            min_data_rows: 3,
        }
    }
}

/// Encoding of POSTed API parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Json,
    Form,
}

/// JSON REST / SODA endpoint description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Known endpoints (absolute or relative to `base_url`).
    pub endpoints: Vec<String>,
    /// Scan the landing page and its scripts for further endpoints.
    pub discover: bool,
    pub method: HttpMethod,
    pub body: BodyFormat,
    pub page_param: Option<String>,
    /// Number of the first page (0 or 1).
    pub page_base: u32,
    pub offset_param: Option<String>,
    pub size_param: Option<String>,
    pub city_param: Option<String>,
    pub practice_param: Option<String>,
    pub prefix_param: Option<String>,
    /// Constant parameters sent with every request.
    pub params: BTreeMap<String, String>,
    /// Wrapper keys that may hold the record array, dotted paths allowed.
    pub record_keys: Vec<String>,
    /// Body keys that may hold the total count, dotted paths allowed.
    pub total_keys: Vec<String>,
    pub total_headers: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            discover: true,
            method: HttpMethod::Get,
            body: BodyFormat::Json,
            page_param: None,
            page_base: 0,
            offset_param: Some("offset".into()),
            size_param: Some("limit".into()),
            city_param: None,
            practice_param: None,
            prefix_param: None,
            params: BTreeMap::new(),
            record_keys: [
                "results", "data", "items", "records", "rows", "members", "lawyers", "hits",
            ]
            .map(String::from)
            .to_vec(),
            total_keys: [
                "total",
                "totalCount",
                "total_count",
                "count",
                "recordsTotal",
                "meta.total",
                "hits.total",
            ]
            .map(String::from)
            .to_vec(),
            total_headers: vec!["x-total-count".into(), "x-total".into()],
        }
    }
}

/// Server-rendered search form description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlFormConfig {
    /// Page holding the search form. Empty means `base_url`.
    pub search_url: Option<String>,
    pub form_selector: String,
    /// Constant form fields sent with every submission.
    pub fields: BTreeMap<String, String>,
    pub city_field: Option<String>,
    pub practice_field: Option<String>,
    pub prefix_field: Option<String>,
    /// Explicit page parameter. Without it pagination follows postbacks.
    pub page_param: Option<String>,
    pub page_base: u32,
    pub row_selector: String,
    /// Record field → CSS selector inside a row. Empty maps cells to the
    /// table's header texts by position.
    pub columns: BTreeMap<String, String>,
    pub link_selector: String,
    pub next_selector: String,
    /// Overrides the built-in "1 - 50 of 462" pattern. Must capture the
    /// total in its last group.
    pub total_pattern: Option<String>,
}

impl Default for HtmlFormConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            form_selector: "form".into(),
            fields: BTreeMap::new(),
            city_field: None,
            practice_field: None,
            prefix_field: None,
            page_param: None,
            page_base: 1,
            row_selector: "table tbody tr".into(),
            columns: BTreeMap::new(),
            link_selector: "a[href]".into(),
            next_selector: "a[rel=next], a.next, li.next a, a[title=Next]".into(),
            total_pattern: None,
        }
    }
}

/// Headless-browser harvesting of client-rendered result feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Template with `{query}`, `{lat}`, `{lng}` placeholders.
    pub search_url: String,
    /// Template with `{practice}` and `{city}` placeholders.
    pub query: String,
    pub feed_selector: String,
    pub item_selector: String,
    /// Attribute of a feed item holding its (possibly truncated) name.
    pub item_name_attr: String,
    pub detail_name_selector: String,
    /// Record field → CSS selector in the detail panel.
    pub detail_selectors: BTreeMap<String, String>,
    /// Subdivide each city into grid cells.
    pub grid: bool,
    pub cell_km: f64,
    pub max_scrolls: u32,
    pub scroll_settle_ms: u64,
    pub detail_poll_ms: u64,
    pub detail_poll_attempts: u32,
    pub navigation_timeout_ms: u64,
    pub geocoder_url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        let mut detail_selectors = BTreeMap::new();
        detail_selectors.insert("phone".into(), "button[data-item-id^='phone']".into());
        detail_selectors.insert("website".into(), "a[data-item-id='authority']".into());
        detail_selectors.insert("address".into(), "button[data-item-id='address']".into());
        Self {
            search_url: "https://www.google.com/maps/search/{query}/@{lat},{lng},14z".into(),
            query: "{practice} {city}".into(),
            feed_selector: "div[role='feed']".into(),
            item_selector: "div[role='feed'] a[aria-label]".into(),
            item_name_attr: "aria-label".into(),
            detail_name_selector: "h1".into(),
            detail_selectors,
            grid: true,
            cell_km: 2.0,
            max_scrolls: 30,
            scroll_settle_ms: 1200,
            detail_poll_ms: 250,
            detail_poll_attempts: 20,
            navigation_timeout_ms: 30_000,
            geocoder_url: "https://nominatim.openstreetmap.org/search".into(),
        }
    }
}

/// Termination limits for the iteration driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Page cap per unit (test / production mode).
    pub max_pages: Option<u32>,
    /// Consecutive empty pages tolerated before a unit is abandoned.
    pub empty_page_threshold: u32,
    pub request_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pages: None,
            empty_page_threshold: 3,
            request_timeout_ms: 30_000,
        }
    }
}

impl SourceConfig {
    /// Load a source from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read source config: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid source config: {}", path.display()))
    }

    /// Parse and validate a source from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse source JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("source id must not be empty");
        }
        if url::Url::parse(&self.base_url).is_err() {
            bail!("source {}: base_url is not an absolute URL: {}", self.id, self.base_url);
        }
        if self.page_size == 0 {
            bail!("source {}: page_size must be positive", self.id);
        }
        if self.strategy.is_none() && self.strategy_order.is_empty() {
            bail!("source {}: no strategy configured", self.id);
        }
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            bail!("source {}: pacing min_delay_ms exceeds max_delay_ms", self.id);
        }
        Ok(())
    }

    /// Apply `HARVEST_*` environment overrides to the pacing section.
    pub fn with_env_overrides(mut self) -> Self {
        let p = &mut self.pacing;
        p.min_delay_ms = read_env_u64("HARVEST_MIN_DELAY_MS", p.min_delay_ms);
        p.max_delay_ms = read_env_u64("HARVEST_MAX_DELAY_MS", p.max_delay_ms).max(p.min_delay_ms);
        p.max_retries = read_env_u32("HARVEST_MAX_RETRIES", p.max_retries);
        self
    }

    /// Strategies to try, in priority order.
    pub fn strategy_order(&self) -> Vec<StrategyKind> {
        match self.strategy {
            Some(kind) => vec![kind],
            None => self.strategy_order.clone(),
        }
    }

    /// Configured name prefixes, or A–Z.
    pub fn prefixes_or_alphabet(&self) -> Vec<String> {
        if self.prefixes.is_empty() {
            ('A'..='Z').map(String::from).collect()
        } else {
            self.prefixes.clone()
        }
    }

    /// Resolve a possibly relative link against `base_url`.
    pub fn resolve_url(&self, link: &str) -> String {
        resolve_url(&self.base_url, link)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Resolve `link` against `base`, returning `link` unchanged when either
/// does not parse.
pub fn resolve_url(base: &str, link: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(link)) {
        Ok(u) => u.to_string(),
        Err(_) => link.to_string(),
    }
}

pub(crate) fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

pub(crate) fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}
