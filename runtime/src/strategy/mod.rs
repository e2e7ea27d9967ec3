//! Strategy executors: the four ways of pulling records out of a directory.
//!
//! Each strategy knows how to probe a source for a usable endpoint and how
//! to fetch one page of raw records for an enumeration unit. Everything else
//! (pacing, retries, termination, normalization) lives in the driver, so a
//! strategy only ever answers "what did this page contain".

pub mod api;
pub mod browser;
pub mod bulk;
pub mod html_form;

use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::HttpMethod;
use crate::config::SourceConfig;
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::geocode::Geocoder;
use crate::lead::RawRecord;
use crate::renderer::Renderer;
use async_trait::async_trait;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Acquisition strategy identifiers, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Bulk,
    Api,
    HtmlForm,
    Browser,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bulk => "bulk",
            Self::Api => "api",
            Self::HtmlForm => "html_form",
            Self::Browser => "browser",
        };
        f.write_str(s)
    }
}

/// A resolved place to fetch records from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: StrategyKind,
    pub url: String,
    pub method: HttpMethod,
}

/// Continuation handed back by a strategy for the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Absolute URL of the next page.
    Url(String),
    /// Server-side postback (`__doPostBack(target, argument)`).
    Postback { target: String, argument: String },
}

/// Position of the next fetch inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    /// Zero-based page index.
    pub page: u32,
    /// Records the server returned before this page.
    pub offset: u64,
    pub cursor: Option<PageCursor>,
}

impl PageState {
    pub fn first() -> Self {
        Self::default()
    }

    /// The state after a page of `step` records, carrying the strategy's
    /// cursor.
    pub fn advance(&self, step: u32, cursor: Option<PageCursor>) -> Self {
        Self {
            page: self.page + 1,
            offset: self.offset + u64::from(step),
            cursor,
        }
    }
}

/// One page of raw records plus whatever the server said about the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    /// Total result count the server declared for this unit.
    pub total_hint: Option<u64>,
    /// Whether the server indicated another page exists.
    pub has_next: Option<bool>,
    pub next_cursor: Option<PageCursor>,
}

impl RawBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

/// Result of fetching one page.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Batch(RawBatch),
    /// The strategy has nothing more for this unit.
    Exhausted,
    Blocked {
        status: Option<u16>,
        reason: String,
        captcha: bool,
    },
    /// The response could not be interpreted. Never retried.
    Failed(String),
}

impl From<FetchError> for FetchOutcome {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Blocked {
                status,
                reason,
                captcha,
            } => Self::Blocked {
                status,
                reason,
                captcha,
            },
            FetchError::Transient(reason) => Self::Blocked {
                status: None,
                reason,
                captcha: false,
            },
            FetchError::Structural(reason) => Self::Failed(reason),
        }
    }
}

/// A way of acquiring raw records from a source.
#[async_trait]
pub trait Strategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Look for a usable endpoint. `Ok(None)` means the source does not
    /// offer this kind of access; `Err` means the probe itself was blocked.
    async fn probe(&mut self, ctx: &mut FetchContext) -> Result<Option<Endpoint>, FetchError>;

    async fn fetch_page(
        &mut self,
        ctx: &mut FetchContext,
        endpoint: &Endpoint,
        unit: &UnitKey,
        page: &PageState,
    ) -> FetchOutcome;

    /// Whether fetched pages are already narrowed to the job's practice
    /// area, so leads may be labelled with it.
    fn applies_practice_filter(&self, _source: &SourceConfig) -> bool {
        false
    }
}

/// Instantiate strategies in priority order. The browser strategy is only
/// built when a renderer is available.
pub fn build_strategies(
    order: &[StrategyKind],
    renderer: Option<Arc<dyn Renderer>>,
    geocoder: Option<Arc<dyn Geocoder>>,
) -> Vec<Box<dyn Strategy>> {
    let mut out: Vec<Box<dyn Strategy>> = Vec::new();
    for kind in order {
        match kind {
            StrategyKind::Bulk => out.push(Box::new(bulk::BulkStrategy::new())),
            StrategyKind::Api => out.push(Box::new(api::ApiStrategy::new())),
            StrategyKind::HtmlForm => out.push(Box::new(html_form::HtmlFormStrategy::new())),
            StrategyKind::Browser => match &renderer {
                Some(r) => out.push(Box::new(browser::BrowserStrategy::new(
                    Arc::clone(r),
                    geocoder.clone(),
                ))),
                None => tracing::debug!("no renderer, browser strategy skipped"),
            },
        }
    }
    out
}

/// Visible text of an element, whitespace-collapsed.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a body looks like an HTML document rather than data.
pub(crate) fn looks_like_html(body: &str) -> bool {
    let head: String = body
        .trim_start_matches('\u{feff}')
        .trim_start()
        .chars()
        .take(512)
        .collect::<String>()
        .to_lowercase();
    head.starts_with('<')
        && ["<html", "<!doctype", "<head", "<body"]
            .iter()
            .any(|tag| head.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_state_advance() {
        let p = PageState::first().advance(50, None).advance(50, None);
        assert_eq!(p.page, 2);
        assert_eq!(p.offset, 100);
    }

    #[test]
    fn test_fetch_error_conversion() {
        let out: FetchOutcome = FetchError::captcha("recaptcha").into();
        assert!(matches!(out, FetchOutcome::Blocked { captcha: true, .. }));
        let out: FetchOutcome = FetchError::Structural("bad".into()).into();
        assert_eq!(out, FetchOutcome::Failed("bad".into()));
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("\n<!DOCTYPE html><html><body>x</body></html>"));
        assert!(looks_like_html("<html lang=\"fr\">"));
        assert!(!looks_like_html("name,city\nA,B"));
        assert!(!looks_like_html("<not really>,x\n"));
    }

    #[test]
    fn test_strategy_kind_serde() {
        let k: StrategyKind = serde_json::from_str("\"html_form\"").unwrap();
        assert_eq!(k, StrategyKind::HtmlForm);
        assert_eq!(k.to_string(), "html_form");
    }

    #[test]
    fn test_browser_needs_renderer() {
        let all = [
            StrategyKind::Bulk,
            StrategyKind::Api,
            StrategyKind::HtmlForm,
            StrategyKind::Browser,
        ];
        let built = build_strategies(&all, None, None);
        assert_eq!(built.len(), 3);
        assert_eq!(built[2].kind(), StrategyKind::HtmlForm);
    }
}
