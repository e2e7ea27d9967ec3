//! Headless-browser strategy for client-rendered map and result feeds.
//!
//! A city is optionally split into grid cells. For each cell the strategy
//! loads the search URL, scrolls the feed until it stops growing, then
//! opens each item and waits until the detail panel shows that item's
//! name before reading it. Feed names may be truncated, so the wait uses a
//! prefix match. Each fetched page is the next cell that yields records.

use super::{Endpoint, FetchOutcome, PageState, RawBatch, Strategy, StrategyKind};
use crate::acquisition::challenge::detect_challenge;
use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::HttpMethod;
use crate::config::{BrowserConfig, SourceConfig};
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::geocode::Geocoder;
use crate::lead::RawRecord;
use crate::normalize::names_match;
use crate::normalize::text::fold;
use crate::renderer::{Tab, Renderer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Feed item counts must hold steady this many scrolls in a row.
const STABLE_SCROLLS: u32 = 2;

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

fn scroll_script(cfg: &BrowserConfig) -> String {
    format!(
        "(() => {{ const feed = document.querySelector({feed}); \
         if (feed) feed.scrollBy(0, feed.scrollHeight); \
         return document.querySelectorAll({item}).length; }})()",
        feed = js_str(&cfg.feed_selector),
        item = js_str(&cfg.item_selector),
    )
}

fn names_script(cfg: &BrowserConfig) -> String {
    format!(
        "Array.from(document.querySelectorAll({item})) \
         .map(e => e.getAttribute({attr}) || e.textContent.trim())",
        item = js_str(&cfg.item_selector),
        attr = js_str(&cfg.item_name_attr),
    )
}

fn click_script(cfg: &BrowserConfig, index: usize) -> String {
    format!(
        "(() => {{ const e = document.querySelectorAll({item})[{index}]; \
         if (!e) return false; e.click(); return true; }})()",
        item = js_str(&cfg.item_selector),
    )
}

fn detail_name_script(cfg: &BrowserConfig) -> String {
    format!(
        "(() => {{ const e = document.querySelector({sel}); \
         return e ? e.textContent.trim() : null; }})()",
        sel = js_str(&cfg.detail_name_selector),
    )
}

fn detail_fields_script(cfg: &BrowserConfig) -> String {
    let selectors = serde_json::to_string(&cfg.detail_selectors).unwrap_or_else(|_| "{}".into());
    format!(
        "(() => {{ const out = {{}}; \
         for (const [k, s] of Object.entries({selectors})) {{ \
           const e = document.querySelector(s); if (!e) continue; \
           out[k] = e.getAttribute('href') || e.getAttribute('aria-label') || e.textContent.trim(); \
         }} return out; }})()"
    )
}

/// Drop an accessibility label prefix ("Phone: 01 23" → "01 23").
pub fn strip_label(value: &str) -> String {
    match value.split_once(": ") {
        Some((label, rest)) if label.len() <= 24 && !label.contains("//") => {
            rest.trim().to_string()
        }
        _ => value.trim().to_string(),
    }
}

/// Fill the search URL template. Without coordinates the path segment
/// holding them is dropped.
pub fn search_url(template: &str, query: &str, center: Option<(f64, f64)>) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    let filled = template.replace("{query}", &encoded);
    match center {
        Some((lat, lng)) => filled
            .replace("{lat}", &format!("{lat:.6}"))
            .replace("{lng}", &format!("{lng:.6}")),
        None => filled
            .split('/')
            .filter(|seg| !seg.contains("{lat}") && !seg.contains("{lng}"))
            .collect::<Vec<_>>()
            .join("/"),
    }
}

/// Per-unit progress through the grid.
struct CellPlan {
    unit: UnitKey,
    place: String,
    cells: Vec<Option<(f64, f64)>>,
    next_cell: usize,
    seen: HashSet<String>,
}

fn renderer_error(e: anyhow::Error) -> FetchError {
    FetchError::Blocked {
        status: None,
        reason: format!("browser: {e:#}"),
        captcha: false,
    }
}

pub struct BrowserStrategy {
    renderer: Arc<dyn Renderer>,
    geocoder: Option<Arc<dyn Geocoder>>,
    plan: Option<CellPlan>,
}

impl BrowserStrategy {
    pub fn new(renderer: Arc<dyn Renderer>, geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        Self {
            renderer,
            geocoder,
            plan: None,
        }
    }

    async fn plan_unit(
        &mut self,
        ctx: &mut FetchContext,
        unit: &UnitKey,
    ) -> Result<(), FetchError> {
        if self.plan.as_ref().is_some_and(|p| &p.unit == unit) {
            return Ok(());
        }
        let place = match unit {
            UnitKey::City(city) => city.clone(),
            UnitKey::All => ctx.source().region.clone(),
            UnitKey::Prefix(_) => String::new(),
        };
        let cfg = ctx.source().browser.clone();
        let mut cells = vec![None];
        if let (true, Some(geocoder), false) = (cfg.grid, &self.geocoder, place.is_empty()) {
            match geocoder.locate(ctx, &place).await? {
                Some(bbox) => {
                    cells = bbox.grid_cells(cfg.cell_km).into_iter().map(Some).collect();
                }
                None => tracing::warn!("could not geocode {place}, searching without a grid"),
            }
        }
        tracing::debug!("{place}: {} grid cells", cells.len());
        self.plan = Some(CellPlan {
            unit: unit.clone(),
            place,
            cells,
            next_cell: 0,
            seen: HashSet::new(),
        });
        Ok(())
    }

    /// Scroll the feed until its item count stops growing.
    async fn load_feed(
        &self,
        tab: &dyn Tab,
        cfg: &BrowserConfig,
    ) -> Result<(), FetchError> {
        let script = scroll_script(cfg);
        let mut last = 0u64;
        let mut stable = 0;
        for _ in 0..cfg.max_scrolls {
            let count = tab
                .evaluate(&script)
                .await
                .map_err(renderer_error)?
                .as_u64()
                .unwrap_or(0);
            if count == last {
                stable += 1;
                if stable >= STABLE_SCROLLS {
                    break;
                }
            } else {
                stable = 0;
                last = count;
            }
            tokio::time::sleep(Duration::from_millis(cfg.scroll_settle_ms)).await;
        }
        Ok(())
    }

    /// Wait until the detail panel shows `name`; returns the panel's name.
    async fn await_detail(
        &self,
        tab: &dyn Tab,
        cfg: &BrowserConfig,
        name: &str,
    ) -> Result<Option<String>, FetchError> {
        let script = detail_name_script(cfg);
        for _ in 0..cfg.detail_poll_attempts.max(1) {
            let shown = tab.evaluate(&script).await.map_err(renderer_error)?;
            if let Some(shown) = shown.as_str() {
                if names_match(shown, name) {
                    return Ok(Some(shown.to_string()));
                }
            }
            tokio::time::sleep(Duration::from_millis(cfg.detail_poll_ms)).await;
        }
        Ok(None)
    }

    async fn harvest_cell(
        &mut self,
        ctx: &mut FetchContext,
        tab: &mut dyn Tab,
        query: &str,
        center: Option<(f64, f64)>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let cfg = ctx.source().browser.clone();
        let url = search_url(&cfg.search_url, query, center);

        ctx.pace().await;
        let landed = tab
            .goto(&url, cfg.navigation_timeout_ms)
            .await
            .map_err(renderer_error)?;
        tracing::debug!("cell {query:?} loaded {landed}");
        let html = tab.content().await.map_err(renderer_error)?;
        if let Some(marker) = detect_challenge(&html) {
            return Err(FetchError::captcha(marker));
        }

        self.load_feed(tab, &cfg).await?;
        let names: Vec<String> = serde_json::from_value(
            tab.evaluate(&names_script(&cfg)).await.map_err(renderer_error)?,
        )
        .unwrap_or_default();

        let place = self.plan.as_ref().map(|p| p.place.clone()).unwrap_or_default();
        let mut records = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let key = fold(name.trim_end_matches('…'));
            if key.is_empty() || self.plan.as_ref().is_some_and(|p| p.seen.contains(&key)) {
                continue;
            }
            ctx.pace().await;
            let clicked = tab
                .evaluate(&click_script(&cfg, i))
                .await
                .map_err(renderer_error)?;
            if clicked != Value::Bool(true) {
                continue;
            }
            let Some(full_name) = self.await_detail(tab, &cfg, name).await? else {
                tracing::debug!("detail panel never showed {name}, skipping");
                continue;
            };

            let fields = tab
                .evaluate(&detail_fields_script(&cfg))
                .await
                .map_err(renderer_error)?;
            let mut record = RawRecord::new();
            record.insert("name".into(), Value::String(full_name.clone()));
            record.insert("firm".into(), Value::String(full_name));
            record.insert("city".into(), Value::String(place.clone()));
            if let Value::Object(fields) = fields {
                for (k, v) in fields {
                    if let Some(v) = v.as_str() {
                        record.insert(k, Value::String(strip_label(v)));
                    }
                }
            }
            if let Some(plan) = self.plan.as_mut() {
                plan.seen.insert(key);
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn next_records(
        &mut self,
        ctx: &mut FetchContext,
        tab: &mut dyn Tab,
    ) -> Result<RawBatch, FetchError> {
        let cfg = ctx.source().browser.clone();
        let practice = ctx.filters().practice_label().unwrap_or("").to_string();
        loop {
            let Some((cell, place, remaining)) = self.plan.as_ref().and_then(|p| {
                p.cells
                    .get(p.next_cell)
                    .map(|c| (*c, p.place.clone(), p.cells.len() - p.next_cell - 1))
            }) else {
                return Ok(RawBatch {
                    has_next: Some(false),
                    ..RawBatch::default()
                });
            };
            let query = cfg
                .query
                .replace("{practice}", &practice)
                .replace("{city}", &place)
                .trim()
                .to_string();
            let records = self.harvest_cell(ctx, tab, &query, cell).await?;
            if let Some(plan) = self.plan.as_mut() {
                plan.next_cell += 1;
            }
            if !records.is_empty() || remaining == 0 {
                return Ok(RawBatch {
                    records,
                    total_hint: None,
                    has_next: Some(remaining > 0),
                    next_cursor: None,
                });
            }
        }
    }
}

#[async_trait]
impl Strategy for BrowserStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Browser
    }

    fn applies_practice_filter(&self, source: &SourceConfig) -> bool {
        source.browser.query.contains("{practice}")
    }

    async fn probe(&mut self, ctx: &mut FetchContext) -> Result<Option<Endpoint>, FetchError> {
        match self.renderer.open_tab().await {
            Ok(tab) => {
                let _ = tab.close().await;
                Ok(Some(Endpoint {
                    kind: StrategyKind::Browser,
                    url: ctx.source().browser.search_url.clone(),
                    method: HttpMethod::Get,
                }))
            }
            Err(e) => {
                tracing::debug!("browser unavailable: {e:#}");
                Ok(None)
            }
        }
    }

    async fn fetch_page(
        &mut self,
        ctx: &mut FetchContext,
        _endpoint: &Endpoint,
        unit: &UnitKey,
        _page: &PageState,
    ) -> FetchOutcome {
        if matches!(unit, UnitKey::Prefix(_)) {
            return FetchOutcome::Failed("name prefixes cannot be searched in a result feed".into());
        }
        if let Err(e) = self.plan_unit(ctx, unit).await {
            return e.into();
        }
        let mut tab = match self.renderer.open_tab().await {
            Ok(tab) => tab,
            Err(e) => return renderer_error(e).into(),
        };
        let result = self.next_records(ctx, tab.as_mut()).await;
        let _ = tab.close().await;
        match result {
            Ok(batch) => FetchOutcome::Batch(batch),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::fetch::testing::{context_with, ScriptedTransport};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A feed of fixed items whose detail panel shows the last clicked one.
    struct FakeFeed {
        items: Vec<(&'static str, &'static str, &'static str)>,
        html: &'static str,
    }

    struct FakeTab {
        feed: Arc<FakeFeed>,
        clicked: Mutex<Option<usize>>,
        visited: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tab for FakeTab {
        async fn goto(&mut self, url: &str, _timeout_ms: u64) -> Result<String> {
            self.visited.lock().unwrap().push(url.to_string());
            Ok(url.to_string())
        }

        async fn evaluate(&self, script: &str) -> Result<Value> {
            let items = &self.feed.items;
            if script.contains("Object.entries") {
                let i = self.clicked.lock().unwrap().unwrap_or(0);
                return Ok(serde_json::json!({"phone": format!("Phone: {}", items[i].2)}));
            }
            if script.contains(".click()") {
                let index: usize = script
                    .split("\")[")
                    .nth(1)
                    .and_then(|rest| rest.split(']').next())
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(usize::MAX);
                *self.clicked.lock().unwrap() = Some(index);
                return Ok(Value::Bool(index < items.len()));
            }
            if script.contains("scrollBy") {
                return Ok(Value::from(items.len()));
            }
            if script.starts_with("Array.from") {
                return Ok(serde_json::json!(items.iter().map(|i| i.0).collect::<Vec<_>>()));
            }
            let shown = self.clicked.lock().unwrap().map(|i| items[i].1);
            Ok(shown.map(Value::from).unwrap_or(Value::Null))
        }

        async fn content(&self) -> Result<String> {
            Ok(self.feed.html.to_string())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct FakeRenderer {
        feed: Arc<FakeFeed>,
        visited: Arc<Mutex<Vec<String>>>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn open_tab(&self) -> Result<Box<dyn Tab>> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeTab {
                feed: Arc::clone(&self.feed),
                clicked: Mutex::new(None),
                visited: Arc::clone(&self.visited),
            }))
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        fn open_tabs(&self) -> usize {
            0
        }
    }

    fn renderer(html: &'static str) -> Arc<FakeRenderer> {
        Arc::new(FakeRenderer {
            feed: Arc::new(FakeFeed {
                items: vec![
                    ("Cabinet Dupont & Asso…", "Cabinet Dupont & Associés", "01 40 00 00 01"),
                    ("Etude Martin", "Étude Martin Avocats", "01 40 00 00 02"),
                    ("Etude Martin", "Étude Martin Avocats", "01 40 00 00 02"),
                ],
                html,
            }),
            visited: Arc::new(Mutex::new(Vec::new())),
            opened: AtomicUsize::new(0),
        })
    }

    const SOURCE: &str = r#"{"id": "maps", "base_url": "https://maps.test/", "strategy": "browser",
        "browser": {"grid": false, "scroll_settle_ms": 0, "detail_poll_ms": 0,
                    "search_url": "https://maps.test/search/{query}/@{lat},{lng},14z"}}"#;

    #[test]
    fn test_search_url_template() {
        let t = "https://maps.test/search/{query}/@{lat},{lng},14z";
        assert_eq!(
            search_url(t, "avocat Lyon", Some((45.75, 4.85))),
            "https://maps.test/search/avocat+Lyon/@45.750000,4.850000,14z"
        );
        assert_eq!(search_url(t, "avocat Lyon", None), "https://maps.test/search/avocat+Lyon");
    }

    #[test]
    fn test_strip_label() {
        assert_eq!(strip_label("Phone: 01 23 45"), "01 23 45");
        assert_eq!(strip_label("https://e.org"), "https://e.org");
        assert_eq!(strip_label(" 12 rue X "), "12 rue X");
    }

    #[tokio::test]
    async fn test_feed_items_matched_to_detail_panel() {
        let fake = renderer("<html><div role='feed'></div></html>");
        let mut ctx = context_with(Arc::new(ScriptedTransport::new(vec![])), SOURCE);
        let mut strategy = BrowserStrategy::new(fake.clone(), None);
        let endpoint = strategy.probe(&mut ctx).await.unwrap().unwrap();
        let unit = UnitKey::City("Lyon".into());

        let FetchOutcome::Batch(batch) =
            strategy.fetch_page(&mut ctx, &endpoint, &unit, &PageState::first()).await
        else {
            panic!("expected batch");
        };
        assert_eq!(batch.records.len(), 2, "duplicate feed entry collapsed");
        assert_eq!(batch.records[0]["name"], "Cabinet Dupont & Associés");
        assert_eq!(batch.records[0]["phone"], "01 40 00 00 01");
        assert_eq!(batch.records[1]["city"], "Lyon");
        assert_eq!(batch.has_next, Some(false));
        assert_eq!(
            fake.visited.lock().unwrap().as_slice(),
            ["https://maps.test/search/Lyon"]
        );
    }

    #[tokio::test]
    async fn test_challenge_page_is_captcha() {
        let fake = renderer("<div id='recaptcha'>unusual traffic</div>");
        let mut ctx = context_with(Arc::new(ScriptedTransport::new(vec![])), SOURCE);
        let mut strategy = BrowserStrategy::new(fake, None);
        let endpoint = strategy.probe(&mut ctx).await.unwrap().unwrap();
        let out = strategy
            .fetch_page(&mut ctx, &endpoint, &UnitKey::City("Lyon".into()), &PageState::first())
            .await;
        assert!(matches!(out, FetchOutcome::Blocked { captcha: true, .. }));
    }

    #[tokio::test]
    async fn test_prefix_units_rejected() {
        let mut ctx = context_with(Arc::new(ScriptedTransport::new(vec![])), SOURCE);
        let mut strategy = BrowserStrategy::new(renderer("<html></html>"), None);
        let endpoint = strategy.probe(&mut ctx).await.unwrap().unwrap();
        let out = strategy
            .fetch_page(&mut ctx, &endpoint, &UnitKey::Prefix("A".into()), &PageState::first())
            .await;
        assert!(matches!(out, FetchOutcome::Failed(_)));
    }
}
