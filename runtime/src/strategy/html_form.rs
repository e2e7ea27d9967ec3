//! Server-rendered search form strategy.
//!
//! The probe loads the search page, records the form's action, method and
//! hidden inputs, and keeps the session cookies in the job's jar. Each page
//! is a form submission; pagination is either an explicit page parameter
//! or a postback cursor taken from the previous page's "next" control.
//! Hidden fields (view state and friends) are refreshed from every response.

use super::{
    element_text, Endpoint, FetchOutcome, PageCursor, PageState, RawBatch, Strategy, StrategyKind,
};
use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::{HttpMethod, HttpRequest};
use crate::config::{resolve_url, HtmlFormConfig, SourceConfig};
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::lead::RawRecord;
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::OnceLock;

const POSTBACK_TARGET: &str = "__EVENTTARGET";
const POSTBACK_ARGUMENT: &str = "__EVENTARGUMENT";

fn postback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"__doPostBack\(\s*['"]([^'"]*)['"]\s*,\s*['"]([^'"]*)['"]\s*\)"#)
            .expect("postback regex is valid")
    })
}

fn default_total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d[\d,.\s]*)\s*[-–à]\s*(\d[\d,.\s]*)\s+(?:of|de|sur|von)\s+(\d[\d,.]*)")
            .expect("total regex is valid")
    })
}

fn parse_selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css:?}: {e:?}"))
}

/// A search form as found on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSpec {
    pub action: String,
    pub method: HttpMethod,
    /// Hidden inputs and pre-filled fields.
    pub fields: Vec<(String, String)>,
}

/// Locate the search form and its pre-filled fields.
pub fn parse_form(html: &str, page_url: &str, form_selector: &str) -> Option<FormSpec> {
    let document = Html::parse_document(html);
    let form_sel = Selector::parse(form_selector).ok()?;
    let form = document.select(&form_sel).next()?;
    let action = resolve_url(page_url, form.value().attr("action").unwrap_or(""));
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => HttpMethod::Post,
        _ => HttpMethod::Get,
    };
    Some(FormSpec {
        action: if action.is_empty() { page_url.to_string() } else { action },
        method,
        fields: prefilled_fields(&form),
    })
}

fn prefilled_fields(form: &ElementRef<'_>) -> Vec<(String, String)> {
    let input = Selector::parse("input[name]").expect("input selector is valid");
    form.select(&input)
        .filter(|el| {
            let ty = el.value().attr("type").unwrap_or("text").to_lowercase();
            !matches!(ty.as_str(), "submit" | "button" | "image" | "reset" | "checkbox" | "radio")
        })
        .filter_map(|el| {
            let name = el.value().attr("name")?.to_string();
            let value = el.value().attr("value").unwrap_or("").to_string();
            Some((name, value))
        })
        .collect()
}

/// Hidden inputs anywhere on a results page.
fn hidden_fields(document: &Html) -> Vec<(String, String)> {
    let hidden = Selector::parse("input[type=hidden][name]").expect("hidden selector is valid");
    document
        .select(&hidden)
        .filter_map(|el| {
            Some((
                el.value().attr("name")?.to_string(),
                el.value().attr("value").unwrap_or("").to_string(),
            ))
        })
        .collect()
}

/// Parse the declared total out of a results summary ("1 - 50 of 462").
pub fn parse_total(text: &str, pattern: Option<&str>) -> Option<u64> {
    let custom;
    let re = match pattern {
        Some(p) => {
            custom = Regex::new(p).ok()?;
            &custom
        }
        None => default_total_re(),
    };
    let caps = re.captures(text)?;
    let raw = caps.get(caps.len() - 1)?.as_str();
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Everything one results page yields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub records: Vec<RawRecord>,
    pub total: Option<u64>,
    pub has_next: bool,
    pub next_cursor: Option<PageCursor>,
    pub hidden: Vec<(String, String)>,
}

fn header_texts(document: &Html) -> Vec<String> {
    let th = Selector::parse("table thead th, table tr th").expect("header selector is valid");
    document.select(&th).map(|el| element_text(&el)).collect()
}

/// Extract result rows, the declared total and the next-page control.
pub fn parse_results(
    html: &str,
    page_url: &str,
    cfg: &HtmlFormConfig,
) -> Result<ParsedPage, String> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector(&cfg.row_selector)?;
    let link_sel = parse_selector(&cfg.link_selector)?;
    let next_sel = parse_selector(&cfg.next_selector)?;
    let cell_sel = Selector::parse("td").expect("cell selector is valid");
    let columns = cfg
        .columns
        .iter()
        .map(|(field, css)| parse_selector(css).map(|sel| (field.clone(), sel)))
        .collect::<Result<Vec<_>, _>>()?;
    let headers = header_texts(&document);

    let mut records = Vec::new();
    for row in document.select(&row_sel) {
        let mut record = RawRecord::new();
        if columns.is_empty() {
            let cells: Vec<_> = row.select(&cell_sel).collect();
            if cells.is_empty() {
                continue;
            }
            for (i, cell) in cells.iter().enumerate() {
                let key = headers
                    .get(i)
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("col{i}"));
                record.insert(key, Value::String(element_text(cell)));
            }
        } else {
            for (field, sel) in &columns {
                if let Some(el) = row.select(sel).next() {
                    let value = match el.value().attr("href") {
                        Some(href) if field.ends_with("url") || field == "website" => {
                            resolve_url(page_url, href)
                        }
                        _ => element_text(&el),
                    };
                    record.insert(field.clone(), Value::String(value));
                }
            }
        }
        if let Some(href) = row.select(&link_sel).next().and_then(|a| a.value().attr("href")) {
            if !href.starts_with("javascript:") && !record.contains_key("profile_url") {
                record.insert(
                    "profile_url".into(),
                    Value::String(resolve_url(page_url, href)),
                );
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }

    let body_text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let total = parse_total(&body_text, cfg.total_pattern.as_deref());

    let next = document.select(&next_sel).next();
    let next_cursor = next.and_then(|el| {
        let href = el.value().attr("href").unwrap_or("");
        let script = el.value().attr("onclick").unwrap_or(href);
        if let Some(caps) = postback_re().captures(script) {
            return Some(PageCursor::Postback {
                target: caps[1].to_string(),
                argument: caps[2].to_string(),
            });
        }
        (!href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
            .then(|| PageCursor::Url(resolve_url(page_url, href)))
    });

    Ok(ParsedPage {
        records,
        total,
        has_next: next.is_some(),
        next_cursor,
        hidden: hidden_fields(&document),
    })
}

fn set_field(fields: &mut Vec<(String, String)>, name: &str, value: String) {
    match fields.iter_mut().find(|(k, _)| k == name) {
        Some(slot) => slot.1 = value,
        None => fields.push((name.to_string(), value)),
    }
}

pub struct HtmlFormStrategy {
    form: Option<FormSpec>,
}

impl HtmlFormStrategy {
    pub fn new() -> Self {
        Self { form: None }
    }

    /// The request for a unit page, or `None` when the page cannot be reached.
    fn submission(
        &self,
        ctx: &FetchContext,
        unit: &UnitKey,
        page: &PageState,
    ) -> Option<HttpRequest> {
        let form = self.form.as_ref()?;
        let cfg = &ctx.source().html;
        let mut fields = form.fields.clone();
        for (k, v) in &cfg.fields {
            set_field(&mut fields, k, v.clone());
        }
        match unit {
            UnitKey::City(city) => {
                if let Some(f) = &cfg.city_field {
                    set_field(&mut fields, f, city.clone());
                }
            }
            UnitKey::Prefix(prefix) => {
                if let Some(f) = &cfg.prefix_field {
                    set_field(&mut fields, f, prefix.clone());
                }
            }
            UnitKey::All => {}
        }
        if let (Some(f), Some(code)) = (&cfg.practice_field, ctx.filters().practice_code()) {
            set_field(&mut fields, f, code.to_string());
        }

        let mut method = form.method;
        let url = form.action.clone();
        if let Some(param) = &cfg.page_param {
            set_field(&mut fields, param, (page.page + cfg.page_base).to_string());
        } else if page.page > 0 {
            match page.cursor.as_ref()? {
                PageCursor::Postback { target, argument } => {
                    set_field(&mut fields, POSTBACK_TARGET, target.clone());
                    set_field(&mut fields, POSTBACK_ARGUMENT, argument.clone());
                    method = HttpMethod::Post;
                }
                PageCursor::Url(next) => return Some(HttpRequest::get(next)),
            }
        }

        Some(match method {
            // A GET submission replaces the action's own query string.
            HttpMethod::Get => {
                let base = url.split('?').next().unwrap_or(&url).to_string();
                HttpRequest::get(base).with_query(fields)
            }
            HttpMethod::Post => HttpRequest::post_form(url, fields),
        })
    }
}

impl Default for HtmlFormStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for HtmlFormStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HtmlForm
    }

    fn applies_practice_filter(&self, source: &SourceConfig) -> bool {
        source.html.practice_field.is_some()
    }

    async fn probe(&mut self, ctx: &mut FetchContext) -> Result<Option<Endpoint>, FetchError> {
        let source = ctx.source().clone();
        let url = source
            .html
            .search_url
            .as_deref()
            .map(|u| source.resolve_url(u))
            .unwrap_or_else(|| source.base_url.clone());
        let resp = ctx.send(HttpRequest::get(&url)).await?;
        if !resp.is_success() {
            tracing::debug!("search page {url} answered {}", resp.status);
            return Ok(None);
        }
        let Some(form) = parse_form(&resp.body, &resp.final_url, &source.html.form_selector) else {
            tracing::debug!("no search form on {url}");
            return Ok(None);
        };
        tracing::info!("search form {} {}", form.method, form.action);
        let endpoint = Endpoint {
            kind: StrategyKind::HtmlForm,
            url: form.action.clone(),
            method: form.method,
        };
        self.form = Some(form);
        Ok(Some(endpoint))
    }

    async fn fetch_page(
        &mut self,
        ctx: &mut FetchContext,
        _endpoint: &Endpoint,
        unit: &UnitKey,
        page: &PageState,
    ) -> FetchOutcome {
        let Some(request) = self.submission(ctx, unit, page) else {
            return FetchOutcome::Exhausted;
        };
        let resp = match ctx.send(request).await {
            Ok(resp) => resp,
            Err(e) => return e.into(),
        };
        if !resp.is_success() {
            return FetchOutcome::Failed(format!("results page answered {}", resp.status));
        }
        let parsed = match parse_results(&resp.body, &resp.final_url, &ctx.source().html) {
            Ok(parsed) => parsed,
            Err(reason) => return FetchOutcome::Failed(reason),
        };
        if let Some(form) = self.form.as_mut() {
            for (k, v) in parsed.hidden {
                set_field(&mut form.fields, &k, v);
            }
        }
        FetchOutcome::Batch(RawBatch {
            records: parsed.records,
            total_hint: parsed.total,
            // a missing next control proves nothing: row counts decide
            has_next: parsed.has_next.then_some(true),
            next_cursor: parsed.next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::fetch::testing::{context_with, ScriptedTransport};
    use crate::acquisition::http_client::RequestBody;
    use std::sync::Arc;

    const SEARCH: &str = r#"<html><body>
        <form id="search" action="/Recherche.aspx" method="post">
          <input type="hidden" name="__VIEWSTATE" value="v1">
          <input type="text" name="ville" value="">
          <input type="submit" name="go" value="Chercher">
        </form></body></html>"#;

    const RESULTS: &str = r#"<html><body>
        <input type="hidden" name="__VIEWSTATE" value="v2">
        <p>Résultats 1 - 2 de 3</p>
        <table><thead><tr><th>Nom</th><th>Ville</th></tr></thead>
        <tbody>
          <tr><td><a href="/fiche/1">Dupont, Luc</a></td><td>Paris</td></tr>
          <tr><td><a href="/fiche/2">Martin, Anne</a></td><td>Paris 15e</td></tr>
        </tbody></table>
        <a class="next" href="javascript:__doPostBack('grid$next','Page$2')">Suivant</a>
        </body></html>"#;

    #[test]
    fn test_parse_form() {
        let form = parse_form(SEARCH, "https://e.org/annuaire/", "form#search").unwrap();
        assert_eq!(form.action, "https://e.org/Recherche.aspx");
        assert_eq!(form.method, HttpMethod::Post);
        assert_eq!(
            form.fields,
            vec![("__VIEWSTATE".into(), "v1".into()), ("ville".into(), "".into())]
        );
    }

    #[test]
    fn test_parse_results_by_header_position() {
        let cfg = HtmlFormConfig::default();
        let page = parse_results(RESULTS, "https://e.org/Recherche.aspx", &cfg).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0]["Nom"], "Dupont, Luc");
        assert_eq!(page.records[1]["Ville"], "Paris 15e");
        assert_eq!(page.records[0]["profile_url"], "https://e.org/fiche/1");
        assert_eq!(page.total, Some(3));
        assert!(page.has_next);
        assert_eq!(
            page.next_cursor,
            Some(PageCursor::Postback {
                target: "grid$next".into(),
                argument: "Page$2".into()
            })
        );
        assert_eq!(page.hidden, vec![("__VIEWSTATE".into(), "v2".into())]);
    }

    #[test]
    fn test_parse_total_variants() {
        assert_eq!(parse_total("Showing 1 - 50 of 462 results", None), Some(462));
        assert_eq!(parse_total("1–25 sur 1,204", None), Some(1204));
        assert_eq!(parse_total("no summary", None), None);
        assert_eq!(parse_total("Total: 88 avocats", Some(r"Total:\s*(\d+)")), Some(88));
    }

    #[test]
    fn test_configured_columns() {
        let mut cfg = HtmlFormConfig::default();
        cfg.row_selector = "div.card".into();
        cfg.columns.insert("name".into(), "h3".into());
        cfg.columns.insert("profile_url".into(), "a.more".into());
        let html = r#"<div class="card"><h3>Jean Valjean</h3><a class="more" href="p/9">+</a></div>"#;
        let page = parse_results(html, "https://e.org/list/", &cfg).unwrap();
        assert_eq!(page.records[0]["name"], "Jean Valjean");
        assert_eq!(page.records[0]["profile_url"], "https://e.org/list/p/9");
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn test_postback_pagination_carries_view_state() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some((200, SEARCH)),
            Some((200, RESULTS)),
            Some((200, "<html><body><table><tbody></tbody></table></body></html>")),
        ]));
        let mut ctx = context_with(
            Arc::clone(&transport),
            r#"{"id": "t", "base_url": "https://e.org/", "html": {"city_field": "ville"}}"#,
        );
        let mut html = HtmlFormStrategy::new();
        let endpoint = html.probe(&mut ctx).await.unwrap().unwrap();
        let unit = UnitKey::City("Paris".into());

        let first = PageState::first();
        let FetchOutcome::Batch(batch) = html.fetch_page(&mut ctx, &endpoint, &unit, &first).await
        else {
            panic!("expected batch");
        };
        let second = first.advance(50, batch.next_cursor.clone());
        html.fetch_page(&mut ctx, &endpoint, &unit, &second).await;

        let seen = transport.seen.lock().unwrap();
        let RequestBody::Form(fields) = &seen[2].body else {
            panic!("expected form post");
        };
        assert!(fields.contains(&("__VIEWSTATE".into(), "v2".into())));
        assert!(fields.contains(&("ville".into(), "Paris".into())));
        assert!(fields.contains(&(POSTBACK_TARGET.into(), "grid$next".into())));
    }

    #[tokio::test]
    async fn test_page_without_next_control_leaves_continuation_open() {
        let bare = r#"<html><body><table><tbody>
            <tr><td>Dupont, Luc</td><td>Paris</td></tr>
            </tbody></table></body></html>"#;
        let transport =
            Arc::new(ScriptedTransport::new(vec![Some((200, SEARCH)), Some((200, bare))]));
        let mut ctx = context_with(
            transport,
            r#"{"id": "t", "base_url": "https://e.org/", "html": {"page_param": "p"}}"#,
        );
        let mut html = HtmlFormStrategy::new();
        let endpoint = html.probe(&mut ctx).await.unwrap().unwrap();
        let out = html
            .fetch_page(&mut ctx, &endpoint, &UnitKey::All, &PageState::first())
            .await;
        let FetchOutcome::Batch(batch) = out else {
            panic!("expected batch");
        };
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.total_hint, None);
        assert_eq!(batch.has_next, None);
    }

    #[tokio::test]
    async fn test_no_pagination_means_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(vec![Some((200, SEARCH))]));
        let mut ctx = context_with(transport, r#"{"id": "t", "base_url": "https://e.org/"}"#);
        let mut html = HtmlFormStrategy::new();
        let endpoint = html.probe(&mut ctx).await.unwrap().unwrap();
        let second = PageState::first().advance(50, None);
        let out = html.fetch_page(&mut ctx, &endpoint, &UnitKey::All, &second).await;
        assert_eq!(out, FetchOutcome::Exhausted);
    }
}
