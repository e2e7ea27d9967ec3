//! JSON API strategy (REST and SODA-style endpoints).
//!
//! Endpoints come from configuration or are discovered on the landing page
//! and its same-origin scripts. A candidate is accepted once a test request
//! returns JSON with an extractable record array; a `405` on GET is retried
//! once as POST before the candidate is dropped.

use super::{Endpoint, FetchOutcome, PageCursor, PageState, RawBatch, Strategy, StrategyKind};
use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::{HttpMethod, HttpRequest, HttpResponse};
use crate::config::{resolve_url, ApiConfig, BodyFormat, SourceConfig};
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::lead::RawRecord;
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Body keys signalling more pages.
const NEXT_KEYS: &[&str] = &["next", "next_page", "nextPage", "hasMore", "has_more", "hasNext"];

fn endpoint_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"fetch\(\s*['"`]([^'"`]+)['"`]"#,
            r#"axios\.(?:get|post)\(\s*['"`]([^'"`]+)['"`]"#,
            r#"['"`]((?:https?://[^'"`\s]*)?/api/[^'"`\s]+)['"`]"#,
            r#"['"`]((?:https?://[^'"`\s]*)?/resource/[a-z0-9]{4}-[a-z0-9]{4}\.json[^'"`\s]*)['"`]"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("endpoint regex is valid"))
        .collect()
    })
}

/// Candidate API endpoints referenced in HTML or JavaScript text.
pub fn discover_endpoints(text: &str, base_url: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for re in endpoint_patterns() {
        for caps in re.captures_iter(text) {
            let raw = caps.get(1).map_or("", |m| m.as_str());
            if raw.contains("${") || raw.ends_with(".js") || raw.ends_with(".css") {
                continue;
            }
            let url = resolve_url(base_url, raw);
            if seen.insert(url.clone()) {
                out.push(url);
            }
        }
    }
    out
}

/// Same-origin `<script src>` URLs of a page.
fn script_sources(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let script = Selector::parse("script[src]").expect("script selector is valid");
    let origin = url::Url::parse(page_url).ok().map(|u| u.origin());
    document
        .select(&script)
        .filter_map(|s| s.value().attr("src"))
        .map(|src| resolve_url(page_url, src))
        .filter(|src| {
            let src_origin = url::Url::parse(src).ok().map(|u| u.origin());
            origin.is_some() && src_origin == origin
        })
        .collect()
}

/// Follow a dotted path (`"meta.total"`) into a JSON value.
fn at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        // Elasticsearch-style `{"value": 12, "relation": "eq"}`.
        Value::Object(o) => o.get("value").and_then(as_count),
        _ => None,
    }
}

/// The record array of a response: the root array or the first wrapper key
/// holding an array of objects.
pub fn extract_records(body: &Value, record_keys: &[String]) -> Option<Vec<RawRecord>> {
    let array = match body {
        Value::Array(items) => items,
        Value::Object(_) => record_keys
            .iter()
            .filter_map(|k| at_path(body, k))
            .find_map(|v| v.as_array())?,
        _ => return None,
    };
    Some(
        array
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
    )
}

/// Total result count from response headers or body keys.
pub fn extract_total(resp: &HttpResponse, body: &Value, cfg: &ApiConfig) -> Option<u64> {
    cfg.total_headers
        .iter()
        .find_map(|h| resp.header(h).and_then(|v| v.trim().parse().ok()))
        .or_else(|| {
            cfg.total_keys
                .iter()
                .find_map(|k| at_path(body, k).and_then(as_count))
        })
}

/// Next-page indication from body keys, plus a next URL when given.
fn extract_next(body: &Value, base_url: &str) -> (Option<bool>, Option<PageCursor>) {
    for key in NEXT_KEYS {
        match body.get(*key) {
            Some(Value::Bool(b)) => return (Some(*b), None),
            Some(Value::Null) => return (Some(false), None),
            Some(Value::String(s)) if s.is_empty() => return (Some(false), None),
            Some(Value::String(s)) if s.starts_with("http") || s.starts_with('/') => {
                return (Some(true), Some(PageCursor::Url(resolve_url(base_url, s))));
            }
            Some(Value::String(_)) | Some(Value::Number(_)) => return (Some(true), None),
            _ => {}
        }
    }
    (None, None)
}

/// Request parameters for a unit page.
fn page_params(
    source: &SourceConfig,
    unit: &UnitKey,
    page: &PageState,
    practice: Option<&str>,
) -> Vec<(String, Value)> {
    let cfg = &source.api;
    let mut params: Vec<(String, Value)> = cfg
        .params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if let Some(p) = &cfg.page_param {
        params.push((p.clone(), Value::from(page.page + cfg.page_base)));
    }
    if let Some(p) = &cfg.offset_param {
        params.push((p.clone(), Value::from(page.offset)));
    }
    if let Some(p) = &cfg.size_param {
        params.push((p.clone(), Value::from(source.page_size)));
    }
    match unit {
        UnitKey::City(city) => {
            if let Some(p) = &cfg.city_param {
                params.push((p.clone(), Value::String(city.clone())));
            }
        }
        UnitKey::Prefix(prefix) => {
            if let Some(p) = &cfg.prefix_param {
                params.push((p.clone(), Value::String(prefix.clone())));
            }
        }
        UnitKey::All => {}
    }
    if let (Some(p), Some(code)) = (&cfg.practice_param, practice) {
        params.push((p.clone(), Value::String(code.to_string())));
    }
    params
}

fn param_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_request(
    url: &str,
    method: HttpMethod,
    body: BodyFormat,
    params: Vec<(String, Value)>,
) -> HttpRequest {
    let request = match (method, body) {
        (HttpMethod::Get, _) => HttpRequest::get(url)
            .with_query(params.iter().map(|(k, v)| (k.clone(), param_text(v))).collect()),
        (HttpMethod::Post, BodyFormat::Json) => {
            HttpRequest::post_json(url, Value::Object(params.into_iter().collect::<Map<_, _>>()))
        }
        (HttpMethod::Post, BodyFormat::Form) => HttpRequest::post_form(
            url,
            params.iter().map(|(k, v)| (k.clone(), param_text(v))).collect(),
        ),
    };
    request.header("Accept", "application/json")
}

/// Outcome of interpreting one API response.
fn interpret(resp: &HttpResponse, cfg: &ApiConfig) -> Result<RawBatch, String> {
    if !resp.is_success() {
        return Err(format!("endpoint answered {}", resp.status));
    }
    let body: Value = serde_json::from_str(&resp.body)
        .map_err(|e| format!("response is not JSON: {e}"))?;
    let records = extract_records(&body, &cfg.record_keys)
        .ok_or_else(|| "no record array in response".to_string())?;
    let (has_next, next_cursor) = extract_next(&body, &resp.final_url);
    Ok(RawBatch {
        records,
        total_hint: extract_total(resp, &body, cfg),
        has_next,
        next_cursor,
    })
}

pub struct ApiStrategy;

impl ApiStrategy {
    pub fn new() -> Self {
        Self
    }

    async fn candidates(&self, ctx: &mut FetchContext) -> Result<Vec<String>, FetchError> {
        let source = ctx.source().clone();
        let mut out: Vec<String> = source
            .api
            .endpoints
            .iter()
            .map(|e| source.resolve_url(e))
            .collect();
        if !source.api.discover {
            return Ok(out);
        }

        let landing = ctx.send(HttpRequest::get(&source.base_url)).await?;
        if !landing.is_success() {
            tracing::debug!("landing page answered {}, no discovery", landing.status);
            return Ok(out);
        }
        out.extend(discover_endpoints(&landing.body, &landing.final_url));
        for script in script_sources(&landing.body, &landing.final_url).into_iter().take(5) {
            if let Ok(resp) = ctx.send(HttpRequest::get(&script)).await {
                if resp.is_success() {
                    out.extend(discover_endpoints(&resp.body, &landing.final_url));
                }
            }
        }

        let mut seen = HashSet::new();
        out.retain(|u| seen.insert(u.clone()));
        Ok(out)
    }

    /// Send a first-page request, falling back to POST on `405`.
    async fn test_endpoint(
        &self,
        ctx: &mut FetchContext,
        url: &str,
    ) -> Result<Option<HttpMethod>, FetchError> {
        let source = ctx.source().clone();
        let params = || page_params(&source, &UnitKey::All, &PageState::first(), None);

        let mut method = source.api.method;
        let mut resp = ctx
            .send(build_request(url, method, source.api.body, params()))
            .await?;
        if resp.status == 405 && method == HttpMethod::Get {
            tracing::debug!("{url} rejected GET, retrying as POST");
            method = HttpMethod::Post;
            resp = ctx
                .send(build_request(url, method, source.api.body, params()))
                .await?;
        }
        match interpret(&resp, &source.api) {
            Ok(_) => Ok(Some(method)),
            Err(reason) => {
                tracing::debug!("API candidate {url} rejected: {reason}");
                Ok(None)
            }
        }
    }
}

impl Default for ApiStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for ApiStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Api
    }

    fn applies_practice_filter(&self, source: &SourceConfig) -> bool {
        source.api.practice_param.is_some()
    }

    async fn probe(&mut self, ctx: &mut FetchContext) -> Result<Option<Endpoint>, FetchError> {
        for url in self.candidates(ctx).await? {
            match self.test_endpoint(ctx, &url).await {
                Ok(Some(method)) => {
                    tracing::info!("API endpoint {method} {url}");
                    return Ok(Some(Endpoint {
                        kind: StrategyKind::Api,
                        url,
                        method,
                    }));
                }
                Ok(None) => {}
                // blocks count against the retry budget of the caller
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn fetch_page(
        &mut self,
        ctx: &mut FetchContext,
        endpoint: &Endpoint,
        unit: &UnitKey,
        page: &PageState,
    ) -> FetchOutcome {
        let source = ctx.source().clone();
        let request = match &page.cursor {
            Some(PageCursor::Url(next)) => {
                HttpRequest::get(next).header("Accept", "application/json")
            }
            _ => {
                let params = page_params(&source, unit, page, ctx.filters().practice_code());
                build_request(&endpoint.url, endpoint.method, source.api.body, params)
            }
        };
        let resp = match ctx.send(request).await {
            Ok(resp) => resp,
            Err(e) => return e.into(),
        };
        match interpret(&resp, &source.api) {
            Ok(batch) => FetchOutcome::Batch(batch),
            Err(reason) => FetchOutcome::Failed(reason),
        }
    }
}
