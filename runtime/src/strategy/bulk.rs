//! Bulk download strategy: one CSV export, filtered in memory.
//!
//! Discovery tries configured links, then anchors scraped from listing
//! pages, then conventional export paths. A candidate only counts when it
//! really is delimited data: HTML error pages and near-empty files are
//! rejected so the selector falls through to the next strategy.

use super::{Endpoint, FetchOutcome, PageState, RawBatch, Strategy, StrategyKind};
use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::{HttpMethod, HttpRequest};
use crate::config::resolve_url;
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::lead::RawRecord;
use crate::normalize::text::fold;
use crate::normalize::{resolve_field, CityFilter, RecordNormalizer};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashSet;

/// Delimiters considered when sniffing the first line.
const DELIMITERS: [u8; 3] = [b',', b';', b'\t'];

/// Pick the delimiter occurring most often in the header line.
pub fn detect_delimiter(first_line: &str) -> Option<u8> {
    DELIMITERS
        .iter()
        .map(|d| (*d, first_line.bytes().filter(|b| b == d).count()))
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(_, n)| *n)
        .map(|(d, _)| d)
}

/// Parse a delimited export into header-keyed records.
///
/// Fails when the body is HTML, has no recognizable delimiter in its first
/// line, or holds fewer than `min_rows` non-blank data lines.
pub fn parse_delimited(body: &str, min_rows: usize) -> Result<Vec<RawRecord>> {
    if super::looks_like_html(body) {
        bail!("response is an HTML page");
    }
    let body = body.trim_start_matches('\u{feff}');
    let first_line = body.lines().next().unwrap_or("");
    let delimiter = detect_delimiter(first_line)
        .with_context(|| format!("no delimiter in header line: {first_line:.60}"))?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader.headers().context("unreadable header row")?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.context("malformed CSV row")?;
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        records.push(record);
    }

    if records.len() < min_rows {
        bail!("only {} data rows (need {min_rows})", records.len());
    }
    Ok(records)
}

/// Download-looking anchors on a listing page, resolved to absolute URLs.
pub fn download_links(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a[href]").expect("anchor selector is valid");

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for a in document.select(&anchor) {
        let href = a.value().attr("href").unwrap_or("").trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let lower = href.to_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or("");
        let text = super::element_text(&a).to_lowercase();
        let is_file = path.ends_with(".csv") || path.ends_with(".xlsx") || path.ends_with(".xls");
        let is_export = ["export", "download", "telecharger"]
            .iter()
            .any(|k| lower.contains(k) || text.contains(k));
        if is_file || is_export {
            let url = resolve_url(page_url, href);
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }
    links
}

fn is_spreadsheet(url: &str) -> bool {
    let path = url.to_lowercase();
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.ends_with(".xlsx") || path.ends_with(".xls")
}

/// In-memory view of one downloaded export.
pub struct BulkStrategy {
    rows: Vec<RawRecord>,
    /// Row indices matching the last requested unit.
    selection: Option<(UnitKey, Vec<usize>)>,
}

impl BulkStrategy {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            selection: None,
        }
    }

    async fn candidates(&self, ctx: &mut FetchContext) -> Result<Vec<String>, FetchError> {
        let source = ctx.source().clone();
        let mut out: Vec<String> = source.bulk.urls.iter().map(|u| source.resolve_url(u)).collect();

        let listing_pages = if source.bulk.listing_pages.is_empty() {
            vec![source.base_url.clone()]
        } else {
            source.bulk.listing_pages.iter().map(|p| source.resolve_url(p)).collect()
        };
        for page in listing_pages {
            match ctx.send(HttpRequest::get(&page)).await {
                Ok(resp) if resp.is_success() => {
                    out.extend(download_links(&resp.body, &resp.final_url));
                }
                Ok(resp) => tracing::debug!("listing page {page} answered {}", resp.status),
                Err(e) => return Err(e),
            }
        }

        out.extend(source.bulk.conventional_paths.iter().map(|p| source.resolve_url(p)));
        let mut seen = HashSet::new();
        out.retain(|u| seen.insert(u.clone()));
        Ok(out)
    }

    fn select(
        &mut self,
        normalizer: &RecordNormalizer,
        unit: &UnitKey,
        practice: Option<(&str, &str)>,
    ) -> &[usize] {
        let stale = self.selection.as_ref().map_or(true, |(k, _)| k != unit);
        if stale {
            let city_filter = match unit {
                UnitKey::City(c) => Some(CityFilter::new(&[c.as_str()])),
                _ => None,
            };
            let prefix = match unit {
                UnitKey::Prefix(p) => Some(fold(p)),
                _ => None,
            };
            let practice = practice.map(|(code, label)| (fold(code), fold(label)));

            let indices = self
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| {
                    // rows without a city are kept, as for every other strategy
                    if let (Some(filter), Some(city)) = (&city_filter, normalizer.city_of(row)) {
                        if !filter.matches(&city) {
                            return false;
                        }
                    }
                    if let Some(prefix) = &prefix {
                        let family = normalizer
                            .family_name_of(row)
                            .map(|f| fold(&f))
                            .unwrap_or_default();
                        if !family.starts_with(prefix.as_str()) {
                            return false;
                        }
                    }
                    if let Some((code, label)) = &practice {
                        let areas = resolve_field(row, &normalizer.fields().practice_areas)
                            .map(|a| fold(&a));
                        // Rows without a practice column are kept.
                        if let Some(areas) = areas {
                            if !areas.contains(code.as_str()) && !areas.contains(label.as_str()) {
                                return false;
                            }
                        }
                    }
                    true
                })
                .map(|(i, _)| i)
                .collect();
            self.selection = Some((unit.clone(), indices));
        }
        self.selection.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

impl Default for BulkStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for BulkStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Bulk
    }

    async fn probe(&mut self, ctx: &mut FetchContext) -> Result<Option<Endpoint>, FetchError> {
        let min_rows = ctx.source().bulk.min_data_rows;
        let source = ctx.source().clone();
        let guessed: HashSet<String> = source
            .bulk
            .conventional_paths
            .iter()
            .map(|p| source.resolve_url(p))
            .collect();
        for url in self.candidates(ctx).await? {
            if is_spreadsheet(&url) {
                tracing::warn!(
                    "skipping spreadsheet export {url}: only delimited text is supported"
                );
                continue;
            }
            let resp = match ctx.send(HttpRequest::get(&url)).await {
                Ok(resp) => resp,
                // a guessed path that is forbidden is simply absent
                Err(FetchError::Blocked {
                    status: Some(403), ..
                }) if guessed.contains(&url) => {
                    tracing::debug!("bulk candidate {url} is forbidden");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !resp.is_success() {
                continue;
            }
            match parse_delimited(&resp.body, min_rows) {
                Ok(rows) => {
                    tracing::info!("bulk export {url}: {} rows", rows.len());
                    self.rows = rows;
                    self.selection = None;
                    return Ok(Some(Endpoint {
                        kind: StrategyKind::Bulk,
                        url,
                        method: HttpMethod::Get,
                    }));
                }
                Err(e) => tracing::debug!("bulk candidate {url} rejected: {e:#}"),
            }
        }
        Ok(None)
    }

    async fn fetch_page(
        &mut self,
        ctx: &mut FetchContext,
        _endpoint: &Endpoint,
        unit: &UnitKey,
        page: &PageState,
    ) -> FetchOutcome {
        let normalizer = RecordNormalizer::new(ctx.source());
        let page_size = ctx.source().page_size as usize;
        let practice = ctx
            .filters()
            .practice
            .as_ref()
            .map(|p| (p.code.clone(), p.label.clone()));
        let practice = practice.as_ref().map(|(c, l)| (c.as_str(), l.as_str()));

        let selected = self.select(&normalizer, unit, practice);
        let total = selected.len();
        let start = (page.page as usize).saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);
        let indices = selected[start..end].to_vec();

        FetchOutcome::Batch(RawBatch {
            records: indices.into_iter().map(|i| self.rows[i].clone()).collect(),
            total_hint: Some(total as u64),
            has_next: Some(end < total),
            next_cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::fetch::testing::{context, ScriptedTransport};
    use std::sync::Arc;

    const EXPORT: &str = "\u{feff}Nom;Prénom;Ville\n\
        Dupont;Luc;PARIS CEDEX 08\n\
        Martin;Anne;Lyon\n\
        Bernard;Paul;Paris 15e\n\
        ;;\n\
        Durand;Marie;Marseille 01\n";

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("a;b;c"), Some(b';'));
        assert_eq!(detect_delimiter("a,b;c,d"), Some(b','));
        assert_eq!(detect_delimiter("a\tb"), Some(b'\t'));
        assert_eq!(detect_delimiter("single column"), None);
    }

    #[test]
    fn test_parse_skips_blank_rows() {
        let rows = parse_delimited(EXPORT, 3).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["Nom"], "Dupont");
        assert_eq!(rows[0]["Prénom"], "Luc");
    }

    #[test]
    fn test_parse_rejects_html_and_short_files() {
        assert!(parse_delimited("<!DOCTYPE html><html><body>Not found</body></html>", 1).is_err());
        let err = parse_delimited("name,city\nA B,Paris\nC D,Lyon\n", 3).unwrap_err();
        assert!(err.to_string().contains("only 2 data rows"));
        assert!(parse_delimited("just text\nmore text\n", 0).is_err());
    }

    #[test]
    fn test_download_links() {
        let html = r##"<html><body>
            <a href="/files/members.csv">Members</a>
            <a href="report.xlsx">Excel</a>
            <a href="/data?format=x">Télécharger la liste (export)</a>
            <a href="/about">About</a>
            <a href="#top">top</a>
        </body></html>"##;
        let links = download_links(html, "https://e.org/annuaire/");
        assert_eq!(
            links,
            vec![
                "https://e.org/files/members.csv",
                "https://e.org/annuaire/report.xlsx",
                "https://e.org/data?format=x",
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_then_filter_by_city_in_memory() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some((200, "<html><body>no links</body></html>")),
            Some((200, EXPORT)),
        ]));
        let mut ctx = context(Arc::clone(&transport));
        let mut bulk = BulkStrategy::new();
        let endpoint = bulk.probe(&mut ctx).await.unwrap().unwrap();
        assert_eq!(endpoint.url, "https://e.org/export.csv");

        let unit = UnitKey::City("Paris".into());
        let out = bulk.fetch_page(&mut ctx, &endpoint, &unit, &PageState::first()).await;
        let FetchOutcome::Batch(batch) = out else {
            panic!("expected batch");
        };
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.total_hint, Some(2));
        assert_eq!(batch.has_next, Some(false));
        // Filtering does not touch the network.
        assert_eq!(transport.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_city_filter_keeps_rows_without_city() {
        let mut ctx = context(Arc::new(ScriptedTransport::new(vec![])));
        let mut bulk = BulkStrategy::new();
        let export = "Nom;Prénom;Ville\nDupont;Luc;Paris\nMartin;Anne;Lyon\nPetit;Jean;\n";
        bulk.rows = parse_delimited(export, 0).unwrap();
        let endpoint = Endpoint {
            kind: StrategyKind::Bulk,
            url: "https://e.org/export.csv".into(),
            method: HttpMethod::Get,
        };
        let unit = UnitKey::City("Paris".into());
        let FetchOutcome::Batch(batch) =
            bulk.fetch_page(&mut ctx, &endpoint, &unit, &PageState::first()).await
        else {
            panic!("expected batch");
        };
        let names: Vec<_> = batch.records.iter().map(|r| r["Nom"].clone()).collect();
        assert_eq!(names, vec!["Dupont", "Petit"]);
    }

    #[tokio::test]
    async fn test_filter_by_name_prefix() {
        let mut ctx = context(Arc::new(ScriptedTransport::new(vec![])));
        let mut bulk = BulkStrategy::new();
        bulk.rows = parse_delimited(EXPORT, 0).unwrap();
        let endpoint = Endpoint {
            kind: StrategyKind::Bulk,
            url: "https://e.org/export.csv".into(),
            method: HttpMethod::Get,
        };
        let unit = UnitKey::Prefix("D".into());
        let FetchOutcome::Batch(batch) =
            bulk.fetch_page(&mut ctx, &endpoint, &unit, &PageState::first()).await
        else {
            panic!("expected batch");
        };
        let names: Vec<_> = batch.records.iter().map(|r| r["Nom"].clone()).collect();
        assert_eq!(names, vec!["Dupont", "Durand"]);
    }

    #[tokio::test]
    async fn test_short_file_not_accepted() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Some((200, "<html></html>")),
            Some((200, "name,city\nA B,Paris\nC D,Lyon\n")),
            Some((404, "")),
            Some((404, "")),
        ]));
        let mut ctx = context(transport);
        assert_eq!(BulkStrategy::new().probe(&mut ctx).await.unwrap(), None);
    }
}
