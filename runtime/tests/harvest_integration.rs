//! End-to-end harvesting against a local mock directory.
//!
//! Every test runs a real `HarvestJob` over the reqwest transport, pointed at
//! a wiremock server standing in for the directory site. Pacing delays are
//! zeroed so the tests stay fast.

use lead_harvest::batch::ledger::{JobStatus, ProgressLedger};
use lead_harvest::batch::{BatchConfig, BatchOrchestrator, BatchPlan, InProcessRunner};
use lead_harvest::config::SourceConfig;
use lead_harvest::job::{HarvestJob, HarvestRequest, JobResources, JobStats};
use lead_harvest::lead::CanonicalLead;
use lead_harvest::progress::{AnomalyKind, HarvestItem};
use lead_harvest::strategy::StrategyKind;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

async fn harvest(source_json: &str) -> (Vec<HarvestItem>, JobStats) {
    let source = SourceConfig::from_json(source_json).unwrap();
    let job = HarvestJob::with_http(HarvestRequest::new(source), JobResources::default()).unwrap();
    job.collect().await
}

fn leads(items: &[HarvestItem]) -> Vec<CanonicalLead> {
    items.iter().filter_map(HarvestItem::as_lead).cloned().collect()
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html; charset=utf-8")
}

fn json(body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

// ── HTML search form ──

const SEARCH_PAGE: &str = r#"<html><body>
    <form id="search" action="/results" method="get">
      <input type="hidden" name="token" value="abc">
      <input type="text" name="city" value="">
      <input type="submit" value="Search">
    </form></body></html>"#;

const DECLARED_TOTAL: usize = 462;

/// How the mock directory decorates its result pages.
#[derive(Clone, Copy)]
struct Layout {
    /// "Showing a - b of N" above the table.
    summary: bool,
    /// Pages before this one carry a "next" link.
    next_before: usize,
}

const FULL_LAYOUT: Layout = Layout { summary: true, next_before: 5 };

/// A results page of the mock directory, 50 rows per page whatever the
/// client asks for.
fn results_page(req: &Request, layout: Layout) -> ResponseTemplate {
    let page: usize = req
        .url
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1);
    let first = (page - 1) * 50;
    let last = (first + 50).min(DECLARED_TOTAL);

    let rows: String = (first..last)
        .map(|n| {
            format!(
                r#"<tr><td><a href="/member/{n}">Member{n} Lawson</a></td><td>Springfield</td></tr>"#
            )
        })
        .collect();
    let summary = if layout.summary {
        format!("<p>Showing {} - {last} of {DECLARED_TOTAL}</p>", first + 1)
    } else {
        String::new()
    };
    let next = if page < layout.next_before {
        format!(r#"<a class="next" href="/results?page={}">Next</a>"#, page + 1)
    } else {
        String::new()
    };
    html(&format!(
        r#"<html><body>{summary}
        <table><thead><tr><th>Name</th><th>City</th></tr></thead>
        <tbody>{rows}</tbody></table>{next}
        </body></html>"#
    ))
}

async fn mount_results(server: &MockServer, layout: Layout) {
    Mock::given(method("GET"))
        .and(path("/results"))
        .respond_with(move |req: &Request| results_page(req, layout))
        .expect(10)
        .mount(server)
        .await;
}

fn form_source(server: &MockServer, extra: &str) -> String {
    format!(
        r#"{{"id": "form-dir", "base_url": "{}/search", "strategy": "html_form",
            "html": {{"page_param": "page"}}, {extra}
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0, "max_retries": 3}}}}"#,
        server.uri()
    )
}

#[tokio::test]
async fn test_html_form_follows_declared_total_past_missing_next_link() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(SEARCH_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    mount_results(&server, FULL_LAYOUT).await;

    let (items, stats) = harvest(&form_source(&server, "")).await;

    let leads = leads(&items);
    assert_eq!(leads.len(), DECLARED_TOTAL);
    assert_eq!(leads[0].last_name, "Lawson");
    assert_eq!(leads[0].city, "Springfield");
    assert!(leads[0].profile_url.ends_with("/member/0"));
    assert_eq!(stats.pages, 10);
    assert_eq!(stats.units_done, 1);
    assert_eq!(stats.strategy, Some(StrategyKind::HtmlForm));
    assert!(items.iter().all(|i| i.as_anomaly().is_none()));
}

#[tokio::test]
async fn test_declared_total_reached_when_server_pages_smaller_than_asked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(SEARCH_PAGE))
        .mount(&server)
        .await;
    mount_results(&server, FULL_LAYOUT).await;

    let (items, stats) = harvest(&form_source(&server, r#""page_size": 100,"#)).await;

    assert_eq!(leads(&items).len(), DECLARED_TOTAL);
    assert_eq!(stats.pages, 10);
    assert_eq!(stats.units_done, 1);
}

#[tokio::test]
async fn test_pages_without_total_or_next_link_run_until_short_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(SEARCH_PAGE))
        .mount(&server)
        .await;
    mount_results(&server, Layout { summary: false, next_before: 0 }).await;

    let (items, stats) = harvest(&form_source(&server, "")).await;

    let leads = leads(&items);
    assert_eq!(leads.len(), DECLARED_TOTAL);
    assert!(leads.last().unwrap().profile_url.ends_with("/member/461"));
    assert_eq!(stats.pages, 10);
}

#[tokio::test]
async fn test_rate_limited_search_page_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(SEARCH_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    mount_results(&server, FULL_LAYOUT).await;

    let (items, stats) = harvest(&form_source(&server, "")).await;

    assert_eq!(stats.leads, DECLARED_TOTAL as u64);
    assert_eq!(stats.units_done, 1);
    assert_eq!(stats.units_abandoned, 0);
    assert!(items.iter().all(|i| i.as_anomaly().is_none()));
}

// ── Structured API ──

#[tokio::test]
async fn test_api_empty_pages_abandon_unit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/members"))
        .respond_with(json(serde_json::json!({"results": [], "total": 500})))
        // probe plus three empty pages
        .expect(4)
        .mount(&server)
        .await;

    let source = format!(
        r#"{{"id": "api-dir", "base_url": "{}/", "strategy": "api",
            "api": {{"endpoints": ["/api/members"], "discover": false}},
            "limits": {{"empty_page_threshold": 3}},
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0}}}}"#,
        server.uri()
    );
    let (items, stats) = harvest(&source).await;

    let anomalies: Vec<_> = items.iter().filter_map(HarvestItem::as_anomaly).collect();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::EmptyThreshold);
    assert_eq!(stats.units_abandoned, 1);
    assert_eq!(stats.units_done, 0);
    assert_eq!(stats.leads, 0);
}

#[tokio::test]
async fn test_rate_limit_beyond_retry_budget_emits_anomaly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/members"))
        .respond_with(json(
            serde_json::json!({"results": [{"name": "Ada Byron"}], "total": 90}),
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/members"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let source = format!(
        r#"{{"id": "limited", "base_url": "{}/", "strategy": "api",
            "api": {{"endpoints": ["/api/members"], "discover": false}},
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0, "max_retries": 2}}}}"#,
        server.uri()
    );
    let (items, stats) = harvest(&source).await;

    let anomaly = items.iter().find_map(HarvestItem::as_anomaly).unwrap();
    assert_eq!(anomaly.kind, AnomalyKind::Blocked);
    assert_eq!(stats.units_abandoned, 1);
}

#[tokio::test]
async fn test_api_endpoint_discovered_in_same_origin_script() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<html><head><script src="/static/app.js"></script>
            <script src="https://cdn.example.net/lib.js"></script></head><body></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/static/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "const load = () => fetch('/api/v2/members').then(r => r.json());",
            "application/javascript",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/members"))
        .respond_with(json(serde_json::json!({
            "data": [
                {"first_name": "Ada", "last_name": "Byron", "city": "London"},
                {"first_name": "Alan", "last_name": "Turing", "city": "Wilmslow"}
            ],
            "total": 2
        })))
        .mount(&server)
        .await;

    let source = format!(
        r#"{{"id": "discovered", "base_url": "{}/", "strategy": "api",
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0}}}}"#,
        server.uri()
    );
    let (items, stats) = harvest(&source).await;

    assert_eq!(stats.strategy, Some(StrategyKind::Api));
    let names: Vec<String> = leads(&items).into_iter().map(|l| l.last_name).collect();
    assert_eq!(names, vec!["Byron", "Turing"]);
}

// ── Bulk files ──

#[tokio::test]
async fn test_short_bulk_file_falls_through_to_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export.csv"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("name,city,email\nAda Byron,London,\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/members"))
        .respond_with(json(serde_json::json!({
            "data": [{"name": "Grace Hopper", "city": "Arlington", "email": "grace@navy.example"}]
        })))
        .mount(&server)
        .await;

    let source = format!(
        r#"{{"id": "mixed", "base_url": "{}/", "strategy_order": ["bulk", "api"],
            "bulk": {{"urls": ["/export.csv"], "conventional_paths": []}},
            "api": {{"endpoints": ["/api/members"], "discover": false}},
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0}}}}"#,
        server.uri()
    );
    let (items, stats) = harvest(&source).await;

    assert_eq!(stats.strategy, Some(StrategyKind::Api));
    let leads = leads(&items);
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].last_name, "Hopper");
    assert_eq!(leads[0].email, "grace@navy.example");
}

#[tokio::test]
async fn test_bulk_harvest_is_repeatable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "Last Name;First Name;City;Phone\n\
             Tremblay;Marie;Montréal;514 555 0101\n\
             Gagnon;Luc;LAVAL;\n\
             Roy;Anne;Québec;418 555 0199\n",
        ))
        .mount(&server)
        .await;

    let source = format!(
        r#"{{"id": "bulk-dir", "base_url": "{}/", "strategy": "bulk",
            "bulk": {{"urls": ["/export.csv"], "conventional_paths": []}},
            "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0}}}}"#,
        server.uri()
    );
    let (first, stats) = harvest(&source).await;
    let (second, _) = harvest(&source).await;

    assert_eq!(stats.leads, 3);
    assert_eq!(stats.with_phone, 2);
    assert_eq!(leads(&first), leads(&second));
}

// ── Batch ──

#[tokio::test]
async fn test_batch_resume_skips_done_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/members"))
        .respond_with(json(serde_json::json!({"results": [{"name": "Ada Byron"}]})))
        // probe and one page, first run only
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ok.json"),
        format!(
            r#"{{"id": "ok", "base_url": "{}/", "strategy": "api",
                "api": {{"endpoints": ["/api/members"], "discover": false}},
                "pacing": {{"min_delay_ms": 0, "max_delay_ms": 0}}}}"#,
            server.uri()
        ),
    )
    .unwrap();
    let plan_path = dir.path().join("plan.json");
    std::fs::write(
        &plan_path,
        r#"{"jobs": [
            {"id": "ok", "source": "ok.json"},
            {"id": "broken", "source": "missing.json"}
        ]}"#,
    )
    .unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let config = BatchConfig {
        concurrency: 2,
        job_timeout: Duration::from_secs(30),
        resume: true,
        ledger_path: ledger_path.clone(),
    };

    let plan = BatchPlan::from_file(&plan_path).unwrap();
    let runner = InProcessRunner::new(JobResources::default(), None);
    let first = BatchOrchestrator::new(runner, config.clone())
        .run(plan.jobs.clone())
        .await
        .unwrap();
    assert_eq!(first.done, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.leads, 1);

    let ledger = ProgressLedger::load(&ledger_path).unwrap();
    assert_eq!(ledger.get("ok").unwrap().status, JobStatus::Done);
    let broken = ledger.get("broken").unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("missing.json"));

    let runner = InProcessRunner::new(JobResources::default(), None);
    let second = BatchOrchestrator::new(runner, config).run(plan.jobs).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(second.done, 0);
}
