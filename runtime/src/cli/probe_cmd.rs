//! `harvest probe <source>`: report which strategies find an endpoint.

use crate::acquisition::http_client::HttpClient;
use crate::cli::output;
use crate::config::SourceConfig;
use crate::job::probe_strategies;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub async fn run(source: &Path, no_browser: bool) -> Result<()> {
    let source = SourceConfig::from_file(source)?.with_env_overrides();
    let resources = super::resources_for(&source, !no_browser).await;
    let client = HttpClient::new(source.limits.request_timeout_ms)?;
    let name = source.display_name().to_string();

    let reports = probe_strategies(source, Arc::new(client), resources.clone()).await;
    super::release(&resources).await;
    let reports = reports?;

    if output::is_json() {
        let rows: Vec<_> = reports
            .iter()
            .map(|r| match &r.result {
                Ok(Some(e)) => serde_json::json!({
                    "strategy": r.kind, "available": true,
                    "method": e.method, "endpoint": e.url,
                }),
                Ok(None) => serde_json::json!({"strategy": r.kind, "available": false}),
                Err(e) => serde_json::json!({
                    "strategy": r.kind, "available": false, "error": e.to_string(),
                }),
            })
            .collect();
        output::print_json(&serde_json::json!({ "source": name, "strategies": rows }));
        return Ok(());
    }

    println!("{name}");
    for r in &reports {
        match &r.result {
            Ok(Some(e)) => println!("  [OK] {:<10} {} {}", r.kind.to_string(), e.method, e.url),
            Ok(None) => println!("  [--] {:<10} not available", r.kind.to_string()),
            Err(e) => println!("  [!!] {:<10} {e}", r.kind.to_string()),
        }
    }
    Ok(())
}
