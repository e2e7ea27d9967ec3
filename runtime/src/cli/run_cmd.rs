//! `harvest run <source>`: harvest one source and stream its items.

use crate::cli::output;
use crate::config::SourceConfig;
use crate::job::{HarvestJob, HarvestRequest};
use crate::progress::HarvestItem;
use crate::sink::LeadSink;
use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct RunArgs {
    pub source: PathBuf,
    pub cities: Vec<String>,
    pub practice_area: Option<String>,
    pub max_pages: Option<u32>,
    pub time_budget_secs: Option<u64>,
    /// JSONL file for leads; stdout when unset.
    pub output: Option<PathBuf>,
    pub no_browser: bool,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let source = SourceConfig::from_file(&args.source)?.with_env_overrides();
    let resources = super::resources_for(&source, !args.no_browser).await;
    output::status(format!(
        "Harvesting {} ({})",
        source.display_name(),
        source.base_url
    ));

    let request = HarvestRequest::new(source)
        .cities(args.cities)
        .practice_area(args.practice_area)
        .max_pages(args.max_pages)
        .time_budget(args.time_budget_secs.map(Duration::from_secs));
    let mut job = HarvestJob::with_http(request, resources.clone())?;

    let result = drain(&mut job, args.output.as_deref()).await;
    super::release(&resources).await;
    result?;

    let stats = job.stats();
    if output::is_json() && args.output.is_some() {
        output::print_json(&stats);
    } else {
        output::status(format!(
            "{} lead(s), {:.0}% with email, {:.0}% with phone, {} page(s), {} unit(s) abandoned",
            stats.leads,
            stats.email_coverage(),
            stats.phone_coverage(),
            stats.pages,
            stats.units_abandoned
        ));
        if let Some(d) = job.strategy() {
            output::status(format!("strategy: {} {} {}", d.kind, d.method, d.endpoint));
        }
    }
    Ok(())
}

async fn drain(job: &mut HarvestJob, path: Option<&Path>) -> Result<()> {
    let mut sink = match path {
        // --verbose keeps progress and anomaly lines in the file too
        Some(p) => Some(LeadSink::open(p)?.include_signals(output::is_verbose())),
        None => None,
    };
    let mut out = std::io::stdout();

    while let Some(item) = job.next_item().await {
        match &item {
            HarvestItem::Progress { progress } => {
                output::status(format!(
                    "[{}/{}] {}",
                    progress.current, progress.total, progress.unit
                ));
            }
            HarvestItem::Anomaly { anomaly } => {
                output::status(format!(
                    "warning: {} on {} page {}: {}",
                    anomaly.kind, anomaly.unit, anomaly.page, anomaly.reason
                ));
            }
            HarvestItem::Lead(_) => {}
        }
        match sink.as_mut() {
            Some(sink) => sink.write(&item)?,
            None => output::print_item(&mut out, &item)?,
        }
    }
    out.flush()?;
    if let Some(sink) = sink.as_mut() {
        sink.flush()?;
    }
    Ok(())
}
