//! `harvest batch <plan>`: run many jobs with a worker limit and a ledger.

use crate::batch::ledger::ProgressLedger;
use crate::batch::{
    BatchConfig, BatchOrchestrator, BatchPlan, BatchReport, CommandRunner, InProcessRunner,
    JobRunner,
};
use crate::cli::output;
use crate::events::{BatchEvent, EventBus};
use crate::geocode::{CachedGeocoder, NominatimGeocoder};
use crate::job::{percent, JobResources};
use crate::renderer;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const DEFAULT_GEOCODER: &str = "https://nominatim.openstreetmap.org/search";

pub struct BatchArgs {
    pub plan: PathBuf,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub resume: bool,
    pub ledger: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Launch a shared headless browser for in-process jobs.
    pub browser: bool,
    /// External command per job; in-process when unset.
    pub exec: Option<String>,
    pub exec_args: Vec<String>,
}

pub async fn run(args: BatchArgs) -> Result<()> {
    let plan = BatchPlan::from_file(&args.plan)?;
    let config = BatchConfig {
        concurrency: args.concurrency,
        job_timeout: Duration::from_secs(args.timeout_secs),
        resume: args.resume,
        ledger_path: args.ledger.unwrap_or_else(ProgressLedger::default_path),
    };
    output::status(format!(
        "Batch {}: {} job(s), ledger {}",
        args.plan.display(),
        plan.jobs.len(),
        config.ledger_path.display()
    ));

    let report = match args.exec {
        Some(program) => execute(CommandRunner::new(program, args.exec_args), config, plan).await?,
        None => {
            let resources = if args.browser {
                JobResources {
                    renderer: Some(renderer::launch_or_noop().await),
                    geocoder: Some(Arc::new(CachedGeocoder::new(NominatimGeocoder::new(
                        DEFAULT_GEOCODER,
                    )))),
                }
            } else {
                JobResources::default()
            };
            let runner = InProcessRunner::new(resources.clone(), args.output_dir);
            let report = execute(runner, config, plan).await;
            super::release(&resources).await;
            report?
        }
    };

    if output::is_json() {
        output::print_json(&report);
    } else {
        output::status(format!(
            "{} done, {} failed, {} timed out, {} skipped",
            report.done, report.failed, report.timed_out, report.skipped
        ));
        output::status(format!(
            "{} lead(s), {:.0}% with email, {:.0}% with phone",
            report.leads,
            report.email_coverage(),
            report.phone_coverage()
        ));
    }
    Ok(())
}

async fn execute<R: JobRunner>(
    runner: R,
    config: BatchConfig,
    plan: BatchPlan,
) -> Result<BatchReport> {
    let events = Arc::new(EventBus::default());
    let display = (!output::is_quiet() && !output::is_json()).then(|| show_progress(&events));
    let orchestrator = BatchOrchestrator::new(runner, config).with_events(Arc::clone(&events));
    let report = orchestrator.run(plan.jobs).await;

    // closing the bus ends the progress task
    drop(orchestrator);
    drop(events);
    if let Some(handle) = display {
        let _ = handle.await;
    }
    report
}

fn show_progress(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        let mut bar: Option<ProgressBar> = None;
        loop {
            match rx.recv().await {
                Ok(BatchEvent::BatchStarted { pending, .. }) => {
                    let pb = ProgressBar::new(pending as u64);
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("#>-"),
                    );
                    bar = Some(pb);
                }
                Ok(BatchEvent::JobFailed { job, error, .. }) => {
                    if let Some(pb) = &bar {
                        pb.println(format!("  {job}: {error}"));
                    }
                }
                Ok(BatchEvent::Totals {
                    finished,
                    leads,
                    with_email,
                    with_phone,
                    ..
                }) => {
                    if let Some(pb) = &bar {
                        pb.set_position(finished as u64);
                        pb.set_message(format!(
                            "{leads} leads, {:.0}% email, {:.0}% phone",
                            percent(with_email, leads),
                            percent(with_phone, leads)
                        ));
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
        if let Some(pb) = bar {
            pb.finish_and_clear();
        }
    })
}
