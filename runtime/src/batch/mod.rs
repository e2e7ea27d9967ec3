//! Batch orchestration: many independent harvest jobs under a worker limit.
//!
//! Jobs run concurrently up to the configured width, each under its own
//! timeout and with its own network state. A failed or timed-out job is
//! recorded and the batch moves on. Ledger writes happen from the single
//! loop that collects finished jobs, never from the jobs themselves.

pub mod ledger;

use crate::events::{BatchEvent, EventBus};
use crate::job::{percent, HarvestJob, HarvestRequest, JobResources};
use crate::progress::HarvestItem;
use crate::sink::LeadSink;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ledger::{JobStatus, LedgerEntry, ProgressLedger};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One job of a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobSpec {
    pub id: String,
    /// Source configuration file.
    pub source: PathBuf,
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub practice_area: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// A batch file: `{"jobs": [...]}` or a bare array of jobs.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub jobs: Vec<BatchJobSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanFile {
    Wrapped { jobs: Vec<BatchJobSpec> },
    Bare(Vec<BatchJobSpec>),
}

impl BatchPlan {
    /// Load a plan; relative source paths resolve against the plan's folder.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch file: {}", path.display()))?;
        let mut plan = Self::from_json(&content)
            .with_context(|| format!("invalid batch file: {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for job in &mut plan.jobs {
                if job.source.is_relative() {
                    job.source = dir.join(&job.source);
                }
            }
        }
        Ok(plan)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let jobs = match serde_json::from_str(json).context("failed to parse batch JSON")? {
            PlanFile::Wrapped { jobs } | PlanFile::Bare(jobs) => jobs,
        };
        let mut seen = HashSet::new();
        for job in &jobs {
            if job.id.trim().is_empty() {
                bail!("batch job with empty id");
            }
            if !seen.insert(job.id.as_str()) {
                bail!("duplicate batch job id: {}", job.id);
            }
        }
        Ok(Self { jobs })
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub job_timeout: Duration,
    /// Skip jobs the ledger marks done.
    pub resume: bool,
    pub ledger_path: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout: Duration::from_secs(30 * 60),
            resume: false,
            ledger_path: ProgressLedger::default_path(),
        }
    }
}

/// Counts reported by one finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub leads: u64,
    pub with_email: u64,
    pub with_phone: u64,
    pub anomalies: u64,
}

impl JobSummary {
    pub fn add(&mut self, item: &HarvestItem) {
        match item {
            HarvestItem::Lead(lead) => {
                self.leads += 1;
                if lead.has_email() {
                    self.with_email += 1;
                }
                if lead.has_phone() {
                    self.with_phone += 1;
                }
            }
            HarvestItem::Anomaly { .. } => self.anomalies += 1,
            HarvestItem::Progress { .. } => {}
        }
    }
}

/// Executes one batch job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &BatchJobSpec) -> Result<JobSummary>;
}

/// Runs jobs as tasks of this process, each with its own HTTP client.
pub struct InProcessRunner {
    resources: JobResources,
    /// Leads are written to `<dir>/<job id>.jsonl` when set.
    output_dir: Option<PathBuf>,
}

impl InProcessRunner {
    pub fn new(resources: JobResources, output_dir: Option<PathBuf>) -> Self {
        Self {
            resources,
            output_dir,
        }
    }
}

#[async_trait]
impl JobRunner for InProcessRunner {
    async fn run(&self, spec: &BatchJobSpec) -> Result<JobSummary> {
        let source = crate::config::SourceConfig::from_file(&spec.source)?.with_env_overrides();
        let request = HarvestRequest::new(source)
            .cities(spec.cities.clone())
            .practice_area(spec.practice_area.clone())
            .max_pages(spec.max_pages);
        let mut job = HarvestJob::with_http(request, self.resources.clone())?;
        let mut sink = match &self.output_dir {
            // a re-run replaces the partial output of an earlier attempt
            Some(dir) => Some(LeadSink::create(&dir.join(format!("{}.jsonl", spec.id)))?),
            None => None,
        };

        let mut summary = JobSummary::default();
        while let Some(item) = job.next_item().await {
            summary.add(&item);
            if let Some(sink) = sink.as_mut() {
                sink.write(&item)?;
            }
        }
        if let Some(sink) = sink.as_mut() {
            sink.flush()?;
        }
        Ok(summary)
    }
}

/// Runs each job as a child process that prints output items on stdout,
/// either one JSON object per line or a single JSON array.
///
/// Arguments may contain `{id}`, `{source}` and `{cities}` placeholders.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand(&self, job: &BatchJobSpec) -> Vec<String> {
        let source = job.source.display().to_string();
        let cities = job.cities.join(",");
        self.args
            .iter()
            .map(|a| {
                a.replace("{id}", &job.id)
                    .replace("{source}", &source)
                    .replace("{cities}", &cities)
            })
            .collect()
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job: &BatchJobSpec) -> Result<JobSummary> {
        let output = tokio::process::Command::new(&self.program)
            .args(self.expand(job))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.lines().last().unwrap_or_default()
            );
        }
        parse_command_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Tally items printed by an external job.
pub fn parse_command_output(stdout: &str) -> Result<JobSummary> {
    let trimmed = stdout.trim();
    let items: Vec<HarvestItem> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("job output is not a JSON array of items")?
    } else {
        trimmed
            .lines()
            .filter(|l| l.trim_start().starts_with('{'))
            .map(|l| serde_json::from_str(l).with_context(|| format!("bad output line: {l}")))
            .collect::<Result<_>>()?
    };
    let mut summary = JobSummary::default();
    for item in &items {
        summary.add(item);
    }
    Ok(summary)
}

/// Final tally of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub leads: u64,
    pub with_email: u64,
    pub with_phone: u64,
}

impl BatchReport {
    pub fn email_coverage(&self) -> f64 {
        percent(self.with_email, self.leads)
    }

    pub fn phone_coverage(&self) -> f64 {
        percent(self.with_phone, self.leads)
    }

    fn finished(&self) -> usize {
        self.done + self.failed + self.timed_out
    }
}

pub struct BatchOrchestrator<R> {
    runner: R,
    config: BatchConfig,
    events: Arc<EventBus>,
}

impl<R: JobRunner> BatchOrchestrator<R> {
    pub fn new(runner: R, config: BatchConfig) -> Self {
        Self {
            runner,
            config,
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn run(&self, jobs: Vec<BatchJobSpec>) -> Result<BatchReport> {
        let mut ledger = ProgressLedger::load(&self.config.ledger_path)?;
        tracing::debug!(
            "ledger {}: {} recorded job(s)",
            self.config.ledger_path.display(),
            ledger.len()
        );
        let mut report = BatchReport {
            total: jobs.len(),
            ..BatchReport::default()
        };

        let mut pending = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.config.resume && ledger.is_done(&job.id) {
                tracing::info!("skipping {}: already done", job.id);
                self.events.emit(BatchEvent::JobSkipped { job: job.id });
                report.skipped += 1;
            } else {
                pending.push(job);
            }
        }

        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            "batch: {} job(s) to run, {} skipped, concurrency {concurrency}",
            pending.len(),
            report.skipped
        );
        self.events.emit(BatchEvent::BatchStarted {
            total: report.total,
            pending: pending.len(),
            concurrency,
        });

        let runner = &self.runner;
        let events = &self.events;
        let timeout = self.config.job_timeout;
        let mut finished = stream::iter(pending)
            .map(|job| async move {
                events.emit(BatchEvent::JobStarted {
                    job: job.id.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                });
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, runner.run(&job)).await;
                (job, started.elapsed(), result)
            })
            .buffer_unordered(concurrency);

        while let Some((job, elapsed, result)) = finished.next().await {
            let elapsed_ms = elapsed.as_millis() as u64;
            let entry = match result {
                Ok(Ok(summary)) => {
                    report.done += 1;
                    report.leads += summary.leads;
                    report.with_email += summary.with_email;
                    report.with_phone += summary.with_phone;
                    tracing::info!(
                        "{} done: {} lead(s) in {:.1}s",
                        job.id,
                        summary.leads,
                        elapsed.as_secs_f64()
                    );
                    self.events.emit(BatchEvent::JobCompleted {
                        job: job.id.clone(),
                        leads: summary.leads,
                        with_email: summary.with_email,
                        with_phone: summary.with_phone,
                        anomalies: summary.anomalies,
                        elapsed_ms,
                    });
                    entry(JobStatus::Done, &summary, elapsed_ms, None)
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    let error = format!("{e:#}");
                    tracing::warn!("{} failed: {error}", job.id);
                    self.events.emit(BatchEvent::JobFailed {
                        job: job.id.clone(),
                        error: error.clone(),
                        timed_out: false,
                        elapsed_ms,
                    });
                    entry(JobStatus::Failed, &JobSummary::default(), elapsed_ms, Some(error))
                }
                Err(_) => {
                    report.timed_out += 1;
                    let error = format!("timed out after {}s", timeout.as_secs());
                    tracing::warn!("{} {error}", job.id);
                    self.events.emit(BatchEvent::JobFailed {
                        job: job.id.clone(),
                        error: error.clone(),
                        timed_out: true,
                        elapsed_ms,
                    });
                    entry(JobStatus::Timeout, &JobSummary::default(), elapsed_ms, Some(error))
                }
            };
            if let Err(e) = ledger.record(&job.id, entry) {
                tracing::warn!("ledger update for {} failed: {e:#}", job.id);
            }

            tracing::info!(
                "totals: {}/{} job(s), {} lead(s), {:.0}% email, {:.0}% phone",
                report.finished(),
                report.total - report.skipped,
                report.leads,
                report.email_coverage(),
                report.phone_coverage()
            );
            self.events.emit(BatchEvent::Totals {
                finished: report.finished(),
                total: report.total - report.skipped,
                leads: report.leads,
                with_email: report.with_email,
                with_phone: report.with_phone,
            });
        }

        Ok(report)
    }
}

fn entry(
    status: JobStatus,
    summary: &JobSummary,
    elapsed_ms: u64,
    error: Option<String>,
) -> LedgerEntry {
    LedgerEntry {
        status,
        leads: summary.leads,
        with_email: summary.with_email,
        with_phone: summary.with_phone,
        anomalies: summary.anomalies,
        elapsed_ms,
        timestamp: chrono::Utc::now().to_rfc3339(),
        error,
    }
}
