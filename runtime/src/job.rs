//! A harvest job: one source, one request, one lazily pulled output sequence.
//!
//! The job owns its pacing controller, cookie jar and strategy state; none
//! of it is shared with other jobs. Items are produced on demand by
//! [`HarvestJob::next_item`], and the only place the job waits is the
//! pacing delay in front of each request.

use crate::acquisition::fetch::{FetchContext, SearchFilters};
use crate::acquisition::http_client::{HttpClient, Transport};
use crate::config::SourceConfig;
use crate::driver::{enumeration_units, DriverLimits, EnumerationUnit, IterationDriver};
use crate::error::FetchError;
use crate::geocode::Geocoder;
use crate::lead::CanonicalLead;
use crate::normalize::{resolve_practice_area, RecordNormalizer};
use crate::pacing::PacingController;
use crate::progress::HarvestItem;
use crate::renderer::Renderer;
use crate::selector::{StrategyDescriptor, StrategySelector};
use crate::strategy::{build_strategies, Endpoint, StrategyKind};
use anyhow::{bail, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to harvest from one source.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub source: SourceConfig,
    /// Target cities. Empty means the source's defaults.
    pub cities: Vec<String>,
    pub practice_area: Option<String>,
    /// Page cap per unit, overriding the source's.
    pub max_pages: Option<u32>,
    pub time_budget: Option<Duration>,
}

impl HarvestRequest {
    pub fn new(source: SourceConfig) -> Self {
        Self {
            source,
            cities: Vec::new(),
            practice_area: None,
            max_pages: None,
            time_budget: None,
        }
    }

    pub fn cities(mut self, cities: Vec<String>) -> Self {
        self.cities = cities;
        self
    }

    pub fn practice_area(mut self, area: Option<String>) -> Self {
        self.practice_area = area;
        self
    }

    pub fn max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }
}

/// Shared, optional collaborators of the browser strategy.
#[derive(Clone, Default)]
pub struct JobResources {
    pub renderer: Option<Arc<dyn Renderer>>,
    pub geocoder: Option<Arc<dyn Geocoder>>,
}

/// Running counts for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub leads: u64,
    pub with_email: u64,
    pub with_phone: u64,
    /// Records that yielded no identifiable lead.
    pub dropped: u64,
    /// Leads outside the requested cities or prefix.
    pub filtered_out: u64,
    pub pages: u64,
    pub units_done: u64,
    pub units_abandoned: u64,
    pub requests: u64,
    pub strategy: Option<StrategyKind>,
}

impl JobStats {
    pub fn record(&mut self, lead: &CanonicalLead) {
        self.leads += 1;
        if lead.has_email() {
            self.with_email += 1;
        }
        if lead.has_phone() {
            self.with_phone += 1;
        }
    }

    /// Share of leads carrying an email, in percent.
    pub fn email_coverage(&self) -> f64 {
        percent(self.with_email, self.leads)
    }

    pub fn phone_coverage(&self) -> f64 {
        percent(self.with_phone, self.leads)
    }
}

pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub struct HarvestJob {
    source_id: String,
    ctx: FetchContext,
    driver: IterationDriver,
    units: VecDeque<EnumerationUnit>,
    current: Option<EnumerationUnit>,
    buffer: VecDeque<HarvestItem>,
    finished: bool,
}

impl HarvestJob {
    /// Build a job over an explicit transport. The time budget starts now.
    pub fn new(
        request: HarvestRequest,
        transport: Arc<dyn Transport>,
        resources: JobResources,
    ) -> Result<Self> {
        let HarvestRequest {
            source,
            cities,
            practice_area,
            max_pages,
            time_budget,
        } = request;
        source.validate()?;

        let practice = practice_area.as_deref().and_then(|area| {
            let resolved = resolve_practice_area(area, &source.practice_areas);
            if resolved.is_none() {
                tracing::warn!(
                    "practice area {area:?} is unknown to {}, harvesting unfiltered",
                    source.id
                );
            }
            resolved
        });

        let normalizer = RecordNormalizer::new(&source);
        let units: VecDeque<EnumerationUnit> = enumeration_units(&source, &cities).into();
        let mut limits = DriverLimits::for_source(&source, max_pages);
        limits.deadline = time_budget.map(|budget| Instant::now() + budget);

        let strategies = build_strategies(
            &source.strategy_order(),
            resources.renderer,
            resources.geocoder,
        );
        let selector = StrategySelector::new(strategies, source.selection_policy);
        if selector.is_empty() {
            bail!(
                "source {}: no usable strategy (the browser strategy needs a renderer)",
                source.id
            );
        }
        tracing::info!(
            "job {}: {} unit(s), {} strategies {:?}, {:?} policy",
            source.id,
            units.len(),
            selector.len(),
            source.strategy_order(),
            selector.policy()
        );
        let driver = IterationDriver::new(selector, normalizer, cities, limits);

        let source_id = source.id.clone();
        let pacing = PacingController::new(source.pacing.clone());
        let ctx = FetchContext::new(
            Arc::new(source),
            transport,
            pacing,
            SearchFilters { practice },
        );
        Ok(Self {
            source_id,
            ctx,
            driver,
            units,
            current: None,
            buffer: VecDeque::new(),
            finished: false,
        })
    }

    /// Build a job with its own HTTP client and cookie jar.
    pub fn with_http(request: HarvestRequest, resources: JobResources) -> Result<Self> {
        let client = HttpClient::new(request.source.limits.request_timeout_ms)?;
        Self::new(request, Arc::new(client), resources)
    }

    /// Pull the next item; `None` once every unit is terminal.
    pub async fn next_item(&mut self) -> Option<HarvestItem> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            self.advance().await;
        }
    }

    async fn advance(&mut self) {
        let unit_open = self
            .current
            .as_ref()
            .is_some_and(|unit| !unit.state.is_terminal());
        if !unit_open {
            if self.current.is_some() && self.driver.out_of_time() {
                tracing::info!(
                    "job {}: time budget spent, {} unit(s) not started",
                    self.source_id,
                    self.units.len()
                );
                self.finish();
                return;
            }
            match self.units.pop_front() {
                Some(next) => self.current = Some(next),
                None => {
                    self.finish();
                    return;
                }
            }
        }
        if let Some(unit) = self.current.as_mut() {
            self.driver.step(&mut self.ctx, unit, &mut self.buffer).await;
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let stats = self.stats();
        tracing::info!(
            "job {} finished: {} lead(s), {:.0}% with email, {:.0}% with phone, {} unit(s) abandoned",
            self.source_id,
            stats.leads,
            stats.email_coverage(),
            stats.phone_coverage(),
            stats.units_abandoned
        );
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = self.driver.stats().clone();
        stats.requests = self.ctx.requests_sent();
        stats.strategy = self.driver.selector().descriptor().map(|d| d.kind);
        stats
    }

    /// The strategy pinned for this job, once one produced records.
    pub fn strategy(&self) -> Option<StrategyDescriptor> {
        self.driver.selector().descriptor()
    }

    /// Consume the job as a lazy stream of items.
    pub fn into_stream(self) -> impl Stream<Item = HarvestItem> + Send {
        futures::stream::unfold(self, |mut job| async move {
            job.next_item().await.map(|item| (item, job))
        })
    }

    /// Drain the job.
    pub async fn collect(mut self) -> (Vec<HarvestItem>, JobStats) {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await {
            items.push(item);
        }
        (items, self.stats())
    }
}

/// Result of probing one strategy against a source.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub kind: StrategyKind,
    pub result: Result<Option<Endpoint>, FetchError>,
}

/// Probe every configured strategy once, without harvesting.
pub async fn probe_strategies(
    source: SourceConfig,
    transport: Arc<dyn Transport>,
    resources: JobResources,
) -> Result<Vec<ProbeReport>> {
    source.validate()?;
    let strategies = build_strategies(
        &source.strategy_order(),
        resources.renderer,
        resources.geocoder,
    );
    let pacing = PacingController::new(source.pacing.clone());
    let mut ctx = FetchContext::new(
        Arc::new(source),
        transport,
        pacing,
        SearchFilters::default(),
    );
    let mut reports = Vec::with_capacity(strategies.len());
    for mut strategy in strategies {
        let result = strategy.probe(&mut ctx).await;
        reports.push(ProbeReport {
            kind: strategy.kind(),
            result,
        });
    }
    Ok(reports)
}
