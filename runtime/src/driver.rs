//! Per-unit iteration: pagination, termination and anomaly reporting.
//!
//! Each [`EnumerationUnit`] moves `Start → Fetching → Done | Abandoned`.
//! [`IterationDriver::step`] advances a unit by at most one page fetch and
//! appends whatever that produced (progress, leads, anomalies) to the
//! caller's buffer, which keeps the job a pull-driven sequence.

use crate::acquisition::fetch::FetchContext;
use crate::config::{EnumerationMode, SourceConfig};
use crate::error::FetchError;
use crate::job::JobStats;
use crate::lead::CanonicalLead;
use crate::normalize::text::fold;
use crate::normalize::{CityFilter, RecordNormalizer};
use crate::progress::{AnomalyKind, HarvestItem};
use crate::selector::StrategySelector;
use crate::strategy::{Endpoint, FetchOutcome, PageCursor, PageState, RawBatch};
use std::collections::VecDeque;
use std::time::Instant;

/// Page ceiling applied when neither the source nor the request sets one.
pub const HARD_PAGE_LIMIT: u32 = 5000;

/// One partition of a source's search space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitKey {
    All,
    City(String),
    Prefix(String),
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::City(city) => f.write_str(city),
            Self::Prefix(prefix) => f.write_str(prefix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Start,
    Fetching,
    Done,
    Abandoned,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }
}

/// Strategy bookkeeping for the unit currently being fetched.
#[derive(Debug, Clone, Default)]
struct Attempts {
    current: Option<(usize, Endpoint)>,
    remaining: VecDeque<usize>,
    /// First strategy that answered with an empty first page.
    fallback: Option<(usize, Endpoint)>,
    last_error: Option<FetchError>,
    /// Consecutive blocked probes of the candidate being tried.
    probe_blocks: u32,
}

/// Iteration state of one unit.
#[derive(Debug, Clone)]
pub struct EnumerationUnit {
    pub key: UnitKey,
    /// 1-based position among the job's units.
    pub ordinal: usize,
    pub total: usize,
    pub page: PageState,
    pub pages_fetched: u32,
    pub records_fetched: u64,
    /// Largest total the server declared for this unit.
    pub declared_total: Option<u64>,
    /// Largest page the server actually returned for this unit.
    pub observed_page_size: Option<u32>,
    pub empty_streak: u32,
    pub state: UnitState,
    attempts: Attempts,
}

impl EnumerationUnit {
    pub fn new(key: UnitKey, ordinal: usize, total: usize) -> Self {
        Self {
            key,
            ordinal,
            total,
            page: PageState::first(),
            pages_fetched: 0,
            records_fetched: 0,
            declared_total: None,
            observed_page_size: None,
            empty_streak: 0,
            state: UnitState::Start,
            attempts: Attempts::default(),
        }
    }

    fn restart_with_next_strategy(&mut self) {
        self.attempts.current = None;
        self.page = PageState::first();
        self.pages_fetched = 0;
        self.declared_total = None;
        self.observed_page_size = None;
        self.empty_streak = 0;
    }
}

/// Partition a source into units. Cities mode uses the requested cities,
/// then the source's defaults, then a single `all` unit.
pub fn enumeration_units(source: &SourceConfig, cities: &[String]) -> Vec<EnumerationUnit> {
    let keys: Vec<UnitKey> = match source.enumeration {
        EnumerationMode::Cities => {
            let list = if cities.is_empty() {
                &source.default_cities
            } else {
                cities
            };
            if list.is_empty() {
                vec![UnitKey::All]
            } else {
                list.iter().map(|c| UnitKey::City(c.clone())).collect()
            }
        }
        EnumerationMode::Prefixes => source
            .prefixes_or_alphabet()
            .into_iter()
            .map(UnitKey::Prefix)
            .collect(),
        EnumerationMode::All => vec![UnitKey::All],
    };
    let total = keys.len();
    keys.into_iter()
        .enumerate()
        .map(|(i, key)| EnumerationUnit::new(key, i + 1, total))
        .collect()
}

/// Termination knobs for one job.
#[derive(Debug, Clone)]
pub struct DriverLimits {
    pub page_size: u32,
    pub page_cap: u32,
    pub empty_threshold: u32,
    pub deadline: Option<Instant>,
}

impl DriverLimits {
    /// Limits from the source, with an optional per-request page cap.
    pub fn for_source(source: &SourceConfig, max_pages: Option<u32>) -> Self {
        Self {
            page_size: source.page_size,
            page_cap: max_pages
                .or(source.limits.max_pages)
                .unwrap_or(HARD_PAGE_LIMIT)
                .max(1),
            empty_threshold: source.limits.empty_page_threshold.max(1),
            deadline: None,
        }
    }
}

pub struct IterationDriver {
    selector: StrategySelector,
    normalizer: RecordNormalizer,
    /// Requested cities, applied to units that are not cities themselves.
    cities: Vec<String>,
    limits: DriverLimits,
    stats: JobStats,
}

impl IterationDriver {
    pub fn new(
        selector: StrategySelector,
        normalizer: RecordNormalizer,
        cities: Vec<String>,
        limits: DriverLimits,
    ) -> Self {
        Self {
            selector,
            normalizer,
            cities,
            limits,
            stats: JobStats::default(),
        }
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    pub fn out_of_time(&self) -> bool {
        self.limits.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Advance `unit` by one transition.
    pub async fn step(
        &mut self,
        ctx: &mut FetchContext,
        unit: &mut EnumerationUnit,
        out: &mut VecDeque<HarvestItem>,
    ) {
        match unit.state {
            UnitState::Start => {
                tracing::info!("unit {}/{}: {}", unit.ordinal, unit.total, unit.key);
                out.push_back(HarvestItem::progress(
                    unit.ordinal,
                    unit.total,
                    unit.key.to_string(),
                ));
                unit.attempts.remaining = self.selector.candidates().into();
                unit.state = UnitState::Fetching;
            }
            UnitState::Fetching => self.fetch_next(ctx, unit, out).await,
            UnitState::Done | UnitState::Abandoned => {}
        }
    }

    /// Drive `unit` to a terminal state.
    pub async fn run_unit(
        &mut self,
        ctx: &mut FetchContext,
        unit: &mut EnumerationUnit,
        out: &mut VecDeque<HarvestItem>,
    ) {
        while !unit.state.is_terminal() {
            self.step(ctx, unit, out).await;
        }
    }

    async fn fetch_next(
        &mut self,
        ctx: &mut FetchContext,
        unit: &mut EnumerationUnit,
        out: &mut VecDeque<HarvestItem>,
    ) {
        if self.out_of_time() {
            self.abandon(unit, out, AnomalyKind::TimeBudget, "time budget exhausted");
            return;
        }
        if unit.pages_fetched >= self.limits.page_cap {
            tracing::info!("unit {} reached the {}-page cap", unit.key, self.limits.page_cap);
            self.finish(unit);
            return;
        }

        let (index, endpoint) = match unit.attempts.current.clone() {
            Some(attempt) => attempt,
            None => match self.next_attempt(ctx, unit).await {
                Some(attempt) => attempt,
                None => {
                    self.no_strategy(unit, out);
                    return;
                }
            },
        };

        let outcome = self
            .selector
            .fetch_page(index, ctx, &endpoint, &unit.key, &unit.page)
            .await;
        match outcome {
            FetchOutcome::Batch(batch) if !batch.records.is_empty() => {
                self.on_records(ctx, index, unit, batch, out)
            }
            FetchOutcome::Batch(batch) => self.on_empty(
                index,
                unit,
                batch.total_hint,
                batch.has_next,
                batch.next_cursor,
                out,
            ),
            FetchOutcome::Exhausted => self.on_empty(index, unit, None, Some(false), None, out),
            FetchOutcome::Blocked {
                status,
                reason,
                captcha,
            } => self.on_blocked(ctx, unit, status, reason, captcha, out),
            FetchOutcome::Failed(reason) => self.on_failed(index, unit, reason, out),
        }
    }

    /// Probe remaining candidates until one offers an endpoint.
    async fn next_attempt(
        &mut self,
        ctx: &mut FetchContext,
        unit: &mut EnumerationUnit,
    ) -> Option<(usize, Endpoint)> {
        while let Some(index) = unit.attempts.remaining.pop_front() {
            match self.selector.probe(index, ctx).await {
                Ok(Some(endpoint)) => {
                    unit.attempts.probe_blocks = 0;
                    unit.attempts.current = Some((index, endpoint.clone()));
                    return Some((index, endpoint));
                }
                Ok(None) => unit.attempts.probe_blocks = 0,
                Err(err) => {
                    let kind = self.selector.kind(index);
                    if let FetchError::Blocked { status, .. } = &err {
                        // A probe may issue several requests, so its own
                        // count decides; successes in between do not reset it.
                        unit.attempts.probe_blocks += 1;
                        ctx.pacing_mut().record_block(*status);
                        if unit.attempts.probe_blocks <= ctx.pacing().config().max_retries {
                            tracing::debug!(
                                "{kind} probe blocked ({}), retrying",
                                unit.attempts.probe_blocks
                            );
                            unit.attempts.remaining.push_front(index);
                            continue;
                        }
                        ctx.pacing_mut().reset_retry_budget();
                    }
                    unit.attempts.probe_blocks = 0;
                    tracing::warn!("{kind} probe failed: {err}");
                    unit.attempts.last_error = Some(err);
                }
            }
        }
        None
    }

    fn on_records(
        &mut self,
        ctx: &mut FetchContext,
        index: usize,
        unit: &mut EnumerationUnit,
        batch: RawBatch,
        out: &mut VecDeque<HarvestItem>,
    ) {
        if self.selector.pinned().is_none() {
            self.selector.pin(index);
        }
        ctx.pacing_mut().record_success();
        unit.empty_streak = 0;
        unit.pages_fetched += 1;
        unit.records_fetched += batch.records.len() as u64;
        let count = batch.records.len();
        let page_len = u32::try_from(count).unwrap_or(u32::MAX);
        unit.observed_page_size = unit.observed_page_size.max(Some(page_len));
        self.stats.pages += 1;
        self.note_total(unit, batch.total_hint);

        let filter = self.city_filter(&unit.key);
        let practice = ctx
            .filters()
            .practice_label()
            .filter(|_| self.selector.applies_practice_filter(index, ctx.source()))
            .map(str::to_string);
        for record in &batch.records {
            let Some(mut lead) = self.normalizer.normalize(record) else {
                self.stats.dropped += 1;
                continue;
            };
            if let Some(area) = &practice {
                lead.add_practice_area(area);
            }
            if !self.in_scope(&lead, &unit.key, &filter) {
                self.stats.filtered_out += 1;
                continue;
            }
            self.stats.record(&lead);
            out.push_back(HarvestItem::Lead(lead));
        }

        if self.has_more(unit, count, batch.has_next) {
            // offsets follow what the server returned, which may be less than asked
            unit.page = unit.page.advance(page_len, batch.next_cursor);
        } else {
            self.finish(unit);
        }
    }

    fn on_empty(
        &mut self,
        index: usize,
        unit: &mut EnumerationUnit,
        total_hint: Option<u64>,
        has_next: Option<bool>,
        cursor: Option<PageCursor>,
        out: &mut VecDeque<HarvestItem>,
    ) {
        let first_page = unit.page.page == 0 && unit.records_fetched == 0;
        if first_page && self.selector.pinned().is_none() {
            if !unit.attempts.remaining.is_empty() {
                tracing::debug!(
                    "{} returned nothing for {}, trying the next strategy",
                    self.selector.kind(index),
                    unit.key
                );
                if unit.attempts.fallback.is_none() {
                    unit.attempts.fallback = unit.attempts.current.clone();
                }
                unit.restart_with_next_strategy();
                return;
            }
            if let Some((fallback, _)) = unit.attempts.fallback.take() {
                // nothing better turned up: keep the first strategy that answered
                self.selector.pin(fallback);
                self.finish(unit);
                return;
            }
            self.selector.pin(index);
        }

        unit.pages_fetched += 1;
        self.stats.pages += 1;
        self.note_total(unit, total_hint);
        let claims_more = unit
            .declared_total
            .is_some_and(|total| unit.records_fetched < total)
            || has_next == Some(true);
        if !claims_more {
            self.finish(unit);
            return;
        }

        unit.empty_streak += 1;
        if unit.empty_streak >= self.limits.empty_threshold {
            let reason = format!(
                "{} consecutive empty pages while the server reported more results",
                unit.empty_streak
            );
            self.abandon(unit, out, AnomalyKind::EmptyThreshold, reason);
        } else {
            let step = unit.observed_page_size.unwrap_or(self.limits.page_size);
            unit.page = unit.page.advance(step, cursor);
        }
    }

    fn on_blocked(
        &mut self,
        ctx: &mut FetchContext,
        unit: &mut EnumerationUnit,
        status: Option<u16>,
        reason: String,
        captcha: bool,
        out: &mut VecDeque<HarvestItem>,
    ) {
        if ctx.pacing_mut().record_block(status) {
            tracing::debug!("retrying {} page {} after block", unit.key, unit.page.page + 1);
            return;
        }
        ctx.pacing_mut().reset_retry_budget();
        let kind = if captcha {
            AnomalyKind::Captcha
        } else {
            AnomalyKind::Blocked
        };
        self.abandon(unit, out, kind, reason);
    }

    fn on_failed(
        &mut self,
        index: usize,
        unit: &mut EnumerationUnit,
        reason: String,
        out: &mut VecDeque<HarvestItem>,
    ) {
        tracing::warn!(
            "{} strategy failed on {}: {reason}",
            self.selector.kind(index),
            unit.key
        );
        if unit.records_fetched == 0 && !unit.attempts.remaining.is_empty() {
            unit.restart_with_next_strategy();
            return;
        }
        self.abandon(unit, out, AnomalyKind::Structural, reason);
    }

    fn no_strategy(&mut self, unit: &mut EnumerationUnit, out: &mut VecDeque<HarvestItem>) {
        if let Some((fallback, _)) = unit.attempts.fallback.take() {
            if self.selector.pinned().is_none() {
                self.selector.pin(fallback);
            }
            self.finish(unit);
            return;
        }
        match unit.attempts.last_error.take() {
            Some(FetchError::Blocked {
                reason,
                captcha: true,
                ..
            }) => self.abandon(unit, out, AnomalyKind::Captcha, reason),
            Some(FetchError::Blocked { reason, .. }) => {
                self.abandon(unit, out, AnomalyKind::Blocked, reason)
            }
            _ => self.abandon(
                unit,
                out,
                AnomalyKind::NoStrategy,
                "no strategy found a usable endpoint",
            ),
        }
    }

    /// Completion test. A declared total wins over page-shape heuristics
    /// and is compared with the records received, not with a page count.
    fn has_more(&self, unit: &EnumerationUnit, count: usize, has_next: Option<bool>) -> bool {
        if let Some(total) = unit.declared_total {
            return unit.records_fetched < total;
        }
        if let Some(next) = has_next {
            return next;
        }
        count >= self.limits.page_size as usize
    }

    fn note_total(&self, unit: &mut EnumerationUnit, hint: Option<u64>) {
        if let Some(total) = hint {
            if unit.declared_total.is_none() {
                tracing::debug!("{} declares {total} results", unit.key);
            }
            unit.declared_total = Some(unit.declared_total.map_or(total, |d| d.max(total)));
        }
    }

    fn city_filter(&self, key: &UnitKey) -> CityFilter {
        match key {
            UnitKey::City(city) => CityFilter::new(&[city.as_str()]),
            _ => CityFilter::new(&self.cities),
        }
    }

    /// Leads without a city are kept; sources often omit it.
    fn in_scope(&self, lead: &CanonicalLead, key: &UnitKey, filter: &CityFilter) -> bool {
        if !lead.city.is_empty() && !filter.matches(&lead.city) {
            return false;
        }
        match key {
            UnitKey::Prefix(prefix) => fold(&lead.last_name).starts_with(&fold(prefix)),
            _ => true,
        }
    }

    fn finish(&mut self, unit: &mut EnumerationUnit) {
        unit.state = UnitState::Done;
        self.stats.units_done += 1;
        tracing::info!(
            "unit {} done: {} record(s) over {} page(s)",
            unit.key,
            unit.records_fetched,
            unit.pages_fetched
        );
    }

    fn abandon(
        &mut self,
        unit: &mut EnumerationUnit,
        out: &mut VecDeque<HarvestItem>,
        kind: AnomalyKind,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        unit.state = UnitState::Abandoned;
        self.stats.units_abandoned += 1;
        tracing::warn!(
            "unit {} abandoned at page {} ({kind}): {reason}",
            unit.key,
            unit.page.page + 1
        );
        out.push_back(HarvestItem::anomaly(
            kind,
            unit.key.to_string(),
            unit.page.page + 1,
            reason,
        ));
    }
}
