//! Strategy selection with pinning.
//!
//! Strategies are tried in priority order until one yields records for the
//! first unit; that one is pinned and, under the default policy, is the
//! only candidate for every later unit. Probe results are cached for the
//! job so discovery runs at most once per strategy.

use crate::acquisition::fetch::FetchContext;
use crate::acquisition::http_client::HttpMethod;
use crate::config::SourceConfig;
use crate::driver::UnitKey;
use crate::error::FetchError;
use crate::strategy::{Endpoint, FetchOutcome, PageState, Strategy, StrategyKind};
use serde::{Deserialize, Serialize};

/// What happens when the pinned strategy fails on a later unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Report an anomaly for that unit; never go back to other strategies.
    #[default]
    Pin,
    /// Fall through to the remaining strategies for that unit.
    RetryPerUnit,
}

/// One strategy attempt as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDescriptor {
    pub kind: StrategyKind,
    pub endpoint: String,
    pub method: HttpMethod,
    pub succeeded: bool,
}

pub struct StrategySelector {
    strategies: Vec<Box<dyn Strategy>>,
    /// Per-strategy probe result; `None` until probed.
    probes: Vec<Option<Option<Endpoint>>>,
    pinned: Option<usize>,
    policy: SelectionPolicy,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Box<dyn Strategy>>, policy: SelectionPolicy) -> Self {
        let probes = vec![None; strategies.len()];
        Self {
            strategies,
            probes,
            pinned: None,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn kind(&self, index: usize) -> StrategyKind {
        self.strategies[index].kind()
    }

    /// Strategy indices to try for the next unit, in order.
    pub fn candidates(&self) -> Vec<usize> {
        match (self.pinned, self.policy) {
            (None, _) => (0..self.strategies.len()).collect(),
            (Some(p), SelectionPolicy::Pin) => vec![p],
            (Some(p), SelectionPolicy::RetryPerUnit) => std::iter::once(p)
                .chain((0..self.strategies.len()).filter(|i| *i != p))
                .collect(),
        }
    }

    /// Probe a strategy once per job. A blocked probe is not cached.
    pub async fn probe(
        &mut self,
        index: usize,
        ctx: &mut FetchContext,
    ) -> Result<Option<Endpoint>, FetchError> {
        if let Some(cached) = &self.probes[index] {
            return Ok(cached.clone());
        }
        let kind = self.strategies[index].kind();
        tracing::debug!("probing {kind} strategy");
        let found = self.strategies[index].probe(ctx).await?;
        match &found {
            Some(endpoint) => {
                tracing::debug!("{kind} endpoint: {} {}", endpoint.method, endpoint.url)
            }
            None => tracing::debug!("{kind} strategy not available"),
        }
        self.probes[index] = Some(found.clone());
        Ok(found)
    }

    pub async fn fetch_page(
        &mut self,
        index: usize,
        ctx: &mut FetchContext,
        endpoint: &Endpoint,
        unit: &UnitKey,
        page: &PageState,
    ) -> FetchOutcome {
        self.strategies[index]
            .fetch_page(ctx, endpoint, unit, page)
            .await
    }

    pub fn applies_practice_filter(&self, index: usize, source: &SourceConfig) -> bool {
        self.strategies[index].applies_practice_filter(source)
    }

    pub fn pin(&mut self, index: usize) {
        if self.pinned != Some(index) {
            tracing::info!("using {} strategy for the rest of the job", self.kind(index));
            self.pinned = Some(index);
        }
    }

    pub fn pinned(&self) -> Option<usize> {
        self.pinned
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// The pinned attempt, if any.
    pub fn descriptor(&self) -> Option<StrategyDescriptor> {
        let index = self.pinned?;
        let endpoint = self.probes[index].clone().flatten()?;
        Some(StrategyDescriptor {
            kind: endpoint.kind,
            endpoint: endpoint.url,
            method: endpoint.method,
            succeeded: true,
        })
    }
}
