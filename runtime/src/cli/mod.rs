//! CLI subcommand implementations for the `harvest` binary.

pub mod batch_cmd;
pub mod output;
pub mod probe_cmd;
pub mod run_cmd;

use crate::config::SourceConfig;
use crate::geocode::{CachedGeocoder, NominatimGeocoder};
use crate::job::JobResources;
use crate::renderer;
use crate::strategy::StrategyKind;
use std::sync::Arc;

/// Browser and geocoder for a source, launched only when its strategy
/// order includes the browser and the caller allows it.
pub(crate) async fn resources_for(source: &SourceConfig, allow_browser: bool) -> JobResources {
    if !allow_browser || !source.strategy_order().contains(&StrategyKind::Browser) {
        return JobResources::default();
    }
    JobResources {
        renderer: Some(renderer::launch_or_noop().await),
        geocoder: Some(Arc::new(CachedGeocoder::new(NominatimGeocoder::new(
            source.browser.geocoder_url.clone(),
        )))),
    }
}

/// Release the browser, if one was started.
pub(crate) async fn release(resources: &JobResources) {
    if let Some(r) = &resources.renderer {
        if let Err(e) = r.shutdown().await {
            tracing::debug!("renderer shutdown: {e:#}");
        }
    }
}
