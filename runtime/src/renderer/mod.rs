//! Headless browser seam used by the browser harvesting strategy.
//!
//! Strategies only see [`Renderer`] and [`Tab`]; the Chromium
//! implementation lives in [`chromium`] and tests drive a scripted fake.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A browser engine that hands out isolated tabs.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open_tab(&self) -> Result<Box<dyn Tab>>;
    async fn shutdown(&self) -> Result<()>;
    fn open_tabs(&self) -> usize;
}

/// One browser tab.
#[async_trait]
pub trait Tab: Send + Sync {
    /// Load `url`; returns the URL the tab ended up on.
    async fn goto(&mut self, url: &str, timeout_ms: u64) -> Result<String>;
    /// Evaluate a script and return its JSON-converted value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
    async fn content(&self) -> Result<String>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Stand-in when no browser is installed; the browser strategy then fails
/// its probe and the selector moves on.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn open_tab(&self) -> Result<Box<dyn Tab>> {
        Err(anyhow::anyhow!("browser not available"))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn open_tabs(&self) -> usize {
        0
    }
}

/// Launch Chromium if one can be found, else fall back to [`NoopRenderer`].
pub async fn launch_or_noop() -> Arc<dyn Renderer> {
    let options = chromium::LaunchOptions::from_env();
    match chromium::ChromiumRenderer::launch(options).await {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::warn!("browser strategy disabled: {e:#}");
            Arc::new(NoopRenderer)
        }
    }
}
