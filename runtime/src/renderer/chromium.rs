//! Chromium renderer over chromiumoxide.

use super::{Renderer, Tab};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Locate a Chromium binary: `HARVEST_CHROMIUM_PATH`, then
/// `~/.lead-harvest/chromium/`, then the usual names on `PATH`.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("HARVEST_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let local = dirs::home_dir().map(|home| home.join(".lead-harvest/chromium"));
    if let Some(root) = local {
        let found = ["chrome-linux64/chrome", "chrome-mac-arm64/chrome", "chrome"]
            .iter()
            .map(|rel| root.join(rel))
            .find(|c| c.exists());
        if found.is_some() {
            return found;
        }
    }

    ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"]
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Browser launch settings.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Show the browser window; handy when writing selectors for a new source.
    pub headful: bool,
    /// `Accept-Language` of the browser, e.g. `fr-FR,en-US`.
    pub lang: String,
    pub window: (u32, u32),
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headful: false,
            lang: "fr-FR,en-US".into(),
            window: (1280, 900),
        }
    }
}

impl LaunchOptions {
    /// Defaults overridden by `HARVEST_BROWSER_HEADFUL=1` and
    /// `HARVEST_BROWSER_LANG`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lang = std::env::var("HARVEST_BROWSER_LANG")
            .ok()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        Self {
            headful: std::env::var("HARVEST_BROWSER_HEADFUL").is_ok_and(|v| v == "1"),
            lang: lang.unwrap_or(defaults.lang),
            window: defaults.window,
        }
    }

    fn browser_config(&self, chrome: PathBuf) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg(format!("--lang={}", self.lang))
            .window_size(self.window.0, self.window.1);
        if self.headful {
            builder = builder.with_head();
        } else {
            builder = builder.arg("--headless=new");
        }
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("invalid browser config: {e}"))
    }
}

/// Headless Chromium shared by every browser-strategy job of a process.
pub struct ChromiumRenderer {
    browser: Mutex<Option<Browser>>,
    events: std::sync::Mutex<Option<JoinHandle<()>>>,
    open: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    pub async fn launch(options: LaunchOptions) -> Result<Self> {
        let chrome = find_chromium().context("Chromium not found; set HARVEST_CHROMIUM_PATH")?;
        tracing::info!(
            "launching {} ({}x{})",
            chrome.display(),
            options.window.0,
            options.window.1
        );

        let (browser, mut handler) = Browser::launch(options.browser_config(chrome)?)
            .await
            .context("failed to launch Chromium")?;
        // the CDP connection only makes progress while its handler is polled
        let events = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            events: std::sync::Mutex::new(Some(events)),
            open: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn open_tab(&self) -> Result<Box<dyn Tab>> {
        let guard = self.browser.lock().await;
        let Some(browser) = guard.as_ref() else {
            bail!("browser already shut down");
        };
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open tab")?;
        self.open.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ChromiumTab {
            page,
            open: Arc::clone(&self.open),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        if self.open.load(Ordering::Relaxed) > 0 {
            tracing::debug!("closing browser with {} tab(s) open", self.open_tabs());
        }
        browser.close().await.context("failed to close Chromium")?;
        let _ = browser.wait().await;
        if let Ok(mut events) = self.events.lock() {
            if let Some(handle) = events.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    fn open_tabs(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }
}

pub struct ChromiumTab {
    page: Page,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl Tab for ChromiumTab {
    async fn goto(&mut self, url: &str, timeout_ms: u64) -> Result<String> {
        let limit = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => bail!("navigation to {url} failed: {e}"),
            Err(_) => bail!("navigation to {url} timed out after {timeout_ms}ms"),
        }
        let _ = tokio::time::timeout(limit, self.page.wait_for_navigation()).await;
        Ok(self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        self.page
            .evaluate(script)
            .await
            .context("script evaluation failed")?
            .into_value()
            .map_err(|e| anyhow::anyhow!("script returned a non-JSON value: {e:?}"))
    }

    async fn content(&self) -> Result<String> {
        self.page.content().await.context("failed to read page HTML")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.open.fetch_sub(1, Ordering::Relaxed);
        self.page.close().await.context("failed to close tab")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_unless_asked() {
        let options = LaunchOptions::default();
        assert!(!options.headful);
        assert_eq!(options.window, (1280, 900));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_renders_and_evaluates() {
        let renderer = ChromiumRenderer::launch(LaunchOptions::default())
            .await
            .expect("renderer");
        let mut tab = renderer.open_tab().await.expect("tab");
        let page = "data:text/html,<div role='feed'><a aria-label='Etude Martin'>x</a></div>";
        tab.goto(page, 10_000).await.expect("navigation");

        let label = tab
            .evaluate("document.querySelector('a').getAttribute('aria-label')")
            .await
            .expect("evaluate");
        assert_eq!(label.as_str(), Some("Etude Martin"));
        assert!(tab.content().await.unwrap().contains("role=\"feed\""));

        tab.close().await.unwrap();
        assert_eq!(renderer.open_tabs(), 0);
        renderer.shutdown().await.unwrap();
    }
}
