//! The paced request path shared by every strategy of one job.
//!
//! [`FetchContext::send`] is where a job suspends: it waits on the pacing
//! controller, stamps the current identity, sends, and classifies the result
//! into the [`FetchError`] taxonomy. Strategies never talk to the transport
//! directly.

use crate::acquisition::challenge::{detect_challenge, is_block_status};
use crate::acquisition::http_client::{HttpRequest, HttpResponse, Transport};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::normalize::ResolvedPractice;
use crate::pacing::PacingController;
use std::sync::Arc;

/// Job-wide search criteria forwarded to strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub practice: Option<ResolvedPractice>,
}

impl SearchFilters {
    pub fn practice_code(&self) -> Option<&str> {
        self.practice.as_ref().map(|p| p.code.as_str())
    }

    pub fn practice_label(&self) -> Option<&str> {
        self.practice.as_ref().map(|p| p.label.as_str())
    }
}

/// Job-scoped network state handed to strategies.
pub struct FetchContext {
    transport: Arc<dyn Transport>,
    pacing: PacingController,
    source: Arc<SourceConfig>,
    filters: SearchFilters,
    requests_sent: u64,
}

impl FetchContext {
    pub fn new(
        source: Arc<SourceConfig>,
        transport: Arc<dyn Transport>,
        pacing: PacingController,
        filters: SearchFilters,
    ) -> Self {
        Self {
            transport,
            pacing,
            source,
            filters,
            requests_sent: 0,
        }
    }

    /// Send one logical request through the pacing controller.
    ///
    /// A transport failure is retried once; a second failure is reported as
    /// a block so it counts against the retry budget.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        match self.attempt(&request).await {
            Ok(resp) => self.classify(resp),
            Err(first) => {
                tracing::debug!("transient failure on {}: {first}, retrying once", request.url);
                match self.attempt(&request).await {
                    Ok(resp) => self.classify(resp),
                    Err(second) => Err(FetchError::Blocked {
                        status: None,
                        reason: format!("network failure persisted: {second}"),
                        captcha: false,
                    }),
                }
            }
        }
    }

    async fn attempt(&mut self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.pace().await;
        let mut request = request.clone();
        if !request.has_header("user-agent") {
            request = request.header("User-Agent", self.pacing.identity());
        }
        if request.timeout_ms == 0 {
            request.timeout_ms = self.source.limits.request_timeout_ms;
        }
        self.transport
            .send(request)
            .await
            .map_err(|e| FetchError::Transient(format!("{e:#}")))
    }

    fn classify(&mut self, resp: HttpResponse) -> Result<HttpResponse, FetchError> {
        if is_block_status(resp.status) {
            return Err(FetchError::blocked_status(resp.status));
        }
        if let Some(marker) = detect_challenge(&resp.body) {
            return Err(FetchError::captcha(marker));
        }
        self.pacing.record_success();
        Ok(resp)
    }

    /// Wait out the pacing delay without sending anything. Browser
    /// interactions use this so they honour the same cadence.
    pub async fn pace(&mut self) {
        self.pacing.wait().await;
        self.requests_sent += 1;
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    pub fn pacing_mut(&mut self) -> &mut PacingController {
        &mut self.pacing
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn filters(&self) -> &SearchFilters {
        &self.filters
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for unit tests.

    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers requests from a queue; `None` entries simulate network errors.
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Option<(u16, String)>>>,
        pub seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(replies: Vec<Option<(u16, &str)>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(|(s, b)| (s, b.to_string())))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let url = request.url.clone();
            self.seen.lock().unwrap().push(request);
            match self.replies.lock().unwrap().pop_front() {
                Some(Some((status, body))) => Ok(HttpResponse {
                    url: url.clone(),
                    final_url: url,
                    status,
                    headers: Vec::new(),
                    body,
                }),
                Some(None) => Err(anyhow!("connection reset by peer")),
                None => Err(anyhow!("script exhausted")),
            }
        }
    }

    pub fn context(transport: Arc<ScriptedTransport>) -> FetchContext {
        context_with(transport, r#"{"id": "test", "base_url": "https://e.org/"}"#)
    }

    /// Context over a custom source document, with pacing disabled.
    pub fn context_with(transport: Arc<ScriptedTransport>, source_json: &str) -> FetchContext {
        let source = SourceConfig::from_json(source_json).expect("test source is valid");
        FetchContext::new(
            Arc::new(source),
            transport,
            PacingController::with_seed(crate::pacing::PacingConfig::immediate(), 0),
            SearchFilters::default(),
        )
    }
}
