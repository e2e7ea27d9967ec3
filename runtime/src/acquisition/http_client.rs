//! Async HTTP transport wrapping reqwest.
//!
//! Not a browser, just logical requests. Handles redirects, timeouts and a
//! per-client cookie jar. Retries and backoff live in the pacing controller.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Request method negotiated with an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Body of an outgoing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    Json(Value),
}

/// A logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout_ms: 30_000,
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Form(fields),
            ..Self::get(url)
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Json(body),
            ..Self::get(url)
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether a header with this name (case-insensitive) is already set.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// Response to a logical request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Original requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: Vec<(String, String)>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// First header value with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Generic request/response primitive the engine is written against.
///
/// An `Err` always means the request never produced a response (timeout,
/// reset, DNS); HTTP error statuses come back as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport. One instance per job keeps cookie state
/// isolated between concurrent jobs.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for sites that reject HTTP/2.
    h1_client: reqwest::Client,
}

impl HttpClient {
    /// Create a client with a fresh cookie jar.
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let jar = Arc::new(Jar::default());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        let h1_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_provider(jar)
            .http1_only()
            .build()?;

        Ok(Self { client, h1_client })
    }

    async fn send_with(
        &self,
        client: &reqwest::Client,
        request: &HttpRequest,
    ) -> Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client.post(&request.url),
        }
        .timeout(Duration::from_millis(request.timeout_ms));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let r = builder.send().await?;
        let status = r.status().as_u16();
        let final_url = r.url().to_string();

        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = r.text().await.unwrap_or_default();

        Ok(HttpResponse {
            url: request.url.clone(),
            final_url,
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    /// Falls back to HTTP/1.1 on protocol errors (some CDNs reject HTTP/2).
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        match self.send_with(&self.client, &request).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err_str = format!("{e:#}");
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    tracing::debug!("retrying {} over HTTP/1.1: {err_str}", request.url);
                    self.send_with(&self.h1_client, &request).await
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_http_client_creation() {
        assert!(HttpClient::new(10_000).is_ok());
    }

    #[test]
    fn test_request_builders() {
        let req = HttpRequest::post_form("https://e.org/s", vec![("q".into(), "a".into())])
            .header("User-Agent", "x")
            .timeout(500);
        assert_eq!(req.method, HttpMethod::Post);
        assert!(req.has_header("user-agent"));
        assert_eq!(req.timeout_ms, 500);
        assert!(matches!(req.body, RequestBody::Form(ref f) if f.len() == 1));
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let resp = HttpResponse {
            url: "https://e.org".into(),
            final_url: "https://e.org".into(),
            status: 200,
            headers: vec![("x-total-count".into(), "42".into())],
            body: String::new(),
        };
        assert_eq!(resp.header("X-Total-Count"), Some("42"));
        assert!(resp.is_success());
    }

    #[test]
    fn test_method_serde_uppercase() {
        let m: HttpMethod = serde_json::from_str("\"POST\"").unwrap();
        assert_eq!(m, HttpMethod::Post);
        assert_eq!(m.to_string(), "POST");
    }

    #[tokio::test]
    async fn test_session_cookie_carries_into_form_post() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/annuaire"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/recherche"))
            .and(header("cookie", "session=abc"))
            .and(body_string_contains("ville=Lyon"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = HttpClient::new(5_000).unwrap();
        client
            .send(HttpRequest::get(format!("{}/annuaire", server.uri())))
            .await
            .unwrap();
        let resp = client
            .send(HttpRequest::post_form(
                format!("{}/recherche", server.uri()),
                vec![("ville".into(), "Lyon".into())],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "ok");
    }
}
