//! HTTP call capability.
//!
//! The library never opens sockets itself; every outbound call goes through an
//! [`HttpClient`]. Any `Fn(HttpRequest) -> impl Future<...>` closure is an
//! `HttpClient`, so tests can answer requests from a table without a server.

use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    #[must_use]
    pub fn get(uri: Url) -> Self {
        Self {
            method: Method::Get,
            uri,
            headers: Vec::new(),
            body: None,
        }
    }

    /// `POST` with an `application/x-www-form-urlencoded` body.
    #[must_use]
    pub fn post_form(uri: Url, params: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        Self {
            method: Method::Post,
            uri,
            headers: vec![(
                "content-type".into(),
                "application/x-www-form-urlencoded".into(),
            )],
            body: Some(body.into_bytes()),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Decoded form body parameters (empty for requests without a form body).
    #[must_use]
    pub fn form_params(&self) -> Vec<(String, String)> {
        self.body
            .as_deref()
            .map(|body| url::form_urlencoded::parse(body).into_owned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server errors, request timeouts and rate limiting.
    #[must_use]
    pub fn is_transient_failure(&self) -> bool {
        self.status >= 500 || self.status == 408 || self.status == 429
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Connection-level failure reported by an [`HttpClient`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Consumer-replaceable HTTP transport.
pub trait HttpClient: Send + Sync + 'static {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

impl<F, Fut> HttpClient for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, TransportError>> + Send,
{
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send {
        self(request)
    }
}

/// Executes `request` bounded by `timeout` on behalf of `entity`.
///
/// Timeouts, connection failures and server-side statuses (5xx, 408, 429) map
/// to [`Error::FederationUnavailable`]. Any other non-success status is an
/// answer about `entity` and maps to [`Error::UntrustedEntity`].
pub(crate) async fn fetch<H: HttpClient>(
    http: &H,
    request: HttpRequest,
    timeout: Duration,
    operation: &'static str,
    entity: &str,
) -> Result<HttpResponse, Error> {
    let response = execute(http, request, timeout, operation).await?;
    if response.is_success() {
        return Ok(response);
    }
    if response.is_transient_failure() {
        return Err(Error::unavailable(
            operation,
            format!("HTTP status {}", response.status),
        ));
    }
    tracing::warn!(status = response.status, operation, entity, "Federation request refused");
    Err(Error::untrusted(
        entity,
        format!("{operation} answered HTTP status {}", response.status),
    ))
}

/// Like [`fetch`] but hands non-success responses back to the caller.
pub(crate) async fn execute<H: HttpClient>(
    http: &H,
    request: HttpRequest,
    timeout: Duration,
    operation: &'static str,
) -> Result<HttpResponse, Error> {
    let uri = request.uri.clone();
    match tokio::time::timeout(timeout, http.execute(request)).await {
        Err(_) => {
            tracing::warn!(uri = %uri, ?timeout, operation, "Outbound request timed out");
            Err(Error::unavailable(
                operation,
                format!("{uri} timed out after {timeout:?}"),
            ))
        }
        Ok(Err(e)) => {
            tracing::warn!(uri = %uri, error = %e, operation, "Outbound request failed");
            Err(Error::unavailable(operation, format!("{uri}: {e}")))
        }
        Ok(Ok(response)) => Ok(response),
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    http: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
    /// Build a client whose requests are bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Use a custom `reqwest` client (for connection pool reuse or proxies).
    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.http.get(request.uri),
            Method::Post => self.http.post(request.uri),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
