use std::time::Duration;

use async_trait::async_trait;
use http::{
    HeaderMap,
    HeaderValue,
    Method,
    StatusCode,
    header::CONTENT_TYPE,
};
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::{error::TransportError, prelude::*, query::Query};

/// Sends one HTTP request, nothing else: no retries, no authentication.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

#[derive(Clone, Debug)]
#[must_use]
pub struct Request {
    pub method: Method,

    /// Target URL without the query.
    pub url: Url,

    /// Already encoded query string, without the leading `?`.
    pub query: Option<String>,

    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, query: None, headers: HeaderMap::new(), body: None }
    }

    pub fn with_query(mut self, query: &Query) -> Result<Self> {
        self.query = Some(query.encode()?).filter(|query| !query.is_empty());
        Ok(self)
    }

    pub fn with_json<B: Serialize>(mut self, body: &B) -> Result<Self> {
        let body = serde_json::to_vec(body)
            .map_err(|error| {
                TransportError::Other(format!("failed to serialize the body: {error}"))
            })?;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        Ok(self)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Request target as it appears on the request line, that is `path?query`.
    #[must_use]
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
#[must_use]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }
}

/// Default [`Transport`] on top of [`reqwest`].
#[derive(Clone, Debug)]
pub struct HttpTransport(Client);

impl HttpTransport {
    /// Build the client.
    ///
    /// eGauge meters ship with self-signed certificates, hence the `accept_invalid_certs` switch.
    pub fn try_new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self(client))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(
        skip_all,
        level = Level::DEBUG,
        fields(method = %request.method, path = request.path())
    )]
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let mut url = request.url;
        url.set_query(request.query.as_deref());
        let mut builder = self.0.request(request.method, url).headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        debug!(%status, n_bytes = body.len(), "received");
        Ok(Response { status, headers, body })
    }
}
