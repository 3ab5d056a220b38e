//! Blocking `odata_client` transport backed by `reqwest`.
//!
//! `ReqwestTransport` binds the engine's relative request URIs to one destination, given by
//! [`ReqwestTransportConfig::base_url`]. Timeouts, TLS and connection pooling are handled by the
//! underlying `reqwest::blocking::Client`.

pub mod config;

use odata_client::{HeaderMap, HttpMethod, HttpRequest, RawResponse, Transport, TransportError};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};

pub use crate::config::ReqwestTransportConfig;

#[derive(Debug, Error)]
pub enum ReqwestTransportError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    #[error("invalid header key: {0}")]
    InvalidHeaderName(String),

    #[error("invalid header value for {0}")]
    InvalidHeaderValue(String),
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    config: ReqwestTransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: ReqwestTransportConfig) -> Result<Self, ReqwestTransportError> {
        let mut builder = Client::builder().default_headers(default_headers(&config)?);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(user_agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(user_agent);
        }
        let http = builder.build()?;
        Ok(Self { http, config })
    }

    /// Transport configured from the `ODATA_*` environment variables.
    pub fn from_env() -> Result<Self, ReqwestTransportError> {
        Self::new(ReqwestTransportConfig::from_env())
    }

    pub fn config(&self) -> &ReqwestTransportConfig {
        &self.config
    }

    pub fn build_request(
        &self,
        request: &HttpRequest,
    ) -> Result<reqwest::blocking::RequestBuilder, TransportError> {
        let url = self.config.resolve(&request.uri);
        let mut builder = self.http.request(method_of(request.method), url);
        for (name, value) in request.headers.iter() {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                TransportError::InvalidRequest(format!("invalid header key: {name}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidRequest(format!("invalid header value for {name}"))
            })?;
            builder = builder.header(header_name, header_value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<RawResponse, TransportError> {
        debug!(method = %request.method, uri = %request.uri, "sending HTTP request");
        let response = self
            .build_request(request)?
            .send()
            .map_err(|error| TransportError::Other(Box::new(error)))?;
        Ok(into_raw_response(request.method, response))
    }
}

fn default_headers(
    config: &ReqwestTransportConfig,
) -> Result<reqwest::header::HeaderMap, ReqwestTransportError> {
    let mut out = reqwest::header::HeaderMap::new();
    for (key, value) in &config.default_headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ReqwestTransportError::InvalidHeaderName(key.clone()))?,
            HeaderValue::from_str(value)
                .map_err(|_| ReqwestTransportError::InvalidHeaderValue(key.clone()))?,
        );
    }
    Ok(out)
}

fn method_of(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn into_raw_response(method: HttpMethod, response: Response) -> RawResponse {
    let status = response.status();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        trace!(header = %name, value, "response header");
        headers.append(name.as_str(), value);
    }

    let raw = RawResponse::new(status.as_u16(), status.canonical_reason().unwrap_or_default())
        .with_headers(headers);
    if has_entity(method, status, response.content_length()) {
        raw.with_body(Box::new(response))
    } else {
        raw
    }
}

fn has_entity(method: HttpMethod, status: StatusCode, content_length: Option<u64>) -> bool {
    method != HttpMethod::Head
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
        && content_length != Some(0)
}
