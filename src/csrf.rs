use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ODataError;
use crate::headers::{HeaderMap, HEADER_ACCEPT, HEADER_CSRF_TOKEN};
use crate::transport::{HttpMethod, HttpRequest, Transport};
use crate::uri::{encoded_service_path, UriEncodingStrategy};

/// Sentinel asking the service to issue a token.
pub const CSRF_TOKEN_FETCH: &str = "fetch";

/// Source of anti-forgery tokens for state-changing requests.
pub trait CsrfTokenRetriever: Send + Sync {
    /// A disabled retriever makes the coordinator skip the pre-flight entirely.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Fetch a token for `service_path`, forwarding the request's own `headers` (credentials,
    /// cookies) to the service.
    fn retrieve_token(
        &self,
        transport: &dyn Transport,
        service_path: &str,
        headers: &HeaderMap,
    ) -> Result<String, ODataError>;
}

/// Issues `HEAD <service root>` with `x-csrf-token: fetch` and reads the token from the
/// response header of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCsrfTokenRetriever;

impl CsrfTokenRetriever for DefaultCsrfTokenRetriever {
    fn retrieve_token(
        &self,
        transport: &dyn Transport,
        service_path: &str,
        headers: &HeaderMap,
    ) -> Result<String, ODataError> {
        let uri = encoded_service_path(service_path, UriEncodingStrategy::Regular);
        let mut preflight_headers = headers.clone();
        preflight_headers.remove(HEADER_ACCEPT);
        preflight_headers.insert(HEADER_CSRF_TOKEN, CSRF_TOKEN_FETCH);

        let request =
            HttpRequest::new(HttpMethod::Head, uri.clone()).with_headers(preflight_headers);
        let mut response = transport.execute(&request).map_err(|source| {
            ODataError::connection(format!("CSRF token request to {uri} failed"), source)
        })?;
        if let Some(mut body) = response.body.take() {
            if let Err(error) = std::io::copy(&mut body, &mut std::io::sink()) {
                debug!(%error, "failed to drain the CSRF token response body");
            }
        }

        if response.status >= 400 {
            return Err(ODataError::unhealthy(response.status, None));
        }
        response
            .headers
            .get(HEADER_CSRF_TOKEN)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                ODataError::deserialization(format!(
                    "CSRF token response from {uri} does not carry an {HEADER_CSRF_TOKEN} header"
                ))
            })
    }
}

/// Retriever that never fetches a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCsrfTokenRetriever;

impl CsrfTokenRetriever for DisabledCsrfTokenRetriever {
    fn is_enabled(&self) -> bool {
        false
    }

    fn retrieve_token(
        &self,
        _transport: &dyn Transport,
        _service_path: &str,
        _headers: &HeaderMap,
    ) -> Result<String, ODataError> {
        Err(ODataError::request_construction("CSRF token retrieval is disabled"))
    }
}

/// Fetch-if-absent token handshake wrapped around a request execution.
#[derive(Clone)]
pub struct CsrfCoordinator {
    retriever: Arc<dyn CsrfTokenRetriever>,
}

impl Default for CsrfCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultCsrfTokenRetriever))
    }
}

impl fmt::Debug for CsrfCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfCoordinator")
            .field("enabled", &self.retriever.is_enabled())
            .finish()
    }
}

impl CsrfCoordinator {
    pub fn new(retriever: Arc<dyn CsrfTokenRetriever>) -> Self {
        Self { retriever }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledCsrfTokenRetriever))
    }

    pub fn is_enabled(&self) -> bool {
        self.retriever.is_enabled()
    }

    /// Run `execute` with a token in `headers`.
    ///
    /// The pre-flight is skipped when the coordinator is disabled or `headers` already carry a
    /// token. `execute` always runs; if both the pre-flight and `execute` fail, the pre-flight
    /// failure becomes a secondary cause of the returned error.
    pub fn execute<T>(
        &self,
        transport: &dyn Transport,
        service_path: &str,
        headers: &mut HeaderMap,
        execute: impl FnOnce(&HeaderMap) -> Result<T, ODataError>,
    ) -> Result<T, ODataError> {
        if !self.retriever.is_enabled() || headers.contains(HEADER_CSRF_TOKEN) {
            debug!("CSRF token present or retrieval disabled, skipping pre-flight");
            return execute(headers);
        }

        let preflight = self
            .retriever
            .retrieve_token(transport, service_path, headers);
        match &preflight {
            Ok(token) => {
                debug!(service_path, "CSRF token retrieved");
                headers.insert(HEADER_CSRF_TOKEN, token.clone());
            }
            Err(error) => debug!(
                service_path,
                %error,
                "CSRF token retrieval failed, continuing without token"
            ),
        }

        match (execute(headers), preflight) {
            (Err(error), Err(preflight_error)) => Err(error.with_secondary(preflight_error)),
            (result, _) => result,
        }
    }
}
