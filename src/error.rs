use std::fmt;

use thiserror::Error;

use crate::protocol::ODataProtocol;
use crate::service_error::ODataServiceError;
use crate::transport::{HttpMethod, TransportError};

/// Identifies the request an error belongs to. For batch sub-requests this is the original
/// item request, tagged with its Content-ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: HttpMethod,
    pub relative_uri: String,
    pub protocol: ODataProtocol,
    pub content_id: Option<u32>,
}

impl fmt::Display for RequestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.relative_uri)?;
        if let Some(content_id) = self.content_id {
            write!(f, " (Content-ID {content_id})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ODataErrorKind {
    #[error("connection failure: {message}")]
    Connection {
        message: String,
        #[source]
        source: TransportError,
    },

    #[error("request construction failed: {message}")]
    RequestConstruction { message: String },

    #[error("unhealthy response: HTTP {status}")]
    UnhealthyResponse { status: u16, body: Option<String> },

    #[error("OData service error (HTTP {status}): {error}")]
    ServiceError {
        status: u16,
        error: ODataServiceError,
        body: Option<String>,
    },

    #[error("deserialization failed: {message}")]
    Deserialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Failure of any OData operation: the primary cause, the request it belongs to, and any
/// secondary causes collected on the way (e.g. a failed CSRF pre-flight).
#[derive(Debug)]
pub struct ODataError {
    kind: ODataErrorKind,
    request: Option<RequestSummary>,
    secondary: Vec<ODataError>,
}

impl ODataError {
    #[must_use]
    pub fn new(kind: ODataErrorKind) -> Self {
        Self {
            kind,
            request: None,
            secondary: Vec::new(),
        }
    }

    #[must_use]
    pub fn connection(message: impl Into<String>, source: TransportError) -> Self {
        Self::new(ODataErrorKind::Connection {
            message: message.into(),
            source,
        })
    }

    #[must_use]
    pub fn request_construction(message: impl Into<String>) -> Self {
        Self::new(ODataErrorKind::RequestConstruction {
            message: message.into(),
        })
    }

    #[must_use]
    pub fn unhealthy(status: u16, body: Option<String>) -> Self {
        Self::new(ODataErrorKind::UnhealthyResponse { status, body })
    }

    #[must_use]
    pub fn structured(status: u16, error: ODataServiceError, body: Option<String>) -> Self {
        Self::new(ODataErrorKind::ServiceError {
            status,
            error,
            body,
        })
    }

    #[must_use]
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ODataErrorKind::Deserialization {
            message: message.into(),
            source: None,
        })
    }

    #[must_use]
    pub fn json(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::new(ODataErrorKind::Deserialization {
            message: message.into(),
            source: Some(source),
        })
    }

    /// Attach the request the failure belongs to.
    #[must_use]
    pub fn with_request(mut self, request: RequestSummary) -> Self {
        self.request = Some(request);
        self
    }

    /// Attach the request only when none is recorded yet.
    #[must_use]
    pub fn or_request(mut self, request: impl FnOnce() -> RequestSummary) -> Self {
        if self.request.is_none() {
            self.request = Some(request());
        }
        self
    }

    #[must_use]
    pub fn with_secondary(mut self, cause: ODataError) -> Self {
        self.secondary.push(cause);
        self
    }

    pub fn kind(&self) -> &ODataErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ODataErrorKind {
        self.kind
    }

    /// The request that caused the failure, when known.
    pub fn request(&self) -> Option<&RequestSummary> {
        self.request.as_ref()
    }

    pub fn secondary(&self) -> &[ODataError] {
        &self.secondary
    }

    /// HTTP status of an unhealthy response or service error.
    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            ODataErrorKind::UnhealthyResponse { status, .. }
            | ODataErrorKind::ServiceError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body of an unhealthy response or service error, when one was sent.
    pub fn http_body(&self) -> Option<&str> {
        match &self.kind {
            ODataErrorKind::UnhealthyResponse { body, .. }
            | ODataErrorKind::ServiceError { body, .. } => body.as_deref(),
            _ => None,
        }
    }

    pub fn service_error(&self) -> Option<&ODataServiceError> {
        match &self.kind {
            ODataErrorKind::ServiceError { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for ODataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(request) = &self.request {
            write!(f, " [{request}]")?;
        }
        match self.secondary.len() {
            0 => Ok(()),
            1 => write!(f, " (secondary cause: {})", self.secondary[0]),
            n => write!(f, " ({n} secondary causes)"),
        }
    }
}

impl std::error::Error for ODataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl From<ODataErrorKind> for ODataError {
    fn from(kind: ODataErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    fn summary() -> RequestSummary {
        RequestSummary {
            method: HttpMethod::Post,
            relative_uri: "/svc/People".to_owned(),
            protocol: ODataProtocol::V4,
            content_id: Some(3),
        }
    }

    #[test]
    fn display_mentions_request_and_secondary_cause() {
        let error = ODataError::unhealthy(500, None)
            .with_request(summary())
            .with_secondary(ODataError::unhealthy(403, Some("denied".to_owned())));

        assert_eq!(
            error.to_string(),
            "unhealthy response: HTTP 500 [POST /svc/People (Content-ID 3)] \
             (secondary cause: unhealthy response: HTTP 403)"
        );
        assert_eq!(error.status_code(), Some(500));
        assert_eq!(error.secondary()[0].http_body(), Some("denied"));
    }

    #[test]
    fn source_chain_reaches_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let error = ODataError::connection("request failed", TransportError::Io(io));
        let source = error.source().expect("transport source");
        assert_eq!(source.to_string(), "I/O error: reset");
    }

    #[test]
    fn structured_error_exposes_service_payload() {
        let body = r#"{"error":{"code":"ETAG","message":"stale version"}}"#;
        let service_error =
            ODataServiceError::parse(ODataProtocol::V4, body.as_bytes()).expect("payload");
        let error = ODataError::structured(412, service_error, Some(body.to_owned()));

        assert_eq!(error.status_code(), Some(412));
        assert_eq!(error.http_body(), Some(body));
        assert_eq!(error.service_error().map(|e| e.code.as_str()), Some("ETAG"));
        assert!(ODataError::unhealthy(412, None).service_error().is_none());
    }

    #[test]
    fn or_request_keeps_existing_locus() {
        let error = ODataError::deserialization("no body")
            .with_request(summary())
            .or_request(|| RequestSummary {
                content_id: None,
                ..summary()
            });
        assert_eq!(error.request().and_then(|r| r.content_id), Some(3));
    }
}
