use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::protocol::ODataProtocol;

/// Structured error payload returned by an OData service alongside a failing status code.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ODataServiceError {
    pub code: String,
    pub message: String,
    pub target: Option<String>,
    pub details: Vec<ODataServiceError>,
    pub inner_error: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<MessageField>,
    target: Option<String>,
    #[serde(default)]
    details: Vec<ErrorPayload>,
    #[serde(default, rename = "innererror")]
    inner_error: Option<Map<String, Value>>,
}

/// V2 services localize messages as `{"lang": .., "value": ..}`; V4 sends plain text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageField {
    Text(String),
    Localized { value: String },
}

impl ODataServiceError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        target: Option<impl Into<String>>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            target: target.map(Into::into),
            ..Self::default()
        }
    }

    /// Parse a standard OData error body. Returns `None` when the body is not a well-formed
    /// error document.
    pub fn parse(protocol: ODataProtocol, body: &[u8]) -> Option<Self> {
        let envelope: ErrorEnvelope = serde_json::from_slice(body).ok()?;
        let payload = envelope.error;
        if payload.code.is_none() && payload.message.is_none() {
            return None;
        }
        let mut error = Self::from_payload(payload);
        if protocol == ODataProtocol::V2 && error.details.is_empty() {
            error.details = lift_v2_error_details(&mut error.inner_error);
        }
        Some(error)
    }

    fn from_payload(payload: ErrorPayload) -> Self {
        Self {
            code: payload.code.unwrap_or_default(),
            message: match payload.message {
                Some(MessageField::Text(text)) => text,
                Some(MessageField::Localized { value }) => value,
                None => String::new(),
            },
            target: payload.target,
            details: payload.details.into_iter().map(Self::from_payload).collect(),
            inner_error: payload.inner_error.unwrap_or_default(),
        }
    }
}

/// V2 services nest details under `innererror.errordetails`.
fn lift_v2_error_details(inner_error: &mut Map<String, Value>) -> Vec<ODataServiceError> {
    let Some(Value::Array(items)) = inner_error.remove("errordetails") else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ErrorPayload>(item).ok())
        .map(ODataServiceError::from_payload)
        .collect()
}

impl fmt::Display for ODataServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} ({}): {}", self.code, target, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}
