use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::csrf::{CsrfCoordinator, CsrfTokenRetriever};
use crate::error::{ODataError, RequestSummary};
use crate::headers::{
    HeaderMap, CONTENT_TYPE_JSON, HEADER_ACCEPT, HEADER_CONTENT_TYPE, HEADER_IF_MATCH,
};
use crate::parameters::{ParameterPosition, ParameterSet};
use crate::protocol::ODataProtocol;
use crate::resource_path::ResourcePath;
use crate::response::ODataResponse;
use crate::transport::{HttpMethod, HttpRequest, SharedTransport};
use crate::uri::{create_and_encode_uri, sanitize_path, UriEncodingStrategy};

/// Observer of request execution.
pub trait RequestListener: Send + Sync {
    /// Called right before the transport is invoked.
    fn on_request(&self, _request: &HttpRequest) {}

    /// Called when building, sending or validating the request failed.
    fn on_error(&self, _error: &ODataError) {}
}

/// State shared by every request kind, batch requests included.
#[derive(Clone)]
pub struct RequestBase {
    pub(crate) service_path: String,
    pub(crate) protocol: ODataProtocol,
    pub(crate) headers: HeaderMap,
    pub(crate) query_parameters: BTreeMap<String, String>,
    pub(crate) csrf: CsrfCoordinator,
    pub(crate) listeners: Vec<Arc<dyn RequestListener>>,
    pub(crate) buffer_response: bool,
}

impl RequestBase {
    pub(crate) fn new(service_path: impl Into<String>, protocol: ODataProtocol) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACCEPT, CONTENT_TYPE_JSON);
        Self {
            service_path: service_path.into(),
            protocol,
            headers,
            query_parameters: BTreeMap::new(),
            csrf: CsrfCoordinator::default(),
            listeners: Vec::new(),
            buffer_response: true,
        }
    }

    pub(crate) fn notify_request(&self, request: &HttpRequest) {
        for listener in &self.listeners {
            listener.on_request(request);
        }
    }

    pub(crate) fn notify_error(&self, error: &ODataError) {
        for listener in &self.listeners {
            listener.on_error(error);
        }
    }
}

impl fmt::Debug for RequestBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBase")
            .field("service_path", &self.service_path)
            .field("protocol", &self.protocol)
            .field("headers", &self.headers)
            .field("query_parameters", &self.query_parameters)
            .field("csrf", &self.csrf)
            .field("listeners", &self.listeners.len())
            .field("buffer_response", &self.buffer_response)
            .finish()
    }
}

/// Contract shared by all request kinds: URI building plus header, query and listener storage.
pub trait RequestModel {
    fn base(&self) -> &RequestBase;

    fn base_mut(&mut self) -> &mut RequestBase;

    fn method(&self) -> HttpMethod;

    /// Relative URI of the request, encoded with `strategy`.
    fn relative_uri(&self, strategy: UriEncodingStrategy) -> Result<String, ODataError>;

    fn service_path(&self) -> &str {
        &self.base().service_path
    }

    fn protocol(&self) -> ODataProtocol {
        self.base().protocol
    }

    fn headers(&self) -> &HeaderMap {
        &self.base().headers
    }

    /// Append a header value.
    fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().headers.append(name, value);
        self
    }

    /// Replace all values of a header.
    fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().headers.insert(name, value);
        self
    }

    fn add_header_if_absent(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().headers.insert_if_absent(name, value);
        self
    }

    /// Add a generic query parameter. The value must already be encoded.
    fn add_query_parameter(
        &mut self,
        name: impl Into<String>,
        encoded_value: impl Into<String>,
    ) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut()
            .query_parameters
            .insert(name.into(), encoded_value.into());
        self
    }

    /// Generic query parameters as `k=v` pairs joined with `&`, sorted by name.
    fn request_query(&self) -> String {
        self.base()
            .query_parameters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn add_listener(&mut self, listener: Arc<dyn RequestListener>) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().listeners.push(listener);
        self
    }

    fn with_csrf_token_retriever(&mut self, retriever: Arc<dyn CsrfTokenRetriever>) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().csrf = CsrfCoordinator::new(retriever);
        self
    }

    /// Hand the response body over as a single-use stream instead of buffering it.
    fn disable_buffering(&mut self) -> &mut Self
    where
        Self: Sized,
    {
        self.base_mut().buffer_response = false;
        self
    }

    /// URI shown in logs and errors. Never fails.
    fn display_uri(&self) -> String {
        self.relative_uri(UriEncodingStrategy::Regular)
            .unwrap_or_else(|_| sanitize_path(self.service_path()))
    }

    /// Identification used in errors.
    fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method(),
            relative_uri: self.display_uri(),
            protocol: self.protocol(),
            content_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateStrategy {
    /// Send only changed fields with `PATCH`.
    #[default]
    ModifyWithPatch,
    /// Replace the whole entity with `PUT`.
    ReplaceWithPut,
}

/// What a request does, along with the data only that kind carries.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Read {
        query: String,
    },
    ReadByKey {
        query: String,
    },
    Create {
        entity: String,
    },
    Update {
        entity: String,
        strategy: UpdateStrategy,
        version_identifier: Option<String>,
    },
    Delete {
        version_identifier: Option<String>,
    },
    Action {
        parameters: String,
    },
    Function {
        parameters: ParameterSet,
    },
    Count {
        query: String,
    },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::ReadByKey { .. } => "read-by-key",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Action { .. } => "action",
            Self::Function { .. } => "function",
            Self::Count { .. } => "count",
        }
    }

    /// State-changing kinds need a CSRF token.
    pub fn modifies(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::Update { .. } | Self::Delete { .. } | Self::Action { .. }
        )
    }
}

/// A single OData operation against `service_path/resource_path`.
#[derive(Debug, Clone)]
pub struct ODataRequest {
    pub(crate) base: RequestBase,
    pub(crate) resource_path: ResourcePath,
    pub(crate) kind: RequestKind,
}

impl ODataRequest {
    fn new(
        service_path: impl Into<String>,
        resource_path: ResourcePath,
        protocol: ODataProtocol,
        kind: RequestKind,
    ) -> Self {
        Self {
            base: RequestBase::new(service_path, protocol),
            resource_path,
            kind,
        }
    }

    /// Read a collection or resource. `encoded_query` may be empty.
    pub fn read(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        encoded_query: impl Into<String>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Read {
            query: encoded_query.into(),
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Read one entity of `entity_set` by `key`.
    pub fn read_by_key(
        service_path: impl Into<String>,
        entity_set: impl Into<ResourcePath>,
        key: ParameterSet,
        encoded_query: impl Into<String>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::ReadByKey {
            query: encoded_query.into(),
        };
        let resource_path = entity_set.into().with_parameters(key);
        Self::new(service_path, resource_path, protocol, kind)
    }

    /// Create an entity from its serialized JSON.
    pub fn create(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        serialized_entity: impl Into<String>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Create {
            entity: serialized_entity.into(),
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Update the entity at `resource_path`, usually built with [`ResourcePath::of_key`].
    pub fn update(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        serialized_entity: impl Into<String>,
        strategy: UpdateStrategy,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Update {
            entity: serialized_entity.into(),
            strategy,
            version_identifier: None,
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    pub fn delete(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Delete {
            version_identifier: None,
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Invoke an action. Without parameters the body is `{}`.
    pub fn action(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        parameters: Option<serde_json::Value>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Action {
            parameters: parameters.map_or_else(|| "{}".to_owned(), |value| value.to_string()),
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Invoke a function. V2 places the parameters in the query, V4 attaches them to the last
    /// path segment.
    pub fn function(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        parameters: ParameterSet,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Function { parameters };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Count the entities of a collection via its `$count` segment.
    pub fn count(
        service_path: impl Into<String>,
        resource_path: impl Into<ResourcePath>,
        encoded_query: impl Into<String>,
        protocol: ODataProtocol,
    ) -> Self {
        let kind = RequestKind::Count {
            query: encoded_query.into(),
        };
        Self::new(service_path, resource_path.into(), protocol, kind)
    }

    /// Guard an update or delete with `If-Match`. Ignored by other kinds.
    #[must_use]
    pub fn with_version_identifier(mut self, version_identifier: impl Into<String>) -> Self {
        match &mut self.kind {
            RequestKind::Update {
                version_identifier: slot,
                ..
            }
            | RequestKind::Delete {
                version_identifier: slot,
            } => *slot = Some(version_identifier.into()),
            other => debug!(kind = other.name(), "version identifier ignored"),
        }
        self
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn resource_path(&self) -> &ResourcePath {
        &self.resource_path
    }

    pub fn is_read(&self) -> bool {
        matches!(self.kind, RequestKind::Read { .. })
    }

    pub fn version_identifier(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Update {
                version_identifier, ..
            }
            | RequestKind::Delete { version_identifier } => version_identifier.as_deref(),
            _ => None,
        }
    }

    /// Body sent with the request, if the kind carries one.
    pub fn body(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Create { entity } | RequestKind::Update { entity, .. } => Some(entity),
            RequestKind::Action { parameters } => Some(parameters),
            _ => None,
        }
    }

    /// Headers as sent: the stored ones plus `Content-Type` for bodies and `If-Match` for a
    /// known version identifier. Values already present are never overwritten.
    pub fn effective_headers(&self) -> HeaderMap {
        let mut headers = self.base.headers.clone();
        if self.body().is_some() {
            headers.insert_if_absent(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON);
        }
        if matches!(
            self.kind,
            RequestKind::Update { .. } | RequestKind::Delete { .. }
        ) {
            match self.version_identifier() {
                Some(version_identifier) => {
                    headers.insert_if_absent(HEADER_IF_MATCH, version_identifier);
                }
                None => debug!(
                    kind = self.kind.name(),
                    "no version identifier, sending without If-Match"
                ),
            }
        }
        headers
    }

    fn encoded_path_and_query(&self, strategy: UriEncodingStrategy) -> (String, String) {
        let (path, specific_query) = match &self.kind {
            RequestKind::Read { query } | RequestKind::ReadByKey { query } => {
                (self.resource_path.to_encoded_path(strategy), query.clone())
            }
            RequestKind::Count { query } => (
                self.resource_path
                    .clone()
                    .segment("$count")
                    .to_encoded_path(strategy),
                query.clone(),
            ),
            RequestKind::Function { parameters } => match self.base.protocol {
                ODataProtocol::V4 => (
                    self.resource_path
                        .clone()
                        .with_parameters(parameters.clone())
                        .to_encoded_path(strategy),
                    String::new(),
                ),
                ODataProtocol::V2 => (
                    self.resource_path.to_encoded_path(strategy),
                    parameters.render(strategy, ParameterPosition::Query),
                ),
            },
            _ => (self.resource_path.to_encoded_path(strategy), String::new()),
        };

        let query = [specific_query, self.request_query()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("&");
        (path, query)
    }

    /// Execute against `transport` and validate the response status.
    pub fn execute(&self, transport: &SharedTransport) -> Result<ODataResponse, ODataError> {
        let result = self.try_execute(transport);
        if let Err(error) = &result {
            self.base.notify_error(error);
        }
        result
    }

    fn try_execute(&self, transport: &SharedTransport) -> Result<ODataResponse, ODataError> {
        let method = self.method();
        let uri = self
            .relative_uri(UriEncodingStrategy::Regular)
            .map_err(|error| error.or_request(|| self.summary()))?;
        let body = self.body().map(str::to_owned);
        let mut headers = self.effective_headers();

        let send = |headers: &HeaderMap| -> Result<ODataResponse, ODataError> {
            let mut executed = self.clone();
            executed.base.headers = headers.clone();
            let summary = executed.summary();

            let http = HttpRequest {
                method,
                uri: uri.clone(),
                headers: headers.clone(),
                body: body.clone(),
            };
            debug!(%method, uri = %uri, kind = self.kind.name(), "executing OData request");
            self.base.notify_request(&http);

            let raw = transport.execute(&http).map_err(|source| {
                ODataError::connection(format!("{method} {uri} failed"), source)
                    .with_request(summary.clone())
            })?;
            let response =
                ODataResponse::new(Some(executed), summary, raw, Some(transport.clone()));
            response.require_healthy()?;
            Ok(response)
        };

        if self.kind.modifies() {
            self.base
                .csrf
                .execute(transport.as_ref(), &self.base.service_path, &mut headers, send)
        } else {
            send(&headers)
        }
    }
}

impl RequestModel for ODataRequest {
    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn method(&self) -> HttpMethod {
        match &self.kind {
            RequestKind::Read { .. }
            | RequestKind::ReadByKey { .. }
            | RequestKind::Function { .. }
            | RequestKind::Count { .. } => HttpMethod::Get,
            RequestKind::Create { .. } | RequestKind::Action { .. } => HttpMethod::Post,
            RequestKind::Update {
                strategy: UpdateStrategy::ModifyWithPatch,
                ..
            } => HttpMethod::Patch,
            RequestKind::Update {
                strategy: UpdateStrategy::ReplaceWithPut,
                ..
            } => HttpMethod::Put,
            RequestKind::Delete { .. } => HttpMethod::Delete,
        }
    }

    fn relative_uri(&self, strategy: UriEncodingStrategy) -> Result<String, ODataError> {
        let (path, query) = self.encoded_path_and_query(strategy);
        create_and_encode_uri(&self.base.service_path, &path, Some(&query), strategy)
    }

    /// Falls back to the unvalidated URI when the query is not properly encoded.
    fn display_uri(&self) -> String {
        self.relative_uri(UriEncodingStrategy::Regular)
            .unwrap_or_else(|_| {
                let (path, query) = self.encoded_path_and_query(UriEncodingStrategy::None);
                let uri = format!("{}{path}", sanitize_path(&self.base.service_path));
                if query.is_empty() {
                    uri
                } else {
                    format!("{uri}?{query}")
                }
            })
    }
}
