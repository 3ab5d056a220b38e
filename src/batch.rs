use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ODataError, RequestSummary};
use crate::headers::{
    HeaderMap, CONTENT_TYPE_HTTP, HEADER_ACCEPT, HEADER_CONTENT_ID,
    HEADER_CONTENT_TRANSFER_ENCODING, HEADER_CONTENT_TYPE, HEADER_ODATA_VERSION,
};
use crate::multipart::MultipartParser;
use crate::protocol::ODataProtocol;
use crate::request::{ODataRequest, RequestBase, RequestModel};
use crate::resource_path::ResourcePath;
use crate::response::ODataResponse;
use crate::transport::{HttpMethod, HttpRequest, SharedTransport};
use crate::uri::{create_and_encode_uri, encoded_service_path, UriEncodingStrategy};

const NEW_LINE: &str = "\r\n";

/// Source of boundary identifiers.
pub type UuidProvider = Arc<dyn Fn() -> Uuid + Send + Sync>;

/// A request wrapped into a batch, with the Content-ID it was assigned on insertion.
#[derive(Debug, Clone)]
pub struct BatchItemSingle {
    content_id: u32,
    request: ODataRequest,
    method: HttpMethod,
    resource_path: String,
}

impl BatchItemSingle {
    pub fn content_id(&self) -> u32 {
        self.content_id
    }

    pub fn request(&self) -> &ODataRequest {
        &self.request
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Encoded path relative to the batch's service path.
    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    /// The original request, tagged with this item's Content-ID.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            content_id: Some(self.content_id),
            ..self.request.summary()
        }
    }

    fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("{HEADER_CONTENT_TYPE}: {CONTENT_TYPE_HTTP}"),
            format!("{HEADER_CONTENT_TRANSFER_ENCODING}: binary"),
            format!("{HEADER_CONTENT_ID}: {}", self.content_id),
            String::new(),
            format!("{} {} HTTP/1.1", self.method, self.resource_path),
        ];
        lines.extend(
            self.request
                .effective_headers()
                .iter()
                .map(|(name, value)| format!("{name}: {value}")),
        );
        lines.push(String::new());
        if let Some(payload) = self.request.body() {
            lines.push(payload.to_owned());
        }
        lines.push(String::new());
        lines
    }
}

/// Requests that succeed or fail together.
#[derive(Debug, Clone)]
pub struct BatchChangeset {
    id: Uuid,
    items: Vec<BatchItemSingle>,
}

impl BatchChangeset {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn items(&self) -> &[BatchItemSingle] {
        &self.items
    }

    fn lines(&self) -> Vec<String> {
        let delimiter = format!("--changeset_{}", self.id);
        let mut lines = vec![
            format!("{HEADER_CONTENT_TYPE}: multipart/mixed;boundary=changeset_{}", self.id),
            String::new(),
        ];
        for item in &self.items {
            lines.push(delimiter.clone());
            lines.extend(item.lines());
        }
        lines.push(format!("{delimiter}--"));
        lines.push(String::new());
        lines
    }
}

#[derive(Debug, Clone)]
pub enum BatchItem {
    Single(BatchItemSingle),
    Changeset(BatchChangeset),
}

impl BatchItem {
    fn lines(&self) -> Vec<String> {
        match self {
            Self::Single(item) => item.lines(),
            Self::Changeset(changeset) => changeset.lines(),
        }
    }

    fn singles(&self) -> &[BatchItemSingle] {
        match self {
            Self::Single(item) => std::slice::from_ref(item),
            Self::Changeset(changeset) => &changeset.items,
        }
    }
}

/// Where an item sits in a batch: its top-level index, and its index inside the changeset if
/// it belongs to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchResponsePosition {
    pub batch_index: usize,
    pub changeset_index: Option<usize>,
}

/// Several requests sent as one `multipart/mixed` POST to `<service>/$batch`.
#[derive(Clone)]
pub struct BatchRequest {
    base: RequestBase,
    uuid_provider: UuidProvider,
    batch_id: Uuid,
    items: Vec<BatchItem>,
    next_content_id: u32,
}

impl BatchRequest {
    pub fn new(service_path: impl Into<String>, protocol: ODataProtocol) -> Self {
        Self::with_uuid_provider(service_path, protocol, Arc::new(Uuid::new_v4))
    }

    /// Batch whose boundaries are drawn from `uuid_provider`, one for the batch itself right
    /// away and one per changeset when it is closed.
    pub fn with_uuid_provider(
        service_path: impl Into<String>,
        protocol: ODataProtocol,
        uuid_provider: UuidProvider,
    ) -> Self {
        let mut base = RequestBase::new(service_path, protocol);
        base.headers.remove(HEADER_ACCEPT);
        let batch_id = uuid_provider();
        Self {
            base,
            uuid_provider,
            batch_id,
            items: Vec::new(),
            next_content_id: 1,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    fn single_item(
        &mut self,
        request: ODataRequest,
        accepted: &[&str],
    ) -> Result<BatchItemSingle, ODataError> {
        let kind = request.kind().name();
        if !accepted.contains(&kind) {
            return Err(self.construction_error(format!(
                "a {kind} request cannot be added here, expected one of {accepted:?}"
            )));
        }

        let encoded_uri = request.relative_uri(UriEncodingStrategy::Batch)?;
        let service_path =
            encoded_service_path(&self.base.service_path, UriEncodingStrategy::Batch);
        let Some(resource_path) = encoded_uri.strip_prefix(&service_path) else {
            return Err(self.construction_error(format!(
                "Batch request contains requests to different service paths \
                 (batch request: {service_path}, single request: {encoded_uri})"
            )));
        };
        if request.protocol() != self.base.protocol {
            return Err(self.construction_error(format!(
                "Batch request contains requests with different protocol versions ({} and {})",
                self.base.protocol,
                request.protocol()
            )));
        }

        let content_id = self.next_content_id;
        self.next_content_id += 1;
        debug!(content_id, kind, path = resource_path, "added batch item");
        Ok(BatchItemSingle {
            content_id,
            method: request.method(),
            resource_path: resource_path.to_owned(),
            request,
        })
    }

    fn construction_error(&self, message: String) -> ODataError {
        ODataError::request_construction(message).with_request(self.summary())
    }

    fn add_single(
        &mut self,
        request: ODataRequest,
        accepted: &[&str],
    ) -> Result<&mut Self, ODataError> {
        let item = self.single_item(request, accepted)?;
        self.items.push(BatchItem::Single(item));
        Ok(self)
    }

    pub fn add_read(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add_single(request, &["read"])
    }

    pub fn add_read_by_key(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add_single(request, &["read-by-key"])
    }

    pub fn add_function(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add_single(request, &["function"])
    }

    /// Start a changeset. Items added to it receive their Content-IDs immediately; the changeset
    /// joins the batch on [`Changeset::end_changeset`]. A rejected add leaves the changeset and
    /// the items already in it untouched.
    pub fn begin_changeset(&mut self) -> Changeset<'_> {
        Changeset {
            batch: self,
            items: Vec::new(),
        }
    }

    /// Locate the item that was assigned `content_id`.
    pub fn position_of(&self, content_id: u32) -> Option<BatchResponsePosition> {
        self.items.iter().enumerate().find_map(|(batch_index, item)| match item {
            BatchItem::Single(single) => {
                (single.content_id == content_id).then_some(BatchResponsePosition {
                    batch_index,
                    changeset_index: None,
                })
            }
            BatchItem::Changeset(changeset) => changeset
                .items
                .iter()
                .position(|single| single.content_id == content_id)
                .map(|index| BatchResponsePosition {
                    batch_index,
                    changeset_index: Some(index),
                }),
        })
    }

    pub fn item_at(&self, position: BatchResponsePosition) -> Option<&BatchItemSingle> {
        let item = self.items.get(position.batch_index)?;
        match (item, position.changeset_index) {
            (BatchItem::Single(single), None) => Some(single),
            (BatchItem::Changeset(changeset), Some(index)) => changeset.items.get(index),
            _ => None,
        }
    }

    fn single_by_content_id(&self, content_id: u32) -> Option<&BatchItemSingle> {
        self.position_of(content_id)
            .and_then(|position| self.item_at(position))
    }

    /// The request that was assigned `content_id`.
    pub fn request_by_content_id(&self, content_id: u32) -> Option<&ODataRequest> {
        self.single_by_content_id(content_id)
            .map(BatchItemSingle::request)
    }

    /// Headers sent with the batch POST.
    pub fn batch_headers(&self) -> HeaderMap {
        let mut headers = self.base.headers.clone();
        headers.insert(
            HEADER_CONTENT_TYPE,
            format!("multipart/mixed;boundary=batch_{}", self.batch_id),
        );
        headers.insert(HEADER_ODATA_VERSION, self.base.protocol.version());
        headers
    }

    /// The `multipart/mixed` body, CRLF separated.
    pub fn request_body(&self) -> String {
        let delimiter = format!("--batch_{}", self.batch_id);
        let mut lines = Vec::new();
        for item in &self.items {
            lines.push(delimiter.clone());
            lines.extend(item.lines());
        }
        lines.push(format!("{delimiter}--"));
        lines.push(String::new());
        lines.join(NEW_LINE)
    }

    /// Send the batch. The CSRF handshake always applies.
    pub fn execute(&self, transport: &SharedTransport) -> Result<BatchResponse, ODataError> {
        let result = self.try_execute(transport);
        if let Err(error) = &result {
            self.base.notify_error(error);
        }
        result
    }

    fn try_execute(&self, transport: &SharedTransport) -> Result<BatchResponse, ODataError> {
        let uri = self
            .relative_uri(UriEncodingStrategy::Regular)
            .map_err(|error| error.or_request(|| self.summary()))?;
        let body = self.request_body();
        let mut headers = self.batch_headers();
        let summary = self.summary();

        let response = self.base.csrf.execute(
            transport.as_ref(),
            &self.base.service_path,
            &mut headers,
            |headers| {
                let http = HttpRequest::new(HttpMethod::Post, uri.clone())
                    .with_headers(headers.clone())
                    .with_body(body.clone());
                debug!(
                    uri = %uri,
                    items = self.items.len(),
                    batch_id = %self.batch_id,
                    "executing batch request"
                );
                self.base.notify_request(&http);

                let raw = transport.execute(&http).map_err(|source| {
                    ODataError::connection(format!("POST {uri} failed"), source)
                        .with_request(summary.clone())
                })?;
                let response =
                    ODataResponse::new(None, summary.clone(), raw, Some(transport.clone()));
                if !self.base.buffer_response {
                    response.disable_buffering();
                }
                response.require_healthy()?;
                Ok(response)
            },
        )?;

        Ok(BatchResponse {
            response,
            batch: self.clone(),
        })
    }
}

impl RequestModel for BatchRequest {
    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn method(&self) -> HttpMethod {
        HttpMethod::Post
    }

    fn relative_uri(&self, strategy: UriEncodingStrategy) -> Result<String, ODataError> {
        let path = ResourcePath::of("$batch").to_encoded_path(strategy);
        create_and_encode_uri(
            &self.base.service_path,
            &path,
            Some(&self.request_query()),
            strategy,
        )
    }
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("base", &self.base)
            .field("batch_id", &self.batch_id)
            .field("items", &self.items)
            .field("next_content_id", &self.next_content_id)
            .finish()
    }
}

/// Changeset under construction. Consumed by [`Changeset::end_changeset`]; dropping it discards
/// its items.
pub struct Changeset<'b> {
    batch: &'b mut BatchRequest,
    items: Vec<BatchItemSingle>,
}

impl<'b> Changeset<'b> {
    fn add(&mut self, request: ODataRequest, accepted: &[&str]) -> Result<&mut Self, ODataError> {
        let item = self.batch.single_item(request, accepted)?;
        self.items.push(item);
        Ok(self)
    }

    pub fn add_create(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add(request, &["create"])
    }

    /// Added as `PATCH` or `PUT` per the request's update strategy, with `If-Match` when it
    /// carries a version identifier.
    pub fn add_update(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add(request, &["update"])
    }

    pub fn add_delete(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add(request, &["delete"])
    }

    pub fn add_action(&mut self, request: ODataRequest) -> Result<&mut Self, ODataError> {
        self.add(request, &["action"])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn end_changeset(self) -> &'b mut BatchRequest {
        let id = (self.batch.uuid_provider)();
        debug!(changeset_id = %id, items = self.items.len(), "closed changeset");
        self.batch.items.push(BatchItem::Changeset(BatchChangeset {
            id,
            items: self.items,
        }));
        self.batch
    }
}

impl fmt::Debug for Changeset<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changeset")
            .field("batch_id", &self.batch.batch_id)
            .field("items", &self.items)
            .finish()
    }
}

/// Response of a batch request along with the batch it answers.
#[derive(Debug)]
pub struct BatchResponse {
    response: ODataResponse,
    batch: BatchRequest,
}

impl BatchResponse {
    pub fn response(&self) -> &ODataResponse {
        &self.response
    }

    pub fn batch(&self) -> &BatchRequest {
        &self.batch
    }

    /// Every sub-response in wire order, each validated on its own.
    ///
    /// Sub-responses are matched to their requests by Content-ID, falling back to their
    /// position. A failing sub-response yields an error whose request is the matched item.
    pub fn batched_responses(
        &self,
    ) -> Result<Vec<Result<ODataResponse, ODataError>>, ODataError> {
        let mut parser = MultipartParser::from_response(&self.response)
            .map_err(|error| error.or_request(|| self.response.summary().clone()))?;

        let mut responses = Vec::new();
        let mut batch_index = 0;
        while let Some(mut part) = parser.next_part()? {
            let mut changeset_index = 0;
            while let Some(entry) = part.next_entry()? {
                let item = match entry.content_id() {
                    Some(content_id) => self.batch.single_by_content_id(content_id),
                    None => None,
                }
                .or_else(|| {
                    warn!(
                        batch_index,
                        changeset_index,
                        "sub-response without known Content-ID, correlating by position"
                    );
                    self.positional_item(batch_index, changeset_index)
                });

                let (request, summary) = match item {
                    Some(item) => (Some(item.request.clone()), item.summary()),
                    None => (None, self.response.summary().clone()),
                };
                let response = entry.to_raw_response().and_then(|raw| {
                    let response = ODataResponse::new(request, summary, raw, None);
                    response.require_healthy()?;
                    Ok(response)
                });
                responses.push(
                    response.map_err(|error| error.or_request(|| self.response.summary().clone())),
                );
                changeset_index += 1;
            }
            batch_index += 1;
        }
        debug!(count = responses.len(), "read batch sub-responses");
        Ok(responses)
    }

    /// A failed changeset is answered by a single response in place of the changeset.
    fn positional_item(
        &self,
        batch_index: usize,
        changeset_index: usize,
    ) -> Option<&BatchItemSingle> {
        self.batch
            .items
            .get(batch_index)
            .and_then(|item| item.singles().get(changeset_index))
    }

    /// The sub-response for the request that was assigned `content_id`.
    pub fn response_for(&self, content_id: u32) -> Result<ODataResponse, ODataError> {
        for response in self.batched_responses()? {
            let locus = match &response {
                Ok(response) => response.summary().content_id,
                Err(error) => error.request().and_then(|request| request.content_id),
            };
            if locus == Some(content_id) {
                return response;
            }
        }
        Err(ODataError::deserialization(format!(
            "batch response does not contain a sub-response for Content-ID {content_id}"
        ))
        .with_request(self.response.summary().clone()))
    }

    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        self.response.on_close(handler);
    }

    pub fn close(&self) -> Result<(), ODataError> {
        self.response.close()
    }
}
