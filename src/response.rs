use std::fmt;
use std::io::{Cursor, Read};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::de::{DeserializeOwned, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ODataError, RequestSummary};
use crate::headers::{HeaderMap, HEADER_CONTENT_TYPE, HEADER_ETAG};
use crate::protocol::{JsonPath, ODataProtocol};
use crate::request::{ODataRequest, RequestModel};
use crate::service_error::ODataServiceError;
use crate::transport::{RawResponse, ResponseBody, SharedTransport, TransportError};
use crate::uri::raw_query;

enum BodyState {
    /// Not touched yet. `None` means the response carries no entity at all.
    Pending(Option<ResponseBody>),
    Buffered(Bytes),
    Consumed,
}

struct BodyCell {
    buffering: bool,
    state: BodyState,
}

type CloseHandler = Box<dyn FnOnce() + Send>;

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Result of executing a request: status, headers and a lazily read body.
///
/// By default the body is buffered on first access and can be decoded any number of times.
/// With buffering disabled it can be read exactly once.
///
/// Responses hold on to the transport's connection until the body is read to the end. Call
/// [`ODataResponse::close`] once done with an unbuffered response; dropping it does not run the
/// registered close handlers.
pub struct ODataResponse {
    request: Option<ODataRequest>,
    summary: RequestSummary,
    status: u16,
    reason: String,
    headers: HeaderMap,
    has_entity: bool,
    body: Mutex<BodyCell>,
    transport: Option<SharedTransport>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    closed: AtomicBool,
}

impl ODataResponse {
    /// Wrap `raw`, produced for `request`. Without a transport, pagination is unavailable.
    pub fn new(
        request: Option<ODataRequest>,
        summary: RequestSummary,
        raw: RawResponse,
        transport: Option<SharedTransport>,
    ) -> Self {
        let buffering = request
            .as_ref()
            .map_or(true, |request| request.base().buffer_response);
        let RawResponse {
            status,
            reason,
            headers,
            body,
        } = raw;
        Self {
            request,
            summary,
            status,
            reason,
            headers,
            has_entity: body.is_some(),
            body: Mutex::new(BodyCell {
                buffering,
                state: BodyState::Pending(body),
            }),
            transport,
            close_handlers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn request(&self) -> Option<&ODataRequest> {
        self.request.as_ref()
    }

    /// The request this response belongs to, as reported in errors.
    pub fn summary(&self) -> &RequestSummary {
        &self.summary
    }

    pub fn protocol(&self) -> ODataProtocol {
        self.summary.protocol
    }

    /// Whether the response carries an entity, possibly empty.
    pub fn has_payload(&self) -> bool {
        self.has_entity
    }

    /// Stop buffering the body. Only honoured before the body was first accessed.
    pub fn disable_buffering(&self) {
        let mut cell = lock_unpoisoned(&self.body);
        match cell.state {
            BodyState::Pending(_) => cell.buffering = false,
            _ => warn!(
                "buffering the HTTP response cannot be disabled, \
                 the content has already been accessed"
            ),
        }
    }

    /// Reader over the body. Buffered responses hand out a fresh reader over the same bytes on
    /// every call; unbuffered responses fail on the second call.
    pub fn body_reader(&self) -> Result<ResponseBody, ODataError> {
        let mut cell = lock_unpoisoned(&self.body);
        let buffering = cell.buffering;
        match std::mem::replace(&mut cell.state, BodyState::Consumed) {
            BodyState::Pending(None) => {
                cell.state = BodyState::Pending(None);
                Err(self.error(ODataError::deserialization(
                    "HTTP response does not contain a content.",
                )))
            }
            BodyState::Pending(Some(mut body)) if buffering => {
                let mut buffer = Vec::new();
                let read = body.read_to_end(&mut buffer);
                if let Err(source) = read {
                    return Err(self.error(ODataError::connection(
                        "failed to buffer the HTTP response body",
                        TransportError::Io(source),
                    )));
                }
                debug!(bytes = buffer.len(), "buffered HTTP response body");
                let bytes = Bytes::from(buffer);
                cell.state = BodyState::Buffered(bytes.clone());
                Ok(Box::new(Cursor::new(bytes)))
            }
            BodyState::Pending(Some(body)) => {
                debug!("buffering is disabled, handing out the response stream");
                Ok(body)
            }
            BodyState::Buffered(bytes) => {
                cell.state = BodyState::Buffered(bytes.clone());
                Ok(Box::new(Cursor::new(bytes)))
            }
            BodyState::Consumed => Err(self.error(ODataError::deserialization(
                "the HTTP response body has already been consumed and was not buffered",
            ))),
        }
    }

    /// The whole body as bytes.
    pub fn body_bytes(&self) -> Result<Bytes, ODataError> {
        let mut reader = self.body_reader()?;
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).map_err(|source| {
            self.error(ODataError::connection(
                "failed to read the HTTP response body",
                TransportError::Io(source),
            ))
        })?;
        Ok(Bytes::from(buffer))
    }

    /// The whole body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> Result<String, ODataError> {
        let bytes = self.body_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn error(&self, error: ODataError) -> ODataError {
        error.or_request(|| self.summary.clone())
    }

    /// Fail for status codes of 400 and above, preferring a structured service error when the
    /// body carries one.
    pub fn require_healthy(&self) -> Result<(), ODataError> {
        if self.status < 400 {
            return Ok(());
        }

        let body = if self.has_entity {
            self.body_bytes().ok()
        } else {
            None
        };
        let text = body
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        let service_error = body
            .as_deref()
            .and_then(|bytes| ODataServiceError::parse(self.protocol(), bytes));

        debug!(
            status = self.status,
            structured = service_error.is_some(),
            "unhealthy OData response"
        );
        let error = match service_error {
            Some(service_error) => ODataError::structured(self.status, service_error, text),
            None => ODataError::unhealthy(self.status, text),
        };
        Err(self.error(error))
    }

    fn assert_payload(&self) -> Result<(), ODataError> {
        if self.has_entity {
            return Ok(());
        }
        Err(self.error(ODataError::deserialization(format!(
            "{} response did not contain any payload.",
            self.protocol()
        ))))
    }

    fn unreadable(&self, shape: &str) -> ODataError {
        debug!(
            protocol = %self.protocol(),
            shape,
            "response cannot be read in the requested shape"
        );
        self.error(ODataError::deserialization(format!(
            "Unable to read {} response.",
            self.protocol()
        )))
    }

    fn json_root(&self) -> Result<Value, ODataError> {
        self.assert_payload()?;
        let reader = self.body_reader()?;
        serde_json::from_reader(reader).map_err(|source| {
            self.error(ODataError::json(
                format!("Failed to parse {} response.", self.protocol()),
                source,
            ))
        })
    }

    fn is_plain_text(&self) -> bool {
        self.headers
            .get(HEADER_CONTENT_TYPE)
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .is_some_and(|mime| mime.essence_str() == mime::TEXT_PLAIN.essence_str())
    }

    /// The response's single entity as a JSON object.
    pub fn as_object(&self) -> Result<Value, ODataError> {
        let root = self.json_root()?;
        match lookup(&root, self.protocol().single_path()) {
            Some(entity @ Value::Object(_)) => Ok(entity.clone()),
            _ => Err(self.unreadable("single entity")),
        }
    }

    /// Field name to value view of the single entity.
    pub fn as_map(&self) -> Result<Map<String, Value>, ODataError> {
        match self.as_object()? {
            Value::Object(map) => Ok(map),
            _ => Err(self.unreadable("map")),
        }
    }

    /// The single entity decoded into `T`.
    pub fn as_entity<T: DeserializeOwned>(&self) -> Result<T, ODataError> {
        let entity = self.as_object()?;
        serde_json::from_value(entity).map_err(|source| {
            self.error(ODataError::json("Failed to deserialize a complex object.", source))
        })
    }

    /// A primitive result decoded into `T`.
    ///
    /// `text/plain` bodies are decoded from the body text directly; text that is not valid JSON
    /// is taken as a string.
    pub fn as_primitive<T: DeserializeOwned>(&self) -> Result<T, ODataError> {
        let value = if self.is_plain_text() {
            self.assert_payload()?;
            let text = self.body_text()?;
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            let root = self.json_root()?;
            self.primitive_value(&root)
                .ok_or_else(|| self.unreadable("primitive"))?
        };

        if value.is_null() {
            return Err(self.error(ODataError::deserialization("The response is null.")));
        }
        serde_json::from_value(value).map_err(|source| {
            self.error(ODataError::json("Failed to deserialize a primitive object.", source))
        })
    }

    fn primitive_value(&self, root: &Value) -> Option<Value> {
        let found = lookup(root, self.protocol().primitive_path());
        let value = match (self.protocol(), found) {
            // `{"d": {"FunctionName": 42}}`
            (ODataProtocol::V2, Some(Value::Object(wrapper))) if wrapper.len() == 1 => {
                wrapper.values().next()
            }
            (_, Some(value)) => Some(value),
            (ODataProtocol::V4, None) if !root.is_object() => Some(root),
            _ => None,
        }?;
        match value {
            Value::Object(_) | Value::Array(_) => None,
            primitive => Some(primitive.clone()),
        }
    }

    /// Elements of a collection response, entities or primitives alike.
    pub fn as_collection(&self) -> Result<Vec<Value>, ODataError> {
        let root = self.json_root()?;
        let protocol = self.protocol();
        let elements = lookup(&root, protocol.result_set_path()).or_else(|| match protocol {
            ODataProtocol::V2 => lookup(&root, protocol.single_path()),
            ODataProtocol::V4 => None,
        });
        match elements {
            Some(Value::Array(elements)) => Ok(elements.clone()),
            _ => Err(self.unreadable("collection")),
        }
    }

    /// Collection elements decoded into `T`.
    pub fn as_list<T: DeserializeOwned>(&self) -> Result<Vec<T>, ODataError> {
        self.as_collection()?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|source| {
                self.error(ODataError::json(
                    format!("Failed to parse {} result to a list.", self.protocol()),
                    source,
                ))
            })
    }

    pub fn as_list_of_maps(&self) -> Result<Vec<Map<String, Value>>, ODataError> {
        self.as_list()
    }

    /// Decode the result set one element at a time without materializing the whole payload.
    /// Returns the number of elements handed to `handler`.
    pub fn stream_elements<T, F>(&self, mut handler: F) -> Result<usize, ODataError>
    where
        T: DeserializeOwned,
        F: FnMut(T),
    {
        self.assert_payload()?;
        let reader = self.body_reader()?;
        let mut deserializer = serde_json::Deserializer::from_reader(reader);
        let seed = StreamSeed {
            path: self.protocol().result_set_path(),
            handler: &mut handler,
            marker: PhantomData::<fn() -> T>,
        };
        let parse_error = |source| {
            self.error(ODataError::json(
                format!("Failed to parse {} response.", self.protocol()),
                source,
            ))
        };
        let count = seed.deserialize(&mut deserializer).map_err(parse_error)?;
        deserializer.end().map_err(parse_error)?;

        let count = count.ok_or_else(|| self.unreadable("streamed collection"))?;
        debug!(count, "iterated result set elements");
        Ok(count)
    }

    /// Total count the service reported next to the page.
    pub fn inline_count(&self) -> Result<u64, ODataError> {
        let root = self.json_root()?;
        let count =
            lookup(&root, self.protocol().inline_count_path()).and_then(|value| match value {
                Value::Number(number) => number.as_u64(),
                Value::String(text) => text.parse().ok(),
                _ => None,
            });
        count.ok_or_else(|| {
            self.error(ODataError::deserialization(format!(
                "Inline count not found in {} response payload.",
                self.protocol()
            )))
        })
    }

    fn link_at(&self, path: JsonPath) -> Result<Option<String>, ODataError> {
        let root = self.json_root()?;
        Ok(lookup(&root, path)
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .map(str::to_owned))
    }

    /// Link to the next page of the result set, if there is one.
    pub fn next_link(&self) -> Result<Option<String>, ODataError> {
        let link = self.link_at(self.protocol().next_link_path())?;
        match &link {
            Some(link) => debug!(link = %link, "found reference to next page"),
            None => debug!("result does not reference any further pages"),
        }
        Ok(link)
    }

    /// Delta link for change tracking. Always `None` for V2.
    pub fn delta_link(&self) -> Result<Option<String>, ODataError> {
        let Some(path) = self.protocol().delta_link_path() else {
            return Ok(None);
        };
        self.link_at(path)
    }

    /// First non-empty `ETag` header value.
    pub fn version_identifier_from_header(&self) -> Option<&str> {
        self.headers
            .get_all(HEADER_ETAG)
            .iter()
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }

    fn next_page(&self) -> Result<Option<(ODataRequest, SharedTransport)>, ODataError> {
        let Some(link) = self.next_link()? else {
            return Ok(None);
        };
        let request = self
            .request
            .as_ref()
            .filter(|request| request.is_read())
            .ok_or_else(|| {
                self.error(ODataError::request_construction(
                    "Pagination is only applicable for read requests.",
                ))
            })?;
        let transport = self.transport.clone().ok_or_else(|| {
            self.error(ODataError::request_construction(
                "Unable to access response of next page: \
                 no transport was provided when creating this response.",
            ))
        })?;

        let query = raw_query(&link).unwrap_or_default();
        debug!(protocol = %self.protocol(), query, "querying next page");
        let mut next = ODataRequest::read(
            request.service_path(),
            request.resource_path().clone(),
            query,
            request.protocol(),
        );
        next.base.headers = request.headers().clone();
        next.base.csrf = request.base.csrf.clone();
        next.base.listeners = request.base.listeners.clone();
        next.base.buffer_response = request.base.buffer_response;
        Ok(Some((next, transport)))
    }

    /// Request and execute the next page of the result set.
    pub fn try_next_page(&self) -> Result<ODataResponse, ODataError> {
        match self.next_page()? {
            Some((request, transport)) => request.execute(&transport),
            None => Err(self.error(ODataError::request_construction(
                "Current page of result-set does not reference a next page.",
            ))),
        }
    }

    /// One-shot iterator over this page and every page reachable through next links.
    ///
    /// Iteration stops after the first error, which is yielded.
    pub fn pages(self) -> Pages {
        Pages {
            state: PageState::First(Box::new(self)),
        }
    }

    /// Register a handler run once by [`ODataResponse::close`].
    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        lock_unpoisoned(&self.close_handlers).push(Box::new(handler));
    }

    /// Release the response: drain an unread body and run the close handlers. Only the first
    /// call has an effect.
    pub fn close(&self) -> Result<(), ODataError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = {
            let mut cell = lock_unpoisoned(&self.body);
            match std::mem::replace(&mut cell.state, BodyState::Consumed) {
                BodyState::Pending(Some(mut body)) => {
                    std::io::copy(&mut body, &mut std::io::sink()).map(|_| ())
                }
                other => {
                    cell.state = other;
                    Ok(())
                }
            }
        };

        let handlers = std::mem::take(&mut *lock_unpoisoned(&self.close_handlers));
        debug!(handlers = handlers.len(), "closing OData response");
        for handler in handlers {
            handler();
        }

        drained.map_err(|source| {
            self.error(ODataError::connection(
                "failed to drain the HTTP response body",
                TransportError::Io(source),
            ))
        })
    }
}

impl fmt::Debug for ODataResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ODataResponse")
            .field("request", &self.summary)
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .field("has_entity", &self.has_entity)
            .finish()
    }
}

/// Walk `path` from `root`. Each level takes the first alternative name present.
fn lookup<'a>(root: &'a Value, path: JsonPath) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, names| {
        let object = current.as_object()?;
        names.iter().find_map(|name| object.get(*name))
    })
}

enum PageState {
    First(Box<ODataResponse>),
    Follow(ODataRequest, SharedTransport),
    Failed(ODataError),
    Done,
}

/// Iterator returned by [`ODataResponse::pages`].
pub struct Pages {
    state: PageState,
}

impl Pages {
    fn follow_up(response: &ODataResponse) -> PageState {
        match response.next_page() {
            Ok(Some((request, transport))) => PageState::Follow(request, transport),
            Ok(None) => PageState::Done,
            Err(error) => PageState::Failed(error),
        }
    }
}

impl Iterator for Pages {
    type Item = Result<ODataResponse, ODataError>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, PageState::Done) {
            PageState::First(response) => {
                self.state = Self::follow_up(&response);
                Some(Ok(*response))
            }
            PageState::Follow(request, transport) => {
                let page = request.execute(&transport);
                if let Ok(response) = &page {
                    self.state = Self::follow_up(response);
                }
                Some(page)
            }
            PageState::Failed(error) => Some(Err(error)),
            PageState::Done => None,
        }
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PageState::First(_) => "first",
            PageState::Follow(..) => "follow",
            PageState::Failed(_) => "failed",
            PageState::Done => "done",
        };
        f.debug_struct("Pages").field("state", &state).finish()
    }
}

/// Descends along a [`JsonPath`] and feeds the array found there to a handler, element by
/// element. Yields `None` when the path does not exist.
struct StreamSeed<'h, T, F> {
    path: JsonPath,
    handler: &'h mut F,
    marker: PhantomData<fn() -> T>,
}

impl<'de, T, F> DeserializeSeed<'de> for StreamSeed<'_, T, F>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    type Value = Option<usize>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match self.path.split_first() {
            None => deserializer
                .deserialize_seq(ElementVisitor {
                    handler: self.handler,
                    marker: PhantomData::<fn() -> T>,
                })
                .map(Some),
            Some((names, rest)) => deserializer.deserialize_map(LevelVisitor {
                names,
                rest,
                handler: self.handler,
                marker: PhantomData::<fn() -> T>,
            }),
        }
    }
}

struct LevelVisitor<'h, T, F> {
    names: &'static [&'static str],
    rest: JsonPath,
    handler: &'h mut F,
    marker: PhantomData<fn() -> T>,
}

impl<'de, T, F> Visitor<'de> for LevelVisitor<'_, T, F>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    type Value = Option<usize>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an object with one of the fields {:?}", self.names)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let Self {
            names,
            rest,
            handler,
            ..
        } = self;
        let mut found = None;
        while let Some(key) = map.next_key::<String>()? {
            if found.is_none() && names.contains(&key.as_str()) {
                found = map.next_value_seed(StreamSeed {
                    path: rest,
                    handler: &mut *handler,
                    marker: PhantomData::<fn() -> T>,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

struct ElementVisitor<'h, T, F> {
    handler: &'h mut F,
    marker: PhantomData<fn() -> T>,
}

impl<'de, T, F> Visitor<'de> for ElementVisitor<'_, T, F>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    type Value = usize;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a result set array")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let handler = self.handler;
        let mut count = 0;
        while let Some(element) = seq.next_element::<T>()? {
            handler(element);
            count += 1;
        }
        Ok(count)
    }
}
