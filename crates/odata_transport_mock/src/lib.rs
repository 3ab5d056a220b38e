//! Deterministic scripted implementation of the `odata_client` transport contract.
//!
//! This crate performs no network I/O. Responses are replayed in the order they were queued and
//! every executed request is recorded for later inspection, which makes it suitable for
//! contract-level integration testing of the engine.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use odata_client::{HeaderMap, HttpMethod, HttpRequest, RawResponse, Transport, TransportError};

/// One queued reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Respond(ScriptedResponse),
    /// The transport call itself fails with a protocol error carrying this message.
    Fail(String),
}

/// Status line, headers and optional body of a replayed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ScriptedResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_for(status).to_string(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(body.into())
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Transport that replays queued replies and records what it was asked to send.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<HttpRequest>>,
    bytes_read: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ScriptedTransport::push`].
    #[must_use]
    pub fn with_response(self, response: ScriptedResponse) -> Self {
        self.push(response);
        self
    }

    #[must_use]
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push_failure(message);
        self
    }

    pub fn push(&self, response: ScriptedResponse) {
        lock_unpoisoned(&self.replies).push_back(ScriptedReply::Respond(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        lock_unpoisoned(&self.replies).push_back(ScriptedReply::Fail(message.into()));
    }

    /// Requests executed so far, oldest first.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    /// Methods and URIs of the executed requests, e.g. `GET /svc/People`.
    pub fn request_lines(&self) -> Vec<String> {
        lock_unpoisoned(&self.requests)
            .iter()
            .map(|request| format!("{} {}", request.method, request.uri))
            .collect()
    }

    /// Replies still waiting in the queue.
    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.replies).len()
    }

    /// Total number of body bytes consumers have pulled from replayed responses.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<RawResponse, TransportError> {
        lock_unpoisoned(&self.requests).push(request.clone());

        let reply = lock_unpoisoned(&self.replies).pop_front();
        match reply {
            Some(ScriptedReply::Respond(response)) => {
                let raw = RawResponse::new(response.status, response.reason)
                    .with_headers(response.headers);
                Ok(match response.body {
                    Some(bytes) => raw.with_body(Box::new(CountingBody {
                        inner: io::Cursor::new(bytes),
                        counter: Arc::clone(&self.bytes_read),
                    })),
                    None => raw,
                })
            }
            Some(ScriptedReply::Fail(message)) => Err(TransportError::Protocol(message)),
            None => Err(TransportError::Protocol(format!(
                "no scripted response left for {} {}",
                request.method, request.uri
            ))),
        }
    }
}

struct CountingBody {
    inner: io::Cursor<Vec<u8>>,
    counter: Arc<AtomicUsize>,
}

impl Read for CountingBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.counter.fetch_add(read, Ordering::SeqCst);
        Ok(read)
    }
}

fn reason_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        412 => "Precondition Failed",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// `true` when the method is one the engine sends with a body.
pub fn carries_body(method: HttpMethod) -> bool {
    matches!(method, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_replayed_in_order_and_requests_recorded() {
        let transport = ScriptedTransport::new()
            .with_response(ScriptedResponse::json(r#"{"value":[]}"#))
            .with_response(ScriptedResponse::new(204));

        let first = transport
            .execute(&HttpRequest::new(HttpMethod::Get, "/svc/People"))
            .expect("first reply should be scripted");
        assert_eq!(first.status, 200);
        assert_eq!(first.reason, "OK");
        assert_eq!(first.headers.get("content-type"), Some("application/json"));

        let mut body = String::new();
        first
            .body
            .expect("json reply should carry a body")
            .read_to_string(&mut body)
            .expect("body should be readable");
        assert_eq!(body, r#"{"value":[]}"#);
        assert_eq!(transport.bytes_read(), body.len());

        let second = transport
            .execute(&HttpRequest::new(HttpMethod::Delete, "/svc/People(1)"))
            .expect("second reply should be scripted");
        assert_eq!(second.status, 204);
        assert!(second.body.is_none());

        assert_eq!(
            transport.request_lines(),
            vec!["GET /svc/People".to_string(), "DELETE /svc/People(1)".to_string()]
        );
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn exhausted_queue_reports_protocol_error() {
        let transport = ScriptedTransport::new();
        let error = transport
            .execute(&HttpRequest::new(HttpMethod::Get, "/svc/Missing"))
            .expect_err("empty queue must fail");

        assert!(matches!(
            error,
            TransportError::Protocol(ref message) if message.contains("GET /svc/Missing")
        ));
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn scripted_failures_surface_as_transport_errors() {
        let transport = ScriptedTransport::new().with_failure("connection reset");
        let error = transport
            .execute(&HttpRequest::new(HttpMethod::Head, "/svc/"))
            .expect_err("failure should be replayed");

        assert_eq!(error.to_string(), "protocol violation: connection reset");
    }

    #[test]
    fn body_methods_are_classified() {
        assert!(carries_body(HttpMethod::Post));
        assert!(carries_body(HttpMethod::Patch));
        assert!(!carries_body(HttpMethod::Get));
        assert!(!carries_body(HttpMethod::Delete));
    }
}
