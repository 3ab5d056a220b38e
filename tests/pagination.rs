use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use odata_client::{
    extract_skip_token, ODataErrorKind, ODataProtocol, ODataRequest, RequestModel,
    SharedTransport,
};
use odata_transport_mock::{ScriptedResponse, ScriptedTransport};
use pretty_assertions::assert_eq;
use serde::Deserialize;
use tracing_test::traced_test;

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(rename = "ID")]
    id: u32,
}

fn v4_page(ids: &[u32], next: Option<&str>) -> ScriptedResponse {
    let values: Vec<String> = ids.iter().map(|id| format!(r#"{{"ID":{id}}}"#)).collect();
    let mut body = format!(r#"{{"@odata.count":5,"value":[{}]"#, values.join(","));
    if let Some(next) = next {
        body.push_str(&format!(r#","@odata.nextLink":"{next}""#));
    }
    body.push('}');
    ScriptedResponse::json(body)
}

#[test]
fn pages_follow_next_links_until_exhausted() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(v4_page(&[1, 2], Some("Items?$skiptoken=2")))
            .with_response(v4_page(&[3, 4], Some("http://host/svc/Items?$skiptoken=4")))
            .with_response(v4_page(&[5], None)),
    );
    let shared: SharedTransport = transport.clone();
    let mut request = ODataRequest::read("/svc/", "Items", "$top=2", ODataProtocol::V4);
    request.add_header("sap-client", "001");

    let first = request.execute(&shared).expect("first page");
    assert_eq!(first.inline_count().expect("count"), 5);
    assert_eq!(
        first
            .next_link()
            .expect("link")
            .as_deref()
            .and_then(extract_skip_token),
        Some("2".to_string())
    );

    let mut ids = Vec::new();
    let mut pages = 0;
    for page in first.pages() {
        let page = page.expect("page");
        ids.extend(page.as_list::<Item>().expect("items").into_iter().map(|item| item.id));
        pages += 1;
    }

    assert_eq!(pages, 3);
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        transport.request_lines(),
        vec![
            "GET /svc/Items?$top=2".to_string(),
            "GET /svc/Items?$skiptoken=2".to_string(),
            "GET /svc/Items?$skiptoken=4".to_string(),
        ]
    );
    assert!(transport
        .requests()
        .iter()
        .all(|request| request.headers.get("sap-client") == Some("001")));
}

#[test]
fn v2_pages_read_next_link_from_envelope() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(ScriptedResponse::json(
                r#"{"d":{"__count":"2","results":[{"ID":1}],"__next":"Items?$skiptoken='1'"}}"#,
            ))
            .with_response(ScriptedResponse::json(r#"{"d":{"results":[{"ID":2}]}}"#)),
    );
    let shared: SharedTransport = transport.clone();
    let request = ODataRequest::read("/sap/API_SRV", "Items", "", ODataProtocol::V2);

    let first = request.execute(&shared).expect("first page");
    assert_eq!(first.inline_count().expect("count"), 2);
    assert_eq!(first.delta_link().expect("delta"), None);

    let second = first.try_next_page().expect("second page");
    assert_eq!(second.as_list::<Item>().expect("items")[0].id, 2);
    let error = second.try_next_page().expect_err("no further page");
    assert_matches!(error.kind(), ODataErrorKind::RequestConstruction { .. });

    assert_eq!(
        transport.request_lines()[1],
        "GET /sap/API_SRV/Items?$skiptoken='1'"
    );
}

#[test]
fn pages_stop_after_unhealthy_follow_up() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(v4_page(&[1], Some("Items?$skiptoken=1")))
            .with_response(ScriptedResponse::new(500).with_body("backend down"))
            .with_response(v4_page(&[2], None)),
    );
    let shared: SharedTransport = transport.clone();
    let request = ODataRequest::read("/svc/", "Items", "", ODataProtocol::V4);

    let pages: Vec<_> = request.execute(&shared).expect("first page").pages().collect();

    assert_eq!(pages.len(), 2);
    assert!(pages[0].is_ok());
    let error = pages[1].as_ref().expect_err("second page fails");
    assert_eq!(error.status_code(), Some(500));
    assert_eq!(error.http_body(), Some("backend down"));
    assert_eq!(transport.remaining(), 1);
}

#[test]
fn pagination_requires_read_request() {
    let transport = Arc::new(ScriptedTransport::new().with_response(
        ScriptedResponse::json(r#"{"value":[],"@odata.nextLink":"Items?$skiptoken=1"}"#),
    ));
    let shared: SharedTransport = transport.clone();
    let request = ODataRequest::function(
        "/svc/",
        "TopItems",
        odata_client::ParameterSet::function_parameters(ODataProtocol::V4),
        ODataProtocol::V4,
    );

    let response = request.execute(&shared).expect("function");
    let error = response.try_next_page().expect_err("functions do not page");
    assert!(error
        .to_string()
        .contains("Pagination is only applicable for read requests."));
}

#[test]
fn buffered_body_is_read_lazily_and_reused() {
    let body = r#"{"value":[{"ID":1},{"ID":2}]}"#;
    let transport = Arc::new(ScriptedTransport::new().with_response(ScriptedResponse::json(body)));
    let shared: SharedTransport = transport.clone();
    let request = ODataRequest::read("/svc/", "Items", "", ODataProtocol::V4);

    let response = request.execute(&shared).expect("read");
    assert_eq!(transport.bytes_read(), 0);

    assert_eq!(response.as_collection().expect("first decode").len(), 2);
    assert_eq!(transport.bytes_read(), body.len());
    assert_eq!(response.as_list_of_maps().expect("second decode").len(), 2);
    assert_eq!(response.body_text().expect("text"), body);
    assert_eq!(transport.bytes_read(), body.len());
}

#[test]
fn unbuffered_body_streams_once() {
    let transport = Arc::new(ScriptedTransport::new().with_response(ScriptedResponse::json(
        r#"{"value":[{"ID":1},{"ID":2},{"ID":3}]}"#,
    )));
    let shared: SharedTransport = transport.clone();
    let mut request = ODataRequest::read("/svc/", "Items", "", ODataProtocol::V4);
    request.disable_buffering();

    let response = request.execute(&shared).expect("read");
    let mut seen = Vec::new();
    let count = response
        .stream_elements(|item: Item| seen.push(item.id))
        .expect("stream");

    assert_eq!(count, 3);
    assert_eq!(seen, vec![1, 2, 3]);
    let error = response.as_collection().expect_err("stream already consumed");
    assert!(error.to_string().contains("already been consumed"));
}

#[test]
#[traced_test]
fn disabling_buffering_after_access_only_warns() {
    let transport = Arc::new(
        ScriptedTransport::new().with_response(ScriptedResponse::json(r#"{"value":[]}"#)),
    );
    let shared: SharedTransport = transport.clone();
    let request = ODataRequest::read("/svc/", "Items", "", ODataProtocol::V4);

    let response = request.execute(&shared).expect("read");
    response.as_collection().expect("decode");
    response.disable_buffering();

    assert!(response.as_collection().is_ok());
    assert!(logs_contain("buffering the HTTP response cannot be disabled"));
}

#[test]
fn close_drains_body_and_runs_handlers_once() {
    let body = r#"{"value":[{"ID":1}]}"#;
    let transport = Arc::new(ScriptedTransport::new().with_response(ScriptedResponse::json(body)));
    let shared: SharedTransport = transport.clone();
    let mut request = ODataRequest::read("/svc/", "Items", "", ODataProtocol::V4);
    request.disable_buffering();

    let response = request.execute(&shared).expect("read");
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    response.on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    response.close().expect("close");
    response.close().expect("second close is a no-op");

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(transport.bytes_read(), body.len());
}
