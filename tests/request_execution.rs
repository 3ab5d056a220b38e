use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use odata_client::{
    DisabledCsrfTokenRetriever, HttpMethod, HttpRequest, ODataError, ODataErrorKind,
    ODataProtocol, ODataRequest, ParameterSet, RequestListener, RequestModel, ResourcePath,
    SharedTransport, UpdateStrategy,
};
use odata_transport_mock::{carries_body, ScriptedResponse, ScriptedTransport};
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::json;

fn shared(transport: &Arc<ScriptedTransport>) -> SharedTransport {
    transport.clone()
}

#[derive(Default)]
struct RecordingListener {
    requests: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RequestListener for RecordingListener {
    fn on_request(&self, request: &HttpRequest) {
        self.requests
            .lock()
            .expect("listener lock")
            .push(format!("{} {}", request.method, request.uri));
    }

    fn on_error(&self, error: &ODataError) {
        self.errors
            .lock()
            .expect("listener lock")
            .push(error.to_string());
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct Person {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
}

#[test]
fn read_by_key_decodes_typed_entity() {
    let transport = Arc::new(ScriptedTransport::new().with_response(
        ScriptedResponse::json(r#"{"ID":42,"Name":"Ada"}"#).with_header("ETag", "W/\"3\""),
    ));
    let key = ParameterSet::entity_key(ODataProtocol::V4)
        .with("ID", 42)
        .expect("key");
    let request = ODataRequest::read_by_key("/svc/", "People", key, "", ODataProtocol::V4);

    let response = request.execute(&shared(&transport)).expect("read by key");
    let person: Person = response.as_entity().expect("typed entity");

    assert_eq!(
        person,
        Person {
            id: 42,
            name: "Ada".to_string()
        }
    );
    assert_eq!(response.version_identifier_from_header(), Some("W/\"3\""));
    assert_eq!(transport.request_lines(), vec!["GET /svc/People(42)".to_string()]);

    let sent = &transport.requests()[0];
    assert_eq!(sent.headers.get("Accept"), Some("application/json"));
    assert!(sent.body.is_none());
}

#[test]
fn v2_function_places_parameters_in_query() {
    let transport = Arc::new(
        ScriptedTransport::new().with_response(ScriptedResponse::json(r#"{"d":{"IsHappy":true}}"#)),
    );
    let parameters = ParameterSet::function_parameters(ODataProtocol::V2)
        .with("stringParameter", "t'est")
        .expect("parameter");
    let request = ODataRequest::function(
        "/sap/opu/odata/sap/API_TEST_SRV",
        "TestFunctionImport",
        parameters,
        ODataProtocol::V2,
    );

    let response = request.execute(&shared(&transport)).expect("function call");
    let happy: bool = response.as_primitive().expect("primitive");

    assert!(happy);
    assert_eq!(
        transport.request_lines(),
        vec![
            "GET /sap/opu/odata/sap/API_TEST_SRV/TestFunctionImport?stringParameter='t''est'"
                .to_string()
        ]
    );
}

#[test]
fn count_reads_plain_text_primitive() {
    let transport = Arc::new(ScriptedTransport::new().with_response(
        ScriptedResponse::new(200)
            .with_header("Content-Type", "text/plain;charset=utf-8")
            .with_body("17"),
    ));
    let mut request = ODataRequest::count("/svc/", "People", "", ODataProtocol::V4);
    request.add_query_parameter("sap-client", "001");

    let response = request.execute(&shared(&transport)).expect("count");
    let count: u64 = response.as_primitive().expect("count value");

    assert_eq!(count, 17);
    assert_eq!(
        transport.request_lines(),
        vec!["GET /svc/People/$count?sap-client=001".to_string()]
    );
}

#[test]
fn create_fetches_csrf_token_before_sending() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(ScriptedResponse::new(200).with_header("x-csrf-token", "foobar"))
            .with_response(ScriptedResponse::new(201).with_body(r#"{"ID":7,"Name":"Grace"}"#)),
    );
    let mut request = ODataRequest::create(
        "/service/",
        "People",
        json!({"Name": "Grace"}).to_string(),
        ODataProtocol::V4,
    );
    request.add_header("Authorization", "Basic abc");

    let response = request.execute(&shared(&transport)).expect("create");
    assert_eq!(response.status_code(), 201);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);

    let preflight = &requests[0];
    assert_eq!(preflight.method, HttpMethod::Head);
    assert_eq!(preflight.uri, "/service/");
    assert_eq!(preflight.headers.get("x-csrf-token"), Some("fetch"));
    assert_eq!(preflight.headers.get("Authorization"), Some("Basic abc"));
    assert!(!preflight.headers.contains("Accept"));

    let create = &requests[1];
    assert_eq!(create.method, HttpMethod::Post);
    assert!(carries_body(create.method));
    assert_eq!(create.uri, "/service/People");
    assert_eq!(create.headers.get("x-csrf-token"), Some("foobar"));
    assert_eq!(create.headers.get("Content-Type"), Some("application/json"));
    assert_eq!(create.body.as_deref(), Some(r#"{"Name":"Grace"}"#));

    let executed = response.request().expect("executed request");
    assert_eq!(executed.headers().get("x-csrf-token"), Some("foobar"));
}

#[test]
fn preset_csrf_token_skips_preflight() {
    let transport =
        Arc::new(ScriptedTransport::new().with_response(ScriptedResponse::new(204)));
    let key = ParameterSet::entity_key(ODataProtocol::V4)
        .with("ID", 1)
        .expect("key");
    let mut request = ODataRequest::delete(
        "/svc/",
        ResourcePath::of_key("People", key),
        ODataProtocol::V4,
    );
    request.add_header("x-csrf-token", "preset");

    request.execute(&shared(&transport)).expect("delete");

    assert_eq!(transport.request_lines(), vec!["DELETE /svc/People(1)".to_string()]);
    assert_eq!(transport.requests()[0].headers.get("x-csrf-token"), Some("preset"));
}

#[test]
fn disabled_csrf_retriever_skips_preflight() {
    let transport =
        Arc::new(ScriptedTransport::new().with_response(ScriptedResponse::new(204)));
    let key = ParameterSet::entity_key(ODataProtocol::V4)
        .with("ID", 1)
        .expect("key");
    let mut request = ODataRequest::update(
        "/svc/",
        ResourcePath::of_key("People", key),
        r#"{"Name":"x"}"#,
        UpdateStrategy::ReplaceWithPut,
        ODataProtocol::V4,
    )
    .with_version_identifier("W/\"5\"");
    request.with_csrf_token_retriever(Arc::new(DisabledCsrfTokenRetriever));

    request.execute(&shared(&transport)).expect("update");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, HttpMethod::Put);
    assert_eq!(requests[0].headers.get("If-Match"), Some("W/\"5\""));
    assert!(!requests[0].headers.contains("x-csrf-token"));
}

#[test]
fn failed_preflight_does_not_block_the_request() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(ScriptedResponse::new(403))
            .with_response(ScriptedResponse::new(200).with_body("{}")),
    );
    let request = ODataRequest::action("/svc/", "Reset", None, ODataProtocol::V4);

    request.execute(&shared(&transport)).expect("action succeeds without token");

    let requests = transport.requests();
    assert_eq!(requests[1].method, HttpMethod::Post);
    assert_eq!(requests[1].body.as_deref(), Some("{}"));
    assert!(!requests[1].headers.contains("x-csrf-token"));
}

#[test]
fn failed_preflight_becomes_secondary_cause_of_failed_request() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_failure("connection refused")
            .with_response(ScriptedResponse::new(500).with_body("boom")),
    );
    let request = ODataRequest::create("/svc/", "People", "{}", ODataProtocol::V4);

    let error = request
        .execute(&shared(&transport))
        .expect_err("both calls fail");

    assert_matches!(
        error.kind(),
        ODataErrorKind::UnhealthyResponse { status: 500, body: Some(body) } if body == "boom"
    );
    assert_eq!(error.secondary().len(), 1);
    assert_matches!(error.secondary()[0].kind(), ODataErrorKind::Connection { .. });
    assert_eq!(error.request().map(|request| request.relative_uri.as_str()), Some("/svc/People"));
}

#[test]
fn service_error_payload_is_exposed_with_request_locus() {
    let body = json!({
        "error": {
            "code": "E_KEY",
            "message": "Entity not found",
            "target": "ID",
            "details": [{"code": "E_DETAIL", "message": "no such key"}]
        }
    });
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(ScriptedResponse::new(404).with_body(body.to_string())),
    );
    let key = ParameterSet::entity_key(ODataProtocol::V4)
        .with("ID", 99)
        .expect("key");
    let request = ODataRequest::read_by_key("/svc/", "People", key, "", ODataProtocol::V4);

    let error = request.execute(&shared(&transport)).expect_err("404");

    assert_eq!(error.status_code(), Some(404));
    let service_error = error.service_error().expect("structured error");
    assert_eq!(service_error.code, "E_KEY");
    assert_eq!(service_error.message, "Entity not found");
    assert_eq!(service_error.target.as_deref(), Some("ID"));
    assert_eq!(service_error.details.len(), 1);
    assert_eq!(service_error.details[0].code, "E_DETAIL");

    let locus = error.request().expect("request locus");
    assert_eq!(locus.method, HttpMethod::Get);
    assert_eq!(locus.relative_uri, "/svc/People(99)");
    assert_eq!(error.http_body(), Some(body.to_string().as_str()));
}

#[test]
fn v2_service_error_message_is_flattened() {
    let body = r#"{"error":{"code":"SY/530","message":{"lang":"en","value":"Order locked"},"innererror":{"errordetails":[{"code":"LOCK","message":"Locked by USER1"}]}}}"#;
    let transport = Arc::new(
        ScriptedTransport::new().with_response(ScriptedResponse::new(400).with_body(body)),
    );
    let request = ODataRequest::read("/sap/opu/odata/sap/API_SRV", "Orders", "", ODataProtocol::V2);

    let error = request.execute(&shared(&transport)).expect_err("400");
    let service_error = error.service_error().expect("structured error");

    assert_eq!(service_error.code, "SY/530");
    assert_eq!(service_error.message, "Order locked");
    assert_eq!(service_error.details.len(), 1);
    assert_eq!(service_error.details[0].message, "Locked by USER1");
}

#[test]
fn transport_failure_is_a_connection_error() {
    let transport = Arc::new(ScriptedTransport::new().with_failure("socket closed"));
    let request = ODataRequest::read("/svc/", "People", "", ODataProtocol::V4);

    let error = request.execute(&shared(&transport)).expect_err("transport fails");

    assert_matches!(error.kind(), ODataErrorKind::Connection { .. });
    assert_eq!(error.status_code(), None);
    assert!(error.to_string().starts_with("connection failure: GET /svc/People failed"));
}

#[test]
fn listeners_observe_requests_and_errors() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_response(ScriptedResponse::json(r#"{"value":[]}"#))
            .with_response(ScriptedResponse::new(500)),
    );
    let listener = Arc::new(RecordingListener::default());

    let mut request = ODataRequest::read("/svc/", "People", "$top=1", ODataProtocol::V4);
    request.add_listener(listener.clone());

    request.execute(&shared(&transport)).expect("first call");
    request.execute(&shared(&transport)).expect_err("second call fails");

    assert_eq!(
        *listener.requests.lock().expect("listener lock"),
        vec![
            "GET /svc/People?$top=1".to_string(),
            "GET /svc/People?$top=1".to_string()
        ]
    );
    let errors = listener.errors.lock().expect("listener lock");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("unhealthy response: HTTP 500"));
}

#[test]
fn malformed_query_fails_before_reaching_transport() {
    let transport = Arc::new(ScriptedTransport::new());
    let listener = Arc::new(RecordingListener::default());
    let mut request = ODataRequest::read(
        "/svc/",
        "People",
        "$filter=Name eq 'x'",
        ODataProtocol::V4,
    );
    request.add_listener(listener.clone());

    let error = request
        .execute(&shared(&transport))
        .expect_err("unencoded query is rejected");

    assert_matches!(error.kind(), ODataErrorKind::RequestConstruction { .. });
    assert_eq!(transport.request_count(), 0);
    assert_eq!(listener.errors.lock().expect("listener lock").len(), 1);
}
