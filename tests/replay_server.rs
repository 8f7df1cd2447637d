use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, StatusCode, Uri, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use mockreplay::{
    config::Config,
    fixture::{Fixture, PostData, RequestDescriptor, ResponseDescriptor},
    reconcile::{CaptureBatch, CapturedExchange, IdentityRule, ReconcileOptions, reconcile},
    server::{self, ServerHandle},
    store::{ScenarioManager, ScenarioPointer},
};
use tempfile::TempDir;

type TestClient = Client<HttpConnector, Full<Bytes>>;

struct Harness {
    _storage: TempDir,
    manager: ScenarioManager,
    server: ServerHandle,
    client: TestClient,
}

impl Harness {
    async fn start(extra_toml: &str) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let config_toml = format!(
            r#"
[server]
listen = "127.0.0.1:0"
{extra_toml}

[storage]
path = "{}"
"#,
            storage.path().display()
        );
        let config = Config::from_toml_str(&config_toml).unwrap();
        let server = server::serve(&config).await.unwrap();
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        Self {
            manager: ScenarioManager::new(storage.path().to_path_buf()),
            _storage: storage,
            server,
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.server.listen_addr
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> (StatusCode, hyper::HeaderMap, Bytes) {
        let uri: Uri = format!("http://{}{path}", self.addr()).parse().unwrap();
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default().to_owned())))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn activate(&self, scenario: &str) {
        self.manager
            .write_pointer(ScenarioPointer {
                test_name: Some(scenario.to_owned()),
                port: None,
            })
            .await
            .unwrap();
    }
}

fn fixture(method: &str, url: &str, body: Option<&str>, status: u16, content: &str) -> Fixture {
    Fixture {
        id: String::new(),
        url: url.to_owned(),
        method: method.to_owned(),
        request: RequestDescriptor::new(
            format!("http://localhost:3000{url}"),
            method,
            BTreeMap::new(),
            body.map(|text| PostData {
                mime_type: "application/json".to_owned(),
                text: text.to_owned(),
            }),
        ),
        response: ResponseDescriptor {
            status,
            headers: BTreeMap::from([("content-type".to_owned(), "application/json".to_owned())]),
            content: Some(content.to_owned()),
            ..ResponseDescriptor::default()
        },
        ignore_params: BTreeSet::new(),
        wait_for_previous: false,
        served: false,
    }
}

fn assert_json_body(body: &Bytes, expected: &str) {
    assert_eq!(
        std::str::from_utf8(body).unwrap(),
        expected,
        "unexpected response body"
    );
}

#[tokio::test]
async fn unmatched_request_is_a_json_404() {
    let harness = Harness::start("").await;

    let (status, headers, body) = harness.send(Method::GET, "/api/students", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_json_body(&body, r#"{"error":"Not found"}"#);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn matched_fixture_replays_status_and_body() {
    let harness = Harness::start("").await;
    let store = harness.manager.create_scenario("students").await.unwrap();
    store
        .create(fixture("POST", "/api/students", Some(r#"{"name":"Ada"}"#), 201, r#"{"id":6}"#))
        .await
        .unwrap();
    harness.activate("students").await;

    let (status, headers, body) = harness
        .send(Method::POST, "/api/students", Some(r#"{ "name": "Ada" }"#))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_json_body(&body, r#"{"id":6}"#);

    let (status, _, _) = harness
        .send(Method::POST, "/api/students", Some(r#"{"name":"Grace"}"#))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn sequential_fixtures_replay_in_order_until_reset() {
    let harness = Harness::start("").await;
    let store = harness.manager.create_scenario("flow").await.unwrap();
    let mut batch = CaptureBatch::new("flow.har", IdentityRule::RequestAndResponse);
    for content in ["[]", r#"[{"id":6}]"#] {
        let captured = fixture("GET", "/api/students", None, 200, content);
        batch
            .exchanges
            .push(CapturedExchange::new(captured.request, captured.response));
    }
    let report = reconcile(&store, None, batch, ReconcileOptions::default())
        .await
        .unwrap();
    assert_eq!(report.created, 2);
    let mut after_create = store.get(&report.fixture_ids[1]).await.unwrap();
    after_create.wait_for_previous = true;
    store
        .update(&report.fixture_ids[1], after_create)
        .await
        .unwrap();
    harness.activate("flow").await;

    let mut bodies = Vec::new();
    for _ in 0..3 {
        bodies.push(harness.send(Method::GET, "/api/students", None).await.2);
    }
    assert_json_body(&bodies[0], "[]");
    assert_json_body(&bodies[1], r#"[{"id":6}]"#);
    assert_json_body(&bodies[2], r#"[{"id":6}]"#);
    assert!(store.get(&report.fixture_ids[0]).await.unwrap().served);

    assert_eq!(harness.manager.reset_served("flow").await.unwrap(), 2);
    let (_, _, body) = harness.send(Method::GET, "/api/students", None).await;
    assert_json_body(&body, "[]");
    harness.server.shutdown().await;
}

#[tokio::test]
async fn default_fixtures_answer_regardless_of_served_state() {
    let harness = Harness::start("").await;
    harness.manager.create_scenario("empty").await.unwrap();
    harness
        .manager
        .default_store()
        .create(fixture("GET", "/api/config", None, 200, r#"{"flag":true}"#))
        .await
        .unwrap();
    harness.activate("empty").await;

    for _ in 0..3 {
        let (status, _, body) = harness.send(Method::GET, "/api/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_json_body(&body, r#"{"flag":true}"#);
    }
    let defaults = harness.manager.default_store().load_all().await.unwrap();
    assert!(!defaults[0].served);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn pointer_changes_apply_to_the_next_request() {
    let harness = Harness::start("").await;
    for (scenario, content) in [("first", r#"{"n":1}"#), ("second", r#"{"n":2}"#)] {
        harness
            .manager
            .create_scenario(scenario)
            .await
            .unwrap()
            .create(fixture("GET", "/api/n", None, 200, content))
            .await
            .unwrap();
    }

    harness.activate("first").await;
    let (_, _, body) = harness.send(Method::GET, "/api/n", None).await;
    assert_json_body(&body, r#"{"n":1}"#);

    harness.activate("second").await;
    let (_, _, body) = harness.send(Method::GET, "/api/n", None).await;
    assert_json_body(&body, r#"{"n":2}"#);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn configured_scenario_overrides_the_pointer() {
    let storage = tempfile::tempdir().unwrap();
    let manager = ScenarioManager::new(storage.path().to_path_buf());
    manager
        .create_scenario("pinned")
        .await
        .unwrap()
        .create(fixture("GET", "/api/who", None, 200, r#""pinned""#))
        .await
        .unwrap();
    manager
        .write_pointer(ScenarioPointer {
            test_name: Some("other".to_owned()),
            port: None,
        })
        .await
        .unwrap();

    let mut config = Config::from_toml_str(&format!(
        "[server]\nlisten = \"127.0.0.1:0\"\n\n[storage]\npath = \"{}\"\n",
        storage.path().display()
    ))
    .unwrap();
    config.apply_active_scenario_override(Some("pinned")).unwrap();
    let server = server::serve(&config).await.unwrap();

    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    let client: TestClient = Client::builder(TokioExecutor::new()).build(connector);
    let uri: Uri = format!("http://{}/api/who", server.listen_addr).parse().unwrap();
    let response = client
        .request(Request::get(uri).body(Full::new(Bytes::new())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_json_body(&body, r#""pinned""#);
    server.shutdown().await;
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let harness = Harness::start("max_body_bytes = 16").await;

    let (status, _, body) = harness
        .send(Method::POST, "/api/upload", Some(&"x".repeat(64)))
        .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_json_body(&body, r#"{"error":"Request body too large"}"#);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn missing_asset_is_a_json_500() {
    let harness = Harness::start("").await;
    let store = harness.manager.create_scenario("assets").await.unwrap();
    let mut broken = fixture("GET", "/logo.bin", None, 200, "");
    broken.response.content = None;
    broken.response.file = Some("missing.bin".to_owned());
    store.create(broken).await.unwrap();
    harness.activate("assets").await;

    let (status, _, body) = harness.send(Method::GET, "/logo.bin", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_body(&body, r#"{"error":"Internal server error"}"#);
    harness.server.shutdown().await;
}
