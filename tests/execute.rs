mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{MockServer, Reply, api_file};
use restbench::Error;
use restbench::domain::{EnvVariable, EnvironmentInput, HttpMethod, NewNode, NodeKind, SECRET_MASK};
use restbench::engine::cancel::{CancelRegistry, never};
use restbench::engine::execute::{ExecuteRequest, execute_direct};
use restbench::engine::headers::HeaderMap;
use restbench::engine::http::{HttpEngine, HttpSettings};
use restbench::store::Store;
use serde_json::{Map, json};

struct Fixture {
    store: Store,
    file_id: i64,
}

fn fixture(server: &MockServer) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let ws = store.create_workspace("Billing", None).unwrap();
    let folder = store
        .create_node(NewNode { workspace_id: ws.id, name: "tariffs".into(), kind: NodeKind::Folder, parent_id: None })
        .unwrap();
    store
        .set_folder_headers(
            folder.id,
            HeaderMap::from([
                ("X-Client".to_string(), "{{client}}".to_string()),
                ("Accept-Language".to_string(), "en".to_string()),
            ]),
        )
        .unwrap();
    let file_id = api_file(&store, ws.id, Some(folder.id), "list", HttpMethod::Get, "/tariffs");

    store
        .create_environment(
            ws.id,
            EnvironmentInput {
                name: "local".into(),
                description: None,
                is_active: true,
                variables: BTreeMap::from([
                    ("host".to_string(), EnvVariable::new(server.base_url.clone())),
                    ("client".to_string(), EnvVariable::new("web")),
                    ("token".to_string(), EnvVariable::secret("s3cret")),
                ]),
            },
        )
        .unwrap();

    Fixture { store, file_id }
}

fn engine() -> HttpEngine {
    HttpEngine::new(HttpSettings::default()).unwrap()
}

#[tokio::test]
async fn resolves_variables_and_inherits_folder_headers() {
    let server = MockServer::start(|_| Reply::json(200, json!({"data": [{"id": 1, "rate": 0.5}]}))).await;
    let fx = fixture(&server);

    let request = ExecuteRequest {
        file_id: fx.file_id,
        method: HttpMethod::Get,
        url: "{{host}}/tariffs".into(),
        headers: HeaderMap::from([
            ("Accept-Language".to_string(), "de".to_string()),
            ("X-Trace".to_string(), "{{trace}}".to_string()),
        ]),
        params: Map::from_iter([("page".to_string(), json!(2))]),
        ..Default::default()
    };
    let outcome = execute_direct(&fx.store, &engine(), request, &mut never()).await.unwrap();

    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.json.as_ref().unwrap()["data"][0]["rate"], json!(0.5));
    assert_eq!(outcome.resolved_url, server.url("/tariffs?page=2"));
    assert_eq!(outcome.environment_used.as_deref(), Some("local"));
    assert_eq!(outcome.variables_missing, ["trace"]);
    assert_eq!(outcome.variables_used["host"], server.base_url);
    assert_eq!(outcome.folder_headers["X-Client"], "web");

    let sent = &server.received()[0];
    assert_eq!(sent.path, "/tariffs?page=2");
    assert_eq!(sent.header("x-client"), Some("web"));
    assert_eq!(sent.header("accept-language"), Some("de"));
    assert_eq!(sent.header("x-trace"), Some("{{trace}}"));
    assert_eq!(sent.header("content-type"), Some("application/json"));
    assert!(sent.header("user-agent").is_some());
}

#[tokio::test]
async fn explicit_variables_override_and_unmask() {
    let server = MockServer::start(|req| Reply::json(201, req.json())).await;
    let fx = fixture(&server);

    let request = ExecuteRequest {
        file_id: fx.file_id,
        method: HttpMethod::Post,
        url: "{{host}}/tariffs".into(),
        body: Some(json!({"client": "{{client}}", "key": "{{token}}"})),
        variables: BTreeMap::from([("client".to_string(), "mobile".to_string())]),
        ..Default::default()
    };
    let outcome = execute_direct(&fx.store, &engine(), request, &mut never()).await.unwrap();

    assert_eq!(outcome.response.status, 201);
    assert_eq!(outcome.response.json, Some(json!({"client": "mobile", "key": "s3cret"})));
    assert_eq!(outcome.variables_used["client"], "mobile");
    assert_eq!(outcome.variables_used["token"], SECRET_MASK);
    assert!(outcome.variables_missing.is_empty());
}

#[tokio::test]
async fn foreign_environment_is_rejected() {
    let server = MockServer::start(|_| Reply::json(200, json!({}))).await;
    let fx = fixture(&server);
    let other = fx.store.create_workspace("Other", None).unwrap();
    let env = fx
        .store
        .create_environment(other.id, EnvironmentInput { name: "x".into(), ..Default::default() })
        .unwrap();

    let request = ExecuteRequest {
        file_id: fx.file_id,
        environment_id: Some(env.id),
        url: "{{host}}/tariffs".into(),
        ..Default::default()
    };
    let err = execute_direct(&fx.store, &engine(), request, &mut never()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(server.received().is_empty());
}

#[tokio::test]
async fn cancel_interrupts_a_slow_request() {
    let server = MockServer::start(|_| Reply::json(200, json!({})).delayed(Duration::from_secs(10))).await;
    let fx = fixture(&server);
    let registry = CancelRegistry::new();
    let mut rx = registry.register("exec-1");

    let request = ExecuteRequest { file_id: fx.file_id, url: "{{host}}/slow".into(), ..Default::default() };
    let http = engine();
    let run = execute_direct(&fx.store, &http, request, &mut rx);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.cancel("exec-1"));
    };
    let (result, ()) = tokio::join!(run, cancel);

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!registry.is_registered("exec-1"));
}
