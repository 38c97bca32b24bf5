mod common;

use common::{MockServer, Reply};
use restbench::Error;
use restbench::engine::execute::ExecuteRequest;
use restbench::engine::http::HttpSettings;
use restbench::remote::RemoteClient;
use restbench::session::{Session, SessionStore};
use serde_json::json;
use tempfile::TempDir;

fn backend() -> impl Fn(&common::Received) -> Reply + Send + Sync + 'static {
    |req| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/sso/sign_in") => {
            if req.json()["password"] == "pw" {
                Reply::json(200, json!({"response_code": 200, "data": {"access_token": "tok", "token_type": "bearer"}}))
            } else {
                Reply::json(401, json!({"detail": "Invalid credentials"}))
            }
        }
        ("GET", "/workspace/list") => match req.header("authorization") {
            Some("Bearer tok") => Reply::json(200, json!({"response_code": 200, "data": [{"id": 1, "name": "Shop"}]})),
            Some("Bearer stale") => Reply::json(401, json!({"detail": "Authentication required"})),
            _ => Reply::json(401, json!({"detail": "Missing token"})),
        },
        ("GET", "/workspace/9") => {
            Reply::json(206, json!({"response_code": 206, "data": null, "error_message": "Workspace not found"}))
        }
        ("POST", "/workspace/1/environments/4/resolve-api") => {
            let body = req.json();
            Reply::json(
                200,
                json!({"response_code": 200, "data": {"original_api_data": body["api_data"], "environment_id": body["environment_id"]}}),
            )
        }
        ("POST", "/execute-direct") => Reply::json(200, json!({"response_code": 200, "data": {"echo": req.json()}})),
        ("DELETE", "/sso/logout") => Reply::json(200, json!({"response_code": 200, "message": "bye"})),
        _ => Reply::json(404, json!({"detail": "no route"})),
    }
}

fn client(server: &MockServer, dir: &TempDir) -> RemoteClient {
    let sessions = SessionStore::new(dir.path().join("session.json"));
    RemoteClient::new(&server.url("/"), HttpSettings::default(), sessions).unwrap()
}

#[tokio::test]
async fn sign_in_stores_a_session_used_by_later_calls() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);

    let session = remote.sign_in("dev@example.com", "pw").await.unwrap();
    assert_eq!(session.access_token, "tok");
    assert_eq!(remote.session().unwrap().username, "dev@example.com");

    let workspaces = remote.list_workspaces().await.unwrap();
    assert_eq!(workspaces, json!([{"id": 1, "name": "Shop"}]));

    let listed = server.received().into_iter().find(|r| r.path == "/workspace/list").unwrap();
    assert_eq!(listed.header("authorization"), Some("Bearer tok"));
    assert_eq!(listed.header("username"), Some("dev@example.com"));

    remote.sign_out().await.unwrap();
    assert!(remote.session().is_none());
}

#[tokio::test]
async fn bad_credentials_keep_no_session() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);

    let err = remote.sign_in("dev@example.com", "wrong").await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 401, ref message } if message == "Invalid credentials"));
    assert!(remote.session().is_none());
}

#[tokio::test]
async fn expired_token_forces_logout() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);
    SessionStore::new(dir.path().join("session.json"))
        .save(&Session::new("stale", "dev@example.com"))
        .unwrap();

    let err = remote.list_workspaces().await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
    assert!(remote.session().is_none());
}

#[tokio::test]
async fn other_unauthorized_responses_keep_the_session() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);
    SessionStore::new(dir.path().join("session.json"))
        .save(&Session::new("someone-else", "dev@example.com"))
        .unwrap();

    let err = remote.list_workspaces().await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 401, .. }));
    assert!(remote.session().is_some());
}

#[tokio::test]
async fn error_message_on_success_status_is_an_error() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);

    let err = remote.workspace_tree(9).await.unwrap_err();
    match err {
        Error::Remote { status, message } => {
            assert_eq!(status, 206);
            assert_eq!(message, "Workspace not found");
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = remote.bulk_testing_tree(9).await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 404, ref message } if message == "no route"));
}

#[tokio::test]
async fn execute_direct_posts_the_request() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);

    let request = ExecuteRequest { file_id: 7, url: "{{host}}/ping".into(), ..Default::default() };
    let data = remote.execute_direct(&request).await.unwrap();
    assert_eq!(data["echo"]["file_id"], 7);
    assert_eq!(data["echo"]["url"], "{{host}}/ping");
}

#[tokio::test]
async fn resolve_api_posts_the_document() {
    let server = MockServer::start(backend()).await;
    let dir = TempDir::new().unwrap();
    let remote = client(&server, &dir);

    let api = json!({"url": "{{host}}/users", "headers": {"X-Key": "{{key}}"}});
    let data = remote.resolve_api(1, &api, Some(4)).await.unwrap();
    assert_eq!(data["original_api_data"], api);
    assert_eq!(data["environment_id"], 4);

    let err = remote.resolve_api(1, &api, None).await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 404, .. }));
}
