mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{MockServer, Reply, api_file, case};
use restbench::domain::{HttpMethod, NewNode, NodeKind};
use restbench::engine::bulk::{BulkCollectionTree, BulkSelection, RunFilter, plan_from_filters, plan_from_selection};
use restbench::engine::cancel::{CancelRegistry, never};
use restbench::engine::http::{HttpEngine, HttpSettings};
use restbench::engine::headers::HeaderMap;
use restbench::engine::runner::{CaseStatus, RunOptions, run_plan};
use restbench::store::Store;
use serde_json::json;

fn engine() -> HttpEngine {
    HttpEngine::new(HttpSettings::default()).unwrap()
}

fn echo_server() -> impl Fn(&common::Received) -> Reply + Send + Sync + 'static {
    |req| match req.path.as_str() {
        p if p.starts_with("/users") && req.method == "POST" => {
            let body = req.json();
            if body["email"].as_str().is_some_and(|e| e.contains('@')) {
                Reply::json(201, json!({"data": {"email": body["email"]}}))
            } else {
                Reply::json(422, json!({"error_message": "email must be valid"}))
            }
        }
        "/ping" => Reply::json(200, json!({"ok": true})),
        _ => Reply::json(404, json!({"detail": "not found"})),
    }
}

struct Fixture {
    store: Store,
    workspace_id: i64,
    folder_id: i64,
    users_file: i64,
}

fn fixture(server: &MockServer) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let ws = store.create_workspace("Shop", None).unwrap();
    let folder = store
        .create_node(NewNode { workspace_id: ws.id, name: "accounts".into(), kind: NodeKind::Folder, parent_id: None })
        .unwrap();
    store
        .set_folder_headers(folder.id, HeaderMap::from([("X-Team".to_string(), "core".to_string())]))
        .unwrap();

    let users = api_file(&store, ws.id, Some(folder.id), "create-user", HttpMethod::Post, "{{host}}/users");
    case(
        &store,
        users,
        "valid",
        Some(json!({"email": "u${ts}@example.com"})),
        json!({"status": 201, "json": {"checks": [{"path": "$.data.email", "regex": "^u\\d+@example\\.com$"}]}}),
    );
    case(&store, users, "invalid", Some(json!({"email": "nope"})), json!({"status": 201}));

    let ping = api_file(&store, ws.id, None, "ping", HttpMethod::Get, &server.url("/ping"));
    case(&store, ping, "alive", None, json!({"status": 200, "text_contains": "ok"}));

    Fixture { store, workspace_id: ws.id, folder_id: folder.id, users_file: users }
}

fn options(server: &MockServer) -> RunOptions {
    RunOptions {
        concurrency: 2,
        variables: HashMap::from([("host".to_string(), server.base_url.clone())]),
        timeout_ms: Some(5_000),
    }
}

#[tokio::test]
async fn project_run_reports_passes_and_failures() {
    let server = MockServer::start(echo_server()).await;
    let fx = fixture(&server);
    let tree = BulkCollectionTree::new(fx.store.bulk_tree(fx.workspace_id).unwrap());
    let plan = plan_from_filters(&tree, &[RunFilter::Project]).unwrap();
    assert_eq!(plan.len(), 3);

    let report = run_plan(plan, options(&server), &engine(), &mut never()).await;

    let names: Vec<_> = report.results.iter().map(|r| (r.case_name.as_str(), r.status)).collect();
    assert_eq!(
        names,
        [("valid", CaseStatus::Passed), ("invalid", CaseStatus::Failed), ("alive", CaseStatus::Passed)]
    );
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.summary.pass_rate, 66.67);
    assert!(report.results[1].failures[0].contains("status"));

    let by_api = &report.by_api["POST {{host}}/users"];
    assert_eq!(by_api[0].case_name, "invalid");
    assert_eq!(report.by_file["accounts/create-user"].failed, 1);

    let sent = server.received();
    let user_posts: Vec<_> = sent.iter().filter(|r| r.path == "/users").collect();
    assert_eq!(user_posts.len(), 2);
    assert!(user_posts.iter().all(|r| r.header("x-team") == Some("core")));
    assert!(sent.iter().find(|r| r.path == "/ping").unwrap().header("x-team").is_none());
    let stamped = user_posts.iter().find(|r| r.json()["email"] != "nope").unwrap();
    assert!(!stamped.body.contains("${ts}"));
}

#[tokio::test]
async fn folder_filter_and_selection_narrow_the_plan() {
    let server = MockServer::start(echo_server()).await;
    let fx = fixture(&server);
    let tree = BulkCollectionTree::new(fx.store.bulk_tree(fx.workspace_id).unwrap());

    let folder_plan = plan_from_filters(&tree, &[RunFilter::Folder { folder_id: Some(fx.folder_id) }]).unwrap();
    assert_eq!(folder_plan.len(), 2);
    assert!(folder_plan.iter().all(|t| t.inherited_headers["X-Team"] == "core"));

    let case_plan = plan_from_filters(
        &tree,
        &[RunFilter::Case { file_id: Some(fx.users_file), case_names: vec!["valid".into()] }],
    )
    .unwrap();
    assert_eq!(case_plan.len(), 1);

    let api_id = fx.store.get_file_api(fx.users_file).unwrap().id;
    let mut selection = BulkSelection::new();
    selection.toggle_folder(&tree, fx.folder_id);
    assert!(selection.is_api_selected(api_id));
    let all_cases = tree.case_ids(api_id);
    selection.deselect_case(api_id, all_cases[1], &all_cases);
    let selected = plan_from_selection(&tree, &selection);
    assert_eq!(selected.iter().map(|t| t.case.name.as_str()).collect::<Vec<_>>(), ["valid"]);

    let report = run_plan(selected, options(&server), &engine(), &mut never()).await;
    assert_eq!(report.summary.passed, 1);
}

#[tokio::test]
async fn cancelling_a_run_skips_what_is_left() {
    let server = MockServer::start(|_| Reply::json(200, json!({})).delayed(Duration::from_secs(10))).await;
    let store = Store::open_in_memory().unwrap();
    let ws = store.create_workspace("Slow", None).unwrap();
    let file = api_file(&store, ws.id, None, "slow", HttpMethod::Get, &server.url("/slow"));
    for name in ["a", "b", "c"] {
        case(&store, file, name, None, json!({"status": 200}));
    }
    let tree = BulkCollectionTree::new(store.bulk_tree(ws.id).unwrap());
    let plan = plan_from_filters(&tree, &[RunFilter::Project]).unwrap();

    let registry = CancelRegistry::new();
    let mut rx = registry.register("run");
    let http = engine();
    let run = run_plan(plan, RunOptions { concurrency: 1, ..Default::default() }, &http, &mut rx);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.cancel("run");
    };
    let (report, ()) = tokio::join!(run, cancel);

    assert!(report.cancelled);
    assert_eq!(report.summary.skipped, 3);
    assert_eq!(report.summary.pass_rate, 0.0);
}
