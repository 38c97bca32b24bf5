//! Import and export of service directories.
//!
//! A service directory mirrors a workspace: sub-directories are folders, a
//! `headers.json` inside a directory holds that folder's headers, and every
//! other `*.json` file is one API file:
//!
//! ```json
//! {
//!   "meta": { "name": "Create user", "method": "POST", "endpoint": "https://host/users", "headers": {} },
//!   "cases": [ { "name": "ok", "body": {}, "expected": { "status": 201 } } ]
//! }
//! ```
//!
//! A bare list of cases is accepted too. An empty file imports as an API
//! with no endpoint.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::domain::{ApiInput, BulkNode, CaseInput, HttpMethod, NewNode, NodeId, NodeKind, WorkspaceId, string_map};
use crate::error::{Error, Result};
use crate::store::Store;

pub const HEADERS_FILE: &str = "headers.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub folders: usize,
    pub files: usize,
    pub cases: usize,
    pub headers: usize,
    /// Files left alone, with the reason.
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Import every API file below `dir` into `workspace_id`. Existing folders
/// with matching names are reused; files whose name is taken are skipped.
pub fn import_services_dir(store: &Store, workspace_id: WorkspaceId, dir: &Path) -> Result<ImportReport> {
    store.get_workspace(workspace_id)?;
    if !dir.is_dir() {
        return Err(Error::invalid(format!("{} is not a directory", dir.display())));
    }

    let mut report = ImportReport::default();
    let mut folders: HashMap<PathBuf, Option<NodeId>> = HashMap::from([(PathBuf::new(), None)]);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| Error::invalid(format!("Cannot read {}: {err}", dir.display())))?;
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf();
        let parent_key = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let Some(&parent_id) = folders.get(&parent_key) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().to_string();

        if entry.file_type().is_dir() {
            match folder_for(store, workspace_id, parent_id, &name) {
                Ok((id, created)) => {
                    report.folders += usize::from(created);
                    folders.insert(relative, Some(id));
                }
                Err(err) => report.errors.push(format!("{}: {err}", relative.display())),
            }
            continue;
        }
        if !is_json(entry.path()) {
            continue;
        }

        let outcome = if name.eq_ignore_ascii_case(HEADERS_FILE) {
            match parent_id {
                Some(folder_id) => import_headers(store, folder_id, entry.path()).map(|()| report.headers += 1),
                None => {
                    report.skipped.push(format!("{}: headers need a folder", relative.display()));
                    Ok(())
                }
            }
        } else {
            import_file(store, workspace_id, parent_id, entry.path(), &mut report)
        };
        if let Err(err) = outcome {
            warn!(path = %relative.display(), error = %err, "import failed");
            report.errors.push(format!("{}: {err}", relative.display()));
        }
    }

    info!(
        workspace_id,
        folders = report.folders,
        files = report.files,
        cases = report.cases,
        errors = report.errors.len(),
        "import finished"
    );
    Ok(report)
}

fn folder_for(store: &Store, workspace_id: WorkspaceId, parent_id: Option<NodeId>, name: &str) -> Result<(NodeId, bool)> {
    let existing = store
        .list_children(workspace_id, parent_id)?
        .into_iter()
        .find(|node| node.is_folder() && node.name.eq_ignore_ascii_case(name));
    if let Some(folder) = existing {
        return Ok((folder.id, false));
    }
    let folder = store.create_node(NewNode {
        workspace_id,
        name: name.to_string(),
        kind: NodeKind::Folder,
        parent_id,
    })?;
    Ok((folder.id, true))
}

fn import_headers(store: &Store, folder_id: NodeId, path: &Path) -> Result<()> {
    let value: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let object = match &value {
        Value::Object(map) => map.get("headers").and_then(Value::as_object).unwrap_or(map),
        _ => return Err(Error::invalid("headers must be an object")),
    };
    store.set_folder_headers(folder_id, string_map(object))?;
    Ok(())
}

fn import_file(
    store: &Store,
    workspace_id: WorkspaceId,
    parent_id: Option<NodeId>,
    path: &Path,
    report: &mut ImportReport,
) -> Result<()> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let raw = fs::read_to_string(path)?;
    let raw = raw.trim_start_matches('\u{feff}');

    let (meta, cases) = if raw.trim().is_empty() {
        (Map::new(), Vec::new())
    } else {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(mut doc) if doc.contains_key("cases") => {
                let meta = match doc.remove("meta") {
                    Some(Value::Object(meta)) => meta,
                    _ => Map::new(),
                };
                match doc.remove("cases") {
                    Some(Value::Array(cases)) => (meta, cases),
                    _ => return Err(Error::invalid("'cases' must be a list")),
                }
            }
            Value::Array(cases) => (Map::new(), cases),
            _ => return Err(Error::invalid("expected an object with 'meta' and 'cases' or a list of cases")),
        }
    };

    let taken = store
        .list_children(workspace_id, parent_id)?
        .iter()
        .any(|node| !node.is_folder() && node.name.eq_ignore_ascii_case(&stem));
    if taken {
        report.skipped.push(format!("{stem}: a file with this name already exists"));
        return Ok(());
    }

    let file = store.create_node(NewNode {
        workspace_id,
        name: stem.clone(),
        kind: NodeKind::File,
        parent_id,
    })?;
    report.files += 1;
    store.save_api(file.id, api_input(&stem, &meta)?)?;

    for (index, case) in cases.iter().enumerate() {
        let Some(case) = case.as_object() else {
            report.errors.push(format!("{stem}: case {} is not an object", index + 1));
            continue;
        };
        match store.create_case(file.id, case_input(index, case)) {
            Ok(_) => report.cases += 1,
            Err(err) => report.errors.push(format!("{stem}: case {}: {err}", index + 1)),
        }
    }
    Ok(())
}

fn api_input(stem: &str, meta: &Map<String, Value>) -> Result<ApiInput> {
    let method = match meta.get("method").and_then(Value::as_str) {
        Some(raw) => raw.parse()?,
        None => HttpMethod::Get,
    };
    let mut extra_meta = Map::new();
    for key in ["headers", "params", "body"] {
        if let Some(value) = meta.get(key).filter(|v| !v.is_null()) {
            extra_meta.insert(key.to_string(), value.clone());
        }
    }
    Ok(ApiInput {
        name: meta
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(stem)
            .to_string(),
        method,
        endpoint: meta
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: meta.get("description").and_then(Value::as_str).map(str::to_string),
        is_active: None,
        extra_meta: Some(extra_meta),
    })
}

fn case_input(index: usize, case: &Map<String, Value>) -> CaseInput {
    CaseInput {
        name: case
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| format!("case-{}", index + 1), str::to_string),
        headers: case.get("headers").and_then(Value::as_object).map(string_map).unwrap_or_default(),
        params: case.get("params").and_then(Value::as_object).cloned().unwrap_or_default(),
        body: case.get("body").filter(|b| !b.is_null()).cloned(),
        expected: case.get("expected").cloned(),
    }
}

/// A file's API and cases in the import format.
pub fn export_file(store: &Store, file_id: NodeId) -> Result<Value> {
    let api = store.get_file_api(file_id)?;
    let cases = store.list_cases(file_id, None)?;
    let mut meta = json!({
        "name": api.name,
        "method": api.method,
        "endpoint": api.endpoint,
        "headers": api.headers(),
    });
    if let Some(description) = &api.description {
        meta["description"] = json!(description);
    }
    for key in ["params", "body"] {
        if let Some(value) = api.extra_meta.get(key) {
            meta[key] = value.clone();
        }
    }
    let cases: Vec<Value> = cases
        .into_iter()
        .map(|case| {
            json!({
                "name": case.name,
                "headers": case.headers,
                "params": case.params,
                "body": case.body,
                "expected": case.expected,
            })
        })
        .collect();
    Ok(json!({ "meta": meta, "cases": cases }))
}

/// Write a whole workspace as a service directory under `dir`.
pub fn export_services_dir(store: &Store, workspace_id: WorkspaceId, dir: &Path) -> Result<usize> {
    fn write(store: &Store, nodes: &[BulkNode], dir: &Path, written: &mut usize) -> Result<()> {
        fs::create_dir_all(dir)?;
        for node in nodes {
            if node.is_folder() {
                let sub = dir.join(&node.name);
                write(store, &node.children, &sub, written)?;
                if !node.headers.is_empty() {
                    fs::write(sub.join(HEADERS_FILE), serde_json::to_vec_pretty(&node.headers)?)?;
                }
            } else if node.api.is_some() {
                let doc = export_file(store, node.id)?;
                fs::write(dir.join(format!("{}.json", node.name)), serde_json::to_vec_pretty(&doc)?)?;
                *written += 1;
            }
        }
        Ok(())
    }

    let tree = store.bulk_tree(workspace_id)?;
    let mut written = 0;
    write(store, &tree, dir, &mut written)?;
    info!(workspace_id, files = written, dir = %dir.display(), "export finished");
    Ok(written)
}
