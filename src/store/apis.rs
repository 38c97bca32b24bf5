use std::collections::{HashMap, HashSet};

use rusqlite::{OptionalExtension, Row, params};
use serde_json::{Map, Value};
use tracing::info;

use super::workspaces::sort_nodes;
use super::{Store, from_json, now, to_json, unique_name};
use crate::domain::{
    ApiDefinition, ApiId, ApiInput, BulkNode, DuplicatedApi, Node, NodeId, NodeKind, SaveOutcome,
    TestCase, WorkspaceId,
};
use crate::error::{Error, Result};

const API_COLUMNS: &str =
    "a.id, a.file_id, a.name, a.method, a.endpoint, a.description, a.is_active, a.extra_meta, a.created_at";

fn api_from_row(row: &Row<'_>) -> rusqlite::Result<ApiDefinition> {
    let method: String = row.get(3)?;
    let extra_meta: String = row.get(7)?;
    Ok(ApiDefinition {
        id: row.get(0)?,
        file_id: row.get(1)?,
        name: row.get(2)?,
        method: method.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.to_string().into())
        })?,
        endpoint: row.get(4)?,
        description: row.get(5)?,
        is_active: row.get(6)?,
        extra_meta: from_json(7, &extra_meta)?,
        created_at: row.get(8)?,
    })
}

fn validate_api(input: &ApiInput) -> Result<String> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(Error::invalid("API name cannot be empty"));
    }
    Ok(name.to_string())
}

impl Store {
    /// Create or update the single API of a file. On update `extra_meta`
    /// is shallow-merged into the stored object.
    pub fn save_api(&self, file_id: NodeId, input: ApiInput) -> Result<(ApiDefinition, SaveOutcome)> {
        let file = self.require_file(file_id)?;
        let name = validate_api(&input)?;
        let endpoint = input.endpoint.trim().to_string();

        match self.find_file_api(file.id)? {
            Some(current) => {
                let mut extra_meta = current.extra_meta;
                if let Some(update) = input.extra_meta {
                    extra_meta.extend(update);
                }
                self.conn.execute(
                    "UPDATE apis SET name = ?1, method = ?2, endpoint = ?3, description = ?4,
                       is_active = ?5, extra_meta = ?6
                     WHERE id = ?7",
                    params![
                        name,
                        input.method.as_str(),
                        endpoint,
                        input.description.or(current.description),
                        input.is_active.unwrap_or(current.is_active),
                        to_json(&extra_meta)?,
                        current.id
                    ],
                )?;
                info!(api_id = current.id, file_id, "updated api");
                Ok((self.get_file_api(file_id)?, SaveOutcome::Updated))
            }
            None => {
                let api = self.insert_api(
                    file_id,
                    &name,
                    &input.method.to_string(),
                    &endpoint,
                    input.description.as_deref(),
                    input.is_active.unwrap_or(true),
                    &input.extra_meta.unwrap_or_default(),
                )?;
                info!(api_id = api.id, file_id, "created api");
                Ok((api, SaveOutcome::Created))
            }
        }
    }

    pub fn get_file_api(&self, file_id: NodeId) -> Result<ApiDefinition> {
        self.find_file_api(file_id)?
            .ok_or_else(|| Error::not_found("API"))
    }

    pub fn find_file_api(&self, file_id: NodeId) -> Result<Option<ApiDefinition>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {API_COLUMNS} FROM apis a WHERE a.file_id = ?1"),
                params![file_id],
                api_from_row,
            )
            .optional()?)
    }

    pub(crate) fn get_api(&self, api_id: ApiId) -> Result<ApiDefinition> {
        self.conn
            .query_row(
                &format!("SELECT {API_COLUMNS} FROM apis a WHERE a.id = ?1"),
                params![api_id],
                api_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("API"))
    }

    pub fn delete_api(&self, file_id: NodeId) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM apis WHERE file_id = ?1", params![file_id])?;
        if removed == 0 {
            return Err(Error::not_found("API"));
        }
        info!(file_id, "deleted api");
        Ok(())
    }

    pub fn list_apis(&self, workspace_id: WorkspaceId) -> Result<Vec<ApiDefinition>> {
        self.get_workspace(workspace_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {API_COLUMNS} FROM apis a JOIN nodes n ON n.id = a.file_id
             WHERE n.workspace_id = ?1 ORDER BY a.id"
        ))?;
        let apis = stmt
            .query_map(params![workspace_id], api_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(apis)
    }

    /// Copy a file's API into a new sibling file named `"<file> (Copy)"`.
    pub fn duplicate_api(
        &self,
        file_id: NodeId,
        new_api_name: Option<&str>,
        include_cases: bool,
    ) -> Result<DuplicatedApi> {
        let source = self.require_file(file_id)?;
        let source_api = self
            .find_file_api(file_id)?
            .ok_or_else(|| Error::not_found("API in source file"))?;

        let base = format!("{} (Copy)", source.name);
        let file_name = unique_name(&base, "copy", |candidate| {
            self.sibling_exists(source.workspace_id, source.parent_id, candidate, None)
        })?;
        let api_name = match new_api_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{} (Copy)", source_api.name),
        };

        let tx = self.conn.unchecked_transaction()?;
        let new_file = self.insert_node(source.workspace_id, &file_name, NodeKind::File, source.parent_id)?;
        let duplicated_cases = self.copy_api_into(file_id, new_file.id, Some(&api_name), include_cases)?;
        tx.commit()?;

        let api = self.get_file_api(new_file.id)?;
        info!(source_file = file_id, new_file = new_file.id, duplicated_cases, "duplicated api");
        Ok(DuplicatedApi {
            new_file,
            api,
            duplicated_cases,
            duplicated_from_file_id: file_id,
        })
    }

    /// Workspace tree for bulk testing: folders carry their own headers,
    /// files their API and test cases.
    pub fn bulk_tree(&self, workspace_id: WorkspaceId) -> Result<Vec<BulkNode>> {
        let nodes = self.workspace_nodes(workspace_id)?;
        let mut apis: HashMap<NodeId, ApiDefinition> = self
            .list_apis(workspace_id)?
            .into_iter()
            .map(|api| (api.file_id, api))
            .collect();
        let mut cases = self.cases_by_api(workspace_id)?;
        let mut headers = HashMap::new();
        for folder in nodes.iter().filter(|n| n.is_folder()) {
            if let Some(map) = self.get_folder_headers(folder.id)? {
                headers.insert(folder.id, map);
            }
        }

        let ids: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        let mut by_parent: HashMap<Option<NodeId>, Vec<Node>> = HashMap::new();
        for node in nodes {
            let parent = node.parent_id.filter(|p| ids.contains(p));
            by_parent.entry(parent).or_default().push(node);
        }

        fn assemble(
            parent: Option<NodeId>,
            by_parent: &mut HashMap<Option<NodeId>, Vec<Node>>,
            apis: &mut HashMap<NodeId, ApiDefinition>,
            cases: &mut HashMap<ApiId, Vec<TestCase>>,
            headers: &mut HashMap<NodeId, crate::engine::headers::HeaderMap>,
        ) -> Vec<BulkNode> {
            let mut level = by_parent.remove(&parent).unwrap_or_default();
            sort_nodes(&mut level);
            level
                .into_iter()
                .map(|node| {
                    let children = assemble(Some(node.id), by_parent, apis, cases, headers);
                    let api = apis.remove(&node.id);
                    let test_cases = api
                        .as_ref()
                        .and_then(|a| cases.remove(&a.id))
                        .unwrap_or_default();
                    BulkNode {
                        id: node.id,
                        headers: headers.remove(&node.id).unwrap_or_default(),
                        name: node.name,
                        kind: node.kind,
                        parent_id: node.parent_id,
                        api,
                        test_cases,
                        children,
                    }
                })
                .collect()
        }

        Ok(assemble(None, &mut by_parent, &mut apis, &mut cases, &mut headers))
    }

    /// Copy the API of `source_file` (if any) onto `target_file`; returns
    /// the number of cases copied.
    pub(crate) fn copy_api_into(
        &self,
        source_file: NodeId,
        target_file: NodeId,
        name: Option<&str>,
        include_cases: bool,
    ) -> Result<usize> {
        let Some(source) = self.find_file_api(source_file)? else {
            return Ok(0);
        };
        let copy = self.insert_api(
            target_file,
            name.unwrap_or(&source.name),
            source.method.as_str(),
            &source.endpoint,
            source.description.as_deref(),
            source.is_active,
            &source.extra_meta,
        )?;
        if !include_cases {
            return Ok(0);
        }
        let cases = self.cases_for_api(source.id)?;
        for case in &cases {
            self.insert_case(copy.id, case)?;
        }
        Ok(cases.len())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_api(
        &self,
        file_id: NodeId,
        name: &str,
        method: &str,
        endpoint: &str,
        description: Option<&str>,
        is_active: bool,
        extra_meta: &Map<String, Value>,
    ) -> Result<ApiDefinition> {
        self.conn.execute(
            "INSERT INTO apis (file_id, name, method, endpoint, description, is_active, extra_meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![file_id, name, method, endpoint, description, is_active, to_json(extra_meta)?, now()],
        )?;
        self.get_api(self.conn.last_insert_rowid())
    }

    pub(crate) fn require_file(&self, file_id: NodeId) -> Result<Node> {
        let node = self.get_node(file_id).map_err(|_| Error::not_found("File"))?;
        if node.is_folder() {
            return Err(Error::invalid("Node must be a file"));
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CaseInput, HttpMethod, NewNode};
    use serde_json::json;

    fn api_input(name: &str, meta: Option<Value>) -> ApiInput {
        ApiInput {
            name: name.into(),
            method: HttpMethod::Post,
            endpoint: "/orders".into(),
            description: None,
            is_active: None,
            extra_meta: meta.and_then(|m| m.as_object().cloned()),
        }
    }

    fn setup() -> (Store, WorkspaceId, Node) {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "orders".into(), kind: NodeKind::File, parent_id: None })
            .unwrap();
        (store, ws.id, file)
    }

    #[test]
    fn save_creates_then_merges_meta() {
        let (store, _, file) = setup();
        let (api, outcome) = store
            .save_api(file.id, api_input("create order", Some(json!({"headers": {"A": "1"}, "tag": "x"}))))
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Created);
        assert!(api.is_active);

        let (api, outcome) = store
            .save_api(file.id, api_input("create order v2", Some(json!({"tag": "y"}))))
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Updated);
        assert_eq!(api.name, "create order v2");
        assert_eq!(api.extra_meta["tag"], "y");
        assert_eq!(api.headers()["A"], "1");
    }

    #[test]
    fn apis_only_live_on_files() {
        let (store, ws, _) = setup();
        let folder = store
            .create_node(NewNode { workspace_id: ws, name: "dir".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap();
        assert!(matches!(
            store.save_api(folder.id, api_input("x", None)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(store.get_file_api(folder.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn duplicate_creates_sibling_with_cases() {
        let (store, _, file) = setup();
        store.save_api(file.id, api_input("create order", None)).unwrap();
        store
            .create_case(file.id, CaseInput { name: "happy".into(), ..Default::default() })
            .unwrap();

        let dup = store.duplicate_api(file.id, None, true).unwrap();
        assert_eq!(dup.new_file.name, "orders (Copy)");
        assert_eq!(dup.api.name, "create order (Copy)");
        assert_eq!(dup.duplicated_cases, 1);

        let again = store.duplicate_api(file.id, Some("renamed"), false).unwrap();
        assert_eq!(again.new_file.name, "orders (Copy) copy");
        assert_eq!(again.api.name, "renamed");
        assert_eq!(again.duplicated_cases, 0);
    }

    #[test]
    fn bulk_tree_carries_apis_cases_and_headers() {
        let (store, ws, _) = setup();
        let folder = store
            .create_node(NewNode { workspace_id: ws, name: "billing".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap();
        let inner = store
            .create_node(NewNode { workspace_id: ws, name: "invoices".into(), kind: NodeKind::File, parent_id: Some(folder.id) })
            .unwrap();
        store.save_api(inner.id, api_input("list", None)).unwrap();
        store
            .create_case(inner.id, CaseInput { name: "ok".into(), ..Default::default() })
            .unwrap();
        store
            .set_folder_headers(folder.id, [("X-Team".to_string(), "billing".to_string())].into())
            .unwrap();

        let tree = store.bulk_tree(ws).unwrap();
        assert_eq!(tree.len(), 2);
        let billing = &tree[0];
        assert_eq!(billing.headers["X-Team"], "billing");
        let file = &billing.children[0];
        assert_eq!(file.api.as_ref().unwrap().name, "list");
        assert_eq!(file.test_cases.len(), 1);
    }
}
