use std::collections::HashSet;

use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, info};

use super::workspaces::sort_nodes;
use super::{Store, now, unique_name};
use crate::domain::{
    Breadcrumb, NewNode, Node, NodeCopy, NodeId, NodeKind, NodeWithPath, WorkspaceId,
};
use crate::error::{Error, Result};

const NODE_COLUMNS: &str = "id, workspace_id, name, type, parent_id, created_at";
const INVALID_NAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_NAME_LEN: usize = 255;

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let kind: String = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        kind: NodeKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown node type `{kind}`").into(),
            )
        })?,
        parent_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn validate_node_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid("Name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::invalid(format!("Name cannot exceed {MAX_NAME_LEN} characters")));
    }
    if name.contains(INVALID_NAME_CHARS) {
        return Err(Error::invalid(r#"Name contains invalid characters (< > : " / \ | ? *)"#));
    }
    Ok(name.to_string())
}

impl Store {
    pub fn create_node(&self, new: NewNode) -> Result<Node> {
        self.get_workspace(new.workspace_id)?;
        let name = validate_node_name(&new.name)?;
        if let Some(parent_id) = new.parent_id {
            self.require_folder_in(parent_id, new.workspace_id)?;
        }
        if self.sibling_exists(new.workspace_id, new.parent_id, &name, None)? {
            return Err(Error::conflict(format!(
                "A {} named '{name}' already exists in this location",
                new.kind
            )));
        }
        let node = self.insert_node(new.workspace_id, &name, new.kind, new.parent_id)?;
        info!(node_id = node.id, kind = %node.kind, name = %node.name, "created node");
        Ok(node)
    }

    pub fn get_node(&self, id: NodeId) -> Result<Node> {
        self.conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id],
                node_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Node"))
    }

    /// Direct children of `parent_id` (workspace roots for `None`),
    /// folders first.
    pub fn list_children(&self, workspace_id: WorkspaceId, parent_id: Option<NodeId>) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE workspace_id = ?1 AND parent_id IS ?2"
        ))?;
        let mut nodes = stmt
            .query_map(params![workspace_id, parent_id], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    pub fn node_with_path(&self, id: NodeId) -> Result<NodeWithPath> {
        let node = self.get_node(id)?;
        let path = self.breadcrumbs(&node)?;
        let children = if node.is_folder() {
            self.list_children(node.workspace_id, Some(node.id))?
        } else {
            Vec::new()
        };
        Ok(NodeWithPath { node, path, children })
    }

    pub fn rename_node(&self, id: NodeId, name: &str) -> Result<Node> {
        let node = self.get_node(id)?;
        let name = validate_node_name(name)?;
        if self.sibling_exists(node.workspace_id, node.parent_id, &name, Some(id))? {
            return Err(Error::conflict(format!(
                "A {} named '{name}' already exists in this location",
                node.kind
            )));
        }
        self.conn
            .execute("UPDATE nodes SET name = ?1 WHERE id = ?2", params![name, id])?;
        self.get_node(id)
    }

    /// Re-parent a node inside its workspace. `None` moves it to the root.
    pub fn move_node(&self, id: NodeId, target_parent: Option<NodeId>) -> Result<Node> {
        let node = self.get_node(id)?;
        if let Some(target) = target_parent {
            self.require_folder_in(target, node.workspace_id)?;
            if target == id || self.is_descendant(target, id)? {
                return Err(Error::invalid("Cannot move a folder into itself or its descendants"));
            }
        }
        if node.parent_id == target_parent {
            return Ok(node);
        }
        let name = unique_name(&node.name, "copy", |candidate| {
            self.sibling_exists(node.workspace_id, target_parent, candidate, Some(id))
        })?;
        self.conn.execute(
            "UPDATE nodes SET parent_id = ?1, name = ?2 WHERE id = ?3",
            params![target_parent, name, id],
        )?;
        info!(node_id = id, ?target_parent, "moved node");
        self.get_node(id)
    }

    /// Recursive copy into another location (possibly another workspace).
    pub fn copy_node(&self, id: NodeId, request: NodeCopy) -> Result<Node> {
        let source = self.get_node(id)?;
        self.get_workspace(request.target_workspace_id)?;
        if let Some(folder) = request.target_folder_id {
            let target = self.get_node(folder).map_err(|_| Error::not_found("Target folder"))?;
            if !target.is_folder() {
                return Err(Error::not_found("Target folder"));
            }
            if target.workspace_id != request.target_workspace_id {
                return Err(Error::invalid("Target folder must be in the target workspace"));
            }
            if source.is_folder() && (folder == id || self.is_descendant(folder, id)?) {
                return Err(Error::invalid("Cannot copy a folder into itself or its descendants"));
            }
        }

        let base = match request.new_name.as_deref() {
            Some(name) => validate_node_name(name)?,
            None => source.name.clone(),
        };
        let name = unique_name(&base, "copy", |candidate| {
            self.sibling_exists(request.target_workspace_id, request.target_folder_id, candidate, None)
        })?;

        let tx = self.conn.unchecked_transaction()?;
        let copied = self.copy_recursive(&source, request.target_workspace_id, request.target_folder_id, &name)?;
        tx.commit()?;
        info!(source_id = id, copy_id = copied.id, name = %copied.name, "copied node");
        Ok(copied)
    }

    pub fn delete_node(&self, id: NodeId) -> Result<()> {
        let removed = self.conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("Node"));
        }
        info!(node_id = id, "deleted node");
        Ok(())
    }

    pub(crate) fn workspace_nodes(&self, workspace_id: WorkspaceId) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE workspace_id = ?1 ORDER BY id"
        ))?;
        let nodes = stmt
            .query_map(params![workspace_id], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Ancestors root→node, including the node itself.
    pub(crate) fn ancestry(&self, node: &Node) -> Result<Vec<Node>> {
        let mut chain = vec![node.clone()];
        let mut seen = HashSet::from([node.id]);
        let mut parent = node.parent_id;
        while let Some(parent_id) = parent {
            if !seen.insert(parent_id) {
                debug!(node_id = node.id, "cycle detected while walking ancestry");
                break;
            }
            let Ok(current) = self.get_node(parent_id) else {
                break;
            };
            parent = current.parent_id;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    fn breadcrumbs(&self, node: &Node) -> Result<Vec<Breadcrumb>> {
        Ok(self
            .ancestry(node)?
            .into_iter()
            .map(|n| Breadcrumb { id: n.id, name: n.name, kind: n.kind })
            .collect())
    }

    /// True when `candidate` sits somewhere below `ancestor`.
    fn is_descendant(&self, candidate: NodeId, ancestor: NodeId) -> Result<bool> {
        let node = self.get_node(candidate)?;
        Ok(self.ancestry(&node)?.iter().any(|n| n.id == ancestor && n.id != candidate))
    }

    fn require_folder_in(&self, folder_id: NodeId, workspace_id: WorkspaceId) -> Result<Node> {
        let folder = self
            .get_node(folder_id)
            .map_err(|_| Error::not_found("Parent folder"))?;
        if !folder.is_folder() {
            return Err(Error::invalid("Parent must be a folder"));
        }
        if folder.workspace_id != workspace_id {
            return Err(Error::invalid("Parent folder must be in the same workspace"));
        }
        Ok(folder)
    }

    pub(crate) fn sibling_exists(
        &self,
        workspace_id: WorkspaceId,
        parent_id: Option<NodeId>,
        name: &str,
        exclude: Option<NodeId>,
    ) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM nodes
             WHERE workspace_id = ?1 AND parent_id IS ?2 AND name = ?3 AND id IS NOT ?4",
            params![workspace_id, parent_id, name, exclude],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub(crate) fn insert_node(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        kind: NodeKind,
        parent_id: Option<NodeId>,
    ) -> Result<Node> {
        self.conn.execute(
            "INSERT INTO nodes (workspace_id, name, type, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![workspace_id, name, kind.as_str(), parent_id, now()],
        )?;
        self.get_node(self.conn.last_insert_rowid())
    }

    fn copy_recursive(
        &self,
        source: &Node,
        workspace_id: WorkspaceId,
        parent_id: Option<NodeId>,
        name: &str,
    ) -> Result<Node> {
        let children = if source.is_folder() {
            self.list_children(source.workspace_id, Some(source.id))?
        } else {
            Vec::new()
        };
        let copied = self.insert_node(workspace_id, name, source.kind, parent_id)?;

        match source.kind {
            NodeKind::File => {
                self.copy_api_into(source.id, copied.id, None, true)?;
            }
            NodeKind::Folder => {
                if let Some(headers) = self.get_folder_headers(source.id)? {
                    self.set_folder_headers(copied.id, headers)?;
                }
                for child in &children {
                    self.copy_recursive(child, workspace_id, Some(copied.id), &child.name)?;
                }
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiInput, CaseInput, HttpMethod};

    fn setup() -> (Store, WorkspaceId) {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        (store, ws.id)
    }

    fn folder(store: &Store, ws: WorkspaceId, name: &str, parent: Option<NodeId>) -> Node {
        store
            .create_node(NewNode { workspace_id: ws, name: name.into(), kind: NodeKind::Folder, parent_id: parent })
            .unwrap()
    }

    fn file(store: &Store, ws: WorkspaceId, name: &str, parent: Option<NodeId>) -> Node {
        store
            .create_node(NewNode { workspace_id: ws, name: name.into(), kind: NodeKind::File, parent_id: parent })
            .unwrap()
    }

    #[test]
    fn rejects_invalid_names_and_duplicates() {
        let (store, ws) = setup();
        for bad in ["", "  ", "a/b", "what?", "x*y", "<tag>"] {
            let err = store
                .create_node(NewNode { workspace_id: ws, name: bad.into(), kind: NodeKind::File, parent_id: None })
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{bad}");
        }
        file(&store, ws, "users", None);
        let err = store
            .create_node(NewNode { workspace_id: ws, name: "users".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn parent_must_be_folder_in_same_workspace() {
        let (store, ws) = setup();
        let other = store.create_workspace("Other", None).unwrap();
        let f = file(&store, ws, "leaf", None);
        let foreign = folder(&store, other.id, "foreign", None);

        let err = store
            .create_node(NewNode { workspace_id: ws, name: "x".into(), kind: NodeKind::File, parent_id: Some(f.id) })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = store
            .create_node(NewNode { workspace_id: ws, name: "x".into(), kind: NodeKind::File, parent_id: Some(foreign.id) })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn path_runs_from_root() {
        let (store, ws) = setup();
        let a = folder(&store, ws, "a", None);
        let b = folder(&store, ws, "b", Some(a.id));
        let c = file(&store, ws, "c", Some(b.id));

        let with_path = store.node_with_path(c.id).unwrap();
        let names: Vec<_> = with_path.path.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let folder_view = store.node_with_path(a.id).unwrap();
        assert_eq!(folder_view.children.len(), 1);
    }

    #[test]
    fn move_refuses_cycles_and_renames_on_clash() {
        let (store, ws) = setup();
        let a = folder(&store, ws, "a", None);
        let b = folder(&store, ws, "b", Some(a.id));
        assert!(store.move_node(a.id, Some(b.id)).is_err());
        assert!(store.move_node(a.id, Some(a.id)).is_err());

        let root_doc = file(&store, ws, "doc", None);
        file(&store, ws, "doc", Some(b.id));
        let moved = store.move_node(root_doc.id, Some(b.id)).unwrap();
        assert_eq!(moved.parent_id, Some(b.id));
        assert_eq!(moved.name, "doc copy");
    }

    #[test]
    fn copy_is_recursive_and_uniquely_named() {
        let (store, ws) = setup();
        let src = folder(&store, ws, "src", None);
        let f = file(&store, ws, "users", Some(src.id));
        store
            .save_api(
                f.id,
                ApiInput {
                    name: "list users".into(),
                    method: HttpMethod::Get,
                    endpoint: "/users".into(),
                    description: None,
                    is_active: None,
                    extra_meta: None,
                },
            )
            .unwrap();
        store
            .create_case(f.id, CaseInput { name: "ok".into(), ..Default::default() })
            .unwrap();

        let request = || NodeCopy { target_workspace_id: ws, target_folder_id: None, new_name: None };
        let first = store.copy_node(src.id, request()).unwrap();
        let second = store.copy_node(src.id, request()).unwrap();
        let third = store.copy_node(src.id, request()).unwrap();
        assert_eq!(first.name, "src copy");
        assert_eq!(second.name, "src copy 2");
        assert_eq!(third.name, "src copy 3");

        let children = store.list_children(ws, Some(first.id)).unwrap();
        assert_eq!(children.len(), 1);
        let api = store.get_file_api(children[0].id).unwrap();
        assert_eq!(api.endpoint, "/users");
        assert_eq!(store.list_cases(children[0].id, None).unwrap().len(), 1);
    }

    #[test]
    fn copy_carries_folder_headers_and_bare_files() {
        let (store, ws) = setup();
        let src = folder(&store, ws, "src", None);
        let bare = file(&store, ws, "draft", Some(src.id));
        store
            .set_folder_headers(src.id, [("X-Team".to_string(), "core".to_string())].into())
            .unwrap();

        let copy = store
            .copy_node(src.id, NodeCopy { target_workspace_id: ws, target_folder_id: None, new_name: Some("dst".into()) })
            .unwrap();
        assert_eq!(store.get_folder_headers(copy.id).unwrap().unwrap()["X-Team"], "core");
        let children = store.list_children(ws, Some(copy.id)).unwrap();
        assert_eq!(children[0].name, "draft");
        assert!(store.find_file_api(children[0].id).unwrap().is_none());

        let lone = store
            .copy_node(bare.id, NodeCopy { target_workspace_id: ws, target_folder_id: None, new_name: None })
            .unwrap();
        assert_eq!((lone.name.as_str(), lone.kind), ("draft", NodeKind::File));
    }

    #[test]
    fn copy_into_own_subtree_is_rejected() {
        let (store, ws) = setup();
        let a = folder(&store, ws, "a", None);
        let b = folder(&store, ws, "b", Some(a.id));
        let err = store
            .copy_node(a.id, NodeCopy { target_workspace_id: ws, target_folder_id: Some(b.id), new_name: None })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn delete_cascades_to_children() {
        let (store, ws) = setup();
        let a = folder(&store, ws, "a", None);
        let leaf = file(&store, ws, "leaf", Some(a.id));
        store.delete_node(a.id).unwrap();
        assert!(store.get_node(leaf.id).is_err());
        assert!(matches!(store.delete_node(a.id), Err(Error::NotFound(_))));
    }
}
