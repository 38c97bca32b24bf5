use std::collections::HashMap;

use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

use super::{Store, now};
use crate::domain::{
    ApiSummary, Node, NodeId, TreeNode, Workspace, WorkspaceId, WorkspaceTree, WorkspaceUpdate,
};
use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid("Workspace name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::invalid(format!(
            "Workspace name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_description(description: Option<&str>) -> Result<Option<String>> {
    match description.map(str::trim) {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(Error::invalid(format!(
            "Description cannot exceed {MAX_DESCRIPTION_LEN} characters"
        ))),
        Some("") | None => Ok(None),
        Some(d) => Ok(Some(d.to_string())),
    }
}

impl Store {
    pub fn create_workspace(&self, name: &str, description: Option<&str>) -> Result<Workspace> {
        let name = validate_name(name)?;
        let description = validate_description(description)?;
        self.conn.execute(
            "INSERT INTO workspaces (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, now()],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(workspace_id = id, %name, "created workspace");
        self.get_workspace(id)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, created_at FROM workspaces ORDER BY id")?;
        let rows = stmt.query_map([], workspace_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_workspace(&self, id: WorkspaceId) -> Result<Workspace> {
        self.conn
            .query_row(
                "SELECT id, name, description, created_at FROM workspaces WHERE id = ?1",
                params![id],
                workspace_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Workspace"))
    }

    pub fn update_workspace(&self, id: WorkspaceId, update: WorkspaceUpdate) -> Result<Workspace> {
        let current = self.get_workspace(id)?;
        let name = match update.name.as_deref() {
            Some(name) => validate_name(name)?,
            None => current.name,
        };
        let description = match update.description.as_deref() {
            Some(description) => validate_description(Some(description))?,
            None => current.description,
        };
        self.conn.execute(
            "UPDATE workspaces SET name = ?1, description = ?2 WHERE id = ?3",
            params![name, description, id],
        )?;
        self.get_workspace(id)
    }

    pub fn delete_workspace(&self, id: WorkspaceId) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("Workspace"));
        }
        info!(workspace_id = id, "deleted workspace");
        Ok(())
    }

    /// Hierarchical view of a workspace. Folders sort before files, then by
    /// name; file nodes carry an API summary when `include_apis` is set.
    pub fn workspace_tree(&self, id: WorkspaceId, include_apis: bool) -> Result<WorkspaceTree> {
        let workspace = self.get_workspace(id)?;
        let nodes = self.workspace_nodes(id)?;
        let summaries = self.api_summaries(id)?;

        let total_nodes = nodes.len();
        let total_apis = summaries.len();
        let total_test_cases = summaries.values().map(|s| s.total_cases).sum();

        let attach = |node: &Node| -> Option<ApiSummary> {
            if include_apis {
                summaries.get(&node.id).cloned()
            } else {
                None
            }
        };
        let file_tree = build_tree(nodes, attach);

        Ok(WorkspaceTree {
            workspace,
            file_tree,
            total_nodes,
            total_apis,
            total_test_cases,
        })
    }

    /// API summaries keyed by file id.
    fn api_summaries(&self, workspace_id: WorkspaceId) -> Result<HashMap<NodeId, ApiSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.file_id, a.id, a.name, a.method, a.endpoint, a.is_active,
                    (SELECT COUNT(*) FROM test_cases c WHERE c.api_id = a.id)
             FROM apis a JOIN nodes n ON n.id = a.file_id
             WHERE n.workspace_id = ?1",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            let method: String = row.get(3)?;
            Ok((
                row.get::<_, NodeId>(0)?,
                ApiSummary {
                    id: row.get(1)?,
                    name: row.get(2)?,
                    method: method.parse().unwrap_or_default(),
                    endpoint: row.get(4)?,
                    is_active: row.get(5)?,
                    total_cases: row.get::<_, i64>(6)? as usize,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }
}

/// Assemble a forest from a flat node list. Orphans whose parent is missing
/// are treated as roots.
pub(crate) fn build_tree(nodes: Vec<Node>, attach: impl Fn(&Node) -> Option<ApiSummary>) -> Vec<TreeNode> {
    let ids: std::collections::HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut by_parent: HashMap<Option<NodeId>, Vec<Node>> = HashMap::new();
    for node in nodes {
        let parent = node.parent_id.filter(|p| ids.contains(p));
        by_parent.entry(parent).or_default().push(node);
    }

    fn assemble(
        parent: Option<NodeId>,
        by_parent: &mut HashMap<Option<NodeId>, Vec<Node>>,
        attach: &dyn Fn(&Node) -> Option<ApiSummary>,
    ) -> Vec<TreeNode> {
        let mut level = by_parent.remove(&parent).unwrap_or_default();
        sort_nodes(&mut level);
        level
            .into_iter()
            .map(|node| {
                let children = assemble(Some(node.id), by_parent, attach);
                TreeNode {
                    api: attach(&node),
                    node,
                    children,
                }
            })
            .collect()
    }

    assemble(None, &mut by_parent, &attach)
}

/// Folders first, then case-insensitive name.
pub(crate) fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        b.is_folder()
            .cmp(&a.is_folder())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
