use std::collections::HashMap;

use rusqlite::{OptionalExtension, params};
use tracing::debug;

use super::{Store, from_json, now, to_json};
use crate::domain::{Breadcrumb, NodeId};
use crate::engine::headers::{HeaderInheritance, HeaderMap, merge_with_priority};
use crate::error::{Error, Result};

fn validate_headers(headers: &HeaderMap) -> Result<()> {
    if let Some(key) = headers.keys().find(|k| k.trim().is_empty()) {
        return Err(Error::invalid(format!("Header name cannot be empty (`{key}`)")));
    }
    Ok(())
}

impl Store {
    /// Replace a folder's headers.
    pub fn set_folder_headers(&self, folder_id: NodeId, headers: HeaderMap) -> Result<HeaderMap> {
        self.require_folder(folder_id)?;
        validate_headers(&headers)?;
        self.conn.execute(
            "INSERT INTO folder_headers (folder_id, content, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(folder_id) DO UPDATE SET
               content = excluded.content,
               updated_at = excluded.updated_at",
            params![folder_id, to_json(&headers)?, now()],
        )?;
        debug!(folder_id, count = headers.len(), "saved folder headers");
        Ok(headers)
    }

    /// Merge keys into a folder's existing headers.
    pub fn update_folder_headers(&self, folder_id: NodeId, headers: HeaderMap) -> Result<HeaderMap> {
        let mut current = self.get_folder_headers(folder_id)?.unwrap_or_default();
        current.extend(headers);
        self.set_folder_headers(folder_id, current)
    }

    pub fn get_folder_headers(&self, folder_id: NodeId) -> Result<Option<HeaderMap>> {
        self.require_folder(folder_id)?;
        let headers = self
            .conn
            .query_row(
                "SELECT content FROM folder_headers WHERE folder_id = ?1",
                params![folder_id],
                |row| from_json::<HeaderMap>(0, &row.get::<_, String>(0)?),
            )
            .optional()?;
        Ok(headers)
    }

    pub fn delete_folder_headers(&self, folder_id: NodeId) -> Result<()> {
        self.require_folder(folder_id)?;
        let removed = self
            .conn
            .execute("DELETE FROM folder_headers WHERE folder_id = ?1", params![folder_id])?;
        if removed == 0 {
            return Err(Error::not_found("Folder headers"));
        }
        Ok(())
    }

    /// Headers inherited by `node_id`: a folder sees its own path, a file
    /// sees the path to its parent folder.
    pub fn complete_headers(&self, node_id: NodeId) -> Result<HeaderInheritance> {
        let node = self.get_node(node_id)?;
        let anchor = if node.is_folder() {
            Some(node)
        } else {
            node.parent_id.map(|id| self.get_node(id)).transpose()?
        };
        let Some(anchor) = anchor else {
            return Ok(HeaderInheritance::default());
        };

        let path: Vec<Breadcrumb> = self
            .ancestry(&anchor)?
            .into_iter()
            .filter(|n| n.is_folder())
            .map(|n| Breadcrumb { id: n.id, name: n.name, kind: n.kind })
            .collect();

        let mut by_folder = HashMap::new();
        for crumb in &path {
            if let Some(headers) = self.get_folder_headers(crumb.id)? {
                by_folder.insert(crumb.id, headers);
            }
        }
        Ok(merge_with_priority(&path, &by_folder))
    }

    fn require_folder(&self, folder_id: NodeId) -> Result<()> {
        let node = self.get_node(folder_id).map_err(|_| Error::not_found("Folder"))?;
        if !node.is_folder() {
            return Err(Error::invalid("Headers can only be set on folders"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewNode, NodeKind};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn file_inherits_folder_chain() {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let root = store
            .create_node(NewNode { workspace_id: ws.id, name: "api".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap();
        let child = store
            .create_node(NewNode { workspace_id: ws.id, name: "v2".into(), kind: NodeKind::Folder, parent_id: Some(root.id) })
            .unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "users".into(), kind: NodeKind::File, parent_id: Some(child.id) })
            .unwrap();

        store
            .set_folder_headers(root.id, headers(&[("Authorization", "Bearer a"), ("X-Env", "dev")]))
            .unwrap();
        store
            .update_folder_headers(child.id, headers(&[("Authorization", "Bearer b")]))
            .unwrap();

        let info = store.complete_headers(file.id).unwrap();
        assert_eq!(info.path.len(), 2);
        assert_eq!(info.merged["Authorization"], "Bearer b");
        assert_eq!(info.merged["X-Env"], "dev");
        assert_eq!(info.contributions[1].headers_overridden.len(), 1);
    }

    #[test]
    fn child_folder_wins_regardless_of_header_case() {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let parent = store
            .create_node(NewNode { workspace_id: ws.id, name: "p".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap();
        let child = store
            .create_node(NewNode { workspace_id: ws.id, name: "c".into(), kind: NodeKind::Folder, parent_id: Some(parent.id) })
            .unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "f".into(), kind: NodeKind::File, parent_id: Some(child.id) })
            .unwrap();
        store.set_folder_headers(parent.id, headers(&[("x-team", "parent")])).unwrap();
        store.set_folder_headers(child.id, headers(&[("X-Team", "child")])).unwrap();

        let info = store.complete_headers(file.id).unwrap();
        assert_eq!(info.merged, headers(&[("X-Team", "child")]));
        assert_eq!(info.contributions[0].headers_added.len(), 1);
        assert_eq!(info.contributions[1].headers_added.len(), 0);
        assert_eq!(info.contributions[1].headers_overridden[0].old_value, "parent");
    }

    #[test]
    fn headers_only_on_folders() {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "f".into(), kind: NodeKind::File, parent_id: None })
            .unwrap();
        assert!(store.set_folder_headers(file.id, HeaderMap::new()).is_err());
        assert!(store.complete_headers(file.id).unwrap().merged.is_empty());
    }

    #[test]
    fn update_merges_and_delete_removes() {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let folder = store
            .create_node(NewNode { workspace_id: ws.id, name: "f".into(), kind: NodeKind::Folder, parent_id: None })
            .unwrap();
        store.set_folder_headers(folder.id, headers(&[("A", "1")])).unwrap();
        let merged = store.update_folder_headers(folder.id, headers(&[("B", "2")])).unwrap();
        assert_eq!(merged.len(), 2);
        store.delete_folder_headers(folder.id).unwrap();
        assert!(store.get_folder_headers(folder.id).unwrap().is_none());
        assert!(matches!(store.delete_folder_headers(folder.id), Err(Error::NotFound(_))));
    }
}
