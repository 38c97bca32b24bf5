//! Header layering: folder inheritance and the final request header set.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{Breadcrumb, NodeId};

pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderOverride {
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

/// What one folder added to or changed in the inherited set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderContribution {
    pub folder_id: NodeId,
    pub folder_name: String,
    pub headers_added: Vec<HeaderEntry>,
    pub headers_overridden: Vec<HeaderOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderInheritance {
    pub path: Vec<Breadcrumb>,
    pub merged: HeaderMap,
    pub contributions: Vec<HeaderContribution>,
}

/// Merge folder headers root→leaf; a child folder overrides its parents.
/// Folders that contributed nothing are left out of `contributions`.
pub fn merge_with_priority(
    path: &[Breadcrumb],
    headers_by_folder: &HashMap<NodeId, HeaderMap>,
) -> HeaderInheritance {
    let mut merged = HeaderMap::new();
    let mut contributions = Vec::new();

    for folder in path {
        let Some(headers) = headers_by_folder.get(&folder.id) else {
            continue;
        };
        let mut contribution = HeaderContribution {
            folder_id: folder.id,
            folder_name: folder.name.clone(),
            headers_added: Vec::new(),
            headers_overridden: Vec::new(),
        };
        for (key, value) in headers {
            let previous = get_header(&merged, key).map(str::to_string);
            set_header(&mut merged, key, value.clone());
            match previous {
                Some(old_value) => contribution.headers_overridden.push(HeaderOverride {
                    key: key.clone(),
                    old_value,
                    new_value: value.clone(),
                }),
                None => contribution.headers_added.push(HeaderEntry {
                    key: key.clone(),
                    value: value.clone(),
                }),
            }
        }
        if !contribution.headers_added.is_empty() || !contribution.headers_overridden.is_empty() {
            contributions.push(contribution);
        }
    }

    HeaderInheritance {
        path: path.to_vec(),
        merged,
        contributions,
    }
}

/// Insert replacing any existing header whose name matches case-insensitively.
pub fn set_header(headers: &mut HeaderMap, key: &str, value: impl Into<String>) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
    headers.insert(key.to_string(), value.into());
}

pub fn get_header<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}

/// Apply layers in order; later layers win.
pub fn layer_headers<'a>(layers: impl IntoIterator<Item = &'a HeaderMap>) -> HeaderMap {
    let mut result = HeaderMap::new();
    for layer in layers {
        for (key, value) in layer {
            set_header(&mut result, key, value.clone());
        }
    }
    result
}

/// `defaults < folder < api < case`.
pub fn final_request_headers(defaults: &HeaderMap, folder: &HeaderMap, api: &HeaderMap, case: &HeaderMap) -> HeaderMap {
    layer_headers([defaults, folder, api, case])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeKind;

    fn crumb(id: NodeId, name: &str) -> Breadcrumb {
        Breadcrumb { id, name: name.into(), kind: NodeKind::Folder }
    }

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn child_overrides_parent_and_records_it() {
        let path = vec![crumb(1, "root"), crumb(2, "mid"), crumb(3, "leaf")];
        let mut by_folder = HashMap::new();
        by_folder.insert(1, map(&[("Authorization", "Bearer root"), ("X-Env", "dev")]));
        by_folder.insert(3, map(&[("Authorization", "Bearer leaf")]));

        let info = merge_with_priority(&path, &by_folder);
        assert_eq!(info.merged["Authorization"], "Bearer leaf");
        assert_eq!(info.merged["X-Env"], "dev");
        assert_eq!(info.contributions.len(), 2);
        let leaf = &info.contributions[1];
        assert_eq!(leaf.folder_name, "leaf");
        assert_eq!(leaf.headers_overridden[0].old_value, "Bearer root");
        assert!(leaf.headers_added.is_empty());
    }

    #[test]
    fn override_matches_names_in_any_case() {
        let path = vec![crumb(1, "root"), crumb(2, "leaf")];
        let mut by_folder = HashMap::new();
        by_folder.insert(1, map(&[("x-team", "parent")]));
        by_folder.insert(2, map(&[("X-Team", "child")]));

        let info = merge_with_priority(&path, &by_folder);
        assert_eq!(info.merged, map(&[("X-Team", "child")]));
        let leaf = &info.contributions[1];
        assert!(leaf.headers_added.is_empty());
        assert_eq!(leaf.headers_overridden[0].old_value, "parent");
        assert_eq!(leaf.headers_overridden[0].new_value, "child");
    }

    #[test]
    fn final_headers_compare_names_case_insensitively() {
        let defaults = map(&[("Content-Type", "application/json"), ("User-Agent", "bench")]);
        let folder = map(&[("x-team", "core")]);
        let api = map(&[("content-type", "text/plain")]);
        let case = map(&[("X-Team", "edge")]);

        let headers = final_request_headers(&defaults, &folder, &api, &case);
        assert_eq!(headers.len(), 3);
        assert_eq!(get_header(&headers, "CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("X-Team").map(String::as_str), Some("edge"));
    }
}
