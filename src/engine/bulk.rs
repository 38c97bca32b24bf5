//! Bulk testing: expand/collapse bookkeeping over a fetched tree, the
//! selection model, and turning a selection or a set of filters into an
//! ordered run plan.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::headers::{HeaderMap, layer_headers};
use super::runner::RunTarget;
use crate::domain::{ApiId, BulkNode, CaseId, HttpMethod, NodeId};
use crate::error::{Error, Result};

// ─── Collection tree ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Folder,
    File,
    Case,
}

/// One line of the rendered tree. `id` is always a node id; case rows carry
/// the id of their file and set `case_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleRow {
    pub id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<CaseId>,
    pub kind: RowKind,
    pub name: String,
    pub depth: usize,
    pub expanded: bool,
    pub api_id: Option<ApiId>,
    pub method: Option<HttpMethod>,
    pub endpoint: Option<String>,
    pub case_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub folders: usize,
    pub files: usize,
    pub apis: usize,
    pub cases: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BulkCollectionTree {
    roots: Vec<BulkNode>,
    expanded: HashSet<NodeId>,
}

impl BulkCollectionTree {
    pub fn new(roots: Vec<BulkNode>) -> Self {
        Self { roots, expanded: HashSet::new() }
    }

    pub fn roots(&self) -> &[BulkNode] {
        &self.roots
    }

    /// Flip a node's expansion; returns the new state. Ids that are not
    /// nodes of this tree are ignored.
    pub fn toggle(&mut self, id: NodeId) -> bool {
        if self.find(id).is_none() {
            return false;
        }
        if self.expanded.remove(&id) {
            false
        } else {
            self.expanded.insert(id);
            true
        }
    }

    pub fn expand_all(&mut self) {
        let mut ids = Vec::new();
        walk(&self.roots, &mut |node, _| {
            if node.is_folder() || !node.test_cases.is_empty() {
                ids.push(node.id);
            }
        });
        self.expanded.extend(ids);
    }

    pub fn collapse_all(&mut self) {
        self.expanded.clear();
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.expanded.contains(&id)
    }

    /// Depth-first rows; children are listed only under expanded nodes.
    pub fn visible_rows(&self) -> Vec<VisibleRow> {
        let mut rows = Vec::new();
        self.push_rows(&self.roots, 0, &mut rows);
        rows
    }

    fn push_rows(&self, nodes: &[BulkNode], depth: usize, rows: &mut Vec<VisibleRow>) {
        for node in nodes {
            let expanded = self.is_expanded(node.id);
            rows.push(VisibleRow {
                id: node.id,
                case_id: None,
                kind: if node.is_folder() { RowKind::Folder } else { RowKind::File },
                name: node.name.clone(),
                depth,
                expanded,
                api_id: node.api.as_ref().map(|a| a.id),
                method: node.api.as_ref().map(|a| a.method),
                endpoint: node.api.as_ref().map(|a| a.endpoint.clone()),
                case_count: node.test_cases.len(),
            });
            if !expanded {
                continue;
            }
            if node.is_folder() {
                self.push_rows(&node.children, depth + 1, rows);
            } else {
                rows.extend(node.test_cases.iter().map(|case| VisibleRow {
                    id: node.id,
                    case_id: Some(case.id),
                    kind: RowKind::Case,
                    name: case.name.clone(),
                    depth: depth + 1,
                    expanded: false,
                    api_id: Some(case.api_id),
                    method: None,
                    endpoint: None,
                    case_count: 0,
                }));
            }
        }
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        walk(&self.roots, &mut |node, _| {
            if node.is_folder() {
                stats.folders += 1;
            } else {
                stats.files += 1;
            }
            if node.api.is_some() {
                stats.apis += 1;
            }
            stats.cases += node.test_cases.len();
        });
        stats
    }

    pub fn find(&self, id: NodeId) -> Option<&BulkNode> {
        find_in(&self.roots, id)
    }

    /// APIs at or below `id`, in tree order.
    pub fn apis_under(&self, id: NodeId) -> Vec<ApiId> {
        let Some(node) = self.find(id) else {
            return Vec::new();
        };
        let mut apis = Vec::new();
        walk(std::slice::from_ref(node), &mut |n, _| {
            if let Some(api) = &n.api {
                apis.push(api.id);
            }
        });
        apis
    }

    pub fn case_ids(&self, api_id: ApiId) -> Vec<CaseId> {
        let mut ids = Vec::new();
        walk(&self.roots, &mut |node, _| {
            if node.api.as_ref().is_some_and(|a| a.id == api_id) {
                ids.extend(node.test_cases.iter().map(|c| c.id));
            }
        });
        ids
    }
}

fn walk<'a>(nodes: &'a [BulkNode], visit: &mut dyn FnMut(&'a BulkNode, usize)) {
    fn go<'a>(nodes: &'a [BulkNode], depth: usize, visit: &mut dyn FnMut(&'a BulkNode, usize)) {
        for node in nodes {
            visit(node, depth);
            go(&node.children, depth + 1, visit);
        }
    }
    go(nodes, 0, visit);
}

fn find_in(nodes: &[BulkNode], id: NodeId) -> Option<&BulkNode> {
    nodes
        .iter()
        .find_map(|node| if node.id == id { Some(node) } else { find_in(&node.children, id) })
}

// ─── Selection ────────────────────────────────────────────────────────────────

/// Selected work: whole APIs, or individual cases of APIs that are not
/// wholly selected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSelection {
    apis: BTreeSet<ApiId>,
    cases: BTreeMap<ApiId, BTreeSet<CaseId>>,
}

impl BulkSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a whole API; individually selected cases of it are dropped.
    pub fn select_api(&mut self, api: ApiId) {
        self.cases.remove(&api);
        self.apis.insert(api);
    }

    pub fn deselect_api(&mut self, api: ApiId) {
        self.apis.remove(&api);
        self.cases.remove(&api);
    }

    /// No-op when the API is already wholly selected.
    pub fn select_case(&mut self, api: ApiId, case: CaseId) {
        if self.apis.contains(&api) {
            return;
        }
        self.cases.entry(api).or_default().insert(case);
    }

    /// A wholly selected API degrades to all of `all_case_ids` but `case`.
    pub fn deselect_case(&mut self, api: ApiId, case: CaseId, all_case_ids: &[CaseId]) {
        if self.apis.remove(&api) {
            let rest: BTreeSet<CaseId> = all_case_ids.iter().copied().filter(|c| *c != case).collect();
            if !rest.is_empty() {
                self.cases.insert(api, rest);
            }
            return;
        }
        if let Some(selected) = self.cases.get_mut(&api) {
            selected.remove(&case);
            if selected.is_empty() {
                self.cases.remove(&api);
            }
        }
    }

    /// Select every API under `folder`, or deselect them all when they were
    /// all selected already.
    pub fn toggle_folder(&mut self, tree: &BulkCollectionTree, folder: NodeId) {
        let apis = tree.apis_under(folder);
        if apis.is_empty() {
            return;
        }
        if apis.iter().all(|api| self.apis.contains(api)) {
            apis.iter().for_each(|api| self.deselect_api(*api));
        } else {
            apis.iter().for_each(|api| self.select_api(*api));
        }
    }

    pub fn merge(&mut self, other: &BulkSelection) {
        for api in &other.apis {
            self.select_api(*api);
        }
        for (api, cases) in &other.cases {
            for case in cases {
                self.select_case(*api, *case);
            }
        }
    }

    pub fn is_api_selected(&self, api: ApiId) -> bool {
        self.apis.contains(&api)
    }

    pub fn is_selected(&self, api: ApiId, case: CaseId) -> bool {
        self.apis.contains(&api) || self.cases.get(&api).is_some_and(|c| c.contains(&case))
    }

    /// Number of cases that would run.
    pub fn selected_count(&self, tree: &BulkCollectionTree) -> usize {
        let whole: usize = self.apis.iter().map(|api| tree.case_ids(*api).len()).sum();
        whole + self.cases.values().map(BTreeSet::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty() && self.cases.is_empty()
    }

    pub fn clear(&mut self) {
        self.apis.clear();
        self.cases.clear();
    }
}

// ─── Run plans ────────────────────────────────────────────────────────────────

/// Which part of a workspace to run. Arguments are optional so that missing
/// ones can be reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RunFilter {
    Project,
    Folder {
        #[serde(default)]
        folder_id: Option<NodeId>,
    },
    File {
        #[serde(default)]
        file_id: Option<NodeId>,
    },
    Api {
        #[serde(default)]
        api_signatures: Vec<String>,
    },
    Case {
        #[serde(default)]
        file_id: Option<NodeId>,
        #[serde(default)]
        case_names: Vec<String>,
    },
}

struct Candidate<'a> {
    ancestors: Vec<NodeId>,
    file: &'a BulkNode,
    path: String,
    headers: HeaderMap,
}

/// Every file with an API, in tree order, with its folder ancestry and
/// inherited headers.
fn candidates(roots: &[BulkNode]) -> Vec<Candidate<'_>> {
    fn go<'a>(
        nodes: &'a [BulkNode],
        ancestors: &mut Vec<NodeId>,
        names: &mut Vec<String>,
        headers: &HeaderMap,
        out: &mut Vec<Candidate<'a>>,
    ) {
        for node in nodes {
            if node.is_folder() {
                let inherited = layer_headers([headers, &node.headers]);
                ancestors.push(node.id);
                names.push(node.name.clone());
                go(&node.children, ancestors, names, &inherited, out);
                ancestors.pop();
                names.pop();
            } else if node.api.is_some() {
                let mut path = names.clone();
                path.push(node.name.clone());
                out.push(Candidate {
                    ancestors: ancestors.clone(),
                    file: node,
                    path: path.join("/"),
                    headers: headers.clone(),
                });
            }
        }
    }
    let mut out = Vec::new();
    go(roots, &mut Vec::new(), &mut Vec::new(), &HeaderMap::new(), &mut out);
    out
}

fn targets_where(roots: &[BulkNode], mut keep: impl FnMut(&Candidate<'_>, ApiId, &crate::domain::TestCase) -> bool) -> Vec<RunTarget> {
    let mut plan = Vec::new();
    for candidate in candidates(roots) {
        let Some(api) = candidate.file.api.as_ref() else {
            continue;
        };
        for case in &candidate.file.test_cases {
            if keep(&candidate, api.id, case) {
                plan.push(RunTarget {
                    file_id: candidate.file.id,
                    file_path: candidate.path.clone(),
                    api: api.clone(),
                    case: case.clone(),
                    inherited_headers: candidate.headers.clone(),
                });
            }
        }
    }
    plan
}

pub fn plan_from_selection(tree: &BulkCollectionTree, selection: &BulkSelection) -> Vec<RunTarget> {
    targets_where(tree.roots(), |_, api, case| selection.is_selected(api, case.id))
}

/// Union of all filters, de-duplicated, in tree order.
pub fn plan_from_filters(tree: &BulkCollectionTree, filters: &[RunFilter]) -> Result<Vec<RunTarget>> {
    let mut everything = false;
    let mut folders = HashSet::new();
    let mut files = HashSet::new();
    let mut signatures = HashSet::new();
    let mut named: Vec<(NodeId, HashSet<String>)> = Vec::new();

    for filter in filters {
        match filter {
            RunFilter::Project => everything = true,
            RunFilter::Folder { folder_id } => {
                let id = folder_id.ok_or_else(|| Error::invalid("folder_id required for scope=folder"))?;
                match tree.find(id) {
                    Some(node) if node.is_folder() => folders.insert(id),
                    _ => return Err(Error::not_found(format!("Folder {id}"))),
                };
            }
            RunFilter::File { file_id } => {
                let id = file_id.ok_or_else(|| Error::invalid("file_id required for scope=file"))?;
                require_file(tree, id)?;
                files.insert(id);
            }
            RunFilter::Api { api_signatures } => {
                if api_signatures.is_empty() {
                    return Err(Error::invalid("api_signatures required for scope=api"));
                }
                signatures.extend(api_signatures.iter().map(|s| normalize_signature(s)));
            }
            RunFilter::Case { file_id, case_names } => {
                let (Some(id), false) = (file_id, case_names.is_empty()) else {
                    return Err(Error::invalid("file_id and case_names required for scope=case"));
                };
                require_file(tree, *id)?;
                named.push((*id, case_names.iter().cloned().collect()));
            }
        }
    }

    Ok(targets_where(tree.roots(), |candidate, _, case| {
        let file = candidate.file;
        everything
            || files.contains(&file.id)
            || candidate.ancestors.iter().any(|a| folders.contains(a))
            || file
                .api
                .as_ref()
                .is_some_and(|api| signatures.contains(&api.signature()))
            || named
                .iter()
                .any(|(id, names)| *id == file.id && names.contains(&case.name))
    }))
}

fn require_file(tree: &BulkCollectionTree, id: NodeId) -> Result<()> {
    match tree.find(id) {
        Some(node) if !node.is_folder() => Ok(()),
        _ => Err(Error::not_found(format!("File {id}"))),
    }
}

/// `"get  /a?x=1"` → `"GET /a"`.
fn normalize_signature(raw: &str) -> String {
    let mut parts = raw.split_whitespace();
    let method = parts.next().unwrap_or_default().to_ascii_uppercase();
    let path = parts.next().unwrap_or_default();
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() { method } else { format!("{method} {path}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiDefinition, NodeKind, TestCase};
    use serde_json::{Map, json};

    fn case(id: CaseId, api_id: ApiId, name: &str) -> TestCase {
        TestCase {
            id,
            api_id,
            name: name.into(),
            headers: Default::default(),
            params: Map::new(),
            body: None,
            expected: json!({}),
            created_at: String::new(),
        }
    }

    fn file(id: NodeId, name: &str, api_id: ApiId, method: HttpMethod, endpoint: &str, cases: Vec<TestCase>) -> BulkNode {
        BulkNode {
            id,
            name: name.into(),
            kind: NodeKind::File,
            parent_id: None,
            headers: HeaderMap::new(),
            api: Some(ApiDefinition {
                id: api_id,
                file_id: id,
                name: name.into(),
                method,
                endpoint: endpoint.into(),
                description: None,
                is_active: true,
                extra_meta: Map::new(),
                created_at: String::new(),
            }),
            test_cases: cases,
            children: vec![],
        }
    }

    fn folder(id: NodeId, name: &str, headers: &[(&str, &str)], children: Vec<BulkNode>) -> BulkNode {
        BulkNode {
            id,
            name: name.into(),
            kind: NodeKind::Folder,
            parent_id: None,
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            api: None,
            test_cases: vec![],
            children,
        }
    }

    /// billing/ (X-Team: billing)
    ///   invoices  GET /invoices   cases 1, 2
    ///   refunds/  (X-Team: refunds)
    ///     create  POST /refunds   case 3
    /// ping        GET /ping       case 4
    fn tree() -> BulkCollectionTree {
        BulkCollectionTree::new(vec![
            folder(
                1,
                "billing",
                &[("X-Team", "billing")],
                vec![
                    file(2, "invoices", 10, HttpMethod::Get, "/invoices?page=1", vec![case(1, 10, "list"), case(2, 10, "empty")]),
                    folder(
                        3,
                        "refunds",
                        &[("X-Team", "refunds")],
                        vec![file(4, "create", 11, HttpMethod::Post, "/refunds", vec![case(3, 11, "ok")])],
                    ),
                ],
            ),
            file(5, "ping", 12, HttpMethod::Get, "/ping", vec![case(4, 12, "alive")]),
        ])
    }

    fn case_ids(plan: &[RunTarget]) -> Vec<CaseId> {
        plan.iter().map(|t| t.case.id).collect()
    }

    #[test]
    fn rows_follow_expansion() {
        let mut tree = tree();
        assert_eq!(tree.visible_rows().len(), 2);
        assert!(tree.toggle(1));
        let rows = tree.visible_rows();
        assert_eq!(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["billing", "invoices", "refunds", "ping"]);
        assert_eq!(rows[1].depth, 1);

        tree.expand_all();
        assert_eq!(tree.visible_rows().len(), 9);
        tree.collapse_all();
        assert!(!tree.is_expanded(1));
        assert!(tree.toggle(1));
        assert!(tree.is_expanded(1));
        assert!(!tree.toggle(1));
        assert!(!tree.is_expanded(1));
    }

    #[test]
    fn case_rows_point_at_their_file() {
        let mut tree = tree();
        tree.toggle(1);
        tree.toggle(2);
        let rows = tree.visible_rows();
        let cases: Vec<_> = rows.iter().filter(|r| r.kind == RowKind::Case).collect();
        assert_eq!(cases.len(), 2);
        assert!(cases.iter().all(|r| r.id == 2));
        assert_eq!(cases.iter().map(|r| r.case_id).collect::<Vec<_>>(), [Some(1), Some(2)]);
        assert!(rows.iter().filter(|r| r.kind != RowKind::Case).all(|r| r.case_id.is_none()));

        assert!(!tree.toggle(99));
        assert!(!tree.is_expanded(99));
    }

    #[test]
    fn stats_and_apis_under() {
        let tree = tree();
        assert_eq!(tree.stats(), TreeStats { folders: 2, files: 3, apis: 3, cases: 4 });
        assert_eq!(tree.apis_under(1), [10, 11]);
        assert_eq!(tree.apis_under(5), [12]);
        assert!(tree.apis_under(99).is_empty());
    }

    #[test]
    fn selecting_api_drops_individual_cases() {
        let mut selection = BulkSelection::new();
        selection.select_case(10, 1);
        selection.select_api(10);
        selection.select_case(10, 2);
        assert!(selection.is_api_selected(10));
        assert_eq!(selection.selected_count(&tree()), 2);

        selection.deselect_case(10, 1, &[1, 2]);
        assert!(!selection.is_api_selected(10));
        assert!(selection.is_selected(10, 2));
        assert!(!selection.is_selected(10, 1));

        selection.deselect_case(10, 2, &[1, 2]);
        assert!(selection.is_empty());
    }

    #[test]
    fn toggle_folder_selects_then_clears() {
        let tree = tree();
        let mut selection = BulkSelection::new();
        selection.toggle_folder(&tree, 1);
        assert!(selection.is_api_selected(10) && selection.is_api_selected(11));
        selection.toggle_folder(&tree, 1);
        assert!(selection.is_empty());

        selection.select_api(10);
        selection.toggle_folder(&tree, 1);
        assert!(selection.is_api_selected(11));
    }

    #[test]
    fn merge_respects_whole_api_rule() {
        let mut a = BulkSelection::new();
        a.select_api(10);
        let mut b = BulkSelection::new();
        b.select_case(10, 1);
        b.select_case(12, 4);
        a.merge(&b);
        assert!(a.is_api_selected(10));
        assert!(a.is_selected(12, 4));
        assert_eq!(a.selected_count(&tree()), 3);
    }

    #[test]
    fn selection_plan_carries_inherited_headers() {
        let tree = tree();
        let mut selection = BulkSelection::new();
        selection.select_api(11);
        selection.select_case(12, 4);
        let plan = plan_from_selection(&tree, &selection);
        assert_eq!(case_ids(&plan), [3, 4]);
        assert_eq!(plan[0].file_path, "billing/refunds/create");
        assert_eq!(plan[0].inherited_headers["X-Team"], "refunds");
        assert!(plan[1].inherited_headers.is_empty());
    }

    #[test]
    fn filters_union_and_dedup() {
        let tree = tree();
        let plan = plan_from_filters(
            &tree,
            &[
                RunFilter::Folder { folder_id: Some(3) },
                RunFilter::Api { api_signatures: vec!["get /invoices".into()] },
                RunFilter::Case { file_id: Some(4), case_names: vec!["ok".into()] },
            ],
        )
        .unwrap();
        assert_eq!(case_ids(&plan), [1, 2, 3]);

        let all = plan_from_filters(&tree, &[RunFilter::Project, RunFilter::File { file_id: Some(5) }]).unwrap();
        assert_eq!(case_ids(&all), [1, 2, 3, 4]);

        let named = plan_from_filters(&tree, &[RunFilter::Case { file_id: Some(2), case_names: vec!["empty".into()] }]).unwrap();
        assert_eq!(case_ids(&named), [2]);
    }

    #[test]
    fn filters_report_missing_arguments() {
        let tree = tree();
        for filter in [
            RunFilter::Folder { folder_id: None },
            RunFilter::File { file_id: None },
            RunFilter::Api { api_signatures: vec![] },
            RunFilter::Case { file_id: Some(2), case_names: vec![] },
        ] {
            assert!(matches!(plan_from_filters(&tree, &[filter]), Err(Error::InvalidInput(_))));
        }
        assert!(matches!(
            plan_from_filters(&tree, &[RunFilter::Folder { folder_id: Some(2) }]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn filter_json_shape() {
        let filter: RunFilter = serde_json::from_value(json!({"scope": "case", "file_id": 2, "case_names": ["list"]})).unwrap();
        assert_eq!(filter, RunFilter::Case { file_id: Some(2), case_names: vec!["list".into()] });
    }
}
