use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::method::HttpMethod;

pub type WorkspaceId = i64;
pub type NodeId = i64;
pub type ApiId = i64;
pub type CaseId = i64;
pub type EnvironmentId = i64;

/// Masked stand-in for secret variable values.
pub const SECRET_MASK: &str = "***";

// ─── Workspaces & nodes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    File,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(NodeKind::Folder),
            "file" => Some(NodeKind::File),
            _ => None,
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub created_at: String,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeCopy {
    pub target_workspace_id: WorkspaceId,
    pub target_folder_id: Option<NodeId>,
    pub new_name: Option<String>,
}

/// API facts shown on file nodes of a workspace tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSummary {
    pub id: ApiId,
    pub name: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub is_active: bool,
    pub total_cases: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSummary>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceTree {
    pub workspace: Workspace,
    pub file_tree: Vec<TreeNode>,
    pub total_nodes: usize,
    pub total_apis: usize,
    pub total_test_cases: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeWithPath {
    #[serde(flatten)]
    pub node: Node,
    pub path: Vec<Breadcrumb>,
    pub children: Vec<Node>,
}

// ─── APIs & test cases ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: ApiId,
    pub file_id: NodeId,
    pub name: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub description: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub extra_meta: Map<String, Value>,
    pub created_at: String,
}

impl ApiDefinition {
    /// API-level headers kept in `extra_meta.headers`.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.extra_meta
            .get("headers")
            .and_then(Value::as_object)
            .map(string_map)
            .unwrap_or_default()
    }

    pub fn params(&self) -> Map<String, Value> {
        self.extra_meta
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn body(&self) -> Option<Value> {
        self.extra_meta.get("body").filter(|b| !b.is_null()).cloned()
    }

    /// The request as one JSON document. A case layers its headers and
    /// params over the API's, replaces the body when it has one and adds
    /// its expectation.
    pub fn document(&self, case: Option<&TestCase>) -> Value {
        let mut headers = self.headers();
        let mut params = self.params();
        let mut body = self.body();
        let mut expected = Value::Null;
        if let Some(case) = case {
            headers.extend(case.headers.clone());
            params.extend(case.params.clone());
            body = case.body.clone().or(body);
            expected = case.expected.clone();
        }
        let mut doc = json!({
            "url": self.endpoint,
            "method": self.method.to_string(),
            "headers": headers,
            "params": params,
            "body": body,
        });
        if !expected.is_null() {
            doc["expected"] = expected;
        }
        doc
    }

    pub fn signature(&self) -> String {
        api_signature(self.method, &self.endpoint)
    }
}

/// `"METHOD /path"` with the query string stripped; groups the same API
/// across files.
pub fn api_signature(method: HttpMethod, endpoint: &str) -> String {
    let path = endpoint.split('?').next().unwrap_or_default().trim();
    if path.is_empty() {
        method.to_string()
    } else {
        format!("{method} {path}")
    }
}

/// Flatten a JSON object to string values; strings are kept verbatim.
pub fn string_map(object: &Map<String, Value>) -> BTreeMap<String, String> {
    object
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect()
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiInput {
    pub name: String,
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub extra_meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicatedApi {
    pub new_file: Node,
    pub api: ApiDefinition,
    pub duplicated_cases: usize,
    pub duplicated_from_file_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    pub api_id: ApiId,
    pub name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub expected: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseInput {
    pub name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseUpdate {
    pub name: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub params: Option<Map<String, Value>>,
    pub body: Option<Value>,
    pub expected: Option<Value>,
}

/// Workspace node with everything a bulk run needs: folder headers on
/// folders, the API and its cases on files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkNode {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub children: Vec<BulkNode>,
}

impl BulkNode {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

// ─── Environments ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_secret: bool,
}

fn default_enabled() -> bool {
    true
}

impl EnvVariable {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            description: None,
            is_enabled: true,
            is_secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            is_secret: true,
            ..Self::new(value)
        }
    }

    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.is_secret && !copy.value.is_empty() {
            copy.value = SECRET_MASK.to_string();
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, EnvVariable>,
    pub created_at: String,
    pub updated_at: String,
}

impl Environment {
    pub fn masked(&self) -> Self {
        Self {
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.masked()))
                .collect(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, EnvVariable>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableUpdate {
    pub key: Option<String>,
    pub value: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
    pub is_secret: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}
