//! Direct execution of an ad-hoc request in the context of a file: the
//! workspace environment, inherited folder headers and the default headers
//! are applied before sending.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use super::headers::{HeaderMap, layer_headers, set_header};
use super::http::{HttpEngine, OutgoingRequest, ResponseSnapshot, build_url, query_pairs};
use super::variables::{VariableResolver, extract};
use crate::domain::{AuthMethod, Environment, EnvironmentId, HttpMethod, NodeId, SECRET_MASK};
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub file_id: NodeId,
    #[serde(default)]
    pub environment_id: Option<EnvironmentId>,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub auth: AuthMethod,
    /// Explicit values that win over the environment.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub response: ResponseSnapshot,
    pub method: HttpMethod,
    pub original_url: String,
    pub resolved_url: String,
    pub resolved_headers: HeaderMap,
    pub folder_headers: HeaderMap,
    /// Referenced variables and their values, secrets masked.
    pub variables_used: BTreeMap<String, String>,
    pub variables_missing: Vec<String>,
    pub environment_used: Option<String>,
}

/// Everything resolved from the store; sending needs no further lookups.
#[derive(Debug, Clone)]
pub struct PreparedExecution {
    pub request: OutgoingRequest,
    pub original_url: String,
    pub resolved_url: String,
    pub folder_headers: HeaderMap,
    pub variables_used: BTreeMap<String, String>,
    pub variables_missing: Vec<String>,
    pub environment_used: Option<String>,
}

pub fn default_headers(user_agent: &str) -> HeaderMap {
    HeaderMap::from([
        ("Content-Type".to_string(), "application/json".to_string()),
        ("User-Agent".to_string(), user_agent.to_string()),
    ])
}

fn is_ngrok(url: &str) -> bool {
    url.contains(".ngrok.") || url.contains("ngrok-free.app")
}

/// Pick the explicit environment (which must belong to `workspace_id`) or
/// the workspace's active one.
pub fn select_environment(
    store: &Store,
    workspace_id: i64,
    environment_id: Option<EnvironmentId>,
) -> Result<Option<Environment>> {
    match environment_id {
        Some(id) => {
            let env = store.get_environment(id)?;
            if env.workspace_id != workspace_id {
                return Err(Error::invalid("Environment does not belong to this workspace"));
            }
            Ok(Some(env))
        }
        None => store.active_environment(workspace_id),
    }
}

pub fn prepare_direct(store: &Store, request: ExecuteRequest, user_agent: &str) -> Result<PreparedExecution> {
    let file = store.require_file(request.file_id)?;
    let environment = select_environment(store, file.workspace_id, request.environment_id)?;
    let resolver = VariableResolver::for_environment(environment.as_ref(), &request.variables);
    let inherited = store.complete_headers(file.id)?.merged;

    let mut referenced = extract(&request.url);
    for (key, value) in inherited.iter().chain(&request.headers) {
        referenced.extend(extract(key));
        referenced.extend(extract(value));
    }
    let mut missing = Vec::new();
    for name in &referenced {
        if !resolver.is_defined(name) && !missing.contains(name) {
            missing.push(name.clone());
        }
    }
    let params_value = Value::Object(request.params.clone());
    resolver.missing_in_value(&params_value, &mut missing);
    if let Some(body) = &request.body {
        resolver.missing_in_value(body, &mut missing);
    }

    let url = resolver.resolve_str(&request.url);
    let folder_headers = resolver.resolve_map(&inherited);
    let headers = resolver.resolve_map(&request.headers);
    let params = match resolver.resolve_value(&params_value) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let body = request.body.as_ref().map(|b| resolver.resolve_value(b));

    let mut final_headers = layer_headers([&default_headers(user_agent), &folder_headers, &headers]);
    if is_ngrok(&url) {
        set_header(&mut final_headers, "ngrok-skip-browser-warning", "true");
    }

    let query = query_pairs(&params);
    let resolved_url = build_url(&url, &query, &request.auth)?.to_string();

    let variables_used = used_variables(&request, &inherited, &resolver, environment.as_ref());

    Ok(PreparedExecution {
        request: OutgoingRequest {
            method: request.method,
            url,
            headers: final_headers,
            query,
            body,
            auth: request.auth,
            timeout: request.timeout_ms.map(Duration::from_millis),
        },
        original_url: request.url,
        resolved_url,
        folder_headers,
        variables_used,
        variables_missing: missing,
        environment_used: resolver.environment_name().map(str::to_string),
    })
}

/// Defined variables referenced anywhere in the request. Secret environment
/// values are masked unless an explicit override supplied them.
fn used_variables(
    request: &ExecuteRequest,
    inherited: &HeaderMap,
    resolver: &VariableResolver,
    environment: Option<&Environment>,
) -> BTreeMap<String, String> {
    let mut texts = vec![request.url.clone()];
    texts.extend(
        inherited
            .iter()
            .chain(&request.headers)
            .flat_map(|(k, v)| [k.clone(), v.clone()]),
    );
    texts.push(Value::Object(request.params.clone()).to_string());
    if let Some(body) = &request.body {
        texts.push(body.to_string());
    }

    let mut used = BTreeMap::new();
    for name in texts.iter().flat_map(|t| extract(t)) {
        let Some(value) = resolver.variables().get(&name) else {
            continue;
        };
        let secret = !request.variables.contains_key(&name)
            && environment
                .and_then(|env| env.variables.get(&name))
                .is_some_and(|v| v.is_secret);
        let shown = if secret { SECRET_MASK.to_string() } else { value.clone() };
        used.insert(name, shown);
    }
    used
}

pub async fn send_prepared(
    http: &HttpEngine,
    prepared: PreparedExecution,
    cancel_rx: &mut broadcast::Receiver<()>,
) -> Result<ExecuteOutcome> {
    let response = http.send(&prepared.request, cancel_rx).await?;
    info!(
        method = %prepared.request.method,
        url = %prepared.resolved_url,
        status = response.status,
        duration_ms = response.duration_ms,
        "executed request"
    );
    Ok(ExecuteOutcome {
        response,
        method: prepared.request.method,
        original_url: prepared.original_url,
        resolved_url: prepared.resolved_url,
        resolved_headers: prepared.request.headers,
        folder_headers: prepared.folder_headers,
        variables_used: prepared.variables_used,
        variables_missing: prepared.variables_missing,
        environment_used: prepared.environment_used,
    })
}

#[instrument(skip_all, fields(file_id = request.file_id))]
pub async fn execute_direct(
    store: &Store,
    http: &HttpEngine,
    request: ExecuteRequest,
    cancel_rx: &mut broadcast::Receiver<()>,
) -> Result<ExecuteOutcome> {
    let prepared = prepare_direct(store, request, &http.settings().user_agent)?;
    send_prepared(http, prepared, cancel_rx).await
}
