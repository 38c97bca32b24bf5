//! Client for a hosted backend exposing the same resources over REST.
//!
//! Every response is wrapped in an envelope:
//!
//! ```json
//! { "response_code": 200, "data": { ... }, "message": null, "error_message": null }
//! ```
//!
//! The backend reports some failures (e.g. "not found") with a 2xx status and
//! an `error_message`, so the envelope is checked even on success.

use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{EnvironmentId, NodeId, WorkspaceId};
use crate::engine::execute::ExecuteRequest;
use crate::engine::http::{HttpEngine, HttpSettings};
use crate::error::{Error, Result};
use crate::session::{Session, SessionStore};

/// Message the backend attaches to a 401 when the token is no longer valid.
pub const SESSION_EXPIRED_MESSAGE: &str = "Authentication required";

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    response_code: Option<u16>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    detail: Option<Value>,
}

impl Envelope {
    fn server_message(&self) -> Option<String> {
        self.error_message
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| match &self.detail {
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
                None => None,
            })
    }
}

/// User-facing text for a failed call.
pub fn handle_api_error(status: u16, server_message: Option<&str>) -> String {
    let server = server_message.map(str::trim).filter(|m| !m.is_empty());
    match status {
        400 => server.unwrap_or("Invalid request. Please check your input.").to_string(),
        401 => "Your session has expired. Please sign in again.".to_string(),
        403 => "You do not have permission to perform this action.".to_string(),
        404 => server.unwrap_or("The requested resource was not found.").to_string(),
        422 => match server {
            Some(msg) => format!("Validation error: {msg}"),
            None => "Validation error. Please check your input.".to_string(),
        },
        429 => "Too many requests. Please wait a moment and try again.".to_string(),
        500..=599 => "Server error. Please try again later.".to_string(),
        _ => server.unwrap_or("An unexpected error occurred.").to_string(),
    }
}

enum Failure {
    Unauthorized(Option<String>),
    Status { status: u16, message: Option<String> },
}

/// Unwrap an envelope into its `data`.
fn read_envelope(status: u16, body: &[u8]) -> std::result::Result<Value, Failure> {
    let envelope: Envelope = if body.is_empty() {
        Envelope::default()
    } else {
        serde_json::from_slice(body).unwrap_or_default()
    };
    let message = envelope.server_message();

    if status == 401 {
        return Err(Failure::Unauthorized(message));
    }
    if !(200..300).contains(&status) {
        return Err(Failure::Status { status, message });
    }
    match envelope.data {
        Some(data) => Ok(data),
        None if envelope.error_message.is_some() => Err(Failure::Status {
            status: envelope.response_code.unwrap_or(status),
            message,
        }),
        None => Ok(Value::Null),
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    client: Client,
    sessions: SessionStore,
}

impl RemoteClient {
    pub fn new(base_url: &str, settings: HttpSettings, sessions: SessionStore) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("remote.base_url is not set".into()));
        }
        let client = HttpEngine::new(settings)?.client().clone();
        Ok(Self { base_url, client, sessions })
    }

    pub fn session(&self) -> Option<Session> {
        self.sessions.load()
    }

    /// Drop the local session.
    pub fn force_logout(&self) -> Result<()> {
        warn!("session expired, signing out");
        self.sessions.clear()
    }

    /// 401 with the expiry message signs out; any other 401 leaves the
    /// session alone.
    pub fn handle_unauthorized(&self, message: Option<&str>) -> Error {
        if message == Some(SESSION_EXPIRED_MESSAGE) {
            if let Err(err) = self.force_logout() {
                warn!(error = %err, "failed to clear session");
            }
            return Error::SessionExpired;
        }
        Error::Remote {
            status: 401,
            message: message.map_or_else(|| handle_api_error(401, None), str::to_string),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(session) = self.sessions.load() {
            builder = builder
                .bearer_auth(&session.access_token)
                .header("username", &session.username);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                Error::Timeout(err.to_string())
            } else {
                Error::Request(err.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let url = response.url().path().to_string();
        let body = response.bytes().await?;
        debug!(status, path = %url, "remote response");

        read_envelope(status, &body).map_err(|failure| match failure {
            Failure::Unauthorized(message) => self.handle_unauthorized(message.as_deref()),
            Failure::Status { status, message } => Error::Remote {
                status,
                message: handle_api_error(status, message.as_deref()),
            },
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let data = self
            .post("/sso/sign_in", &json!({ "email": email, "password": password }))
            .await?;
        let token = data
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Remote { status: 502, message: "Sign-in response carried no token".into() })?;
        let mut session = Session::new(token, email);
        if let Some(kind) = data.get("token_type").and_then(Value::as_str) {
            session.token_type = kind.to_string();
        }
        self.sessions.save(&session)?;
        info!(username = %email, "signed in");
        Ok(session)
    }

    /// Revoke the token remotely when possible; the local session is always
    /// cleared.
    pub async fn sign_out(&self) -> Result<()> {
        if self.sessions.load().is_none() {
            return Ok(());
        }
        let remote = self.send(self.request(Method::DELETE, "/sso/logout")).await;
        self.sessions.clear()?;
        match remote {
            Ok(_) | Err(Error::SessionExpired) => Ok(()),
            Err(err) => {
                warn!(error = %err, "remote logout failed");
                Ok(())
            }
        }
    }

    pub async fn list_workspaces(&self) -> Result<Value> {
        self.get("/workspace/list").await
    }

    pub async fn workspace_tree(&self, workspace_id: WorkspaceId) -> Result<Value> {
        self.get(&format!("/workspace/{workspace_id}")).await
    }

    pub async fn file_api(&self, file_id: NodeId, include_cases: bool) -> Result<Value> {
        self.get(&format!("/file/{file_id}/api?include_cases={include_cases}")).await
    }

    pub async fn bulk_testing_tree(&self, workspace_id: WorkspaceId) -> Result<Value> {
        self.get(&format!("/workspace/{workspace_id}/bulk-testing-tree")).await
    }

    pub async fn list_environments(&self, workspace_id: WorkspaceId) -> Result<Value> {
        self.get(&format!("/workspace/{workspace_id}/environments")).await
    }

    pub async fn activate_environment(&self, workspace_id: WorkspaceId, environment_id: EnvironmentId) -> Result<Value> {
        self.post(
            &format!("/workspace/{workspace_id}/environments/{environment_id}/activate"),
            &Value::Null,
        )
        .await
    }

    pub async fn resolve_text(
        &self,
        workspace_id: WorkspaceId,
        text: &str,
        environment_id: Option<EnvironmentId>,
    ) -> Result<Value> {
        let path = match environment_id {
            Some(env) => format!("/workspace/{workspace_id}/environments/{env}/resolve"),
            None => format!("/workspace/{workspace_id}/environments/resolve"),
        };
        self.post(&path, &json!({ "text": text })).await
    }

    pub async fn resolve_api(
        &self,
        workspace_id: WorkspaceId,
        api_data: &Value,
        environment_id: Option<EnvironmentId>,
    ) -> Result<Value> {
        let path = match environment_id {
            Some(env) => format!("/workspace/{workspace_id}/environments/{env}/resolve-api"),
            None => format!("/workspace/{workspace_id}/environments/resolve-api"),
        };
        self.post(&path, &json!({ "api_data": api_data, "environment_id": environment_id })).await
    }

    pub async fn execute_direct(&self, request: &ExecuteRequest) -> Result<Value> {
        self.post("/execute-direct", &serde_json::to_value(request)?).await
    }
}
