use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_TYPE, HeaderMap as ReqwestHeaders, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::headers::HeaderMap;
use crate::config::HttpConfig;
use crate::domain::{ApiKeyLocation, AuthMethod, HttpMethod, value_to_string};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl From<&HttpConfig> for HttpSettings {
    fn from(config: &HttpConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            verify_ssl: config.verify_ssl,
            follow_redirects: config.follow_redirects,
            max_redirects: config.max_redirects,
            user_agent: config.user_agent.clone(),
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

/// A fully resolved request, ready to send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    /// Strings are sent as raw text, anything else as JSON.
    pub body: Option<Value>,
    pub auth: AuthMethod,
    /// Overrides the client-wide timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Parsed body, when it is JSON.
    pub json: Option<Value>,
    pub duration_ms: u64,
    pub size: usize,
    pub content_type: Option<String>,
}

impl ResponseSnapshot {
    /// Header value by case-insensitive name; repeated headers are joined
    /// with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Flatten JSON query params into pairs. Arrays repeat the key; nulls are
/// dropped.
pub fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| (key.clone(), value_to_string(v))),
            ),
            other => pairs.push((key.clone(), value_to_string(other))),
        }
    }
    pairs
}

pub fn build_headers(input: &HeaderMap) -> Result<ReqwestHeaders> {
    let mut headers = ReqwestHeaders::new();

    for (key, value) in input {
        if key.trim().is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|err| Error::invalid(format!("Invalid header name `{key}`: {err}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| Error::invalid(format!("Invalid header value for `{key}`: {err}")))?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

/// Append query pairs (and a query-located API key) to `url`.
pub fn build_url(url: &str, query: &[(String, String)], auth: &AuthMethod) -> Result<Url> {
    let mut url = Url::parse(url.trim()).map_err(|e| Error::invalid(format!("Invalid URL `{url}`: {e}")))?;

    let api_key = match auth {
        AuthMethod::ApiKey { key, value, location: ApiKeyLocation::Query } => {
            if key.trim().is_empty() {
                return Err(Error::invalid("API key name cannot be empty"));
            }
            Some((key.trim(), value.trim()))
        }
        _ => None,
    };

    if !query.is_empty() || api_key.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
        if let Some((key, value)) = api_key {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn apply_auth(builder: reqwest::RequestBuilder, auth: &AuthMethod) -> Result<reqwest::RequestBuilder> {
    match auth {
        AuthMethod::None => Ok(builder),
        AuthMethod::ApiKey { location: ApiKeyLocation::Query, .. } => Ok(builder),
        AuthMethod::Bearer { token } => {
            let token = token.trim();
            if token.is_empty() {
                return Err(Error::invalid("Bearer token cannot be empty"));
            }
            Ok(builder.bearer_auth(token))
        }
        AuthMethod::Basic { username, password } => {
            let username = username.trim();
            if username.is_empty() {
                return Err(Error::invalid("Basic auth username cannot be empty"));
            }
            Ok(builder.basic_auth(username, Some(password.trim())))
        }
        AuthMethod::ApiKey { key, value, location: ApiKeyLocation::Header } => {
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::invalid("API key name cannot be empty"));
            }
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::invalid(format!("Invalid API key header `{key}`: {e}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| Error::invalid(format!("Invalid API key header value: {e}")))?;
            Ok(builder.header(name, value))
        }
    }
}

/// Shared HTTP client plus the retry policy.
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: Client,
    settings: HttpSettings,
}

impl HttpEngine {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let redirect = if settings.follow_redirects {
            reqwest::redirect::Policy::limited(settings.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = Client::builder()
            .timeout(settings.timeout)
            .redirect(redirect)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Send with the configured retry count.
    pub async fn send(
        &self,
        request: &OutgoingRequest,
        cancel_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ResponseSnapshot> {
        self.send_with_retries(request, self.settings.retry_count, cancel_rx).await
    }

    /// Send once; transport errors are returned as is.
    pub async fn send_once(
        &self,
        request: &OutgoingRequest,
        cancel_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ResponseSnapshot> {
        self.send_with_retries(request, 0, cancel_rx).await
    }

    async fn send_with_retries(
        &self,
        request: &OutgoingRequest,
        max_retries: u32,
        cancel_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ResponseSnapshot> {
        let url = build_url(&request.url, &request.query, &request.auth)?;
        let headers = build_headers(&request.headers)?;
        let method: reqwest::Method = request.method.into();

        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = tokio::time::sleep(self.settings.retry_delay);
                tokio::select! {
                    _ = delay => {},
                    Ok(()) = cancel_rx.recv() => return Err(Error::Cancelled),
                }
                debug!(attempt, url = %url, "retrying request");
            }

            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            builder = apply_auth(builder, &request.auth)?;
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(body) = request.body.as_ref().filter(|_| request.method.sends_body()) {
                builder = match body {
                    Value::String(text) => builder.body(text.clone()),
                    other => builder.json(other),
                };
            }

            let start = Instant::now();
            let result = tokio::select! {
                res = builder.send() => res,
                Ok(()) = cancel_rx.recv() => return Err(Error::Cancelled),
            };

            match result {
                Ok(response) => return read_response(response, start).await,
                Err(err) => {
                    let classified = classify(&err, request.method, &url);
                    warn!(attempt, error = %classified, "request failed");
                    last_error = Some(classified);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Request(format!("{} {url}", request.method))))
    }
}

fn classify(err: &reqwest::Error, method: HttpMethod, url: &Url) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{method} {url}"))
    } else {
        Error::Request(format!("{method} {url}: {err}"))
    }
}

async fn read_response(response: reqwest::Response, start: Instant) -> Result<ResponseSnapshot> {
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("Unknown").to_string();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_str().unwrap_or_default().to_string()))
        .collect();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|err| Error::Request(format!("Failed to read response: {err}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;
    let json = if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&bytes).ok()
    };

    Ok(ResponseSnapshot {
        status: status.as_u16(),
        status_text,
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        json,
        duration_ms,
        size: bytes.len(),
        content_type,
    })
}
