//! A tiny HTTP/1.1 server for exercising outgoing requests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use restbench::domain::{ApiInput, CaseInput, HttpMethod, NewNode, NodeId, NodeKind};
use restbench::store::Store;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Received {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body: body.to_string(), delay: None }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub struct MockServer {
    pub base_url: String,
    received: Arc<Mutex<Vec<Received>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let log = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let log = log.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, log, respond).await;
                });
            }
        });

        Self { base_url, received, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection<F>(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<Received>>>,
    respond: Arc<F>,
) -> std::io::Result<()>
where
    F: Fn(&Received) -> Reply + Send + Sync + 'static,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).to_string();

    let received = Received { method, path, headers, body };
    let reply = respond(&received);
    log.lock().push(received);

    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }
    let response = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// A file holding an API at `endpoint`, inside `parent`.
pub fn api_file(
    store: &Store,
    workspace_id: i64,
    parent: Option<NodeId>,
    name: &str,
    method: HttpMethod,
    endpoint: &str,
) -> NodeId {
    let file = store
        .create_node(NewNode { workspace_id, name: name.into(), kind: NodeKind::File, parent_id: parent })
        .unwrap();
    store
        .save_api(
            file.id,
            ApiInput {
                name: name.into(),
                method,
                endpoint: endpoint.into(),
                description: None,
                is_active: None,
                extra_meta: None,
            },
        )
        .unwrap();
    file.id
}

pub fn case(store: &Store, file_id: NodeId, name: &str, body: Option<Value>, expected: Value) {
    store
        .create_case(
            file_id,
            CaseInput {
                name: name.into(),
                headers: Default::default(),
                params: Map::new(),
                body,
                expected: Some(expected),
            },
        )
        .unwrap();
}
