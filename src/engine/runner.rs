//! Runs a plan of test cases concurrently and collects a report.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::expect;
use super::headers::{HeaderMap, layer_headers};
use super::http::{HttpEngine, OutgoingRequest, query_pairs};
use super::variables::VariableResolver;
use crate::domain::{ApiDefinition, ApiId, CaseId, HttpMethod, NodeId, TestCase};
use crate::error::Error;

pub const TIMESTAMP_TOKEN: &str = "${ts}";

/// One case to run, with the folder headers its file inherits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunTarget {
    pub file_id: NodeId,
    pub file_path: String,
    pub api: ApiDefinition,
    pub case: TestCase,
    pub inherited_headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub variables: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { concurrency: 4, variables: HashMap::new(), timeout_ms: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderMap,
    pub params: Map<String, Value>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseResult {
    pub file_id: NodeId,
    pub file_path: String,
    pub api_id: ApiId,
    pub api_signature: String,
    pub case_id: CaseId,
    pub case_name: String,
    pub status: CaseStatus,
    pub ok: bool,
    pub failures: Vec<String>,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub request: Option<SentRequest>,
    pub response_json: Option<Value>,
}

impl CaseResult {
    fn pending(target: &RunTarget) -> Self {
        Self {
            file_id: target.file_id,
            file_path: target.file_path.clone(),
            api_id: target.api.id,
            api_signature: target.api.signature(),
            case_id: target.case.id,
            case_name: target.case.name.clone(),
            status: CaseStatus::Skipped,
            ok: false,
            failures: Vec::new(),
            status_code: None,
            duration_ms: 0,
            request: None,
            response_json: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pass_rate: f64,
}

impl RunSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a CaseResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.total += 1;
            match result.status {
                CaseStatus::Passed => summary.passed += 1,
                CaseStatus::Failed => summary.failed += 1,
                CaseStatus::Skipped => summary.skipped += 1,
            }
        }
        summary.pass_rate = pass_rate(summary.passed, summary.total);
        summary
    }
}

/// Percentage rounded to two decimals; 0 for an empty run.
pub fn pass_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (passed as f64 / total as f64 * 10_000.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    /// Plan order.
    pub results: Vec<CaseResult>,
    /// Keyed by API signature; failures first, then by case name.
    pub by_api: BTreeMap<String, Vec<CaseResult>>,
    pub by_file: BTreeMap<String, RunSummary>,
    pub summary: RunSummary,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    fn assemble(run_id: String, started_at: String, results: Vec<CaseResult>, cancelled: bool, duration: Duration) -> Self {
        let mut by_api: BTreeMap<String, Vec<CaseResult>> = BTreeMap::new();
        for result in &results {
            by_api.entry(result.api_signature.clone()).or_default().push(result.clone());
        }
        for group in by_api.values_mut() {
            group.sort_by(|a, b| a.ok.cmp(&b.ok).then_with(|| a.case_name.cmp(&b.case_name)));
        }

        let mut grouped: BTreeMap<String, Vec<&CaseResult>> = BTreeMap::new();
        for result in &results {
            grouped.entry(result.file_path.clone()).or_default().push(result);
        }
        let by_file = grouped
            .into_iter()
            .map(|(path, group)| (path, RunSummary::from_results(group)))
            .collect();

        Self {
            run_id,
            started_at,
            summary: RunSummary::from_results(&results),
            results,
            by_api,
            by_file,
            cancelled,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Replace every `${ts}` inside the strings of `value`.
pub fn substitute_timestamp(value: &Value, ts: i64) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(TIMESTAMP_TOKEN, &ts.to_string())),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_timestamp(v, ts)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_timestamp(v, ts)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The request a target sends: `${ts}` first, then headers layered
/// inherited < API < case, then variables.
fn build_request(target: &RunTarget, resolver: &VariableResolver, ts: i64, timeout: Option<Duration>) -> (OutgoingRequest, SentRequest) {
    let stamp = |s: &str| s.replace(TIMESTAMP_TOKEN, &ts.to_string());
    let stamp_map = |m: &HeaderMap| m.iter().map(|(k, v)| (stamp(k), stamp(v))).collect::<HeaderMap>();

    let headers = layer_headers([
        &stamp_map(&target.inherited_headers),
        &stamp_map(&target.api.headers()),
        &stamp_map(&target.case.headers),
    ]);
    let headers = resolver.resolve_map(&headers);

    let mut params = target.api.params();
    params.extend(target.case.params.clone());
    let params = match resolver.resolve_value(&substitute_timestamp(&Value::Object(params), ts)) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let body = target
        .case
        .body
        .clone()
        .filter(|b| !b.is_null())
        .or_else(|| target.api.body())
        .map(|b| resolver.resolve_value(&substitute_timestamp(&b, ts)));

    let url = resolver.resolve_str(&stamp(&target.api.endpoint));
    let method = target.api.method;

    let outgoing = OutgoingRequest {
        method,
        url: url.clone(),
        headers: headers.clone(),
        query: query_pairs(&params),
        body: body.clone(),
        auth: Default::default(),
        timeout,
    };
    (outgoing, SentRequest { method, url, headers, params, body })
}

async fn run_case(
    http: HttpEngine,
    target: RunTarget,
    resolver: Arc<VariableResolver>,
    ts: i64,
    timeout: Option<Duration>,
    mut stop_rx: broadcast::Receiver<()>,
) -> CaseResult {
    let mut result = CaseResult::pending(&target);
    let (outgoing, sent) = build_request(&target, &resolver, ts, timeout);
    result.request = Some(sent);

    debug!(case = %target.case.name, method = %outgoing.method, url = %outgoing.url, "running case");
    match http.send_once(&outgoing, &mut stop_rx).await {
        Ok(response) => {
            let (ok, failures) = expect::evaluate(&response, &target.case.expected);
            result.ok = ok;
            result.status = if ok { CaseStatus::Passed } else { CaseStatus::Failed };
            result.failures = failures;
            result.status_code = Some(response.status);
            result.duration_ms = response.duration_ms;
            result.response_json = response.json;
        }
        Err(Error::Cancelled) => {}
        Err(err) => {
            result.status = CaseStatus::Failed;
            result.failures = vec![format!("request: {err}")];
        }
    }
    result
}

pub async fn run_plan(
    targets: Vec<RunTarget>,
    options: RunOptions,
    http: &HttpEngine,
    cancel_rx: &mut broadcast::Receiver<()>,
) -> RunReport {
    let started = chrono::Utc::now();
    let ts = started.timestamp_millis();
    let run_id = format!("run-{ts}");
    let clock = Instant::now();
    info!(run_id = %run_id, cases = targets.len(), concurrency = options.concurrency, "starting run");

    let resolver = Arc::new(VariableResolver::new(options.variables));
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let timeout = options.timeout_ms.map(Duration::from_millis);
    let (stop_tx, _) = broadcast::channel::<()>(1);

    let mut slots: Vec<CaseResult> = targets.iter().map(CaseResult::pending).collect();
    let mut tasks = JoinSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        let http = http.clone();
        let resolver = resolver.clone();
        let semaphore = semaphore.clone();
        let mut stop_rx = stop_tx.subscribe();
        let case_rx = stop_tx.subscribe();
        tasks.spawn(async move {
            let skipped = CaseResult::pending(&target);
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                Ok(()) = stop_rx.recv() => None,
            };
            let Some(_permit) = permit else {
                return (index, skipped);
            };
            (index, run_case(http, target, resolver, ts, timeout, case_rx).await)
        });
    }

    let mut cancelled = false;
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok((index, result))) => slots[index] = result,
                Some(Err(err)) => warn!(error = %err, "case task failed"),
                None => break,
            },
            Ok(()) = cancel_rx.recv(), if !cancelled => {
                info!(run_id = %run_id, "run cancelled");
                cancelled = true;
                let _ = stop_tx.send(());
            }
        }
    }

    let report = RunReport::assemble(
        run_id,
        started.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        slots,
        cancelled,
        clock.elapsed(),
    );
    info!(
        run_id = %report.run_id,
        passed = report.summary.passed,
        failed = report.summary.failed,
        skipped = report.summary.skipped,
        duration_ms = report.duration_ms,
        "run finished"
    );
    report
}
