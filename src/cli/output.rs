//! CLI output: text renderings of command results and error mapping.

use std::fmt::Write;

use serde::Serialize;
use serde_json::Value;

use super::parse::OutputFormat;
use crate::domain::{Environment, TreeNode, Workspace, WorkspaceTree};
use crate::engine::bulk::{RowKind, TreeStats, VisibleRow};
use crate::engine::execute::ExecuteOutcome;
use crate::engine::runner::{CaseStatus, RunReport};
use crate::error::{Error, Result};

pub const EXIT_FAILURES: i32 = 1;
pub const EXIT_ERROR: i32 = 2;

/// A command result: the JSON form plus its text rendering.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub json: Value,
    pub text: String,
    /// False when the command ran but what it checked did not pass.
    pub success: bool,
}

impl CommandOutput {
    pub fn new(value: &impl Serialize, text: impl Into<String>) -> Result<Self> {
        Ok(Self { json: serde_json::to_value(value)?, text: text.into(), success: true })
    }

    /// Text is the pretty-printed JSON.
    pub fn plain(value: &impl Serialize) -> Result<Self> {
        let json = serde_json::to_value(value)?;
        let text = serde_json::to_string_pretty(&json)?;
        Ok(Self { json, text, success: true })
    }

    pub fn message(text: impl Into<String>) -> Self {
        let text = text.into();
        Self { json: serde_json::json!({ "message": text }), text, success: true }
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.text.clone(),
            OutputFormat::Json => serde_json::to_string_pretty(&self.json).unwrap_or_else(|_| self.json.to_string()),
        }
    }
}

pub fn map_error(err: &Error) -> String {
    match err {
        Error::InvalidExpectation(reasons) => {
            let mut out = String::from("Invalid expected schema:");
            for reason in reasons {
                let _ = write!(out, "\n  - {reason}");
            }
            out
        }
        other => other.to_string(),
    }
}

pub fn workspaces(list: &[Workspace]) -> String {
    if list.is_empty() {
        return "No workspaces".to_string();
    }
    list.iter()
        .map(|ws| match &ws.description {
            Some(desc) if !desc.is_empty() => format!("{:>4}  {}  ({desc})", ws.id, ws.name),
            _ => format!("{:>4}  {}", ws.id, ws.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn tree(tree: &WorkspaceTree) -> String {
    fn push(out: &mut String, nodes: &[TreeNode], depth: usize) {
        for node in nodes {
            let indent = "  ".repeat(depth);
            if node.node.is_folder() {
                let _ = writeln!(out, "{indent}{}/  [{}]", node.node.name, node.node.id);
            } else {
                let api = node
                    .api
                    .as_ref()
                    .map(|a| format!("  {} {} ({} cases)", a.method, a.endpoint, a.total_cases))
                    .unwrap_or_default();
                let _ = writeln!(out, "{indent}{}  [{}]{api}", node.node.name, node.node.id);
            }
            push(out, &node.children, depth + 1);
        }
    }

    let mut out = format!("{} [{}]\n", tree.workspace.name, tree.workspace.id);
    push(&mut out, &tree.file_tree, 1);
    let _ = write!(
        out,
        "{} nodes, {} APIs, {} test cases",
        tree.total_nodes, tree.total_apis, tree.total_test_cases
    );
    out
}

pub fn environments(list: &[Environment]) -> String {
    if list.is_empty() {
        return "No environments".to_string();
    }
    list.iter()
        .map(|env| {
            let marker = if env.is_active { "*" } else { " " };
            format!("{marker}{:>4}  {}  ({} variables)", env.id, env.name, env.variables.len())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn bulk_rows(rows: &[VisibleRow], stats: &TreeStats) -> String {
    let mut out = String::new();
    for row in rows {
        let indent = "  ".repeat(row.depth);
        let marker = match (row.kind, row.expanded) {
            (RowKind::Case, _) => "·",
            (_, true) => "▾",
            (_, false) => "▸",
        };
        let detail = match (&row.method, &row.endpoint) {
            (Some(method), Some(endpoint)) => format!("  {method} {endpoint} ({} cases)", row.case_count),
            _ => String::new(),
        };
        let id = row.case_id.unwrap_or(row.id);
        let _ = writeln!(out, "{indent}{marker} {} [{id}]{detail}", row.name);
    }
    let _ = write!(
        out,
        "{} folders, {} files, {} APIs, {} cases",
        stats.folders, stats.files, stats.apis, stats.cases
    );
    out
}

pub fn execution(outcome: &ExecuteOutcome) -> String {
    let response = &outcome.response;
    let mut out = format!(
        "{} {}\n{} {}  {} ms  {} bytes\n",
        outcome.method, outcome.resolved_url, response.status, response.status_text, response.duration_ms, response.size
    );
    if let Some(env) = &outcome.environment_used {
        let _ = writeln!(out, "environment: {env}");
    }
    if !outcome.variables_missing.is_empty() {
        let _ = writeln!(out, "missing variables: {}", outcome.variables_missing.join(", "));
    }
    for (key, value) in &response.headers {
        let _ = writeln!(out, "{key}: {value}");
    }
    out.push('\n');
    match &response.json {
        Some(json) => out.push_str(&serde_json::to_string_pretty(json).unwrap_or_else(|_| response.body.clone())),
        None => out.push_str(&response.body),
    }
    out
}

pub fn report(report: &RunReport) -> String {
    let mut out = String::new();
    for (signature, results) in &report.by_api {
        let _ = writeln!(out, "{signature}");
        for result in results {
            let mark = match result.status {
                CaseStatus::Passed => "PASS",
                CaseStatus::Failed => "FAIL",
                CaseStatus::Skipped => "SKIP",
            };
            let status = result.status_code.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "  {mark}  {}  [{}]  {status}  {} ms",
                result.case_name, result.file_path, result.duration_ms
            );
            for failure in &result.failures {
                let _ = writeln!(out, "        {failure}");
            }
        }
    }
    let summary = &report.summary;
    let _ = write!(
        out,
        "{} total, {} passed, {} failed, {} skipped ({:.2}%) in {} ms",
        summary.total, summary.passed, summary.failed, summary.skipped, summary.pass_rate, report.duration_ms
    );
    if report.cancelled {
        out.push_str(" (cancelled)");
    }
    out
}
