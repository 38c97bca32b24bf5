//! Response expectations.
//!
//! An expectation is a JSON object:
//!
//! ```json
//! {
//!   "status_in": [400, 422],
//!   "text_contains": ["must be 0"],
//!   "headers": { "content-type": "application/json" },
//!   "json": {
//!     "checks": [{ "path": "$.data.items[0].rate", "gt": 0 }],
//!     "either": [
//!       { "checks": [{ "path": "error_message", "present": true }] },
//!       { "checks": [{ "path": "detail", "present": true }] }
//!     ]
//!   }
//! }
//! ```
//!
//! `evaluate` reports one message per failed check; `validate_spec` checks
//! the shape before an expectation is stored.

use regex::Regex;
use serde_json::{Map, Value};

use super::http::ResponseSnapshot;

const TOP_LEVEL_KEYS: [&str; 6] = ["status", "status_in", "text_contains", "text_regex", "headers", "json"];
const JSON_KEYS: [&str; 2] = ["checks", "either"];
const CHECK_KEYS: [&str; 12] = [
    "path", "equals", "present", "absent", "regex", "contains", "length", "type", "gt", "gte", "lt", "lte",
];
const TYPE_NAMES: [&str; 6] = ["string", "number", "boolean", "object", "array", "null"];
const NUMERIC_OPS: [&str; 4] = ["gt", "gte", "lt", "lte"];

// ─── Evaluation ───────────────────────────────────────────────────────────────

/// Evaluate `expected` against a response. `ok` is true when no check failed.
pub fn evaluate(response: &ResponseSnapshot, expected: &Value) -> (bool, Vec<String>) {
    let mut failures = Vec::new();
    let Some(expect) = expected.as_object() else {
        return (true, failures);
    };

    if let Some(allowed) = expect.get("status_in").and_then(Value::as_array) {
        if !allowed.iter().any(|s| s.as_u64() == Some(u64::from(response.status))) {
            failures.push(format!(
                "status: expected one of {}, got {}",
                render(&Value::Array(allowed.clone())),
                response.status
            ));
        }
    } else if let Some(status) = expect.get("status").and_then(Value::as_u64) {
        if status != u64::from(response.status) {
            failures.push(format!("status: expected {status}, got {}", response.status));
        }
    }

    match expect.get("text_contains") {
        Some(Value::String(needle)) => check_text_contains(&response.body, needle, &mut failures),
        Some(Value::Array(needles)) => needles
            .iter()
            .filter_map(Value::as_str)
            .for_each(|needle| check_text_contains(&response.body, needle, &mut failures)),
        _ => {}
    }

    if let Some(pattern) = expect.get("text_regex").and_then(Value::as_str).filter(|p| !p.is_empty()) {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&response.body) => {}
            Ok(_) => failures.push(format!("text_regex: pattern '{pattern}' not found")),
            Err(e) => failures.push(format!("text_regex: invalid pattern '{pattern}': {e}")),
        }
    }

    if let Some(wanted) = expect.get("headers").and_then(Value::as_object) {
        for (name, value) in wanted {
            let want = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            match response.header(name) {
                None => failures.push(format!("header '{name}' missing")),
                Some(actual) if actual != want => {
                    failures.push(format!("header '{name}': expected '{want}', got '{actual}'"))
                }
                Some(_) => {}
            }
        }
    }

    if let Some(json_expect) = expect.get("json").and_then(Value::as_object).filter(|j| !j.is_empty()) {
        match response.json.as_ref() {
            None => failures.push("json: response is not JSON".to_string()),
            Some(body) => evaluate_json(body, json_expect, &mut failures),
        }
    }

    (failures.is_empty(), failures)
}

fn check_text_contains(body: &str, needle: &str, failures: &mut Vec<String>) {
    if !body.contains(needle) {
        failures.push(format!("text_contains: '{needle}' not found"));
    }
}

fn evaluate_json(body: &Value, expect: &Map<String, Value>, failures: &mut Vec<String>) {
    for check in expect.get("checks").and_then(Value::as_array).into_iter().flatten() {
        apply_check(body, check, failures, "json");
    }

    let branches = expect.get("either").and_then(Value::as_array).cloned().unwrap_or_default();
    if branches.is_empty() {
        return;
    }
    let mut reasons = Vec::new();
    for (i, branch) in branches.iter().enumerate() {
        let mut local = Vec::new();
        let prefix = format!("json.either[{i}]");
        for check in branch.get("checks").and_then(Value::as_array).into_iter().flatten() {
            apply_check(body, check, &mut local, &prefix);
        }
        if local.is_empty() {
            return;
        }
        reasons.push(format!("[{}]", local.join("; ")));
    }
    failures.push(format!("json.either: none matched. Reasons: {}", reasons.join(", ")));
}

fn apply_check(body: &Value, check: &Value, failures: &mut Vec<String>, prefix: &str) {
    let Some(path) = check.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) else {
        failures.push(format!("{prefix}: missing 'path' in check {}", render(check)));
        return;
    };
    let value = resolve_path(body, path);
    let shown = value.map(render).unwrap_or_else(|| "MISSING".to_string());

    if check.get("absent").and_then(Value::as_bool) == Some(true) {
        if value.is_some() {
            failures.push(format!("{path}: expected absent, got {shown}"));
        }
        return;
    }
    if check.get("present").and_then(Value::as_bool) == Some(true) {
        if value.is_none() {
            failures.push(format!("{path}: expected present"));
        }
        return;
    }

    if let Some(expected) = check.get("equals") {
        if !value.is_some_and(|v| json_eq(v, expected)) {
            failures.push(format!("{path}: expected {}, got {shown}", render(expected)));
        }
    }

    if let Some(kinds) = check.get("type") {
        let names: Vec<&str> = match kinds {
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            Value::String(name) => vec![name.as_str()],
            _ => Vec::new(),
        };
        let actual = value.map(type_name);
        if !actual.is_some_and(|t| names.contains(&t)) {
            failures.push(format!(
                "{path}: type {names:?} expected, got {}",
                actual.unwrap_or("MISSING")
            ));
        }
    }

    if let Some(pattern) = check.get("regex").and_then(Value::as_str) {
        let matched = match (value.and_then(Value::as_str), Regex::new(pattern)) {
            (Some(text), Ok(re)) => re.is_match(text),
            _ => false,
        };
        if !matched {
            failures.push(format!("{path}: regex '{pattern}' did not match {shown}"));
        }
    }

    if let Some(expected) = check.get("contains") {
        if !value.is_some_and(|v| contains(v, expected)) {
            failures.push(format!("{path}: does not contain {}", render(expected)));
        }
    }

    if let Some(length) = check.get("length") {
        match value.and_then(sized_len) {
            None => failures.push(format!("{path}: length check on non-sized value {shown}")),
            Some(actual) if Some(actual as u64) != length.as_u64() => {
                failures.push(format!("{path}: expected length {}, got {actual}", render(length)))
            }
            Some(_) => {}
        }
    }

    for op in NUMERIC_OPS {
        let Some(reference) = check.get(op) else {
            continue;
        };
        let Some(actual) = value.filter(|v| v.is_number()).and_then(Value::as_f64) else {
            failures.push(format!(
                "{path}: {op} requires number, got {}",
                value.map(type_name).unwrap_or("MISSING")
            ));
            continue;
        };
        let Some(limit) = reference.as_f64() else {
            continue;
        };
        let (ok, symbol) = match op {
            "gt" => (actual > limit, ">"),
            "gte" => (actual >= limit, ">="),
            "lt" => (actual < limit, "<"),
            _ => (actual <= limit, "<="),
        };
        if !ok {
            failures.push(format!("{path}: expected {symbol} {}, got {}", render(reference), shown));
        }
    }
}

/// Resolve `$.a.b[0].c`, `a.b[0].c` or `a.b.c`. `None` means missing.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix('$').unwrap_or(path).trim_start_matches('.');
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(at) => segment.split_at(at),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        for raw in indexes.split('[').filter(|s| !s.is_empty()) {
            let index: usize = raw.strip_suffix(']')?.parse().ok()?;
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// Equality where `1` and `1.0` match.
fn json_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_eq(x, y)),
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => actual == expected,
    }
}

/// Object subset, list multi-subset (each expected item consumes one actual
/// item), equality otherwise.
fn subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|a| subset(v, a))),
        (Value::Array(want), Value::Array(have)) => {
            let mut used = vec![false; have.len()];
            want.iter().all(|item| {
                let slot = have
                    .iter()
                    .enumerate()
                    .find(|(i, candidate)| !used[*i] && subset(item, candidate))
                    .map(|(i, _)| i);
                match slot {
                    Some(i) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        _ => json_eq(actual, expected),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Object(_) | Value::Array(_), _) => subset(expected, actual),
        _ => false,
    }
}

fn sized_len(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::Null => "null",
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

// ─── Shape validation ─────────────────────────────────────────────────────────

/// Check the structure of an expectation. Every problem is reported.
pub fn validate_spec(expected: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let Some(expect) = expected.as_object() else {
        return Err(vec!["expected: must be an object".to_string()]);
    };

    for key in expect.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            errors.push(format!("unknown key '{key}'"));
        }
    }

    if let Some(status) = expect.get("status") {
        if !is_status(status) {
            errors.push("status: must be an integer between 100 and 599".to_string());
        }
    }
    if let Some(list) = expect.get("status_in") {
        match list.as_array() {
            Some(items) if items.iter().all(is_status) => {}
            _ => errors.push("status_in: must be a list of status codes".to_string()),
        }
    }
    match expect.get("text_contains") {
        None | Some(Value::String(_)) => {}
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
        Some(_) => errors.push("text_contains: must be a string or a list of strings".to_string()),
    }
    if let Some(pattern) = expect.get("text_regex") {
        validate_regex("text_regex", pattern, &mut errors);
    }
    if let Some(headers) = expect.get("headers") {
        match headers.as_object() {
            Some(map) if map.values().all(|v| v.is_string() || v.is_number()) => {}
            _ => errors.push("headers: must be an object of header values".to_string()),
        }
    }
    if let Some(json) = expect.get("json") {
        validate_json_section(json, &mut errors);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn is_status(value: &Value) -> bool {
    value.as_u64().is_some_and(|s| (100..=599).contains(&s))
}

fn validate_regex(field: &str, pattern: &Value, errors: &mut Vec<String>) {
    match pattern.as_str() {
        Some(p) => {
            if let Err(e) = Regex::new(p) {
                errors.push(format!("{field}: invalid regex '{p}': {e}"));
            }
        }
        None => errors.push(format!("{field}: must be a string")),
    }
}

fn validate_json_section(json: &Value, errors: &mut Vec<String>) {
    let Some(section) = json.as_object() else {
        errors.push("json: must be an object".to_string());
        return;
    };
    for key in section.keys() {
        if !JSON_KEYS.contains(&key.as_str()) {
            errors.push(format!("json: unknown key '{key}'"));
        }
    }
    if let Some(checks) = section.get("checks") {
        validate_checks("json.checks", checks, errors);
    }
    if let Some(either) = section.get("either") {
        let Some(branches) = either.as_array() else {
            errors.push("json.either: must be a list of branches".to_string());
            return;
        };
        for (i, branch) in branches.iter().enumerate() {
            match branch.get("checks") {
                Some(checks) if branch.is_object() => validate_checks(&format!("json.either[{i}].checks"), checks, errors),
                _ => errors.push(format!("json.either[{i}]: must be an object with 'checks'")),
            }
        }
    }
}

fn validate_checks(field: &str, checks: &Value, errors: &mut Vec<String>) {
    let Some(items) = checks.as_array() else {
        errors.push(format!("{field}: must be a list"));
        return;
    };
    for (i, check) in items.iter().enumerate() {
        let at = format!("{field}[{i}]");
        let Some(check) = check.as_object() else {
            errors.push(format!("{at}: must be an object"));
            continue;
        };
        match check.get("path").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => {}
            _ => errors.push(format!("{at}: missing 'path'")),
        }
        for key in check.keys() {
            if !CHECK_KEYS.contains(&key.as_str()) {
                errors.push(format!("{at}: unknown key '{key}'"));
            }
        }
        for flag in ["present", "absent"] {
            if check.get(flag).is_some_and(|v| !v.is_boolean()) {
                errors.push(format!("{at}.{flag}: must be a boolean"));
            }
        }
        if let Some(pattern) = check.get("regex") {
            validate_regex(&format!("{at}.regex"), pattern, errors);
        }
        if check.get("length").is_some_and(|v| v.as_u64().is_none()) {
            errors.push(format!("{at}.length: must be a non-negative integer"));
        }
        for op in NUMERIC_OPS {
            if check.get(op).is_some_and(|v| !v.is_number()) {
                errors.push(format!("{at}.{op}: must be a number"));
            }
        }
        if let Some(kind) = check.get("type") {
            let names: Option<Vec<&str>> = match kind {
                Value::String(name) => Some(vec![name.as_str()]),
                Value::Array(list) => list.iter().map(Value::as_str).collect(),
                _ => None,
            };
            match names {
                Some(names) if !names.is_empty() => {
                    for name in names.iter().filter(|n| !TYPE_NAMES.contains(n)) {
                        errors.push(format!("{at}.type: unknown type '{name}'"));
                    }
                }
                _ => errors.push(format!("{at}.type: must be a type name or a list of them")),
            }
        }
    }
}
