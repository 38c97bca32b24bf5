//! `{{name}}` variable resolution.
//!
//! Substitution is a single pass: replacement values are never rescanned, so
//! a value containing `{{other}}` stays literal. Undefined tokens are left
//! verbatim.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use serde::Serialize;
use serde_json::Value;

use crate::domain::Environment;

struct Token<'a> {
    span: Range<usize>,
    name: &'a str,
}

/// `[A-Za-z_][A-Za-z0-9_.-]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn scan(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while let Some(open) = text[pos..].find("{{") {
        let start = pos + open;
        let inner_start = start + 2;
        let Some(close) = text[inner_start..].find("}}") else {
            break;
        };
        let inner_end = inner_start + close;
        let name = text[inner_start..inner_end].trim();
        if is_valid_name(name) {
            tokens.push(Token { span: start..inner_end + 2, name });
            pos = inner_end + 2;
        } else {
            pos = start + 1;
        }
    }
    tokens
}

/// Referenced names in first-appearance order, without duplicates.
pub fn extract(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in scan(text) {
        if !names.iter().any(|n| n == token.name) {
            names.push(token.name.to_string());
        }
    }
    names
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextResolution {
    pub original_text: String,
    pub resolved_text: String,
    pub variables_found: Vec<String>,
    pub variables_missing: Vec<String>,
    pub environment_used: Option<String>,
}

/// A whole API document (url, headers, params, body, expected, ...) after
/// substitution. Here `variables_found` lists every reference, defined or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResolution {
    pub original_api_data: Value,
    pub resolved_api_data: Value,
    pub variables_found: Vec<String>,
    pub variables_resolved: Vec<String>,
    pub variables_missing: Vec<String>,
    pub total_variables: usize,
    pub resolved_count: usize,
    pub missing_count: usize,
    pub environment_used: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    variables: HashMap<String, String>,
    environment: Option<String>,
}

impl VariableResolver {
    pub fn new(variables: HashMap<String, String>) -> Self {
        Self { variables, environment: None }
    }

    /// Resolver over an environment's enabled variables plus overrides.
    pub fn for_environment(environment: Option<&Environment>, overrides: &BTreeMap<String, String>) -> Self {
        Self {
            variables: build_variable_map(environment, overrides),
            environment: environment.map(|e| e.name.clone()),
        }
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn environment_name(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn resolve_str(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for token in scan(text) {
            if let Some(value) = self.variables.get(token.name) {
                out.push_str(&text[last..token.span.start]);
                out.push_str(value);
                last = token.span.end;
            }
        }
        out.push_str(&text[last..]);
        out
    }

    pub fn resolve_text(&self, text: &str) -> TextResolution {
        let (found, missing): (Vec<String>, Vec<String>) = extract(text)
            .into_iter()
            .partition(|name| self.is_defined(name));
        TextResolution {
            original_text: text.to_string(),
            resolved_text: self.resolve_str(text),
            variables_found: found,
            variables_missing: missing,
            environment_used: self.environment.clone(),
        }
    }

    /// Substitute inside every string of a JSON value; object keys are kept.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn resolve_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (self.resolve_str(k), self.resolve_str(v)))
            .collect()
    }

    pub fn resolve_api(&self, api_data: &Value) -> ApiResolution {
        let mut found = Vec::new();
        extract_in_value(api_data, &mut found);
        let (resolved, missing): (Vec<String>, Vec<String>) =
            found.iter().cloned().partition(|name| self.is_defined(name));
        ApiResolution {
            original_api_data: api_data.clone(),
            resolved_api_data: self.resolve_value(api_data),
            total_variables: found.len(),
            resolved_count: resolved.len(),
            missing_count: missing.len(),
            variables_found: found,
            variables_resolved: resolved,
            variables_missing: missing,
            environment_used: self.environment.clone(),
        }
    }

    /// Names referenced anywhere in a JSON value that are not defined.
    pub fn missing_in_value(&self, value: &Value, into: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                for name in extract(s) {
                    if !self.is_defined(&name) && !into.contains(&name) {
                        into.push(name);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| self.missing_in_value(v, into)),
            Value::Object(map) => map.values().for_each(|v| self.missing_in_value(v, into)),
            _ => {}
        }
    }
}

/// Referenced names in the string values of a JSON document, first
/// appearance first. Keys are not scanned.
pub fn extract_in_value(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for name in extract(s) {
                if !into.contains(&name) {
                    into.push(name);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| extract_in_value(v, into)),
        Value::Object(map) => map.values().for_each(|v| extract_in_value(v, into)),
        _ => {}
    }
}

/// Enabled variables of the environment; explicit overrides win.
pub fn build_variable_map(
    environment: Option<&Environment>,
    overrides: &BTreeMap<String, String>,
) -> HashMap<String, String> {
    let mut variables = HashMap::new();

    if let Some(env) = environment {
        for (key, var) in &env.variables {
            if var.is_enabled && !key.is_empty() {
                variables.insert(key.clone(), var.value.clone());
            }
        }
    }

    for (key, value) in overrides {
        variables.insert(key.clone(), value.clone());
    }

    variables
}
