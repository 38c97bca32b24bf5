use std::collections::HashMap;

use rusqlite::{OptionalExtension, Row, params};
use serde_json::{Value, json};
use tracing::info;

use super::{Store, from_json, now, to_json, unique_name};
use crate::domain::{ApiId, CaseId, CaseInput, CaseUpdate, NodeId, TestCase, WorkspaceId};
use crate::engine::expect::validate_spec;
use crate::error::{Error, Result};

const CASE_COLUMNS: &str = "c.id, c.api_id, c.name, c.headers, c.params, c.body, c.expected, c.created_at";

fn case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    let headers: String = row.get(3)?;
    let params: String = row.get(4)?;
    let body: Option<String> = row.get(5)?;
    let expected: String = row.get(6)?;
    Ok(TestCase {
        id: row.get(0)?,
        api_id: row.get(1)?,
        name: row.get(2)?,
        headers: from_json(3, &headers)?,
        params: from_json(4, &params)?,
        body: body.as_deref().map(|raw| from_json(5, raw)).transpose()?,
        expected: from_json(6, &expected)?,
        created_at: row.get(7)?,
    })
}

/// `null` expectations are stored as `{}`; anything else must pass shape checks.
fn checked_expectation(expected: Option<Value>) -> Result<Value> {
    let expected = match expected {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    validate_spec(&expected).map_err(Error::InvalidExpectation)?;
    Ok(expected)
}

fn body_column(body: &Option<Value>) -> Result<Option<String>> {
    body.as_ref().filter(|b| !b.is_null()).map(to_json).transpose()
}

impl Store {
    pub fn create_case(&self, file_id: NodeId, input: CaseInput) -> Result<TestCase> {
        self.require_file(file_id)?;
        let api = self
            .find_file_api(file_id)?
            .ok_or_else(|| Error::not_found("API for this file"))?;
        let name = input.name.trim().to_string();
        if self.case_name_taken(api.id, &name, None)? {
            return Err(Error::conflict("Test case with this name already exists for this API"));
        }
        let case = TestCase {
            id: 0,
            api_id: api.id,
            name,
            headers: input.headers,
            params: input.params,
            body: input.body,
            expected: checked_expectation(input.expected)?,
            created_at: now(),
        };
        let created = self.insert_case(api.id, &case)?;
        info!(case_id = created.id, api_id = api.id, "created test case");
        Ok(created)
    }

    pub fn get_case(&self, id: CaseId) -> Result<TestCase> {
        self.conn
            .query_row(
                &format!("SELECT {CASE_COLUMNS} FROM test_cases c WHERE c.id = ?1"),
                params![id],
                case_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Test case"))
    }

    /// Only the provided fields change.
    pub fn update_case(&self, id: CaseId, update: CaseUpdate) -> Result<TestCase> {
        let mut case = self.get_case(id)?;
        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if self.case_name_taken(case.api_id, &name, Some(id))? {
                return Err(Error::conflict("Test case with this name already exists for this API"));
            }
            case.name = name;
        }
        if let Some(headers) = update.headers {
            case.headers = headers;
        }
        if let Some(params) = update.params {
            case.params = params;
        }
        if let Some(body) = update.body {
            case.body = Some(body).filter(|b| !b.is_null());
        }
        if let Some(expected) = update.expected {
            case.expected = checked_expectation(Some(expected))?;
        }

        self.conn.execute(
            "UPDATE test_cases SET name = ?1, headers = ?2, params = ?3, body = ?4, expected = ?5
             WHERE id = ?6",
            params![
                case.name,
                to_json(&case.headers)?,
                to_json(&case.params)?,
                body_column(&case.body)?,
                to_json(&case.expected)?,
                id
            ],
        )?;
        self.get_case(id)
    }

    /// Cases of a file's API, optionally filtered by a case-insensitive
    /// substring of the name.
    pub fn list_cases(&self, file_id: NodeId, search: Option<&str>) -> Result<Vec<TestCase>> {
        self.require_file(file_id)?;
        let Some(api) = self.find_file_api(file_id)? else {
            return Ok(Vec::new());
        };
        let mut cases = self.cases_for_api(api.id)?;
        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            cases.retain(|c| c.name.to_lowercase().contains(&term));
        }
        Ok(cases)
    }

    pub fn delete_case(&self, id: CaseId) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM test_cases WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("Test case"));
        }
        info!(case_id = id, "deleted test case");
        Ok(())
    }

    pub fn duplicate_case(&self, id: CaseId) -> Result<TestCase> {
        let original = self.get_case(id)?;
        let base = if original.name.is_empty() {
            "Untitled Case (Copy)".to_string()
        } else {
            format!("{} (Copy)", original.name)
        };
        let name = unique_name(&base, "copy", |candidate| {
            self.case_name_taken(original.api_id, candidate, None)
        })?;
        let copy = TestCase {
            name,
            created_at: now(),
            ..original
        };
        self.insert_case(copy.api_id, &copy)
    }

    pub(crate) fn cases_for_api(&self, api_id: ApiId) -> Result<Vec<TestCase>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CASE_COLUMNS} FROM test_cases c WHERE c.api_id = ?1 ORDER BY c.id"
        ))?;
        let cases = stmt
            .query_map(params![api_id], case_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cases)
    }

    pub(crate) fn cases_by_api(&self, workspace_id: WorkspaceId) -> Result<HashMap<ApiId, Vec<TestCase>>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CASE_COLUMNS} FROM test_cases c
             JOIN apis a ON a.id = c.api_id
             JOIN nodes n ON n.id = a.file_id
             WHERE n.workspace_id = ?1 ORDER BY c.id"
        ))?;
        let mut grouped: HashMap<ApiId, Vec<TestCase>> = HashMap::new();
        for case in stmt.query_map(params![workspace_id], case_from_row)? {
            let case = case?;
            grouped.entry(case.api_id).or_default().push(case);
        }
        Ok(grouped)
    }

    pub(crate) fn insert_case(&self, api_id: ApiId, case: &TestCase) -> Result<TestCase> {
        self.conn.execute(
            "INSERT INTO test_cases (api_id, name, headers, params, body, expected, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                api_id,
                case.name,
                to_json(&case.headers)?,
                to_json(&case.params)?,
                body_column(&case.body)?,
                to_json(&case.expected)?,
                now()
            ],
        )?;
        self.get_case(self.conn.last_insert_rowid())
    }

    fn case_name_taken(&self, api_id: ApiId, name: &str, exclude: Option<CaseId>) -> Result<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM test_cases WHERE api_id = ?1 AND name = ?2 AND id IS NOT ?3",
            params![api_id, name, exclude],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiInput, HttpMethod, NewNode, NodeKind};

    fn setup() -> (Store, NodeId) {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "users".into(), kind: NodeKind::File, parent_id: None })
            .unwrap();
        store
            .save_api(
                file.id,
                ApiInput {
                    name: "get user".into(),
                    method: HttpMethod::Get,
                    endpoint: "/users/1".into(),
                    description: None,
                    is_active: None,
                    extra_meta: None,
                },
            )
            .unwrap();
        (store, file.id)
    }

    fn named(name: &str) -> CaseInput {
        CaseInput { name: name.into(), ..Default::default() }
    }

    #[test]
    fn create_validates_expectation_and_names() {
        let (store, file) = setup();
        let case = store
            .create_case(file, CaseInput { expected: Some(json!({"status": 200})), ..named("ok") })
            .unwrap();
        assert_eq!(case.expected["status"], 200);

        assert!(matches!(store.create_case(file, named("ok")), Err(Error::Conflict(_))));
        let err = store
            .create_case(file, CaseInput { expected: Some(json!({"status": "two hundred"})), ..named("bad") })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidExpectation(_)));
    }

    #[test]
    fn update_only_touches_given_fields() {
        let (store, file) = setup();
        let case = store
            .create_case(file, CaseInput { body: Some(json!({"a": 1})), ..named("first") })
            .unwrap();
        let updated = store
            .update_case(case.id, CaseUpdate { name: Some("renamed".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.body, Some(json!({"a": 1})));
    }

    #[test]
    fn search_is_case_insensitive() {
        let (store, file) = setup();
        store.create_case(file, named("Happy Path")).unwrap();
        store.create_case(file, named("missing user")).unwrap();
        let found = store.list_cases(file, Some("happy")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.list_cases(file, None).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_names_copies() {
        let (store, file) = setup();
        let named_case = store.create_case(file, named("login")).unwrap();
        let unnamed = store.create_case(file, named("")).unwrap();
        assert_eq!(store.duplicate_case(named_case.id).unwrap().name, "login (Copy)");
        assert_eq!(store.duplicate_case(named_case.id).unwrap().name, "login (Copy) copy");
        assert_eq!(store.duplicate_case(unnamed.id).unwrap().name, "Untitled Case (Copy)");
    }

    #[test]
    fn cases_require_an_api() {
        let store = Store::open_in_memory().unwrap();
        let ws = store.create_workspace("Demo", None).unwrap();
        let file = store
            .create_node(NewNode { workspace_id: ws.id, name: "empty".into(), kind: NodeKind::File, parent_id: None })
            .unwrap();
        assert!(matches!(store.create_case(file.id, named("x")), Err(Error::NotFound(_))));
        assert!(store.list_cases(file.id, None).unwrap().is_empty());
    }
}
