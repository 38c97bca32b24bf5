use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

use super::{Store, from_json, now, to_json};
use crate::domain::{
    EnvVariable, Environment, EnvironmentId, EnvironmentInput, EnvironmentUpdate, VariableUpdate,
    WorkspaceId,
};
use crate::engine::variables::is_valid_name;
use crate::error::{Error, Result};

const ENV_COLUMNS: &str =
    "id, workspace_id, name, description, is_active, variables, created_at, updated_at";

type Variables = BTreeMap<String, EnvVariable>;

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let variables: String = row.get(5)?;
    Ok(Environment {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get(4)?,
        variables: from_json(5, &variables)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn validate_env_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid("Environment name cannot be empty"));
    }
    Ok(name.to_string())
}

fn validate_key(key: &str) -> Result<String> {
    let key = key.trim();
    if !is_valid_name(key) {
        return Err(Error::invalid(format!(
            "Invalid variable key '{key}': use letters, digits, '_', '.', '-' and start with a letter or '_'"
        )));
    }
    Ok(key.to_string())
}

fn validate_variables(variables: Variables) -> Result<Variables> {
    variables
        .into_iter()
        .map(|(key, var)| Ok((validate_key(&key)?, var)))
        .collect()
}

impl Store {
    /// Create an environment; activating it deactivates its siblings.
    pub fn create_environment(&self, workspace_id: WorkspaceId, input: EnvironmentInput) -> Result<Environment> {
        self.get_workspace(workspace_id)?;
        let name = validate_env_name(&input.name)?;
        if self.env_name_taken(workspace_id, &name, None)? {
            return Err(Error::conflict(format!(
                "Environment '{name}' already exists in this workspace"
            )));
        }
        let variables = validate_variables(input.variables)?;

        let tx = self.conn.unchecked_transaction()?;
        if input.is_active {
            self.deactivate_all(workspace_id)?;
        }
        let stamp = now();
        self.conn.execute(
            "INSERT INTO environments (workspace_id, name, description, is_active, variables, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![workspace_id, name, input.description, input.is_active, to_json(&variables)?, stamp],
        )?;
        let id = self.conn.last_insert_rowid();
        tx.commit()?;
        info!(environment_id = id, workspace_id, %name, "created environment");
        self.get_environment(id)
    }

    pub fn list_environments(&self, workspace_id: WorkspaceId) -> Result<Vec<Environment>> {
        self.get_workspace(workspace_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENV_COLUMNS} FROM environments WHERE workspace_id = ?1 ORDER BY id"
        ))?;
        let envs = stmt
            .query_map(params![workspace_id], environment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envs)
    }

    pub fn get_environment(&self, id: EnvironmentId) -> Result<Environment> {
        self.conn
            .query_row(
                &format!("SELECT {ENV_COLUMNS} FROM environments WHERE id = ?1"),
                params![id],
                environment_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Environment"))
    }

    pub fn active_environment(&self, workspace_id: WorkspaceId) -> Result<Option<Environment>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {ENV_COLUMNS} FROM environments
                     WHERE workspace_id = ?1 AND is_active = 1 ORDER BY id LIMIT 1"
                ),
                params![workspace_id],
                environment_from_row,
            )
            .optional()?)
    }

    pub fn update_environment(&self, id: EnvironmentId, update: EnvironmentUpdate) -> Result<Environment> {
        let mut env = self.get_environment(id)?;
        if let Some(name) = update.name {
            let name = validate_env_name(&name)?;
            if self.env_name_taken(env.workspace_id, &name, Some(id))? {
                return Err(Error::conflict(format!(
                    "Environment '{name}' already exists in this workspace"
                )));
            }
            env.name = name;
        }
        if let Some(description) = update.description {
            env.description = Some(description).filter(|d| !d.trim().is_empty());
        }

        let tx = self.conn.unchecked_transaction()?;
        if let Some(active) = update.is_active {
            if active && !env.is_active {
                self.deactivate_all(env.workspace_id)?;
            }
            env.is_active = active;
        }
        self.conn.execute(
            "UPDATE environments SET name = ?1, description = ?2, is_active = ?3, updated_at = ?4
             WHERE id = ?5",
            params![env.name, env.description, env.is_active, now(), id],
        )?;
        tx.commit()?;
        self.get_environment(id)
    }

    pub fn activate_environment(&self, id: EnvironmentId) -> Result<Environment> {
        self.update_environment(id, EnvironmentUpdate { is_active: Some(true), ..Default::default() })
    }

    pub fn delete_environment(&self, id: EnvironmentId) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM environments WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("Environment"));
        }
        info!(environment_id = id, "deleted environment");
        Ok(())
    }

    pub fn create_variable(&self, env_id: EnvironmentId, key: &str, variable: EnvVariable) -> Result<EnvVariable> {
        let mut env = self.get_environment(env_id)?;
        let key = validate_key(key)?;
        if env.variables.contains_key(&key) {
            return Err(Error::conflict(format!(
                "Variable key '{key}' already exists in this environment"
            )));
        }
        env.variables.insert(key, variable.clone());
        self.write_variables(env_id, &env.variables)?;
        Ok(variable.masked())
    }

    /// Update one variable; `update.key` renames it.
    pub fn update_variable(&self, env_id: EnvironmentId, key: &str, update: VariableUpdate) -> Result<EnvVariable> {
        let mut env = self.get_environment(env_id)?;
        let mut variable = env
            .variables
            .remove(key)
            .ok_or_else(|| Error::not_found("Environment variable"))?;

        let target_key = match update.key {
            Some(new_key) => validate_key(&new_key)?,
            None => key.to_string(),
        };
        if target_key != key && env.variables.contains_key(&target_key) {
            return Err(Error::conflict(format!(
                "Variable key '{target_key}' already exists in this environment"
            )));
        }
        if let Some(value) = update.value {
            variable.value = value;
        }
        if let Some(description) = update.description {
            variable.description = Some(description);
        }
        if let Some(enabled) = update.is_enabled {
            variable.is_enabled = enabled;
        }
        if let Some(secret) = update.is_secret {
            variable.is_secret = secret;
        }

        env.variables.insert(target_key, variable.clone());
        self.write_variables(env_id, &env.variables)?;
        Ok(variable.masked())
    }

    /// Remove the given keys; returns how many existed.
    pub fn delete_variables(&self, env_id: EnvironmentId, keys: &[String]) -> Result<usize> {
        let mut env = self.get_environment(env_id)?;
        if env.variables.is_empty() {
            return Err(Error::not_found("Variables for this environment"));
        }
        let removed = keys
            .iter()
            .filter(|key| env.variables.remove(key.as_str()).is_some())
            .count();
        self.write_variables(env_id, &env.variables)?;
        Ok(removed)
    }

    /// Replace every variable of the environment.
    pub fn save_variables(&self, env_id: EnvironmentId, variables: Variables) -> Result<Variables> {
        self.get_environment(env_id)?;
        let variables = validate_variables(variables)?;
        self.write_variables(env_id, &variables)?;
        Ok(masked(&variables))
    }

    /// Variables with secret values masked.
    pub fn list_variables(&self, env_id: EnvironmentId) -> Result<Variables> {
        Ok(masked(&self.get_environment(env_id)?.variables))
    }

    fn write_variables(&self, env_id: EnvironmentId, variables: &Variables) -> Result<()> {
        self.conn.execute(
            "UPDATE environments SET variables = ?1, updated_at = ?2 WHERE id = ?3",
            params![to_json(variables)?, now(), env_id],
        )?;
        Ok(())
    }

    fn deactivate_all(&self, workspace_id: WorkspaceId) -> Result<()> {
        self.conn.execute(
            "UPDATE environments SET is_active = 0 WHERE workspace_id = ?1 AND is_active = 1",
            params![workspace_id],
        )?;
        Ok(())
    }

    fn env_name_taken(&self, workspace_id: WorkspaceId, name: &str, exclude: Option<EnvironmentId>) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM environments WHERE workspace_id = ?1 AND name = ?2 AND id IS NOT ?3",
            params![workspace_id, name, exclude],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn masked(variables: &Variables) -> Variables {
    variables.iter().map(|(k, v)| (k.clone(), v.masked())).collect()
}
