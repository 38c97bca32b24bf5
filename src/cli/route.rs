//! CLI route: the run context and one handler per command.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::output::{self, CommandOutput};
use super::parse::{
    ApiCommands, CaseCommands, CaseFields, Cli, Commands, EnvCommands, ExecArgs, ExportCommands, HeaderCommands,
    NodeCommands, OutputFormat, RemoteCommands, RunArgs, VarCommands, WorkspaceCommands,
};
use crate::config::AppConfig;
use crate::domain::{
    ApiInput, AuthMethod, CaseInput, CaseUpdate, EnvVariable, EnvironmentInput, EnvironmentUpdate, NewNode,
    NodeCopy, NodeKind, VariableUpdate, WorkspaceId, WorkspaceUpdate,
};
use crate::engine::bulk::{BulkCollectionTree, BulkSelection, RunFilter, plan_from_filters, plan_from_selection};
use crate::engine::cancel::CancelRegistry;
use crate::engine::execute::{ExecuteRequest, execute_direct, select_environment};
use crate::engine::headers::HeaderMap;
use crate::engine::http::{HttpEngine, HttpSettings};
use crate::engine::runner::{RunOptions, RunReport, RunTarget, run_plan};
use crate::engine::schedule::{Schedule, run_scheduled};
use crate::engine::variables::{VariableResolver, build_variable_map};
use crate::error::{Error, Result};
use crate::import_export;
use crate::remote::RemoteClient;
use crate::session::SessionStore;
use crate::store::Store;

/// Configuration with command-line overrides applied.
pub fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Everything a command needs.
pub struct RunContext {
    config: AppConfig,
    store: Store,
    http: HttpEngine,
    sessions: SessionStore,
    cancels: Arc<CancelRegistry>,
    format: OutputFormat,
}

impl RunContext {
    pub fn new(config: AppConfig, format: OutputFormat) -> Result<Self> {
        let store = Store::open(config.database_path())?;
        let http = HttpEngine::new(HttpSettings::from(&config.http))?;
        let sessions = SessionStore::new(config.session_path());
        info!(database = %config.database_path().display(), "context ready");
        Ok(Self {
            config,
            store,
            http,
            sessions,
            cancels: Arc::new(CancelRegistry::new()),
            format,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn execute(&self, command: &Commands) -> Result<CommandOutput> {
        match command {
            Commands::Workspace { command } => self.workspace(command),
            Commands::Node { command } => self.node(command),
            Commands::Headers { command } => self.headers(command),
            Commands::Api { command } => self.api(command),
            Commands::Case { command } => self.case(command),
            Commands::Env { command } => self.env(command),
            Commands::Var { command } => self.var(command),
            Commands::Resolve { workspace_id, text, env, vars } => self.resolve(*workspace_id, text, *env, vars),
            Commands::ResolveApi { workspace_id, file, case, data, env, vars } => {
                self.resolve_api(*workspace_id, *file, case.as_deref(), data.as_ref(), *env, vars)
            }
            Commands::Exec(args) => self.exec(args).await,
            Commands::Run(args) => self.run(args).await,
            Commands::Bulk { workspace_id, expand_all, expand } => self.bulk(*workspace_id, *expand_all, expand),
            Commands::Import { workspace_id, dir } => self.import(*workspace_id, dir),
            Commands::Export { command } => self.export(command),
            Commands::Remote { command } => self.remote(command).await,
        }
    }

    fn workspace(&self, command: &WorkspaceCommands) -> Result<CommandOutput> {
        match command {
            WorkspaceCommands::Create { name, description } => {
                let ws = self.store.create_workspace(name, description.as_deref())?;
                CommandOutput::new(&ws, format!("Created workspace {} [{}]", ws.name, ws.id))
            }
            WorkspaceCommands::List => {
                let list = self.store.list_workspaces()?;
                CommandOutput::new(&list, output::workspaces(&list))
            }
            WorkspaceCommands::Show { id } => CommandOutput::plain(&self.store.get_workspace(*id)?),
            WorkspaceCommands::Update { id, name, description } => {
                let ws = self.store.update_workspace(
                    *id,
                    WorkspaceUpdate { name: name.clone(), description: description.clone() },
                )?;
                CommandOutput::new(&ws, format!("Updated workspace {} [{}]", ws.name, ws.id))
            }
            WorkspaceCommands::Delete { id } => {
                self.store.delete_workspace(*id)?;
                Ok(CommandOutput::message(format!("Deleted workspace {id}")))
            }
            WorkspaceCommands::Tree { id, apis } => {
                let tree = self.store.workspace_tree(*id, *apis)?;
                CommandOutput::new(&tree, output::tree(&tree))
            }
        }
    }

    fn node(&self, command: &NodeCommands) -> Result<CommandOutput> {
        match command {
            NodeCommands::Create { workspace_id, name, folder, parent } => {
                let kind = if *folder { NodeKind::Folder } else { NodeKind::File };
                let node = self.store.create_node(NewNode {
                    workspace_id: *workspace_id,
                    name: name.clone(),
                    kind,
                    parent_id: *parent,
                })?;
                CommandOutput::new(&node, format!("Created {} {} [{}]", node.kind, node.name, node.id))
            }
            NodeCommands::Show { id } => CommandOutput::plain(&self.store.node_with_path(*id)?),
            NodeCommands::List { workspace_id, parent } => {
                let nodes = self.store.list_children(*workspace_id, *parent)?;
                let text = nodes
                    .iter()
                    .map(|n| format!("{:>4}  {}{}", n.id, n.name, if n.is_folder() { "/" } else { "" }))
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutput::new(&nodes, text)
            }
            NodeCommands::Rename { id, name } => {
                let node = self.store.rename_node(*id, name)?;
                CommandOutput::new(&node, format!("Renamed to {}", node.name))
            }
            NodeCommands::Move { id, to } => {
                let node = self.store.move_node(*id, *to)?;
                CommandOutput::new(&node, format!("Moved {} [{}]", node.name, node.id))
            }
            NodeCommands::Copy { id, to_workspace, to_folder, name } => {
                let source = self.store.get_node(*id)?;
                let copy = self.store.copy_node(
                    *id,
                    NodeCopy {
                        target_workspace_id: to_workspace.unwrap_or(source.workspace_id),
                        target_folder_id: *to_folder,
                        new_name: name.clone(),
                    },
                )?;
                CommandOutput::new(&copy, format!("Copied to {} [{}]", copy.name, copy.id))
            }
            NodeCommands::Delete { id } => {
                self.store.delete_node(*id)?;
                Ok(CommandOutput::message(format!("Deleted node {id}")))
            }
        }
    }

    fn headers(&self, command: &HeaderCommands) -> Result<CommandOutput> {
        match command {
            HeaderCommands::Set { folder_id, headers } => {
                CommandOutput::plain(&self.store.set_folder_headers(*folder_id, header_map(headers))?)
            }
            HeaderCommands::Update { folder_id, headers } => {
                CommandOutput::plain(&self.store.update_folder_headers(*folder_id, header_map(headers))?)
            }
            HeaderCommands::Show { folder_id } => {
                let headers = self.store.get_folder_headers(*folder_id)?.unwrap_or_default();
                CommandOutput::plain(&headers)
            }
            HeaderCommands::Delete { folder_id } => {
                self.store.delete_folder_headers(*folder_id)?;
                Ok(CommandOutput::message(format!("Deleted headers of folder {folder_id}")))
            }
            HeaderCommands::Complete { node_id } => CommandOutput::plain(&self.store.complete_headers(*node_id)?),
        }
    }

    fn api(&self, command: &ApiCommands) -> Result<CommandOutput> {
        match command {
            ApiCommands::Save { file_id, name, method, endpoint, description, active, meta } => {
                let (api, outcome) = self.store.save_api(
                    *file_id,
                    ApiInput {
                        name: name.clone(),
                        method: *method,
                        endpoint: endpoint.clone(),
                        description: description.clone(),
                        is_active: *active,
                        extra_meta: object(meta.as_ref(), "meta")?,
                    },
                )?;
                CommandOutput::new(
                    &json!({ "api": api, "outcome": outcome }),
                    format!("{outcome:?} API {} ({})", api.name, api.signature()),
                )
            }
            ApiCommands::Show { file_id } => CommandOutput::plain(&self.store.get_file_api(*file_id)?),
            ApiCommands::List { workspace_id } => {
                let apis = self.store.list_apis(*workspace_id)?;
                let text = apis
                    .iter()
                    .map(|a| format!("{:>4}  {:<28}  {}", a.file_id, a.name, a.signature()))
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutput::new(&apis, text)
            }
            ApiCommands::Delete { file_id } => {
                self.store.delete_api(*file_id)?;
                Ok(CommandOutput::message(format!("Deleted API of file {file_id}")))
            }
            ApiCommands::Duplicate { file_id, name, no_cases } => {
                let dup = self.store.duplicate_api(*file_id, name.as_deref(), !no_cases)?;
                CommandOutput::new(
                    &dup,
                    format!(
                        "Duplicated into {} [{}] with {} cases",
                        dup.new_file.name, dup.new_file.id, dup.duplicated_cases
                    ),
                )
            }
        }
    }

    fn case(&self, command: &CaseCommands) -> Result<CommandOutput> {
        match command {
            CaseCommands::Create { file_id, name, fields } => {
                let case = self.store.create_case(
                    *file_id,
                    CaseInput {
                        name: name.clone(),
                        headers: header_map(&fields.headers),
                        params: object(fields.params.as_ref(), "params")?.unwrap_or_default(),
                        body: fields.body.clone(),
                        expected: fields.expected.clone(),
                    },
                )?;
                CommandOutput::new(&case, format!("Created case {} [{}]", case.name, case.id))
            }
            CaseCommands::Show { id } => CommandOutput::plain(&self.store.get_case(*id)?),
            CaseCommands::List { file_id, search } => {
                let cases = self.store.list_cases(*file_id, search.as_deref())?;
                let text = cases
                    .iter()
                    .map(|c| format!("{:>4}  {}", c.id, c.name))
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutput::new(&cases, text)
            }
            CaseCommands::Update { id, name, fields } => {
                let case = self.store.update_case(*id, case_update(name, fields)?)?;
                CommandOutput::new(&case, format!("Updated case {} [{}]", case.name, case.id))
            }
            CaseCommands::Delete { id } => {
                self.store.delete_case(*id)?;
                Ok(CommandOutput::message(format!("Deleted case {id}")))
            }
            CaseCommands::Duplicate { id } => {
                let case = self.store.duplicate_case(*id)?;
                CommandOutput::new(&case, format!("Created case {} [{}]", case.name, case.id))
            }
        }
    }

    fn env(&self, command: &EnvCommands) -> Result<CommandOutput> {
        match command {
            EnvCommands::Create { workspace_id, name, description, active } => {
                let env = self.store.create_environment(
                    *workspace_id,
                    EnvironmentInput {
                        name: name.clone(),
                        description: description.clone(),
                        is_active: *active,
                        ..Default::default()
                    },
                )?;
                CommandOutput::new(&env.masked(), format!("Created environment {} [{}]", env.name, env.id))
            }
            EnvCommands::List { workspace_id } => {
                let list: Vec<_> = self
                    .store
                    .list_environments(*workspace_id)?
                    .iter()
                    .map(|env| env.masked())
                    .collect();
                CommandOutput::new(&list, output::environments(&list))
            }
            EnvCommands::Show { id } => CommandOutput::plain(&self.store.get_environment(*id)?.masked()),
            EnvCommands::Update { id, name, description } => {
                let env = self.store.update_environment(
                    *id,
                    EnvironmentUpdate { name: name.clone(), description: description.clone(), is_active: None },
                )?;
                CommandOutput::new(&env.masked(), format!("Updated environment {}", env.name))
            }
            EnvCommands::Activate { id } => {
                let env = self.store.activate_environment(*id)?;
                CommandOutput::new(&env.masked(), format!("Activated environment {}", env.name))
            }
            EnvCommands::Delete { id } => {
                self.store.delete_environment(*id)?;
                Ok(CommandOutput::message(format!("Deleted environment {id}")))
            }
        }
    }

    fn var(&self, command: &VarCommands) -> Result<CommandOutput> {
        match command {
            VarCommands::Create { env_id, key, value, description, secret, disabled } => {
                let variable = self.store.create_variable(
                    *env_id,
                    key,
                    EnvVariable {
                        value: value.clone(),
                        description: description.clone(),
                        is_enabled: !disabled,
                        is_secret: *secret,
                    },
                )?;
                CommandOutput::new(&json!({ key: variable }), format!("Created variable {key}"))
            }
            VarCommands::Update { env_id, key, rename, value, description, enabled, secret } => {
                let variable = self.store.update_variable(
                    *env_id,
                    key,
                    VariableUpdate {
                        key: rename.clone(),
                        value: value.clone(),
                        description: description.clone(),
                        is_enabled: *enabled,
                        is_secret: *secret,
                    },
                )?;
                let key = rename.as_deref().unwrap_or(key);
                CommandOutput::new(&json!({ key: variable }), format!("Updated variable {key}"))
            }
            VarCommands::List { env_id } => {
                let variables = self.store.list_variables(*env_id)?;
                let text = variables
                    .iter()
                    .map(|(k, v)| {
                        let off = if v.is_enabled { "" } else { "  (disabled)" };
                        format!("{k} = {}{off}", v.value)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutput::new(&variables, text)
            }
            VarCommands::Delete { env_id, keys } => {
                let deleted = self.store.delete_variables(*env_id, keys)?;
                CommandOutput::new(&json!({ "deleted": deleted }), format!("Deleted {deleted} variables"))
            }
        }
    }

    fn resolve(
        &self,
        workspace_id: WorkspaceId,
        text: &str,
        env: Option<i64>,
        vars: &[(String, String)],
    ) -> Result<CommandOutput> {
        self.store.get_workspace(workspace_id)?;
        let environment = select_environment(&self.store, workspace_id, env)?;
        let resolver = VariableResolver::for_environment(environment.as_ref(), &header_map(vars));
        let resolution = resolver.resolve_text(text);
        let mut rendered = resolution.resolved_text.clone();
        if !resolution.variables_missing.is_empty() {
            rendered.push_str(&format!("\nmissing: {}", resolution.variables_missing.join(", ")));
        }
        CommandOutput::new(&resolution, rendered)
    }

    fn resolve_api(
        &self,
        workspace_id: WorkspaceId,
        file: Option<i64>,
        case: Option<&str>,
        data: Option<&Value>,
        env: Option<i64>,
        vars: &[(String, String)],
    ) -> Result<CommandOutput> {
        self.store.get_workspace(workspace_id)?;
        let document = match (file, data) {
            (Some(file_id), _) => {
                if self.store.get_node(file_id)?.workspace_id != workspace_id {
                    return Err(Error::invalid(format!("file {file_id} is not in workspace {workspace_id}")));
                }
                let api = self.store.get_file_api(file_id)?;
                let case = match case {
                    Some(name) => Some(
                        self.store
                            .list_cases(file_id, None)?
                            .into_iter()
                            .find(|c| c.name == name)
                            .ok_or_else(|| Error::not_found(format!("Case `{name}` on file {file_id}")))?,
                    ),
                    None => None,
                };
                api.document(case.as_ref())
            }
            (None, Some(data)) => data.clone(),
            (None, None) => return Err(Error::invalid("give --file or --data")),
        };
        let environment = select_environment(&self.store, workspace_id, env)?;
        let resolver = VariableResolver::for_environment(environment.as_ref(), &header_map(vars));
        let resolution = resolver.resolve_api(&document);
        let mut rendered = serde_json::to_string_pretty(&resolution.resolved_api_data)?;
        rendered.push_str(&format!(
            "\nvariables: {} found, {} resolved, {} missing",
            resolution.total_variables, resolution.resolved_count, resolution.missing_count
        ));
        if !resolution.variables_missing.is_empty() {
            rendered.push_str(&format!("\nmissing: {}", resolution.variables_missing.join(", ")));
        }
        CommandOutput::new(&resolution, rendered)
    }

    /// A cancel receiver tripped by Ctrl-C, plus the watcher to abort.
    fn interruptible(&self, key: &str) -> (broadcast::Receiver<()>, JoinHandle<()>) {
        let rx = self.cancels.register(key);
        let cancels = self.cancels.clone();
        let key = key.to_string();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(key = %key, "interrupted");
                cancels.cancel(&key);
            }
        });
        (rx, watcher)
    }

    fn finish(&self, key: &str, watcher: JoinHandle<()>) {
        watcher.abort();
        self.cancels.remove(key);
    }

    async fn exec(&self, args: &ExecArgs) -> Result<CommandOutput> {
        let (mut cancel_rx, watcher) = self.interruptible("exec");
        let outcome = execute_direct(&self.store, &self.http, exec_request(args), &mut cancel_rx).await;
        self.finish("exec", watcher);
        let outcome = outcome?;
        CommandOutput::new(&outcome, output::execution(&outcome))
    }

    fn plan(&self, args: &RunArgs) -> Result<Vec<RunTarget>> {
        self.store.get_workspace(args.workspace_id)?;
        let tree = BulkCollectionTree::new(self.store.bulk_tree(args.workspace_id)?);

        let mut filters: Vec<RunFilter> = Vec::new();
        filters.extend(args.folders.iter().map(|id| RunFilter::Folder { folder_id: Some(*id) }));
        filters.extend(args.files.iter().map(|id| RunFilter::File { file_id: Some(*id) }));
        if !args.apis.is_empty() {
            filters.push(RunFilter::Api { api_signatures: args.apis.clone() });
        }
        if let Some(file_id) = args.case_file {
            filters.push(RunFilter::Case { file_id: Some(file_id), case_names: args.cases.clone() });
        }

        let mut selection = BulkSelection::new();
        args.select_apis.iter().for_each(|api| selection.select_api(*api));
        args.select_cases.iter().for_each(|(api, case)| selection.select_case(*api, *case));

        match (filters.is_empty(), selection.is_empty()) {
            (true, true) => plan_from_filters(&tree, &[RunFilter::Project]),
            (false, true) => plan_from_filters(&tree, &filters),
            (true, false) => Ok(plan_from_selection(&tree, &selection)),
            (false, false) => {
                let wanted: HashSet<i64> = plan_from_filters(&tree, &filters)?
                    .into_iter()
                    .chain(plan_from_selection(&tree, &selection))
                    .map(|t| t.case.id)
                    .collect();
                Ok(plan_from_filters(&tree, &[RunFilter::Project])?
                    .into_iter()
                    .filter(|t| wanted.contains(&t.case.id))
                    .collect())
            }
        }
    }

    async fn run(&self, args: &RunArgs) -> Result<CommandOutput> {
        let plan = self.plan(args)?;
        if plan.is_empty() {
            return Err(Error::invalid("Nothing to run: no test cases match"));
        }
        let environment = select_environment(&self.store, args.workspace_id, args.env)?;
        let options = RunOptions {
            concurrency: args.concurrency.unwrap_or(self.config.runner.concurrency),
            variables: build_variable_map(environment.as_ref(), &header_map(&args.vars)),
            timeout_ms: Some(args.timeout_ms.unwrap_or(self.config.runner.case_timeout_ms)),
        };
        debug!(cases = plan.len(), "plan ready");

        let (mut cancel_rx, watcher) = self.interruptible("run");
        let reports = match args.every {
            Some(every) => {
                let schedule = Schedule::new(Duration::from_secs(every), args.times)?;
                let format = self.format;
                run_scheduled(schedule, &plan, &options, &self.http, &mut cancel_rx, |report| {
                    if format == OutputFormat::Text {
                        println!("{}\n", output::report(report));
                    }
                })
                .await
            }
            None => vec![run_plan(plan, options, &self.http, &mut cancel_rx).await],
        };
        self.finish("run", watcher);

        if let Some(path) = &args.report {
            write_report(path, &reports)?;
        }
        let success = reports.iter().all(|r| !r.has_failures());
        let mut out = match reports.as_slice() {
            [single] if args.every.is_none() => CommandOutput::new(single, output::report(single))?,
            many => {
                let failing = many.iter().filter(|r| r.has_failures()).count();
                CommandOutput::new(&many, format!("{} scheduled runs, {failing} with failures", many.len()))?
            }
        };
        out.success = success;
        Ok(out)
    }

    fn bulk(&self, workspace_id: WorkspaceId, expand_all: bool, expand: &[i64]) -> Result<CommandOutput> {
        self.store.get_workspace(workspace_id)?;
        let mut tree = BulkCollectionTree::new(self.store.bulk_tree(workspace_id)?);
        if expand_all {
            tree.expand_all();
        }
        for id in expand {
            if !tree.is_expanded(*id) {
                tree.toggle(*id);
            }
        }
        let rows = tree.visible_rows();
        let stats = tree.stats();
        CommandOutput::new(&json!({ "rows": rows, "stats": stats }), output::bulk_rows(&rows, &stats))
    }

    fn import(&self, workspace_id: WorkspaceId, dir: &Path) -> Result<CommandOutput> {
        let report = import_export::import_services_dir(&self.store, workspace_id, dir)?;
        let mut text = format!(
            "Imported {} folders, {} files, {} cases, {} header sets",
            report.folders, report.files, report.cases, report.headers
        );
        for skipped in &report.skipped {
            text.push_str(&format!("\nskipped: {skipped}"));
        }
        for error in &report.errors {
            text.push_str(&format!("\nerror: {error}"));
        }
        let mut out = CommandOutput::new(&report, text)?;
        out.success = report.errors.is_empty();
        Ok(out)
    }

    fn export(&self, command: &ExportCommands) -> Result<CommandOutput> {
        match command {
            ExportCommands::File { file_id, out: None } => {
                CommandOutput::plain(&import_export::export_file(&self.store, *file_id)?)
            }
            ExportCommands::File { file_id, out: Some(path) } => {
                let doc = import_export::export_file(&self.store, *file_id)?;
                fs::write(path, serde_json::to_vec_pretty(&doc)?)?;
                Ok(CommandOutput::message(format!("Wrote {}", path.display())))
            }
            ExportCommands::Workspace { workspace_id, dir } => {
                let files = import_export::export_services_dir(&self.store, *workspace_id, dir)?;
                CommandOutput::new(
                    &json!({ "files": files, "dir": dir }),
                    format!("Exported {files} files to {}", dir.display()),
                )
            }
        }
    }

    fn remote_client(&self) -> Result<RemoteClient> {
        let base_url = self
            .config
            .remote
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("remote.base_url is not set".into()))?;
        RemoteClient::new(base_url, HttpSettings::from(&self.config.http), self.sessions.clone())
    }

    async fn remote(&self, command: &RemoteCommands) -> Result<CommandOutput> {
        if let RemoteCommands::Whoami = command {
            return match self.sessions.load() {
                Some(session) => CommandOutput::new(
                    &json!({ "username": session.username, "token_type": session.token_type, "user": session.user }),
                    format!("Signed in as {}", session.username),
                ),
                None => Ok(CommandOutput::message("Not signed in")),
            };
        }

        let client = self.remote_client()?;
        let data = match command {
            RemoteCommands::SignIn { email, password } => {
                let session = client.sign_in(email, password).await?;
                return Ok(CommandOutput::message(format!("Signed in as {}", session.username)));
            }
            RemoteCommands::SignOut => {
                client.sign_out().await?;
                return Ok(CommandOutput::message("Signed out"));
            }
            RemoteCommands::Whoami => Value::Null,
            RemoteCommands::Workspaces => client.list_workspaces().await?,
            RemoteCommands::Tree { workspace_id } => client.workspace_tree(*workspace_id).await?,
            RemoteCommands::FileApi { file_id, cases } => client.file_api(*file_id, *cases).await?,
            RemoteCommands::BulkTree { workspace_id } => client.bulk_testing_tree(*workspace_id).await?,
            RemoteCommands::Envs { workspace_id } => client.list_environments(*workspace_id).await?,
            RemoteCommands::Activate { workspace_id, env_id } => {
                client.activate_environment(*workspace_id, *env_id).await?
            }
            RemoteCommands::Resolve { workspace_id, text, env } => {
                client.resolve_text(*workspace_id, text, *env).await?
            }
            RemoteCommands::ResolveApi { workspace_id, data, env } => {
                client.resolve_api(*workspace_id, data, *env).await?
            }
            RemoteCommands::Exec(args) => client.execute_direct(&exec_request(args)).await?,
        };
        CommandOutput::plain(&data)
    }
}

fn header_map(pairs: &[(String, String)]) -> HeaderMap {
    pairs.iter().cloned().collect()
}

fn object(value: Option<&Value>, what: &str) -> Result<Option<Map<String, Value>>> {
    match value {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(Error::invalid(format!("{what} must be a JSON object"))),
    }
}

fn case_update(name: &Option<String>, fields: &CaseFields) -> Result<CaseUpdate> {
    Ok(CaseUpdate {
        name: name.clone(),
        headers: (!fields.headers.is_empty()).then(|| header_map(&fields.headers)),
        params: object(fields.params.as_ref(), "params")?,
        body: fields.body.clone(),
        expected: fields.expected.clone(),
    })
}

fn exec_request(args: &ExecArgs) -> ExecuteRequest {
    ExecuteRequest {
        file_id: args.file_id,
        environment_id: args.env,
        method: args.method,
        url: args.url.clone(),
        headers: header_map(&args.headers),
        params: args
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
        body: args.body.clone(),
        auth: match &args.bearer {
            Some(token) => AuthMethod::Bearer { token: token.clone() },
            None => AuthMethod::None,
        },
        variables: args.vars.iter().cloned().collect::<BTreeMap<_, _>>(),
        timeout_ms: args.timeout_ms,
    }
}

fn write_report(path: &Path, reports: &[RunReport]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let body = match reports {
        [single] => serde_json::to_vec_pretty(single)?,
        many => serde_json::to_vec_pretty(many)?,
    };
    fs::write(path, body)?;
    info!(path = %path.display(), "report written");
    Ok(())
}
