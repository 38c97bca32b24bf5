//! Clap types for the `restbench` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use crate::domain::HttpMethod;

/// Workspace-based API testing workbench
#[derive(Debug, Parser)]
#[command(name = "restbench", version, about = "Organize, execute and bulk-test HTTP APIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./restbench.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the database and session
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Manage folders and files
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Folder headers and inheritance
    Headers {
        #[command(subcommand)]
        command: HeaderCommands,
    },
    /// The API definition of a file
    Api {
        #[command(subcommand)]
        command: ApiCommands,
    },
    /// Test cases of a file's API
    Case {
        #[command(subcommand)]
        command: CaseCommands,
    },
    /// Manage environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Manage environment variables
    Var {
        #[command(subcommand)]
        command: VarCommands,
    },
    /// Resolve {{variables}} in a piece of text
    Resolve {
        workspace_id: i64,
        text: String,
        /// Environment to use instead of the active one
        #[arg(long)]
        env: Option<i64>,
        /// Explicit variable (KEY=VALUE), wins over the environment
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },
    /// Resolve {{variables}} across a whole API request document
    ResolveApi {
        workspace_id: i64,
        /// Use the API stored on this file
        #[arg(long, required_unless_present = "data", conflicts_with = "data")]
        file: Option<i64>,
        /// Layer this case of the file's API over it
        #[arg(long, requires = "file")]
        case: Option<String>,
        /// Inline API document (url, method, headers, params, body, expected)
        #[arg(long, value_parser = parse_json)]
        data: Option<Value>,
        #[arg(long)]
        env: Option<i64>,
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },
    /// Send a request in the context of a file
    Exec(ExecArgs),
    /// Run test cases in bulk
    Run(RunArgs),
    /// Show the bulk testing tree of a workspace
    Bulk {
        workspace_id: i64,
        /// Expand every folder and file
        #[arg(long)]
        expand_all: bool,
        /// Expand these nodes
        #[arg(long = "expand")]
        expand: Vec<i64>,
    },
    /// Import a service directory into a workspace
    Import { workspace_id: i64, dir: PathBuf },
    /// Export a file, or a whole workspace as a service directory
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Talk to a hosted backend
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommands {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Show { id: i64 },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete { id: i64 },
    /// Folder/file tree
    Tree {
        id: i64,
        /// Attach API summaries to files
        #[arg(long)]
        apis: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum NodeCommands {
    Create {
        workspace_id: i64,
        name: String,
        /// Create a folder instead of a file
        #[arg(long)]
        folder: bool,
        #[arg(long)]
        parent: Option<i64>,
    },
    /// Node with its breadcrumb path and children
    Show { id: i64 },
    List {
        workspace_id: i64,
        #[arg(long)]
        parent: Option<i64>,
    },
    Rename { id: i64, name: String },
    Move {
        id: i64,
        /// Target folder; omit to move to the workspace root
        #[arg(long)]
        to: Option<i64>,
    },
    Copy {
        id: i64,
        #[arg(long)]
        to_workspace: Option<i64>,
        #[arg(long)]
        to_folder: Option<i64>,
        #[arg(long)]
        name: Option<String>,
    },
    Delete { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum HeaderCommands {
    /// Replace a folder's headers
    Set {
        folder_id: i64,
        #[arg(long = "header", short = 'H', value_parser = parse_key_val)]
        headers: Vec<(String, String)>,
    },
    /// Merge headers into a folder's headers
    Update {
        folder_id: i64,
        #[arg(long = "header", short = 'H', value_parser = parse_key_val)]
        headers: Vec<(String, String)>,
    },
    Show { folder_id: i64 },
    Delete { folder_id: i64 },
    /// Headers a node inherits from its folders
    Complete { node_id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum ApiCommands {
    Save {
        file_id: i64,
        #[arg(long)]
        name: String,
        #[arg(long, value_parser = parse_method, default_value = "GET")]
        method: HttpMethod,
        #[arg(long, default_value = "")]
        endpoint: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        active: Option<bool>,
        /// Extra metadata object (headers, params, body)
        #[arg(long, value_parser = parse_json)]
        meta: Option<Value>,
    },
    Show { file_id: i64 },
    List { workspace_id: i64 },
    Delete { file_id: i64 },
    Duplicate {
        file_id: i64,
        #[arg(long)]
        name: Option<String>,
        /// Leave test cases behind
        #[arg(long)]
        no_cases: bool,
    },
}

#[derive(Debug, Args)]
pub struct CaseFields {
    #[arg(long = "header", short = 'H', value_parser = parse_key_val)]
    pub headers: Vec<(String, String)>,
    #[arg(long, value_parser = parse_json)]
    pub params: Option<Value>,
    #[arg(long, value_parser = parse_json)]
    pub body: Option<Value>,
    #[arg(long, value_parser = parse_json)]
    pub expected: Option<Value>,
}

#[derive(Debug, Subcommand)]
pub enum CaseCommands {
    Create {
        file_id: i64,
        #[arg(long, default_value = "")]
        name: String,
        #[command(flatten)]
        fields: CaseFields,
    },
    Show { id: i64 },
    List {
        file_id: i64,
        #[arg(long)]
        search: Option<String>,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        fields: CaseFields,
    },
    Delete { id: i64 },
    Duplicate { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum EnvCommands {
    Create {
        workspace_id: i64,
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        active: bool,
    },
    List { workspace_id: i64 },
    Show { id: i64 },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Activate { id: i64 },
    Delete { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum VarCommands {
    Create {
        env_id: i64,
        key: String,
        value: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        secret: bool,
        #[arg(long)]
        disabled: bool,
    },
    Update {
        env_id: i64,
        key: String,
        /// Rename the variable
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        secret: Option<bool>,
    },
    List { env_id: i64 },
    Delete {
        env_id: i64,
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    pub file_id: i64,
    #[arg(long)]
    pub url: String,
    #[arg(long, short = 'X', value_parser = parse_method, default_value = "GET")]
    pub method: HttpMethod,
    #[arg(long = "header", short = 'H', value_parser = parse_key_val)]
    pub headers: Vec<(String, String)>,
    #[arg(long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,
    #[arg(long, value_parser = parse_json)]
    pub body: Option<Value>,
    #[arg(long)]
    pub bearer: Option<String>,
    #[arg(long)]
    pub env: Option<i64>,
    #[arg(long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    pub workspace_id: i64,
    /// Run every case under this folder
    #[arg(long = "folder")]
    pub folders: Vec<i64>,
    /// Run every case of this file
    #[arg(long = "file")]
    pub files: Vec<i64>,
    /// Run every case of APIs with this signature, e.g. "GET /users"
    #[arg(long = "api")]
    pub apis: Vec<String>,
    /// File whose named cases (--case) run
    #[arg(long, requires = "cases")]
    pub case_file: Option<i64>,
    #[arg(long = "case", requires = "case_file")]
    pub cases: Vec<String>,
    /// Select a whole API by id
    #[arg(long = "select-api")]
    pub select_apis: Vec<i64>,
    /// Select one case as API_ID:CASE_ID
    #[arg(long = "select-case", value_parser = parse_id_pair)]
    pub select_cases: Vec<(i64, i64)>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long)]
    pub env: Option<i64>,
    #[arg(long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Repeat every N seconds
    #[arg(long)]
    pub every: Option<u64>,
    /// Number of scheduled runs (with --every)
    #[arg(long, requires = "every")]
    pub times: Option<u32>,
    /// Write the JSON report here
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ExportCommands {
    /// Print a file in the import format
    File {
        file_id: i64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write a workspace as a service directory
    Workspace { workspace_id: i64, dir: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum RemoteCommands {
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    SignOut,
    /// Show the stored session
    Whoami,
    Workspaces,
    Tree { workspace_id: i64 },
    FileApi {
        file_id: i64,
        #[arg(long)]
        cases: bool,
    },
    BulkTree { workspace_id: i64 },
    Envs { workspace_id: i64 },
    Activate { workspace_id: i64, env_id: i64 },
    Resolve {
        workspace_id: i64,
        text: String,
        #[arg(long)]
        env: Option<i64>,
    },
    ResolveApi {
        workspace_id: i64,
        #[arg(long, value_parser = parse_json)]
        data: Value,
        #[arg(long)]
        env: Option<i64>,
    },
    Exec(ExecArgs),
}

pub fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let split = raw
        .find(['=', ':'])
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let (key, value) = (&raw[..split], &raw[split + 1..]);
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

pub fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid JSON: {err}"))
}

pub fn parse_method(raw: &str) -> Result<HttpMethod, String> {
    raw.parse().map_err(|err: crate::error::Error| err.to_string())
}

pub fn parse_id_pair(raw: &str) -> Result<(i64, i64), String> {
    let (a, b) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected API_ID:CASE_ID, got `{raw}`"))?;
    let parse = |s: &str| s.trim().parse::<i64>().map_err(|err| format!("`{s}`: {err}"));
    Ok((parse(a)?, parse(b)?))
}
