//! Command-line surface: clap definitions, dispatch and rendering.

pub mod output;
pub mod parse;
pub mod route;

pub use output::{CommandOutput, EXIT_ERROR, EXIT_FAILURES, map_error};
pub use parse::{Cli, Commands, OutputFormat};
pub use route::{RunContext, load_config};
