use std::process;

use clap::Parser;
use tracing::{error, info};

use restbench::cli::{Cli, EXIT_ERROR, EXIT_FAILURES, RunContext, load_config, map_error};
use restbench::logging::init_logging;

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", map_error(&e));
            process::exit(EXIT_ERROR);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(EXIT_ERROR);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            process::exit(EXIT_ERROR);
        }
    };

    let code = runtime.block_on(async {
        let context = match RunContext::new(config, cli.format) {
            Ok(context) => context,
            Err(e) => {
                error!("Error opening data directory: {e}");
                eprintln!("{}", map_error(&e));
                return EXIT_ERROR;
            }
        };

        match context.execute(&cli.command).await {
            Ok(output) => {
                println!("{}", output.render(cli.format));
                if output.success {
                    info!("command completed");
                    0
                } else {
                    EXIT_FAILURES
                }
            }
            Err(e) => {
                error!("command failed: {e}");
                eprintln!("{}", map_error(&e));
                EXIT_ERROR
            }
        }
    });

    process::exit(code);
}
