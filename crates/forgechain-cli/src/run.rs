//! Entry point, grounded on the teacher's `src/cli/run.rs`: parse, discover
//! settings, build a `tokio` runtime, dispatch, and translate the outcome
//! into a process exit code via [`ForgeError::to_exit_code`].

use crate::args::{Cli, Commands};
use crate::commands;
use camino::Utf8PathBuf;
use clap::Parser;
use forgechain_config::discover_and_load;
use forgechain_utils::error::ForgeError;
use forgechain_utils::logging::init_tracing;

/// Parse argv, run the selected command, and return the process exit code.
///
/// Never panics on a well-formed `Cli` parse failure or a run-time error:
/// both are rendered to stderr and mapped to a stable exit code so the
/// binary's `main` only has to call `std::process::exit`.
pub fn run() -> i32 {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    let cwd = match std::env::current_dir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: failed to read current directory: {e}");
            return 1;
        }
    };
    let cwd = match Utf8PathBuf::from_path_buf(cwd) {
        Ok(d) => d,
        Err(p) => {
            eprintln!("error: current directory is not valid UTF-8: {}", p.display());
            return 1;
        }
    };
    let explicit_config = cli.config.as_deref().map(Utf8PathBuf::from);

    let (settings, _source) = match discover_and_load(&cwd, explicit_config.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e}");
            return ForgeError::Config(e.to_string()).to_exit_code();
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return 1;
        }
    };

    let outcome = rt.block_on(async {
        match cli.command {
            Commands::Run(args) => commands::execute_run(args, &settings).await,
            Commands::Resume(args) => commands::execute_resume(args, &settings).await,
            Commands::Cascade(cmd) => commands::execute_cascade(cmd, &settings).await,
            Commands::Audit { log_root } => commands::execute_audit(log_root, &settings).await,
            Commands::Probe { models, all, vector_store_id } => {
                commands::execute_probe(models, all, vector_store_id, &settings).await
            }
        }
    });

    match outcome {
        Ok(()) => 0,
        Err(e) => {
            match e.downcast::<ForgeError>() {
                Ok(forge_err) => {
                    eprintln!("error: {}", forge_err.display_for_user());
                    forge_err.to_exit_code()
                }
                Err(other) => {
                    eprintln!("error: {other:#}");
                    1
                }
            }
        }
    }
}
