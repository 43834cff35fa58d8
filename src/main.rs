//! testledger CLI — wraps a test runner invocation and records its live
//! execution as a Markdown report tree under `.3pio/`.

use clap::Parser;

use testledger::RunConfig;
use testledger::orchestrator::{self, Orchestrator};

/// `testledger <test-command…>`. Everything after the binary name is the
/// command to execute; `--version`/`--help` are handled by clap before the
/// trailing command is captured, per spec.md §6.
#[derive(Parser)]
#[command(name = "testledger")]
#[command(version)]
#[command(about = "Wraps a test runner and records its live execution as a Markdown report tree")]
struct Cli {
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn init_tracing() {
    let debug = std::env::var("TESTLEDGER_DEBUG").map(|v| v == "1").unwrap_or(false);
    let default_filter = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("testledger: failed to read the current directory: {err}");
            std::process::exit(orchestrator::STARTUP_FAILURE_EXIT_CODE);
        }
    };

    let config = match RunConfig::load(&cwd) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("testledger: invalid configuration: {err:?}");
            std::process::exit(orchestrator::STARTUP_FAILURE_EXIT_CODE);
        }
    };

    let orchestrator = Orchestrator::new(cwd, cli.command, config);
    match orchestrator.run().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("testledger: {err:?}");
            std::process::exit(orchestrator::STARTUP_FAILURE_EXIT_CODE);
        }
    }
}
