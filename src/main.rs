//! ssr-sandbox CLI - Main entry point
//!
//! Parses arguments, builds the immutable sandbox configuration, and
//! dispatches into single-shot or server mode. The rendered body is the
//! only thing ever written to standard out in single-shot mode; console
//! lines and diagnostics go to standard error.

use std::io::Write;
use std::process::ExitCode;

use tracing::error;

use ssr_sandbox::{
    cli::{self, Mode},
    config::{ConfigError, SandboxConfig},
    sandbox::{Sandbox, SandboxError},
    server,
};

/// Main entry point
fn main() -> ExitCode {
    // Parse CLI arguments
    let args = cli::parse_args();

    // Initialize tracing
    init_logging(&args);

    // Initialize V8 platform (thread-safe)
    ssr_sandbox::init_v8();

    let result = run(&args);

    // Shutdown V8
    unsafe {
        ssr_sandbox::shutdown_v8();
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if matches!(e, AppError::Argument(_)) {
                eprintln!("usage: ssr-sandbox [flags] <chunks-dir> <entry> [props-json]");
                eprintln!("       ssr-sandbox [flags] --server <chunks-dir>");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging based on CLI arguments
fn init_logging(args: &cli::Cli) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(
            format!("ssr_sandbox={}", args.log_level).parse().unwrap(),
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run the selected driver mode
fn run(args: &cli::Cli) -> Result<(), AppError> {
    let mode = args.mode()?;

    let config = SandboxConfig::new(
        &args.chunks_dir,
        args.max_heap_bytes(),
        args.timeout,
        &args.allow_origin,
    )?;
    let mut sandbox = Sandbox::new(config)?;

    match mode {
        Mode::Server => server::run(&mut sandbox).map_err(AppError::Io),
        Mode::SingleShot { entry, props } => run_single_shot(&mut sandbox, &entry, &props),
    }
}

/// One render: body to stdout, console lines to stderr.
fn run_single_shot(sandbox: &mut Sandbox, entry: &str, props: &str) -> Result<(), AppError> {
    let output = sandbox.render(entry, props)?;

    server::emit_console(&output.console);

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    stdout.write_all(output.body.as_bytes())?;
    stdout.flush()?;

    Ok(())
}

/// Error types for the CLI
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("{0}")]
    Argument(#[from] cli::CliError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
