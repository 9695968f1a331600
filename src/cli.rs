//! Command-line interface parsing and configuration
//!
//! This module handles all CLI argument parsing using clap.
//!
//! Two invocation shapes are recognized:
//!
//! ```text
//! ssr-sandbox [flags] <chunks-dir> <entry> [props-json]   # single-shot
//! ssr-sandbox [flags] --server <chunks-dir>               # co-process
//! ```

use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while validating the argument combination
#[derive(Error, Debug)]
pub enum CliError {
    /// The flags and positionals do not form a valid invocation
    #[error("ArgumentError: {0}")]
    Argument(String),
}

/// ssr-sandbox - render JavaScript bundles in a capability-confined sandbox
#[derive(Parser, Debug)]
#[command(name = "ssr-sandbox")]
#[command(version)]
#[command(about = "Render untrusted JavaScript bundles in a confined V8 sandbox", long_about = None)]
pub struct Cli {
    /// Maximum V8 heap size in megabytes (0 = unlimited)
    #[arg(long, value_name = "MB", default_value_t = 0)]
    pub max_heap_size: usize,

    /// Wall-clock limit per render in milliseconds (0 = unlimited)
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub timeout: u64,

    /// Origin the sandboxed fetch may address, e.g. https://api.example.com (repeatable)
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    pub allow_origin: Vec<String>,

    /// Run as a co-process reading framed requests from standard input
    #[arg(long)]
    pub server: bool,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Directory containing the bundle's chunks; bounds all module resolution
    #[arg(value_name = "CHUNKS_DIR")]
    pub chunks_dir: PathBuf,

    /// Entry module specifier (required unless --server)
    #[arg(value_name = "ENTRY")]
    pub entry: Option<String>,

    /// Props JSON passed to the render entry (defaults to {})
    #[arg(value_name = "PROPS_JSON")]
    pub props: Option<String>,
}

/// The driver mode selected by the arguments
#[derive(Debug)]
pub enum Mode {
    /// One render, result on stdout
    SingleShot {
        /// Entry module specifier
        entry: String,
        /// Props JSON for the render
        props: String,
    },
    /// Co-process loop over standard streams
    Server,
}

impl Cli {
    /// The configured heap limit in bytes.
    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_size * 1024 * 1024
    }

    /// Validate the flag/positional combination into a driver mode.
    pub fn mode(&self) -> Result<Mode, CliError> {
        if self.server {
            if self.entry.is_some() {
                return Err(CliError::Argument(
                    "--server takes only a chunks directory".to_string(),
                ));
            }
            return Ok(Mode::Server);
        }

        match &self.entry {
            Some(entry) => Ok(Mode::SingleShot {
                entry: entry.clone(),
                props: self.props.clone().unwrap_or_else(|| "{}".to_string()),
            }),
            None => Err(CliError::Argument(
                "an entry module is required unless --server is given".to_string(),
            )),
        }
    }
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments from a string slice (useful for testing)
pub fn parse_args_from<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, clap::Error> {
    Cli::try_parse_from(args)
}
