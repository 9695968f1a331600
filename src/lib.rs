//! ssr-sandbox - A sandboxed JavaScript runtime for server-side rendering
//!
//! Embeds V8 to execute untrusted SSR bundles while containing
//! supply-chain compromise: a compromised bundle cannot read the
//! filesystem, probe the environment, reach the network beyond an
//! operator-specified origin allowlist, spawn processes, or escape via
//! module resolution. Renders return a string (typically HTML) to a
//! caller invoking the binary once or driving it as a co-process over a
//! line protocol.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod cli;
pub mod config;
pub mod loader;
pub mod ops;
pub mod resolver;
pub mod runtime;
pub mod sandbox;
pub mod server;

// Re-exports for convenience
pub use config::{ConfigError, SandboxConfig};
pub use resolver::{resolve, ResolveError};
pub use runtime::{JsRuntime, RuntimeError, RuntimeResult};
pub use sandbox::{RenderOutput, Sandbox, SandboxError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the V8 platform
///
/// This must be called once before creating any sandboxes.
/// This function is thread-safe and will only initialize V8 once.
pub fn init_v8() {
    runtime::init_v8_platform();
}

/// Shutdown the V8 platform
///
/// # Safety
/// Should only be called when no runtimes are active.
pub unsafe fn shutdown_v8() {
    runtime::shutdown_v8_platform();
}
