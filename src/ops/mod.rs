//! Native Operations (Ops)
//!
//! The complete set of host-provided primitives callable from inside the
//! runtime. Nothing else crosses the boundary: there is no filesystem op,
//! no environment op, no process op, and no timer op that schedules work.

pub mod bindings;
pub mod console;
pub mod crypto;
pub mod encoding;
pub mod fetch;

pub use bindings::{install_ops, OPS_GLOBAL};
pub use console::ConsoleLine;
pub use fetch::{FetchError, HttpClient};
