//! Console Operations (Ops)
//!
//! The sandboxed console never writes to process stdio. Each op appends a
//! pre-formatted, level-tagged line to the buffer of the render currently in
//! flight; the driver decides what to do with the lines once the render
//! returns.

use v8;

use crate::runtime::JsRuntime;

/// A single captured console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Level tag: `log`, `warn` or `error`
    pub level: &'static str,
    /// The pre-formatted message
    pub message: String,
}

/// Join all arguments into one line and append it to the current render's
/// console buffer.
fn append_line(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    level: &'static str,
) {
    let mut message = String::new();
    for i in 0..args.length() {
        if i > 0 {
            message.push(' ');
        }
        message.push_str(&args.get(i).to_rust_string_lossy(scope));
    }

    let state = JsRuntime::state(scope);
    state.borrow_mut().console.push(ConsoleLine { level, message });
}

/// console.log() / console.info() sink
pub fn op_console_log(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    append_line(scope, &args, "log");
    rv.set_undefined();
}

/// console.warn() sink
pub fn op_console_warn(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    append_line(scope, &args, "warn");
    rv.set_undefined();
}

/// console.error() sink
pub fn op_console_error(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    append_line(scope, &args, "error");
    rv.set_undefined();
}
