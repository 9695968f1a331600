//! V8-Rust Bridge Bindings
//!
//! Installs the host namespace object on a fresh context and provides the
//! argument-extraction and exception helpers the individual ops share.
//!
//! # Architecture
//!
//! Every op reaches runtime state through the isolate slot
//! (`JsRuntime::state`), so ops and module-loading hooks share one
//! mechanism. The namespace object is a plain global the bootstrap script
//! captures into its closure and then deletes; after bootstrap, user code
//! has no path to the raw op registry.

use v8;

/// Name of the host namespace global. Present only between context
/// creation and the end of the bootstrap script.
pub const OPS_GLOBAL: &str = "__ssr_ops__";

/// Throw a JavaScript error from a Rust callback
pub fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let error = v8::Exception::error(scope, message);
        scope.throw_exception(error);
    }
}

/// Throw a JavaScript type error from a Rust callback
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let error = v8::Exception::type_error(scope, message);
        scope.throw_exception(error);
    }
}

/// Extract a string argument from V8
///
/// Returns `Some(String)` if the argument exists and is a string.
pub fn extract_string_arg(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    index: i32,
) -> Option<String> {
    if args.length() <= index {
        return None;
    }

    let arg = args.get(index);
    if arg.is_string() {
        Some(arg.to_rust_string_lossy(scope))
    } else {
        None
    }
}

/// Extract a bytes argument from V8 (ArrayBuffer or Uint8Array)
pub fn extract_bytes_arg(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    index: i32,
) -> Option<Vec<u8>> {
    if args.length() <= index {
        return None;
    }

    let arg = args.get(index);

    if arg.is_array_buffer() {
        let buffer = v8::Local::<v8::ArrayBuffer>::try_from(arg).ok()?;
        let backing_store = buffer.get_backing_store();
        let bytes: Vec<u8> = backing_store.iter().map(|cell| cell.get()).collect();
        Some(bytes)
    } else if arg.is_uint8_array() {
        let array = v8::Local::<v8::Uint8Array>::try_from(arg).ok()?;
        let buffer = array.buffer(scope)?;
        let backing_store = buffer.get_backing_store();
        let offset = array.byte_offset() as usize;
        let length = array.byte_length() as usize;
        let bytes: Vec<u8> = backing_store
            .iter()
            .skip(offset)
            .take(length)
            .map(|cell| cell.get())
            .collect();
        Some(bytes)
    } else {
        None
    }
}

/// Install the host namespace object on the current context's global.
///
/// Must run after context creation and before the bootstrap script. The
/// object carries the complete op surface and nothing else.
pub fn install_ops(scope: &mut v8::HandleScope) -> Result<(), String> {
    let context = scope.get_current_context();
    let global = context.global(scope);

    let ops = v8::Object::new(scope);

    register(scope, ops, "consoleLog", crate::ops::console::op_console_log)?;
    register(scope, ops, "consoleWarn", crate::ops::console::op_console_warn)?;
    register(scope, ops, "consoleError", crate::ops::console::op_console_error)?;
    register(scope, ops, "randomUuid", crate::ops::crypto::op_random_uuid)?;
    register(scope, ops, "getRandomValues", crate::ops::crypto::op_get_random_values)?;
    register(scope, ops, "digest", crate::ops::crypto::op_digest)?;
    register(scope, ops, "btoa", crate::ops::encoding::op_btoa)?;
    register(scope, ops, "atob", crate::ops::encoding::op_atob)?;
    register(scope, ops, "fetch", crate::ops::fetch::op_fetch)?;

    let key = v8::String::new(scope, OPS_GLOBAL)
        .ok_or_else(|| "failed to allocate ops key".to_string())?;
    global.set(scope, key.into(), ops.into());

    tracing::debug!("host op surface installed");
    Ok(())
}

/// Register one native function on the namespace object.
fn register(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<(), String> {
    let key = v8::String::new(scope, name)
        .ok_or_else(|| format!("failed to allocate op name '{}'", name))?;
    let function = v8::Function::new(scope, callback)
        .ok_or_else(|| format!("failed to create op function '{}'", name))?;
    target.set(scope, key.into(), function.into());
    Ok(())
}
