//! V8 JavaScript Runtime Core
//!
//! One [`JsRuntime`] is one runtime generation: a V8 isolate with its
//! context, module map and caches. The sandbox host constructs a generation
//! lazily, reuses it across renders while it stays healthy, and discards it
//! wholesale after a heap or deadline violation.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use v8::{CreateParams, Platform};

use crate::config::SandboxConfig;
use crate::loader::{self, ModuleMap, PendingImport};
use crate::ops::{self, ConsoleLine, HttpClient};

/// Name of the frozen render entry installed by the bootstrap script.
pub const RENDER_GLOBAL: &str = "__ssr_internal_render__";

/// The bootstrap script, evaluated once per runtime construction before
/// any user code is admitted.
const BOOTSTRAP_JS: &str = include_str!("./js/bootstrap.js");

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime construction or bootstrap evaluation failed
    #[error("BootstrapError: {0}")]
    Bootstrap(String),

    /// User code raised an error; the runtime remains usable
    #[error("{0}")]
    Js(String),

    /// Execution was terminated from outside (deadline or heap limit)
    #[error("execution terminated")]
    Terminated,

    /// The render promise can never settle (e.g. awaiting a stubbed timer)
    #[error("render promise never settled; renders must not await timers")]
    Stalled,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Global V8 platform - must be initialized once per process
static PLATFORM: std::sync::OnceLock<v8::SharedRef<Platform>> = std::sync::OnceLock::new();

/// Initialize the V8 platform (must be called before any runtime operations)
///
/// This function is thread-safe and will only initialize the platform once.
pub fn init_v8_platform() {
    PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        platform
    });
}

/// Shutdown the V8 platform
///
/// # Safety
/// Should only be called when no runtimes are active. Primarily used for
/// process teardown.
pub unsafe fn shutdown_v8_platform() {
    if PLATFORM.get().is_some() {
        v8::V8::dispose();
    }
}

/// The state stored in the isolate slot, reachable from ops and module
/// hooks via [`JsRuntime::state`].
pub struct JsRuntimeState {
    /// The sandboxed execution context with its own globals and caches
    pub context: v8::Global<v8::Context>,
    /// All modules compiled within this runtime generation
    pub module_map: ModuleMap,
    /// Dynamic imports queued by the hook, pumped by the drive loop
    pub pending_imports: Vec<PendingImport>,
    /// Console buffer of the render currently in flight
    pub console: Vec<ConsoleLine>,
    /// Shared sandbox configuration
    pub config: Arc<SandboxConfig>,
    /// Outbound HTTP stack for the fetch op
    pub http: Rc<HttpClient>,
}

/// Registered with V8's near-heap-limit hook; must outlive the isolate.
struct HeapGuard {
    handle: v8::IsolateHandle,
    hit: Arc<AtomicBool>,
}

/// Near-heap-limit callback: flag the violation, request termination, and
/// raise the limit so V8 can unwind instead of aborting the process. The
/// host treats the flag as fatal to the runtime.
extern "C" fn near_heap_limit_cb(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let guard = unsafe { &*(data as *const HeapGuard) };
    guard.hit.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    current_heap_limit * 2
}

/// One runtime generation
///
/// Each instance owns its V8 isolate and context. The isolate field is
/// declared first so it drops before the heap guard the limit callback
/// still points at.
pub struct JsRuntime {
    /// V8 isolate (owns the JavaScript heap and manages execution).
    /// The runtime state lives exclusively in the isolate slot so its V8
    /// handles are reclaimed while the isolate still exists.
    isolate: v8::OwnedIsolate,
    /// Keeps the near-heap-limit callback data alive
    #[allow(dead_code)]
    heap_guard: Option<Box<HeapGuard>>,
    /// Set by the heap-limit callback
    heap_exhausted: Arc<AtomicBool>,
    /// Set by the deadline watchdog
    deadline_hit: Arc<AtomicBool>,
}

impl JsRuntime {
    /// Construct a fresh runtime generation: isolate, hooks, context, op
    /// surface and bootstrap script.
    pub fn new(config: Arc<SandboxConfig>, http: Rc<HttpClient>) -> RuntimeResult<Self> {
        init_v8_platform();

        let mut params = CreateParams::default();
        if config.max_heap_bytes > 0 {
            params = params.heap_limits(0, config.max_heap_bytes);
        }

        let mut isolate = v8::Isolate::new(params);
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
        isolate.set_host_import_module_dynamically_callback(
            loader::host_import_module_dynamically_cb,
        );
        isolate.set_host_initialize_import_meta_object_callback(
            loader::host_initialize_import_meta_object_cb,
        );

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        let heap_guard = if config.max_heap_bytes > 0 {
            let guard = Box::new(HeapGuard {
                handle: isolate.thread_safe_handle(),
                hit: heap_exhausted.clone(),
            });
            let data = &*guard as *const HeapGuard as *mut std::ffi::c_void;
            isolate.add_near_heap_limit_callback(near_heap_limit_cb, data);
            Some(guard)
        } else {
            None
        };

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope);
            v8::Global::new(scope, context)
        };

        let state = Rc::new(RefCell::new(JsRuntimeState {
            context,
            module_map: ModuleMap::new(),
            pending_imports: Vec::new(),
            console: Vec::new(),
            config,
            http,
        }));
        isolate.set_slot(state);

        let mut runtime = Self {
            isolate,
            heap_guard,
            heap_exhausted,
            deadline_hit: Arc::new(AtomicBool::new(false)),
        };
        runtime.bootstrap()?;

        tracing::debug!("runtime generation constructed");
        Ok(runtime)
    }

    /// Returns the runtime state stored in the given isolate.
    pub fn state(isolate: &v8::Isolate) -> Rc<RefCell<JsRuntimeState>> {
        isolate
            .get_slot::<Rc<RefCell<JsRuntimeState>>>()
            .expect("runtime state missing from isolate slot")
            .clone()
    }

    /// Evaluate the bootstrap script in the fresh context.
    fn bootstrap(&mut self) -> RuntimeResult<()> {
        let scope = &mut self.handle_scope();

        ops::install_ops(scope).map_err(RuntimeError::Bootstrap)?;

        let tc_scope = &mut v8::TryCatch::new(scope);
        let source = v8::String::new(tc_scope, BOOTSTRAP_JS)
            .ok_or_else(|| RuntimeError::Bootstrap("failed to allocate bootstrap source".into()))?;

        let script = match v8::Script::compile(tc_scope, source, None) {
            Some(script) => script,
            None => {
                return Err(RuntimeError::Bootstrap(loader::exception_message(tc_scope)));
            }
        };

        if script.run(tc_scope).is_none() {
            return Err(RuntimeError::Bootstrap(loader::exception_message(tc_scope)));
        }

        Ok(())
    }

    /// Invoke the frozen render entry and drive the runtime to completion.
    ///
    /// Every op completes synchronously before returning to JavaScript, so
    /// the drive loop below (drain microtasks, pump queued dynamic imports,
    /// repeat until neither makes progress) either settles the render
    /// promise or proves that nothing ever can.
    pub fn render(&mut self, entry: &str, props_json: &str) -> RuntimeResult<String> {
        let heap_hit = self.heap_exhausted.clone();
        let deadline_hit = self.deadline_hit.clone();
        let terminated =
            move || heap_hit.load(Ordering::SeqCst) || deadline_hit.load(Ordering::SeqCst);

        let scope = &mut self.handle_scope();
        let tc_scope = &mut v8::TryCatch::new(scope);

        let context = tc_scope.get_current_context();
        let global = context.global(tc_scope);

        let key = v8::String::new(tc_scope, RENDER_GLOBAL)
            .ok_or_else(|| RuntimeError::Bootstrap("failed to allocate render key".into()))?;
        let render_fn = global
            .get(tc_scope, key.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| RuntimeError::Bootstrap("render entry missing from global".into()))?;

        let entry_value = v8::String::new(tc_scope, entry)
            .ok_or_else(|| RuntimeError::Bootstrap("failed to allocate entry string".into()))?;

        let props_json = if props_json.trim().is_empty() {
            "{}"
        } else {
            props_json
        };
        let props_source = v8::String::new(tc_scope, props_json)
            .ok_or_else(|| RuntimeError::Bootstrap("failed to allocate props string".into()))?;
        let props = match v8::json::parse(tc_scope, props_source) {
            Some(props) => props,
            None => {
                return Err(RuntimeError::Js(format!(
                    "invalid props JSON: {}",
                    loader::exception_message(tc_scope)
                )));
            }
        };

        let undefined = v8::undefined(tc_scope);
        let result = render_fn.call(tc_scope, undefined.into(), &[entry_value.into(), props]);

        let result = match result {
            Some(result) => result,
            None => {
                if terminated() {
                    return Err(RuntimeError::Terminated);
                }
                return Err(RuntimeError::Js(loader::exception_message(tc_scope)));
            }
        };

        let promise = match v8::Local::<v8::Promise>::try_from(result) {
            Ok(promise) => promise,
            // The frozen entry is async, but tolerate a plain value.
            Err(_) => return Ok(result.to_rust_string_lossy(tc_scope)),
        };

        loop {
            tc_scope.perform_microtask_checkpoint();
            if terminated() {
                return Err(RuntimeError::Terminated);
            }
            if !loader::pump_dynamic_imports(tc_scope) {
                break;
            }
            if terminated() {
                return Err(RuntimeError::Terminated);
            }
        }

        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let value = promise.result(tc_scope);
                Ok(value.to_rust_string_lossy(tc_scope))
            }
            v8::PromiseState::Rejected => {
                let exception = promise.result(tc_scope);
                Err(RuntimeError::Js(exception.to_rust_string_lossy(tc_scope)))
            }
            v8::PromiseState::Pending => Err(RuntimeError::Stalled),
        }
    }

    /// Reset the per-render context.
    pub fn begin_render(&mut self) {
        let state = Self::state(&self.isolate);
        let mut state = state.borrow_mut();
        state.console.clear();
        state.pending_imports.clear();
        self.deadline_hit.store(false, Ordering::SeqCst);
    }

    /// Drain the console lines captured during the current render.
    pub fn take_console(&mut self) -> Vec<ConsoleLine> {
        let state = Self::state(&self.isolate);
        let mut state = state.borrow_mut();
        std::mem::take(&mut state.console)
    }

    /// A handle the watchdog thread may use to terminate execution.
    pub fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate.thread_safe_handle()
    }

    /// Flag the deadline watchdog sets before terminating.
    pub fn deadline_flag(&self) -> Arc<AtomicBool> {
        self.deadline_hit.clone()
    }

    /// Whether the deadline watchdog fired during the last render.
    pub fn deadline_was_hit(&self) -> bool {
        self.deadline_hit.load(Ordering::SeqCst)
    }

    /// Whether the heap-limit callback fired during the last render.
    pub fn heap_exhausted(&self) -> bool {
        self.heap_exhausted.load(Ordering::SeqCst)
    }

    /// Clear a termination request that lost the race with render
    /// completion, so it cannot abort the next render.
    pub fn cancel_termination(&mut self) {
        self.isolate.cancel_terminate_execution();
    }

    /// Returns a v8 handle scope entered into the runtime's context.
    fn handle_scope(&mut self) -> v8::HandleScope {
        let context = Self::state(&self.isolate).borrow().context.clone();
        v8::HandleScope::with_context(&mut self.isolate, context)
    }
}

impl Drop for JsRuntime {
    fn drop(&mut self) {
        tracing::debug!("runtime generation dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Once;
    use tempfile::TempDir;

    static INIT: Once = Once::new();

    fn init_v8_for_tests() {
        INIT.call_once(init_v8_platform);
    }

    fn runtime_over(dir: &TempDir) -> JsRuntime {
        init_v8_for_tests();
        let config = SandboxConfig::new(dir.path(), 0, 0, &[]).unwrap();
        let http = Rc::new(HttpClient::new().unwrap());
        JsRuntime::new(config, http).unwrap()
    }

    #[test]
    fn test_bootstrap_succeeds() {
        let dir = TempDir::new().unwrap();
        let _runtime = runtime_over(&dir);
    }

    #[test]
    fn test_render_string_entry() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("entry.js"),
            "export default (p) => 'hello ' + p.name;",
        )
        .unwrap();

        let mut runtime = runtime_over(&dir);
        runtime.begin_render();
        let body = runtime.render("entry.js", r#"{"name":"Ada"}"#).unwrap();
        assert_eq!(body, "hello Ada");
    }

    #[test]
    fn test_render_error_keeps_runtime() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("entry.js"),
            "export default () => { throw new Error('boom'); };",
        )
        .unwrap();
        fs::write(dir.path().join("ok.js"), "export default () => 'fine';").unwrap();

        let mut runtime = runtime_over(&dir);
        runtime.begin_render();
        let err = runtime.render("entry.js", "{}").unwrap_err();
        assert!(matches!(err, RuntimeError::Js(_)));
        assert!(err.to_string().contains("boom"));

        runtime.begin_render();
        let body = runtime.render("ok.js", "{}").unwrap();
        assert_eq!(body, "fine");
    }

    #[test]
    fn test_invalid_props_is_js_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("entry.js"), "export default () => 'x';").unwrap();

        let mut runtime = runtime_over(&dir);
        runtime.begin_render();
        let err = runtime.render("entry.js", "{not json").unwrap_err();
        assert!(matches!(err, RuntimeError::Js(_)));
    }

    #[test]
    fn test_error_display_tokens() {
        assert!(RuntimeError::Bootstrap("x".into())
            .to_string()
            .starts_with("BootstrapError:"));
    }
}
