//! ES Module Loader
//!
//! Provides module source text to the engine for resolver-approved ids
//! only, and owns the V8-facing loading machinery: the module map, the
//! recursive tree fetch for static imports, the instantiate-time resolve
//! callback and the dynamic-import hook.
//!
//! Dynamic imports are not evaluated inside the V8 callback. The hook only
//! queues them; the host's drive loop pumps the queue between microtask
//! checkpoints, so module evaluation always happens with no JavaScript on
//! the stack. Modules are ES only; CommonJS and import assertions are not
//! interpreted.

use std::collections::HashMap;
use thiserror::Error;

use crate::ops::bindings::throw_error;
use crate::resolver;
use crate::runtime::JsRuntime;

/// Canonical module id, as produced by the resolver
pub type ModulePath = String;

/// Errors that can occur while reading module sources
#[derive(Error, Debug)]
pub enum LoadError {
    /// The module file could not be read
    #[error("LoadIO: failed to read '{path}': {source}")]
    LoadIO {
        /// The module id whose read failed
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Result type for load operations
pub type LoadResult<T> = Result<T, LoadError>;

/// Read the source text for a resolved module id.
pub fn load(id: &str) -> LoadResult<String> {
    std::fs::read_to_string(id).map_err(|source| LoadError::LoadIO {
        path: id.to_string(),
        source,
    })
}

/// Module map: every module compiled within the current runtime, keyed by
/// canonical id. Discarded en masse when the runtime is torn down.
#[derive(Default)]
pub struct ModuleMap {
    index: HashMap<ModulePath, v8::Global<v8::Module>>,
}

impl ModuleMap {
    /// Creates an empty module map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a compiled module under its id.
    pub fn insert(&mut self, id: &str, module: v8::Global<v8::Module>) {
        self.index.insert(id.to_string(), module);
    }

    /// Returns the module registered under `id`, if any.
    pub fn get(&self, id: &str) -> Option<v8::Global<v8::Module>> {
        self.index.get(id).cloned()
    }

    /// Returns whether `id` has been compiled already.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Reverse lookup: the id a module handle was registered under.
    pub fn get_path(&self, module: &v8::Global<v8::Module>) -> Option<ModulePath> {
        self.index
            .iter()
            .find(|(_, m)| *m == module)
            .map(|(path, _)| path.clone())
    }
}

/// A dynamic import queued by the hook, settled by the drive loop.
pub struct PendingImport {
    specifier: String,
    referrer: Option<String>,
    resolver: v8::Global<v8::PromiseResolver>,
    /// Set once evaluation has started; polled until the module settles.
    module: Option<v8::Global<v8::Module>>,
}

/// Creates the script origin for a module id.
fn create_origin<'s>(scope: &mut v8::HandleScope<'s>, name: &str) -> Option<v8::ScriptOrigin<'s>> {
    let resource_name = v8::String::new(scope, name)?;
    let undefined_value = v8::undefined(scope);

    Some(v8::ScriptOrigin::new(
        scope,
        resource_name.into(),
        0,
        0,
        false,
        -1,
        undefined_value.into(),
        false,
        false,
        true,
    ))
}

/// Compiles the module at `id` and, recursively, every module its static
/// imports request. Each compiled module is registered in the module map
/// before its dependencies are walked, so import cycles terminate.
///
/// On failure an exception describing the first error is thrown into the
/// scope and `None` is returned.
pub fn fetch_module_tree<'a>(
    scope: &mut v8::HandleScope<'a>,
    id: &str,
) -> Option<v8::Local<'a, v8::Module>> {
    let state = JsRuntime::state(scope);
    let root = state.borrow().config.root_dir.clone();

    let source = match load(id) {
        Ok(source) => source,
        Err(err) => {
            throw_error(scope, &err.to_string());
            return None;
        }
    };

    let origin = create_origin(scope, id)?;
    let source = v8::String::new(scope, &source)?;
    let source = v8::script_compiler::Source::new(source, Some(&origin));

    let module = v8::script_compiler::compile_module(scope, source)?;

    let module_ref = v8::Global::new(scope, module);
    state.borrow_mut().module_map.insert(id, module_ref);
    tracing::debug!("compiled module {}", id);

    let requests = module.get_module_requests();
    for i in 0..requests.length() {
        let request = requests.get(scope, i)?;
        let request = v8::Local::<v8::ModuleRequest>::try_from(request).ok()?;
        let specifier = request.get_specifier().to_rust_string_lossy(scope);

        let dependency = match resolver::resolve(&specifier, Some(id), &root) {
            Ok(dependency) => dependency,
            Err(err) => {
                throw_error(scope, &err.to_string());
                return None;
            }
        };

        if !state.borrow().module_map.contains(&dependency) {
            fetch_module_tree(scope, &dependency)?;
        }
    }

    Some(module)
}

/// Instantiate-time resolution callback.
///
/// `fetch_module_tree` has already compiled the whole graph, so this only
/// re-resolves the specifier and looks the dependency up in the map.
pub fn module_resolve_cb<'a>(
    context: v8::Local<'a, v8::Context>,
    specifier: v8::Local<'a, v8::String>,
    _import_attributes: v8::Local<'a, v8::FixedArray>,
    referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let state = JsRuntime::state(scope);
    let root = state.borrow().config.root_dir.clone();

    let referrer = v8::Global::new(scope, referrer);
    let referrer_path = state.borrow().module_map.get_path(&referrer);

    let specifier = specifier.to_rust_string_lossy(scope);
    let id = match resolver::resolve(&specifier, referrer_path.as_deref(), &root) {
        Ok(id) => id,
        Err(err) => {
            throw_error(scope, &err.to_string());
            return None;
        }
    };

    let module = state.borrow().module_map.get(&id);
    match module {
        Some(module) => Some(v8::Local::new(scope, module)),
        None => {
            throw_error(scope, &format!("module '{}' was not fetched", id));
            None
        }
    }
}

/// Dynamic-import hook. Queues the request and returns its promise; the
/// drive loop performs the actual load once no JavaScript is on the stack.
pub fn host_import_module_dynamically_cb<'s>(
    scope: &mut v8::HandleScope<'s>,
    _host_defined_options: v8::Local<'s, v8::Data>,
    resource_name: v8::Local<'s, v8::Value>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let resolver = v8::PromiseResolver::new(scope)?;
    let promise = resolver.get_promise(scope);

    let specifier = specifier.to_rust_string_lossy(scope);
    let referrer = resource_name.to_rust_string_lossy(scope);
    let resolver = v8::Global::new(scope, resolver);

    let state = JsRuntime::state(scope);
    let mut state = state.borrow_mut();
    // Imports issued by the bootstrap script carry a synthetic origin that
    // is not a module id; those resolve against the sandbox root.
    let referrer = state.module_map.contains(&referrer).then_some(referrer);
    state.pending_imports.push(PendingImport {
        specifier,
        referrer,
        resolver,
        module: None,
    });

    Some(promise)
}

/// import.meta initializer: exposes the module id as `import.meta.url`.
pub extern "C" fn host_initialize_import_meta_object_cb(
    context: v8::Local<v8::Context>,
    module: v8::Local<v8::Module>,
    meta: v8::Local<v8::Object>,
) {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let state = JsRuntime::state(scope);

    let module = v8::Global::new(scope, module);
    let path = state.borrow().module_map.get_path(&module).unwrap_or_default();

    if let (Some(key), Some(url)) = (
        v8::String::new(scope, "url"),
        v8::String::new(scope, &path),
    ) {
        meta.set(scope, key.into(), url.into());
    }
}

/// Outcome of one step of a pending dynamic import.
enum ImportStep {
    /// The import promise was resolved or rejected.
    Settled,
    /// Evaluation was started this step; the module has not settled yet.
    Started,
    /// Evaluation is in flight (top-level await); poll again later.
    Waiting,
}

/// Work the dynamic-import queue once.
///
/// Returns `true` when any import made progress (started evaluating or
/// settled). When it returns `false` the queue is either empty or
/// genuinely stuck, and no further microtask drain can change that.
pub fn pump_dynamic_imports(scope: &mut v8::HandleScope) -> bool {
    let state = JsRuntime::state(scope);
    let pending: Vec<PendingImport> = state.borrow_mut().pending_imports.drain(..).collect();
    if pending.is_empty() {
        return false;
    }

    let mut progressed = false;
    let mut in_flight = Vec::new();

    for mut import in pending {
        match step_dynamic_import(scope, &mut import) {
            ImportStep::Settled => progressed = true,
            ImportStep::Started => {
                progressed = true;
                in_flight.push(import);
            }
            ImportStep::Waiting => in_flight.push(import),
        }
    }

    state.borrow_mut().pending_imports.extend(in_flight);
    progressed
}

fn step_dynamic_import(scope: &mut v8::HandleScope, import: &mut PendingImport) -> ImportStep {
    // Already evaluating: poll until top-level await settles the module.
    if let Some(module) = &import.module {
        let module = v8::Local::new(scope, module);
        return match module.get_status() {
            v8::ModuleStatus::Evaluated => {
                resolve_with_namespace(scope, &import.resolver, module);
                ImportStep::Settled
            }
            v8::ModuleStatus::Errored => {
                reject_with_exception(scope, &import.resolver, module.get_exception());
                ImportStep::Settled
            }
            _ => ImportStep::Waiting,
        };
    }

    let state = JsRuntime::state(scope);
    let root = state.borrow().config.root_dir.clone();

    let id = match resolver::resolve(&import.specifier, import.referrer.as_deref(), &root) {
        Ok(id) => id,
        Err(err) => {
            reject_with_message(scope, &import.resolver, &err.to_string());
            return ImportStep::Settled;
        }
    };

    let existing = state.borrow().module_map.get(&id);

    let tc_scope = &mut v8::TryCatch::new(scope);

    let module = match existing {
        Some(module) => v8::Local::new(tc_scope, &module),
        None => match fetch_module_tree(tc_scope, &id) {
            Some(module) => module,
            None => {
                let message = exception_message(tc_scope);
                reject_with_message(tc_scope, &import.resolver, &message);
                return ImportStep::Settled;
            }
        },
    };

    if module.get_status() == v8::ModuleStatus::Uninstantiated
        && module.instantiate_module(tc_scope, module_resolve_cb) != Some(true)
    {
        let message = exception_message(tc_scope);
        reject_with_message(tc_scope, &import.resolver, &message);
        return ImportStep::Settled;
    }

    if module.get_status() == v8::ModuleStatus::Instantiated
        && module.evaluate(tc_scope).is_none()
    {
        let message = exception_message(tc_scope);
        reject_with_message(tc_scope, &import.resolver, &message);
        return ImportStep::Settled;
    }

    match module.get_status() {
        v8::ModuleStatus::Evaluated => {
            resolve_with_namespace(tc_scope, &import.resolver, module);
            ImportStep::Settled
        }
        v8::ModuleStatus::Errored => {
            reject_with_exception(tc_scope, &import.resolver, module.get_exception());
            ImportStep::Settled
        }
        _ => {
            import.module = Some(v8::Global::new(tc_scope, module));
            ImportStep::Started
        }
    }
}

fn resolve_with_namespace(
    scope: &mut v8::HandleScope,
    resolver: &v8::Global<v8::PromiseResolver>,
    module: v8::Local<v8::Module>,
) {
    let namespace = module.get_module_namespace();
    let resolver = v8::Local::new(scope, resolver);
    resolver.resolve(scope, namespace);
}

fn reject_with_exception(
    scope: &mut v8::HandleScope,
    resolver: &v8::Global<v8::PromiseResolver>,
    exception: v8::Local<v8::Value>,
) {
    let resolver = v8::Local::new(scope, resolver);
    resolver.reject(scope, exception);
}

fn reject_with_message(
    scope: &mut v8::HandleScope,
    resolver: &v8::Global<v8::PromiseResolver>,
    message: &str,
) {
    let message = v8::String::new(scope, message)
        .unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::error(scope, message);
    let resolver = v8::Local::new(scope, resolver);
    resolver.reject(scope, exception);
}

/// Extract the pending exception's message from a TryCatch scope.
pub fn exception_message(tc_scope: &mut v8::TryCatch<v8::HandleScope>) -> String {
    match tc_scope.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc_scope),
        None => "unknown execution error".to_string(),
    }
}
