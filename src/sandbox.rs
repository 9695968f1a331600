//! Isolate Host
//!
//! Owns the current runtime generation and is the sole caller of user
//! code. Enforces the wall-clock deadline through a watchdog thread whose
//! only permitted action is to request engine termination, classifies
//! limit violations, and recovers from them by discarding the runtime so
//! the next render rebuilds it lazily (cold start).

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::ops::{ConsoleLine, HttpClient};
use crate::runtime::{JsRuntime, RuntimeError};

/// How often the watchdog checks the deadline and its disarm flag.
const WATCHDOG_TICK: Duration = Duration::from_millis(5);

/// Errors surfaced by the host
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Runtime construction failed; fatal in single-shot mode, retried per
    /// request in server mode
    #[error("BootstrapError: {0}")]
    Bootstrap(String),

    /// User code failed; the warm runtime and its caches are kept
    #[error("RenderError: {0}")]
    Render(String),

    /// The render exceeded the configured deadline; the runtime was
    /// discarded
    #[error("Timeout: render exceeded {0} ms")]
    Timeout(u64),

    /// The render exceeded the configured heap limit; the runtime was
    /// discarded
    #[error("HeapExhausted: render exceeded the configured heap limit")]
    HeapExhausted,
}

/// Result type for host operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// A completed render: the body plus the console lines it produced.
#[derive(Debug)]
pub struct RenderOutput {
    /// The rendered string, byte-for-byte what user code returned
    pub body: String,
    /// Level-tagged console lines emitted during this render only
    pub console: Vec<ConsoleLine>,
}

/// Deadline watchdog: a second OS thread that terminates the engine when
/// the deadline elapses. It never touches runtime data.
struct Watchdog {
    done: Arc<AtomicBool>,
}

impl Watchdog {
    fn spawn(handle: v8::IsolateHandle, fired: Arc<AtomicBool>, timeout: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();

        std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            while !done_flag.load(Ordering::SeqCst) {
                if Instant::now() >= deadline {
                    // Re-check right before firing to narrow the window in
                    // which a completed render gets a stray termination.
                    if done_flag.load(Ordering::SeqCst) {
                        return;
                    }
                    fired.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                    return;
                }
                std::thread::sleep(WATCHDOG_TICK);
            }
        });

        Self { done }
    }

    fn disarm(self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// The sandbox host
///
/// Renders are strictly serial; a `Sandbox` lives on one thread and holds
/// at most one runtime generation at a time.
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    http: Rc<HttpClient>,
    runtime: Option<JsRuntime>,
}

impl Sandbox {
    /// Create a host. The runtime itself is constructed lazily on the
    /// first render.
    pub fn new(config: Arc<SandboxConfig>) -> SandboxResult<Self> {
        let http = HttpClient::new().map_err(|e| SandboxError::Bootstrap(e.to_string()))?;
        Ok(Self {
            config,
            http: Rc::new(http),
            runtime: None,
        })
    }

    /// Render one entry with the given props JSON.
    pub fn render(&mut self, entry: &str, props_json: &str) -> SandboxResult<RenderOutput> {
        self.ensure_runtime()?;
        let max_render_ms = self.config.max_render_ms;
        let runtime = self.runtime.as_mut().ok_or_else(|| {
            SandboxError::Bootstrap("runtime unavailable after construction".into())
        })?;

        runtime.begin_render();

        let watchdog = (max_render_ms > 0).then(|| {
            Watchdog::spawn(
                runtime.isolate_handle(),
                runtime.deadline_flag(),
                Duration::from_millis(max_render_ms),
            )
        });

        let result = runtime.render(entry, props_json);

        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        let console = runtime.take_console();
        let heap_exhausted = runtime.heap_exhausted();

        // A limit-triggered termination is fatal to the runtime even when it
        // lost the race with render completion: the heap callback already
        // raised the limit to let V8 unwind.
        if heap_exhausted {
            self.teardown();
            tracing::warn!("render exceeded heap limit; runtime discarded");
            return Err(SandboxError::HeapExhausted);
        }

        // The watchdog may fire between render completion and disarm; a
        // termination request left pending would abort the next render.
        if runtime.deadline_was_hit() && !matches!(result, Err(RuntimeError::Terminated)) {
            runtime.cancel_termination();
        }

        match result {
            Ok(body) => Ok(RenderOutput { body, console }),
            Err(RuntimeError::Terminated) => {
                self.teardown();
                tracing::warn!("render exceeded {} ms deadline; runtime discarded", max_render_ms);
                Err(SandboxError::Timeout(max_render_ms))
            }
            Err(RuntimeError::Stalled) => Err(SandboxError::Render(
                RuntimeError::Stalled.to_string(),
            )),
            Err(RuntimeError::Js(message)) => Err(SandboxError::Render(message)),
            Err(RuntimeError::Bootstrap(message)) => Err(SandboxError::Bootstrap(message)),
        }
    }

    /// Lazily construct a runtime generation when none exists.
    fn ensure_runtime(&mut self) -> SandboxResult<()> {
        if self.runtime.is_none() {
            tracing::debug!("cold start: constructing runtime");
            let runtime = JsRuntime::new(self.config.clone(), self.http.clone()).map_err(
                |err| match err {
                    RuntimeError::Bootstrap(message) => SandboxError::Bootstrap(message),
                    other => SandboxError::Bootstrap(other.to_string()),
                },
            )?;
            self.runtime = Some(runtime);
        }
        Ok(())
    }

    /// Discard the current runtime generation. All module and render
    /// caches go with it; the next render is a cold start.
    fn teardown(&mut self) {
        self.runtime = None;
    }

    /// Whether a warm runtime currently exists. Used by tests to observe
    /// teardown.
    pub fn is_warm(&self) -> bool {
        self.runtime.is_some()
    }
}
