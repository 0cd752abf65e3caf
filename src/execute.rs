//! Execution loop: the one entrypoint (`JsRuntime::execute`) that
//! drives a single cell from source to `ExecuteResult`.
//! Everything else in this crate exists to be called from here: the
//! workspace manager prepares the notebook's on-disk dependency graph, the
//! rewriter and transpiler turn the cell's source into runnable CommonJS,
//! the sandbox and module interceptor provide the context it runs in, and
//! the timer registry tells this loop when a cell's asynchronous work has
//! quiesced.

use crate::emitter::{OutputSink, SharedSink};
use crate::env::{CellLanguage, CodeCell, NotebookEnv};
use crate::errors::{JsError, RunError};
use crate::interceptor::{self, DisplayHook};
use crate::output::{DisplayOutput, ExecuteResult, ExecutionStatus, NotebookOutput, OutputExecution, StreamName};
use crate::sandbox::{Sandbox, SandboxTimers};
use crate::transpilers;
use crate::workspace::{DependencyInstaller, NpmInstaller, Workspace, WorkspaceManager};
use colored::*;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Effective timeout when neither the caller, the cell, nor the
/// `NODEBOOKS_KERNEL_TIMEOUT_MS` environment variable specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Inputs to one `JsRuntime::execute` call. `on_stream` and `on_display`
/// are optional streaming callbacks; both must be `'static` since they are
/// handed to the sandbox's output sink, which can outlive the stack frame
/// that called `execute` if a cell's returned promise is still settling.
pub struct ExecuteRequest<'a> {
    pub cell: &'a CodeCell,
    pub code: &'a str,
    pub notebook_id: &'a str,
    pub env: &'a NotebookEnv,
    pub timeout_ms: Option<u64>,
    pub on_stream: Option<Box<dyn FnMut(&StreamName, &str) + 'static>>,
    pub on_display: Option<Box<dyn FnMut(&DisplayOutput) + 'static>>,
}

impl<'a> ExecuteRequest<'a> {
    pub fn new(cell: &'a CodeCell, code: &'a str, notebook_id: &'a str, env: &'a NotebookEnv) -> Self {
        ExecuteRequest {
            cell,
            code,
            notebook_id,
            env,
            timeout_ms: None,
            on_stream: None,
            on_display: None,
        }
    }
}

/// Constructor knobs for a `JsRuntime`: `workspace_root` and
/// `install_dependencies` control where and how a notebook's on-disk
/// environment is prepared, `seed` lets embedders request a deterministic
/// V8 (`--predictable --random-seed`).
pub struct JsRuntimeOptions {
    pub workspace_root: Option<PathBuf>,
    pub install_dependencies: Option<Arc<dyn DependencyInstaller>>,
    pub seed: Option<i64>,
}

impl Default for JsRuntimeOptions {
    fn default() -> Self {
        JsRuntimeOptions {
            workspace_root: None,
            install_dependencies: None,
            seed: None,
        }
    }
}

/// The sandbox currently bound to a notebook id + packages fingerprint pair.
/// Replaced wholesale -- rather than patched in place -- whenever either
/// half of the pair changes.
struct BoundSandbox {
    notebook_id: String,
    fingerprint: String,
    sandbox: Sandbox,
    display_hook: Rc<DisplayHook>,
}

/// Owns the one V8 isolate/context a notebook's cells share across runs.
/// Not `Send`: a `JsRuntime` (and its isolate) must stay on the thread that
/// created it.
pub struct JsRuntime {
    workspace: WorkspaceManager,
    bound: Option<BoundSandbox>,
}

impl JsRuntime {
    pub fn new() -> Self {
        Self::with_options(JsRuntimeOptions::default())
    }

    /// Performs the one-time V8 platform initialization (guarded by a
    /// `Once` in `sandbox::initialize_platform`) and builds the workspace
    /// manager. `options.seed` only takes effect the first time any
    /// `JsRuntime` is constructed in this process, since V8's random-seed
    /// flag must be set before `v8::V8::initialize()` runs -- recorded in
    /// DESIGN.md.
    pub fn with_options(options: JsRuntimeOptions) -> Self {
        if let Some(seed) = options.seed {
            v8::V8::set_flags_from_string(&format!("--predictable --random-seed={seed}"));
        }
        crate::sandbox::initialize_platform();

        let root = options
            .workspace_root
            .unwrap_or_else(|| std::env::temp_dir().join("nodebooks-runtime"));
        let installer = options
            .install_dependencies
            .unwrap_or_else(|| Arc::new(NpmInstaller) as Arc<dyn DependencyInstaller>);

        JsRuntime {
            workspace: WorkspaceManager::new(root, installer),
            bound: None,
        }
    }

    /// Runs one cell to completion. Never returns `Err`: every failure kind
    /// is folded into the returned `ExecuteResult`'s outputs/status, since
    /// a cell run is only ever stopped by its own timeout, never by an
    /// external cancellation.
    pub fn execute(&mut self, request: ExecuteRequest) -> ExecuteResult {
        let started = now_millis();
        let effective_timeout_ms = effective_timeout(&request);
        let deadline = Instant::now() + Duration::from_millis(effective_timeout_ms);

        let (workspace, diagnostics) = match self.workspace.ensure_environment(request.notebook_id, request.env) {
            Ok(pair) => pair,
            Err(prep_err) => {
                let mut outputs = prep_err.diagnostics.clone();
                let error = RunError::Preparation(prep_err).into_output();
                outputs.push(NotebookOutput::Error(error.clone()));
                return ExecuteResult {
                    outputs,
                    execution: OutputExecution {
                        started,
                        ended: now_millis(),
                        status: ExecutionStatus::Error,
                        error: Some(error),
                    },
                };
            }
        };

        self.rebind_if_needed(request.notebook_id, request.env, &workspace);
        let bound = self.bound.as_mut().expect("rebind_if_needed always leaves a bound sandbox");

        let sink: SharedSink<'static> = Rc::new(RefCell::new(OutputSink::new(request.on_stream, request.on_display)));
        for diagnostic in diagnostics {
            if let NotebookOutput::Stream(stream) = diagnostic {
                sink.borrow_mut().push_stream(stream.name, stream.text);
            }
        }

        let debug = std::env::var("NB_DEBUG").map(|v| v == "1").unwrap_or(false);

        let rewritten = crate::rewriter::rewrite(request.code, request.cell.language);
        if debug {
            trace(&sink, "rewritten source", &rewritten);
        }

        let filename = format!(
            "{}.{}",
            request.cell.id,
            match request.cell.language {
                CellLanguage::Js => "js",
                CellLanguage::Ts => "ts",
            }
        );

        let commonjs = match transpilers::to_commonjs(&filename, &rewritten, request.cell.language) {
            Ok(code) => code,
            Err(err) => {
                return finish_with_script_error(
                    &sink,
                    started,
                    crate::output::ErrorOutput {
                        ename: "Error".to_string(),
                        evalue: err.to_string(),
                        traceback: vec![],
                    },
                );
            }
        };
        if debug {
            trace(&sink, "transpiled commonjs", &commonjs);
        }

        let sink_for_hook = sink.clone();
        bound.display_hook.install(move |value| {
            let data = crate::output::build_display_data(&value);
            sink_for_hook.borrow_mut().push_display(data, true);
        });

        let handle = bound.sandbox.isolate_mut().thread_safe_handle();
        let timers = bound.sandbox.timers();

        let result = bound.sandbox.enter(|scope| {
            rebuild_process_env(scope, request.env);
            crate::sandbox::bind_sink(scope, sink.clone());
            let result = run_cell(scope, &handle, &timers, &commonjs, &filename, deadline);
            crate::sandbox::unbind_sink(scope);
            result
        });

        bound.display_hook.clear();
        timers.borrow_mut().clear_all();

        finalize(sink, started, effective_timeout_ms, result)
    }

    /// Replaces the bound sandbox when the notebook id or packages
    /// fingerprint changed, or when nothing is bound yet.
    fn rebind_if_needed(&mut self, notebook_id: &str, env: &NotebookEnv, workspace: &Workspace) {
        let fingerprint = env.packages_fingerprint();
        let needs_rebind = match &self.bound {
            Some(bound) => bound.notebook_id != notebook_id || bound.fingerprint != fingerprint,
            None => true,
        };
        if !needs_rebind {
            return;
        }

        let mut sandbox = Sandbox::new(workspace.dir.clone());
        let display_hook = DisplayHook::new();
        sandbox.enter(|scope| {
            interceptor::install(scope, workspace, display_hook.clone());
        });

        self.bound = Some(BoundSandbox {
            notebook_id: notebook_id.to_string(),
            fingerprint,
            sandbox,
            display_hook,
        });
    }
}

impl Default for JsRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces `process.env` with a fresh object built from
/// `NotebookEnv::exposed_variables` before every cell run, so a cell never
/// observes variables a prior cell set on the shared `process.env` object.
fn rebuild_process_env(scope: &mut v8::HandleScope, env: &NotebookEnv) {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let Some(process_key) = v8::String::new(scope, "process") else { return };
    let Some(process) = global.get(scope, process_key.into()).and_then(|v| v.to_object(scope)) else {
        return;
    };

    let fresh_env = v8::Object::new(scope);
    for (name, value) in env.exposed_variables() {
        let Some(val) = v8::String::new(scope, &value) else { continue };
        crate::bindings::set_property_to(scope, fresh_env, &name, val.into());
    }

    crate::bindings::set_property_to(scope, process, "env", fresh_env.into());
}

fn effective_timeout(request: &ExecuteRequest) -> u64 {
    request
        .timeout_ms
        .or(request.cell.metadata.timeout_ms)
        .or_else(|| {
            std::env::var("NODEBOOKS_KERNEL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Echoes a tracing section through the cell's own stdout, dimmed, when
/// `NB_DEBUG` is set -- mirrors how a REPL echoes diagnostics inline.
fn trace(sink: &SharedSink<'static>, label: &str, text: &str) {
    let line = format!("{}\n{}", format!("[NB_DEBUG] {label}:").dimmed(), text.dimmed());
    sink.borrow_mut().push_stream(StreamName::Stdout, line);
}

fn finish_with_script_error(sink: &SharedSink<'static>, started: u128, error: crate::output::ErrorOutput) -> ExecuteResult {
    let mut outputs = sink.borrow().outputs.clone();
    outputs.push(NotebookOutput::Error(error.clone()));
    ExecuteResult {
        outputs,
        execution: OutputExecution {
            started,
            ended: now_millis(),
            status: ExecutionStatus::Error,
            error: Some(error),
        },
    }
}

/// What one cell's V8-level run produced, in plain Rust data -- nothing
/// here borrows from the `HandleScope` it was built under, so it is free
/// to outlive the `sandbox.enter` closure.
struct CellRunOutcome {
    terminal_display: Option<std::collections::BTreeMap<String, serde_json::Value>>,
    error: Option<JsError>,
    soft_timeout: bool,
    hard_timeout: bool,
}

impl CellRunOutcome {
    fn hard_timeout() -> Self {
        CellRunOutcome {
            terminal_display: None,
            error: None,
            soft_timeout: false,
            hard_timeout: true,
        }
    }
}

/// Builds the `{ ui: "alert", ... }` display emitted for both the soft
/// quiescence timeout and the hard timeout.
fn alert_display(level: &str, title: &str, text: String) -> std::collections::BTreeMap<String, serde_json::Value> {
    let value = serde_json::json!({
        "ui": "alert",
        "level": level,
        "title": title,
        "text": text,
    });
    crate::output::build_display_data(&value)
}

/// Unwraps the sink's accumulated outputs once the cell run (and any
/// finalization pushes) are done. Panics if a clone of the `Rc` escaped,
/// which would be a bug in how the sink is shared.
fn take_outputs(sink: SharedSink<'static>) -> Vec<NotebookOutput> {
    Rc::try_unwrap(sink)
        .unwrap_or_else(|_| panic!("output sink still referenced after cell run"))
        .into_inner()
        .outputs
}

fn finalize(
    sink: SharedSink<'static>,
    started: u128,
    timeout_ms: u64,
    outcome: CellRunOutcome,
) -> ExecuteResult {
    if outcome.hard_timeout {
        let error = RunError::Timeout(timeout_ms).into_output();
        sink.borrow_mut().push_stream(
            StreamName::Stderr,
            format!("[timeout] Execution exceeded {timeout_ms}ms and was stopped.\n"),
        );
        sink.borrow_mut().push_display(
            alert_display("error", "Execution time limit reached", error.evalue.clone()),
            false,
        );
        let mut outputs = take_outputs(sink);
        outputs.push(NotebookOutput::Error(error.clone()));
        return ExecuteResult {
            outputs,
            execution: OutputExecution {
                started,
                ended: now_millis(),
                status: ExecutionStatus::Error,
                error: Some(error),
            },
        };
    }

    if let Some(js_error) = outcome.error {
        let error = js_error.into_output();
        let mut outputs = take_outputs(sink);
        outputs.push(NotebookOutput::Error(error.clone()));
        return ExecuteResult {
            outputs,
            execution: OutputExecution {
                started,
                ended: now_millis(),
                status: ExecutionStatus::Error,
                error: Some(error),
            },
        };
    }

    if outcome.soft_timeout {
        // "(also streamed)": fires through the same display sink used for
        // step 8, so `onDisplay` runs and `metadata.streamed` is set.
        sink.borrow_mut().push_display(
            alert_display(
                "warn",
                "Execution time limit reached",
                "Execution time limit reached; pending timers were stopped".to_string(),
            ),
            true,
        );
    }

    if let Some(display) = outcome.terminal_display {
        sink.borrow_mut().push_display(display, false);
    }

    let status = if outcome.soft_timeout {
        ExecutionStatus::Error
    } else {
        ExecutionStatus::Ok
    };

    let outputs = take_outputs(sink);

    ExecuteResult {
        outputs,
        execution: OutputExecution {
            started,
            ended: now_millis(),
            status,
            error: None,
        },
    }
}

/// Spawns a watchdog thread that terminates the isolate if `body` has not
/// finished by `deadline`, the same hard-timeout mechanism `dune` never
/// needed (its scripts run to completion once) but every sandboxed
/// multi-tenant V8 embedding relies on: `IsolateHandle::terminate_execution`
/// is explicitly documented as the one thread-safe call on an isolate,
/// meant to be invoked from exactly this kind of watchdog.
fn with_deadline<R>(handle: &v8::IsolateHandle, deadline: Instant, body: impl FnOnce() -> R) -> (R, bool) {
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let timed_out = Arc::new(AtomicBool::new(false));
    let timed_out_for_watchdog = timed_out.clone();
    let handle_for_watchdog = handle.clone();
    let remaining = deadline.saturating_duration_since(Instant::now());

    let watchdog = std::thread::spawn(move || {
        if cancel_rx.recv_timeout(remaining).is_err() {
            timed_out_for_watchdog.store(true, Ordering::SeqCst);
            handle_for_watchdog.terminate_execution();
        }
    });

    let result = body();

    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    handle.cancel_terminate_execution();

    (result, timed_out.load(Ordering::SeqCst))
}

/// Pops every timer due at or before now and invokes its v8 callback.
fn fire_ready_timers(scope: &mut v8::HandleScope, timers: &SandboxTimers) {
    let fired = timers.borrow_mut().poll_ready(Instant::now());
    let undefined = v8::undefined(scope);
    for entry in fired {
        let function = v8::Local::new(scope, (*entry.callback.function).clone());
        let args: Vec<v8::Local<v8::Value>> = entry
            .callback
            .extra_args
            .iter()
            .map(|g| v8::Local::new(scope, g.clone()))
            .collect();
        function.call(scope, undefined.into(), &args);
    }
}

/// Runs the microtask queue and the timer registry together until `done`
/// reports true or `deadline` passes, sleeping briefly between iterations
/// so a pending `setTimeout` doesn't spin the CPU while it waits.
fn pump_until(
    scope: &mut v8::HandleScope,
    timers: &SandboxTimers,
    deadline: Instant,
    mut done: impl FnMut(&mut v8::HandleScope) -> bool,
) -> bool {
    loop {
        scope.perform_microtask_checkpoint();
        fire_ready_timers(scope, timers);
        if done(scope) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn compile_and_run<'s>(
    try_catch: &mut v8::TryCatch<'s, v8::HandleScope>,
    source: &str,
    filename: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let code = v8::String::new(try_catch, source)?;
    let name = v8::String::new(try_catch, filename)?;
    let undefined = v8::undefined(try_catch);
    let origin = v8::ScriptOrigin::new(
        try_catch,
        name.into(),
        0,
        0,
        false,
        0,
        undefined.into(),
        false,
        false,
        false,
    );
    let script = v8::Script::compile(try_catch, code, Some(&origin))?;
    script.run(try_catch)
}

fn build_terminal_display(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Option<std::collections::BTreeMap<String, serde_json::Value>> {
    if value.is_undefined() || value.is_function() {
        return None;
    }
    if is_ui_emitted(scope, value) {
        return None;
    }
    Some(crate::sandbox::inspect_to_display_data(scope, value))
}

/// Values tagged by `@nodebooks/ui` helpers (`__nb_ui_emitted: true`) were
/// already streamed as their own `display_data` output; the terminal
/// display must suppress them to avoid double-emitting.
fn is_ui_emitted(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> bool {
    let Some(obj) = value.to_object(scope) else {
        return false;
    };
    let key = v8::String::new(scope, "__nb_ui_emitted").unwrap();
    obj.get(scope, key.into())
        .map(|v| v.boolean_value(scope))
        .unwrap_or(false)
}

/// Runs the whole cell -- script, awaited promise, and the three
/// quiescence phases -- under one watchdog-enforced deadline shared by
/// all three stages.
fn run_cell(
    scope: &mut v8::HandleScope,
    handle: &v8::IsolateHandle,
    timers: &SandboxTimers,
    source: &str,
    filename: &str,
    deadline: Instant,
) -> CellRunOutcome {
    let try_catch = &mut v8::TryCatch::new(scope);
    let (outcome, hard_timed_out) =
        with_deadline(handle, deadline, || run_cell_phases(try_catch, timers, source, filename, deadline));

    if hard_timed_out {
        return CellRunOutcome::hard_timeout();
    }
    outcome
}

fn run_cell_phases(
    try_catch: &mut v8::TryCatch<v8::HandleScope>,
    timers: &SandboxTimers,
    source: &str,
    filename: &str,
    deadline: Instant,
) -> CellRunOutcome {
    let Some(mut value) = compile_and_run(try_catch, source, filename) else {
        return match try_catch.exception() {
            Some(exception) => {
                let js_error = JsError::from_v8_exception(try_catch, exception, None);
                CellRunOutcome {
                    terminal_display: None,
                    error: Some(js_error),
                    soft_timeout: false,
                    hard_timeout: false,
                }
            }
            // No exception means V8 aborted the script via termination
            // rather than an ordinary throw; the outer watchdog result
            // already takes precedence, but report a timeout here too in
            // case this helper is ever called standalone.
            None => CellRunOutcome::hard_timeout(),
        };
    };

    if value.is_promise() {
        let promise = v8::Local::<v8::Promise>::try_from(value).expect("is_promise implies Promise");
        let settled = pump_until(try_catch, timers, deadline, |_scope| promise.state() != v8::PromiseState::Pending);
        if !settled {
            return CellRunOutcome::hard_timeout();
        }
        match promise.state() {
            v8::PromiseState::Fulfilled => value = promise.result(try_catch),
            v8::PromiseState::Rejected => {
                let reason = promise.result(try_catch);
                let js_error = JsError::from_v8_exception(try_catch, reason, Some("(in promise) "));
                return CellRunOutcome {
                    terminal_display: None,
                    error: Some(js_error),
                    soft_timeout: false,
                    hard_timeout: false,
                };
            }
            v8::PromiseState::Pending => unreachable!("settled implies not pending"),
        }
    }

    let mut soft_timeout = false;
    if !pump_until(try_catch, timers, deadline, |_| timers.borrow().pending_timeouts_empty()) {
        soft_timeout = true;
    }
    if !soft_timeout && !pump_until(try_catch, timers, deadline, |_| timers.borrow().intervals_ticked()) {
        soft_timeout = true;
    }
    if !soft_timeout && !pump_until(try_catch, timers, deadline, |_| timers.borrow().intervals_cleared()) {
        soft_timeout = true;
    }

    let terminal_display = build_terminal_display(try_catch, value);

    CellRunOutcome {
        terminal_display,
        error: None,
        soft_timeout,
        hard_timeout: false,
    }
}
