//! Sandbox Host (C3): builds the curated v8 context a notebook's cells run
//! inside -- console/process/fs proxies, the timer bridge, the `require`
//! placeholder rebound by the module interceptor, and the JS bootstrap that
//! fills in the web-platform globals V8 itself doesn't ship.

use crate::bindings::{
    create_object_under, set_constant_to, set_function_to, set_function_with_data_to,
    set_property_to, throw_exception, throw_type_error,
};
use crate::emitter::SharedSink;
use crate::errors::generic_error;
use crate::timers::TimerRegistry;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initializes the v8 platform exactly once per process. Safe to call from
/// every `Sandbox::new` -- the real work only happens the first time.
pub fn initialize_platform() {
    INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// A timer handle's payload: the callback function plus any extra arguments
/// passed to `setTimeout`/`setInterval` after the delay, both kept alive as
/// global handles since the registry outlives any single `HandleScope`.
#[derive(Clone)]
pub struct TimerCallback {
    pub function: Rc<v8::Global<v8::Function>>,
    pub extra_args: Rc<Vec<v8::Global<v8::Value>>>,
}

pub type SandboxTimers = Rc<RefCell<TimerRegistry<TimerCallback>>>;

/// Everything a running cell needs pinned to the isolate: the timer
/// registry the `execute` loop polls for quiescence, and the output sink
/// the console proxy and `@nodebooks/ui` display hook write into.
pub struct SandboxState {
    pub timers: SandboxTimers,
    pub sink: SharedSink<'static>,
    pub workspace_dir: PathBuf,
}

/// Owns the isolate and the one persistent context a notebook's cells share
/// across runs, giving the REPL-like "variables and `require`d modules
/// persist between cells" behaviour.
pub struct Sandbox {
    isolate: v8::OwnedIsolate,
    context: v8::Global<v8::Context>,
}

impl Sandbox {
    /// Builds a fresh isolate and context, installing every sandbox global.
    /// `sink` and `timers` are cloned into the isolate's v8 `slot` data so
    /// bindings created later (the module interceptor's `require`) can reach
    /// them without threading extra parameters through every call site.
    pub fn new(workspace_dir: PathBuf) -> Self {
        initialize_platform();

        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        let timers: SandboxTimers = Rc::new(RefCell::new(TimerRegistry::new()));
        isolate.set_slot(timers.clone());

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);

            install_globals(scope, &workspace_dir, &timers);

            v8::Global::new(scope, context)
        };

        Sandbox { isolate, context }
    }

    pub fn isolate_mut(&mut self) -> &mut v8::OwnedIsolate {
        &mut self.isolate
    }

    pub fn context(&self) -> &v8::Global<v8::Context> {
        &self.context
    }

    pub fn timers(&mut self) -> SandboxTimers {
        self.isolate
            .get_slot::<SandboxTimers>()
            .expect("timer registry slot missing")
            .clone()
    }

    /// Runs `body` with a `HandleScope`/`ContextScope` pair bound to this
    /// sandbox's persistent context.
    pub fn enter<R>(&mut self, body: impl FnOnce(&mut v8::HandleScope) -> R) -> R {
        let context = self.context.clone();
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, context);
        let scope = &mut v8::ContextScope::new(scope, context);
        body(scope)
    }
}

fn install_globals(
    scope: &mut v8::HandleScope,
    workspace_dir: &PathBuf,
    timers: &SandboxTimers,
) {
    let global = scope.get_current_context().global(scope);

    install_console(scope, global);
    install_process(scope, global, workspace_dir);
    install_timers(scope, global, timers.clone());
    install_require_placeholder(scope, global);
    install_fetch(scope, global);

    let fs = crate::fsproxy::build(scope, workspace_dir.clone());
    set_property_to(scope, global, "__nb_fs", fs.into());

    run_bootstrap(scope, global);
}

const BOOTSTRAP_SOURCE: &str = include_str!("./js/bootstrap.js");

fn run_bootstrap(scope: &mut v8::HandleScope, _global: v8::Local<v8::Object>) {
    let source = v8::String::new(scope, BOOTSTRAP_SOURCE).unwrap();
    let try_catch = &mut v8::TryCatch::new(scope);
    let Some(script) = v8::Script::compile(try_catch, source, None) else {
        panic!("bootstrap script failed to compile");
    };
    if script.run(try_catch).is_none() {
        panic!("bootstrap script threw during initialization");
    }
}

/// `console.log`/`error`/`warn`/`info`/`debug` write to the shared
/// `OutputSink` instead of real stdout/stderr; `console.table`,
/// `console.group`/`groupEnd`, and `console.assert` are best-effort
/// approximations kept for compatibility.
fn install_console(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    let console = create_object_under(scope, global, "console");
    for name in ["log", "info", "debug"] {
        set_function_to(scope, console, name, console_stdout);
    }
    for name in ["warn", "error"] {
        set_function_to(scope, console, name, console_stderr);
    }
    set_function_to(scope, console, "table", console_stdout);
    set_function_to(scope, console, "group", console_stdout);
    set_function_to(scope, console, "groupEnd", |_scope, _args, _rv| {});
    set_function_to(scope, console, "assert", console_assert);
}

fn format_args(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> String {
    let mut parts = Vec::with_capacity(args.length() as usize);
    for i in 0..args.length() {
        parts.push(inspect_value(scope, args.get(i)));
    }
    parts.join(" ")
}

/// Renders a single value the way `console.log` renders one of its
/// arguments: strings verbatim, everything else via `JSON.stringify`,
/// falling back to `String(value)` for values `JSON.stringify` rejects
/// (functions, `BigInt`, values with a throwing `toJSON`). Shared by the
/// console proxy and the execution loop's terminal-display builder
/// (execute.rs) so both inspect values the same way.
pub fn inspect_value(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_string() {
        value.to_rust_string_lossy(scope)
    } else {
        v8::json::stringify(scope, value)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| value.to_rust_string_lossy(scope))
    }
}

/// Builds the MIME-keyed display payload for a live v8 value: JSON-encodes
/// it once, then defers the MIME-table shape to
/// `output::build_display_data`. Values `JSON.stringify` rejects still get
/// a bare `text/plain` entry from the universal inspector.
pub fn inspect_to_display_data(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> std::collections::BTreeMap<String, serde_json::Value> {
    let parsed = v8::json::stringify(scope, value)
        .map(|s| s.to_rust_string_lossy(scope))
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());

    match parsed {
        Some(parsed) => crate::output::build_display_data(&parsed),
        None => {
            let mut data = std::collections::BTreeMap::new();
            data.insert(
                "text/plain".to_string(),
                serde_json::Value::String(inspect_value(scope, value)),
            );
            data
        }
    }
}

fn console_stdout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let line = format_args(scope, &args);
    emit_stream(scope, crate::output::StreamName::Stdout, line);
}

fn console_stderr(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let line = format_args(scope, &args);
    emit_stream(scope, crate::output::StreamName::Stderr, line);
}

fn console_assert(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    if args.get(0).boolean_value(scope) {
        return;
    }
    let rest_args = v8::FunctionCallbackArguments::from(args);
    let mut message = String::from("Assertion failed");
    let tail = format_args_from(scope, &rest_args, 1);
    if !tail.is_empty() {
        message.push_str(": ");
        message.push_str(&tail);
    }
    emit_stream(scope, crate::output::StreamName::Stderr, message);
}

fn format_args_from(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, start: i32) -> String {
    let mut parts = Vec::new();
    for i in start..args.length() {
        parts.push(args.get(i).to_rust_string_lossy(scope));
    }
    parts.join(" ")
}

/// Looks up the sandbox's sink via the current cell's bound state (stashed
/// on the global object as `__nb_state` by `execute.rs` before each run) and
/// appends a stream line to it. Falls back to a no-op before a cell's state
/// has been bound (e.g. during `install_globals` itself).
fn emit_stream(scope: &mut v8::HandleScope, name: crate::output::StreamName, mut text: String) {
    text.push('\n');
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, "__nb_state").unwrap();
    let Some(state_value) = global.get(scope, key.into()) else {
        return;
    };
    if state_value.is_undefined() {
        return;
    }
    let Ok(external) = v8::Local::<v8::External>::try_from(state_value) else {
        return;
    };
    let ptr = external.value() as *const RefCell<crate::emitter::OutputSink<'static>>;
    let sink = unsafe { &*ptr };
    sink.borrow_mut().push_stream(name, text);
}

/// `process` proxy: `cwd()` returns the workspace root,
/// `chdir`/`exit`/`kill` throw (a notebook cell cannot leave its sandbox or
/// tear down the host process), `env` is a plain mutable object seeded from
/// `NotebookEnv::exposed_variables`, and `stdout`/`stderr` are minimal
/// write-only streams wired to the console proxy's sink.
fn install_process(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>, workspace_dir: &PathBuf) {
    let process = create_object_under(scope, global, "process");

    let cwd = workspace_dir.to_string_lossy().into_owned();
    set_function_with_data_to(
        scope,
        process,
        "cwd",
        process_cwd,
        Rc::new(cwd),
    );
    set_function_to(scope, process, "chdir", |scope, _args, _rv| {
        throw_exception(&mut *scope, &generic_error("process.chdir is not supported in this notebook runtime"));
    });
    set_function_to(scope, process, "exit", |scope, _args, _rv| {
        throw_exception(&mut *scope, &generic_error("process.exit is not supported in this notebook runtime"));
    });
    set_function_to(scope, process, "kill", |scope, _args, _rv| {
        throw_exception(&mut *scope, &generic_error("process.kill is not supported in this notebook runtime"));
    });

    let env = v8::Object::new(scope);
    set_property_to(scope, process, "env", env.into());

    let versions = v8::Object::new(scope);
    set_property_to(scope, versions, "node", v8::String::new(scope, "20.0.0-nodebooks").unwrap().into());
    set_property_to(scope, versions, "v8", v8::String::new(scope, v8::V8::get_version()).unwrap().into());
    set_property_to(scope, process, "versions", versions.into());

    set_property_to(scope, process, "pid", v8::Integer::new(scope, std::process::id() as i32).into());
    let platform = if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "win32"
    } else {
        "linux"
    };
    set_property_to(scope, process, "platform", v8::String::new(scope, platform).unwrap().into());
    set_function_to(scope, process, "memoryUsage", process_memory_usage);

    let stdout = create_object_under(scope, process, "stdout");
    set_constant_to(scope, stdout, "isTTY", v8::Boolean::new(scope, true).into());
    set_function_to(scope, stdout, "write", |scope, args, mut rv| {
        let text = args.get(0).to_rust_string_lossy(scope);
        emit_stream(scope, crate::output::StreamName::Stdout, text.trim_end_matches('\n').to_string());
        rv.set(v8::Boolean::new(scope, true).into());
    });

    let stderr = create_object_under(scope, process, "stderr");
    set_constant_to(scope, stderr, "isTTY", v8::Boolean::new(scope, true).into());
    set_function_to(scope, stderr, "write", |scope, args, mut rv| {
        let text = args.get(0).to_rust_string_lossy(scope);
        emit_stream(scope, crate::output::StreamName::Stderr, text.trim_end_matches('\n').to_string());
        rv.set(v8::Boolean::new(scope, true).into());
    });
}

fn process_cwd(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let cwd = crate::bindings::data_ref::<String>(&args);
    rv.set(v8::String::new(scope, &cwd).unwrap().into());
}

fn process_memory_usage(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let stats = scope.get_heap_statistics();
    let obj = v8::Object::new(scope);
    set_property_to(scope, obj, "rss", v8::Number::new(scope, stats.total_physical_size() as f64).into());
    set_property_to(scope, obj, "heapTotal", v8::Number::new(scope, stats.total_heap_size() as f64).into());
    set_property_to(scope, obj, "heapUsed", v8::Number::new(scope, stats.used_heap_size() as f64).into());
    set_property_to(scope, obj, "external", v8::Number::new(scope, stats.external_memory() as f64).into());
    rv.set(obj.into());
}

/// `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval` bridged to the
/// Rust-side `TimerRegistry`. The actual firing happens in `execute.rs`'s
/// quiescence loop, which calls `TimerRegistry::poll_ready` and invokes each
/// fired callback's v8 `Function` directly.
fn install_timers(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>, timers: SandboxTimers) {
    set_function_with_data_to(scope, global, "setTimeout", set_timeout, timers.clone());
    set_function_with_data_to(scope, global, "setInterval", set_interval, timers.clone());
    set_function_with_data_to(scope, global, "clearTimeout", clear_timeout, timers.clone());
    set_function_with_data_to(scope, global, "clearInterval", clear_interval, timers);
}

fn parse_timer_args(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
) -> Option<(Rc<v8::Global<v8::Function>>, Duration, Rc<Vec<v8::Global<v8::Value>>>)> {
    let function = v8::Local::<v8::Function>::try_from(args.get(0)).ok()?;
    let delay_ms = args.get(1).number_value(scope).unwrap_or(0.0).max(0.0);
    let mut extra_args = Vec::new();
    for i in 2..args.length() {
        extra_args.push(v8::Global::new(scope, args.get(i)));
    }
    Some((
        Rc::new(v8::Global::new(scope, function)),
        Duration::from_millis(delay_ms as u64),
        Rc::new(extra_args),
    ))
}

fn set_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let timers = crate::bindings::data_ref::<RefCell<TimerRegistry<TimerCallback>>>(&args);
    let Some((function, delay, extra_args)) = parse_timer_args(scope, &args) else {
        return throw_type_error(scope, "setTimeout: first argument must be a function");
    };
    let id = timers.borrow_mut().set_timeout(delay, TimerCallback { function, extra_args });
    rv.set(v8::Number::new(scope, id as f64).into());
}

fn set_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let timers = crate::bindings::data_ref::<RefCell<TimerRegistry<TimerCallback>>>(&args);
    let Some((function, delay, extra_args)) = parse_timer_args(scope, &args) else {
        return throw_type_error(scope, "setInterval: first argument must be a function");
    };
    let id = timers.borrow_mut().set_interval(delay, TimerCallback { function, extra_args });
    rv.set(v8::Number::new(scope, id as f64).into());
}

fn clear_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let timers = crate::bindings::data_ref::<RefCell<TimerRegistry<TimerCallback>>>(&args);
    if let Some(id) = args.get(0).number_value(scope) {
        timers.borrow_mut().clear_timeout(id as u32);
    }
}

fn clear_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let timers = crate::bindings::data_ref::<RefCell<TimerRegistry<TimerCallback>>>(&args);
    if let Some(id) = args.get(0).number_value(scope) {
        timers.borrow_mut().clear_interval(id as u32);
    }
}

/// Installs a placeholder `require` that always fails until
/// `interceptor::bind_require` rebinds it for the active cell's workspace
/// (a fresh closure per run, since the entry file/workspace can change
/// between cells in principle even though the notebook id doesn't).
fn install_require_placeholder(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    set_function_to(scope, global, "require", |scope, _args, _rv| {
        throw_exception(
            scope,
            &generic_error("require is not available outside of cell execution"),
        );
    });
}

/// `__nb_fetch(url, method, headerEntries, body)` performs a blocking
/// `ureq` request and resolves/rejects a Promise with the result, which
/// `bootstrap.js` wraps into a `Response`. There is no true async I/O in
/// this runtime, so `fetch` is a blocking call dressed up as a Promise.
fn install_fetch(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
    set_function_to(scope, global, "__nb_fetch", fetch_binding);
}

fn fetch_binding(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);

    let url = args.get(0).to_rust_string_lossy(scope);
    let method = args.get(1).to_rust_string_lossy(scope);
    let headers = parse_header_entries(scope, args.get(2));
    let body = args.get(3);
    let body_text = if body.is_null() || body.is_undefined() {
        None
    } else {
        Some(body.to_rust_string_lossy(scope))
    };

    match perform_fetch(&url, &method, &headers, body_text.as_deref()) {
        Ok(response) => {
            let value = response_to_value(scope, &response);
            resolver.resolve(scope, value);
        }
        Err(err) => {
            let message = v8::String::new(scope, &err.to_string()).unwrap();
            let error = v8::Exception::error(scope, message);
            resolver.reject(scope, error);
        }
    }

    rv.set(promise.into());
}

fn parse_header_entries(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Ok(array) = v8::Local::<v8::Array>::try_from(value) else {
        return out;
    };
    for i in 0..array.length() {
        let Some(entry) = array.get_index(scope, i) else {
            continue;
        };
        let Ok(pair) = v8::Local::<v8::Array>::try_from(entry) else {
            continue;
        };
        let Some(k) = pair.get_index(scope, 0) else {
            continue;
        };
        let Some(v) = pair.get_index(scope, 1) else {
            continue;
        };
        out.push((k.to_rust_string_lossy(scope), v.to_rust_string_lossy(scope)));
    }
    out
}

struct FetchResponse {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Denying server-binding APIs is the module interceptor's job; this
/// function only performs outbound client calls, which stay unrestricted
/// for notebook cells.
fn perform_fetch(url: &str, method: &str, headers: &[(String, String)], body: Option<&str>) -> Result<FetchResponse> {
    let mut request = match method.to_uppercase().as_str() {
        "GET" => ureq::get(url),
        "POST" => ureq::post(url),
        "PUT" => ureq::put(url),
        "DELETE" => ureq::delete(url),
        "PATCH" => ureq::patch(url),
        "HEAD" => ureq::head(url),
        other => ureq::request(other, url),
    };
    for (name, value) in headers {
        request = request.set(name, value);
    }

    let response = match body {
        Some(body) => request.send_string(body),
        None => request.call(),
    };

    match response {
        Ok(response) => {
            let status = response.status();
            let status_text = response.status_text().to_string();
            let headers = response
                .headers_names()
                .into_iter()
                .filter_map(|name| response.header(&name).map(|v| (name, v.to_string())))
                .collect();
            let body = response
                .into_string()
                .context("failed to read response body")?;
            Ok(FetchResponse {
                status,
                status_text,
                headers,
                body,
            })
        }
        Err(ureq::Error::Status(status, response)) => {
            let status_text = response.status_text().to_string();
            let headers = response
                .headers_names()
                .into_iter()
                .filter_map(|name| response.header(&name).map(|v| (name, v.to_string())))
                .collect();
            let body = response.into_string().unwrap_or_default();
            Ok(FetchResponse {
                status,
                status_text,
                headers,
                body,
            })
        }
        Err(err) => Err(generic_error(format!("fetch failed: {err}"))),
    }
}

/// Used by the module interceptor's `http`/`https` `request`/`get` stubs
/// (interceptor.rs) to perform the same blocking outbound call `fetch` uses,
/// collapsed to the `(status, body)` pair those thin client shims need.
pub fn perform_client_request(url: &str, method: &str, body: Option<&str>) -> Result<(u16, String)> {
    perform_fetch(url, method, &[], body).map(|response| (response.status, response.body))
}

fn response_to_value<'s>(scope: &mut v8::HandleScope<'s>, response: &FetchResponse) -> v8::Local<'s, v8::Value> {
    let obj = v8::Object::new(scope);
    set_property_to(scope, obj, "status", v8::Integer::new(scope, response.status as i32).into());
    set_property_to(scope, obj, "statusText", v8::String::new(scope, &response.status_text).unwrap().into());
    set_property_to(scope, obj, "body", v8::String::new(scope, &response.body).unwrap().into());

    let header_array = v8::Array::new(scope, response.headers.len() as i32);
    for (i, (name, value)) in response.headers.iter().enumerate() {
        let pair = v8::Array::new(scope, 2);
        let name_value = v8::String::new(scope, name).unwrap();
        let value_value = v8::String::new(scope, value).unwrap();
        pair.set_index(scope, 0, name_value.into());
        pair.set_index(scope, 1, value_value.into());
        header_array.set_index(scope, i as u32, pair.into());
    }
    set_property_to(scope, obj, "headers", header_array.into());

    obj.into()
}

/// Binds the per-cell output sink onto the global object so `console.*` and
/// `process.stdout/stderr` can reach it without a second parallel binding
/// pass (`execute.rs` calls this before running a cell and clears it after).
pub fn bind_sink(scope: &mut v8::HandleScope, sink: SharedSink<'static>) {
    let global = scope.get_current_context().global(scope);
    let ptr = Rc::into_raw(sink) as *mut std::ffi::c_void;
    let external = v8::External::new(scope, ptr);
    set_property_to(scope, global, "__nb_state", external.into());
}

/// Releases the binding installed by `bind_sink`, dropping the `Rc` it leaked.
pub fn unbind_sink(scope: &mut v8::HandleScope) {
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, "__nb_state").unwrap();
    let Some(value) = global.get(scope, key.into()) else {
        return;
    };
    if let Ok(external) = v8::Local::<v8::External>::try_from(value) {
        let ptr = external.value() as *const RefCell<crate::emitter::OutputSink<'static>>;
        unsafe {
            drop(Rc::from_raw(ptr));
        }
    }
    let undefined = v8::undefined(scope);
    global.set(scope, key.into(), undefined.into());
}
