//! Module Interceptor (C4): the intercepted `require`, rooted at the
//! workspace entry file, that virtualizes `@nodebooks/ui`, remaps `fs`/
//! `process`, denies `child_process` and server-binding APIs, and falls
//! back to a small Node-style CommonJS loader for everything else.

use crate::bindings::{
    data_ref, set_function_to, set_function_with_data_to, set_property_to, throw_exception,
};
use crate::errors::generic_error;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// On-disk CommonJS source for `node_modules/@nodebooks/ui/index.js`.
/// Reads `globalThis.__nodebooks_display`,
/// the same hook the live in-process `require("@nodebooks/ui")` installs,
/// so a cell that somehow reaches this file through host resolution
/// (rather than the interceptor's fast path) still streams correctly.
pub const UI_PACKAGE_JS: &str = r#"'use strict';

function display(value) {
  if (typeof globalThis.__nodebooks_display === 'function') {
    globalThis.__nodebooks_display(value);
  }
}

function tag(kind, opts) {
  const value = Object.assign({ ui: kind }, opts);
  Object.defineProperty(value, '__nb_ui_emitted', {
    value: true,
    enumerable: false,
  });
  display(value);
  return value;
}

module.exports = {
  UiImage: (opts) => tag('image', opts),
  UiMarkdown: (markdown) => tag('markdown', { markdown }),
  UiHTML: (html) => tag('html', { html }),
  UiJSON: (json) => tag('json', { json }),
  UiCode: (code, language) => tag('code', { code, language }),
  UiTable: (opts) => tag('table', opts),
  UiDataSummary: (opts) => tag('dataSummary', opts),
  UiAlert: (opts) => tag('alert', opts),
  UiBadge: (opts) => tag('badge', opts),
  UiMetric: (opts) => tag('metric', opts),
  UiProgress: (opts) => tag('progress', opts),
  UiSpinner: (opts) => tag('spinner', opts),
};
"#;

pub const UI_PACKAGE_DTS: &str = r#"export interface UiImageOptions {
  src: string;
  alt?: string;
  width?: number;
  height?: number;
}
export interface UiTableOptions {
  columns: string[];
  rows: unknown[][];
}
export function UiImage(opts: UiImageOptions): unknown;
export function UiMarkdown(markdown: string): unknown;
export function UiHTML(html: string): unknown;
export function UiJSON(json: unknown): unknown;
export function UiCode(code: string, language?: string): unknown;
export function UiTable(opts: UiTableOptions): unknown;
export function UiDataSummary(opts: Record<string, unknown>): unknown;
export function UiAlert(opts: Record<string, unknown>): unknown;
export function UiBadge(opts: Record<string, unknown>): unknown;
export function UiMetric(opts: Record<string, unknown>): unknown;
export function UiProgress(opts: Record<string, unknown>): unknown;
export function UiSpinner(opts: Record<string, unknown>): unknown;
"#;

/// Per-run display hook: installed by
/// `execute.rs` before running a cell, torn down afterwards. Bridges the
/// native `globalThis.__nodebooks_display` binding to whatever Rust closure
/// the execution loop wants to run for a streamed UI value.
#[derive(Default)]
pub struct DisplayHook {
    callback: RefCell<Option<Box<dyn FnMut(serde_json::Value)>>>,
}

impl DisplayHook {
    pub fn new() -> Rc<Self> {
        Rc::new(DisplayHook::default())
    }

    pub fn install(&self, callback: impl FnMut(serde_json::Value) + 'static) {
        *self.callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn clear(&self) {
        *self.callback.borrow_mut() = None;
    }

    fn emit(&self, value: serde_json::Value) {
        if let Some(callback) = self.callback.borrow_mut().as_mut() {
            callback(value);
        }
    }
}

/// Shared state across every `require` call within one notebook binding:
/// the module cache (keyed by resolved absolute path) and the display hook
/// `@nodebooks/ui` calls into.
struct Interceptor {
    workspace_dir: PathBuf,
    cache: RefCell<HashMap<PathBuf, v8::Global<v8::Value>>>,
    cache_object: v8::Global<v8::Object>,
    display_hook: Rc<DisplayHook>,
}

/// Per-module binding: which directory relative `require("./x")` calls
/// resolve against. The entry module's context has `dir == workspace_dir`.
struct RequireContext {
    interceptor: Rc<Interceptor>,
    dir: PathBuf,
}

/// Installs `require`/`module`/`exports`/`__filename`/`__dirname` rooted at
/// the workspace's entry file, and wires
/// `globalThis.__nodebooks_display` to `display_hook`.
pub fn install(scope: &mut v8::HandleScope, workspace: &Workspace, display_hook: Rc<DisplayHook>) {
    let global = scope.get_current_context().global(scope);

    let cache_object_local = v8::Object::new(scope);
    let cache_object = v8::Global::new(scope, cache_object_local);

    let interceptor = Rc::new(Interceptor {
        workspace_dir: workspace.dir.clone(),
        cache: RefCell::new(HashMap::new()),
        cache_object,
        display_hook: display_hook.clone(),
    });

    let entry_dir = workspace.dir.clone();
    let require_fn = build_require_function(scope, interceptor.clone(), entry_dir.clone());

    let module_obj = v8::Object::new(scope);
    let exports_obj = v8::Object::new(scope);
    set_property_to(scope, module_obj, "exports", exports_obj.into());
    set_property_to(scope, module_obj, "require", require_fn.into());
    let filename = v8::String::new(scope, &workspace.entry_path.to_string_lossy()).unwrap();
    set_property_to(scope, module_obj, "id", filename.into());

    set_property_to(scope, global, "require", require_fn.into());
    set_property_to(scope, global, "module", module_obj.into());
    set_property_to(scope, global, "exports", exports_obj.into());
    set_property_to(scope, global, "__filename", filename.into());
    let dirname = v8::String::new(scope, &entry_dir.to_string_lossy()).unwrap();
    set_property_to(scope, global, "__dirname", dirname.into());

    set_function_with_data_to(scope, global, "__nodebooks_display", display_hook_binding, display_hook);
}

fn display_hook_binding(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let hook = data_ref::<DisplayHook>(&args);
    let value = args.get(0);
    let json = v8::json::stringify(scope, value)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "null".to_string());
    if let Ok(parsed) = serde_json::from_str(&json) {
        hook.emit(parsed);
    }
}

fn build_require_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    interceptor: Rc<Interceptor>,
    dir: PathBuf,
) -> v8::Local<'s, v8::Function> {
    let ctx = Rc::new(RequireContext { interceptor: interceptor.clone(), dir: dir.clone() });
    let addr = Rc::into_raw(ctx) as *mut c_void;
    let external = v8::External::new(scope, addr);
    let template = v8::FunctionTemplate::builder_raw(require_callback)
        .data(external.into())
        .build(scope);
    let function = template.get_function(scope).unwrap();
    let function_obj = v8::Local::<v8::Object>::try_from(function).unwrap();

    let resolve_ctx = Rc::new(RequireContext { interceptor: interceptor.clone(), dir: dir.clone() });
    let resolve_addr = Rc::into_raw(resolve_ctx) as *mut c_void;
    let resolve_external = v8::External::new(scope, resolve_addr);
    let resolve_template = v8::FunctionTemplate::builder_raw(require_resolve_callback)
        .data(resolve_external.into())
        .build(scope);
    let resolve_fn = resolve_template.get_function(scope).unwrap();
    set_property_to(scope, function_obj, "resolve", resolve_fn.into());

    let cache_local = v8::Local::new(scope, interceptor.cache_object.clone());
    set_property_to(scope, function_obj, "cache", cache_local.into());

    let main = v8::Object::new(scope);
    let main_filename = v8::String::new(scope, &interceptor.workspace_dir.join("__runtime__.cjs").to_string_lossy()).unwrap();
    set_property_to(scope, main, "filename", main_filename.into());
    set_property_to(scope, function_obj, "main", main.into());

    let extensions = v8::Object::new(scope);
    set_function_to(scope, extensions, ".js", |_scope, _args, _rv| {});
    set_function_to(scope, extensions, ".json", |_scope, _args, _rv| {});
    set_property_to(scope, function_obj, "extensions", extensions.into());

    function
}

fn require_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let ctx = data_ref::<RequireContext>(&args);
    let specifier = args.get(0).to_rust_string_lossy(scope);

    match resolve_value(scope, &ctx, &specifier) {
        Ok(value) => rv.set(value),
        Err(err) => throw_exception(scope, &err),
    }
}

fn require_resolve_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let ctx = data_ref::<RequireContext>(&args);
    let specifier = args.get(0).to_rust_string_lossy(scope);
    match resolve_specifier(&ctx.dir, &specifier, &ctx.interceptor.workspace_dir) {
        Ok(path) => rv.set(v8::String::new(scope, &path.to_string_lossy()).unwrap().into()),
        Err(err) => throw_exception(scope, &err),
    }
}

fn resolve_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    ctx: &RequireContext,
    specifier: &str,
) -> Result<v8::Local<'s, v8::Value>> {
    if let Some(result) = resolve_builtin(scope, ctx, specifier) {
        return result;
    }
    load_module(scope, ctx, specifier)
}

/// Handles every specifier with curated or denied behavior (`@nodebooks/ui`,
/// `fs`, `process`, server-binding built-ins, ...). Returns `None` to
/// signal "fall through to the generic loader".
fn resolve_builtin<'s>(
    scope: &mut v8::HandleScope<'s>,
    ctx: &RequireContext,
    specifier: &str,
) -> Option<Result<v8::Local<'s, v8::Value>>> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);

    match bare {
        "@nodebooks/ui" => Some(load_ui_module(scope, ctx)),
        "fs" | "fs/promises" => Some(Ok(global_lookup(scope, "__nb_fs"))),
        "process" => Some(Ok(global_lookup(scope, "process"))),
        "child_process" => Some(Err(generic_error(
            "Access to child_process is disabled in NodeBooks runtime",
        ))),
        "http" => Some(Ok(build_http_module(scope, "http", false))),
        "https" => Some(Ok(build_http_module(scope, "https", false))),
        "http2" => Some(Ok(build_http_module(scope, "http2", true))),
        "net" => Some(Ok(build_server_denying_module(scope, "net", &["createServer"]))),
        "tls" => Some(Ok(build_server_denying_module(scope, "tls", &["createServer"]))),
        "dgram" => Some(Ok(build_dgram_module(scope))),
        _ => None,
    }
}

fn global_lookup<'s>(scope: &mut v8::HandleScope<'s>, name: &str) -> v8::Local<'s, v8::Value> {
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, name).unwrap();
    global.get(scope, key.into()).unwrap_or_else(|| v8::undefined(scope).into())
}

fn load_ui_module<'s>(scope: &mut v8::HandleScope<'s>, ctx: &RequireContext) -> Result<v8::Local<'s, v8::Value>> {
    let key = ctx.interceptor.workspace_dir.join("__nb_ui_module__");
    if let Some(cached) = ctx.interceptor.cache.borrow().get(&key) {
        return Ok(v8::Local::new(scope, cached.clone()));
    }
    let module_dir = ctx.interceptor.workspace_dir.clone();
    let value = run_commonjs_source(scope, UI_PACKAGE_JS, Path::new("@nodebooks/ui/index.js"), ctx, &module_dir)?;
    ctx.interceptor.cache.borrow_mut().insert(key, v8::Global::new(scope, value));
    Ok(value)
}

fn build_server_denying_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    module_name: &'static str,
    deny_keys: &[&'static str],
) -> v8::Local<'s, v8::Object> {
    let module = v8::Object::new(scope);
    for key in deny_keys {
        let data = Rc::new((module_name, *key));
        set_function_with_data_to(scope, module, *key, deny_server_callback, data);
    }
    module
}

fn deny_server_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let info = data_ref::<(&str, &str)>(&args);
    throw_exception(
        scope,
        &generic_error(format!("{} server creation is not allowed in NodeBooks runtime", info.0)),
    );
}

fn build_http_module<'s>(scope: &mut v8::HandleScope<'s>, module_name: &'static str, is_http2: bool) -> v8::Local<'s, v8::Object> {
    let module = v8::Object::new(scope);
    let create_server = Rc::new((module_name, "createServer"));
    set_function_with_data_to(scope, module, "createServer", deny_server_callback, create_server);
    if is_http2 {
        let create_secure = Rc::new((module_name, "createSecureServer"));
        set_function_with_data_to(scope, module, "createSecureServer", deny_server_callback, create_secure);
    }
    set_function_to(scope, module, "request", http_request);
    set_function_to(scope, module, "get", http_get);
    module
}

/// A minimal `http.request`: performs the request synchronously once the
/// caller calls `.end()`, then fires `response` with a one-shot
/// `IncomingMessage`-shaped object. There is no real async I/O in this
/// runtime; the client surface is intentionally thin, kept just wide enough
/// that outbound clients stay unrestricted without being a full Node `http`
/// client.
fn http_request(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let req = build_client_request_object(scope, &args);
    rv.set(req.into());
}

fn build_client_request_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments,
) -> v8::Local<'s, v8::Object> {
    let req = v8::Object::new(scope);
    let options = args.get(0);
    let callback = v8::Local::<v8::Function>::try_from(args.get(1)).ok();

    set_property_to(scope, req, "__options", options);
    let body_holder = v8::Array::new(scope, 0);
    set_property_to(scope, req, "__chunks", body_holder.into());
    if let Some(cb) = callback {
        set_property_to(scope, req, "__callback", cb.into());
    }

    set_function_to(scope, req, "write", |scope, args, mut rv| {
        let this = args.this();
        let key = v8::String::new(scope, "__chunks").unwrap();
        if let Some(chunks) = this.get(scope, key.into()).and_then(|v| v8::Local::<v8::Array>::try_from(v).ok()) {
            let len = chunks.length();
            chunks.set_index(scope, len, args.get(0));
        }
        rv.set(v8::Boolean::new(scope, true).into());
    });
    set_function_to(scope, req, "on", |_scope, args, mut rv| {
        rv.set(args.this().into());
    });
    set_function_to(scope, req, "end", http_request_end);

    req
}

fn http_request_end(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let this = args.this();
    if args.length() > 0 && args.get(0).is_string() {
        let key = v8::String::new(scope, "__chunks").unwrap();
        if let Some(chunks) = this.get(scope, key.into()).and_then(|v| v8::Local::<v8::Array>::try_from(v).ok()) {
            let len = chunks.length();
            chunks.set_index(scope, len, args.get(0));
        }
    }

    let options_key = v8::String::new(scope, "__options").unwrap();
    let options = this.get(scope, options_key.into()).unwrap_or_else(|| v8::undefined(scope).into());
    let url = options_to_url(scope, options);
    let method = options_to_method(scope, options);

    let chunks_key = v8::String::new(scope, "__chunks").unwrap();
    let body = this
        .get(scope, chunks_key.into())
        .and_then(|v| v8::Local::<v8::Array>::try_from(v).ok())
        .map(|chunks| join_chunks(scope, chunks));

    let callback_key = v8::String::new(scope, "__callback").unwrap();
    let callback = this.get(scope, callback_key.into()).and_then(|v| v8::Local::<v8::Function>::try_from(v).ok());

    let response = crate::sandbox::perform_client_request(&url, &method, body.as_deref());
    if let Some(callback) = callback {
        let incoming = build_incoming_message(scope, response);
        let undefined = v8::undefined(scope);
        callback.call(scope, undefined.into(), &[incoming]);
    }
}

fn join_chunks(scope: &mut v8::HandleScope, chunks: v8::Local<v8::Array>) -> String {
    let mut out = String::new();
    for i in 0..chunks.length() {
        if let Some(chunk) = chunks.get_index(scope, i) {
            out.push_str(&chunk.to_rust_string_lossy(scope));
        }
    }
    out
}

fn options_to_url(scope: &mut v8::HandleScope, options: v8::Local<v8::Value>) -> String {
    if options.is_string() {
        return options.to_rust_string_lossy(scope);
    }
    let Some(obj) = options.to_object(scope) else {
        return String::new();
    };
    let get = |scope: &mut v8::HandleScope, name: &str| -> Option<String> {
        let key = v8::String::new(scope, name).unwrap();
        obj.get(scope, key.into()).filter(|v| !v.is_undefined()).map(|v| v.to_rust_string_lossy(scope))
    };
    let protocol = get(scope, "protocol").unwrap_or_else(|| "http:".to_string());
    let host = get(scope, "host").or_else(|| get(scope, "hostname")).unwrap_or_else(|| "localhost".to_string());
    let port = get(scope, "port").map(|p| format!(":{p}")).unwrap_or_default();
    let path = get(scope, "path").unwrap_or_else(|| "/".to_string());
    format!("{protocol}//{host}{port}{path}")
}

fn options_to_method(scope: &mut v8::HandleScope, options: v8::Local<v8::Value>) -> String {
    let Some(obj) = options.to_object(scope) else {
        return "GET".to_string();
    };
    let key = v8::String::new(scope, "method").unwrap();
    obj.get(scope, key.into())
        .filter(|v| !v.is_undefined())
        .map(|v| v.to_rust_string_lossy(scope).to_uppercase())
        .unwrap_or_else(|| "GET".to_string())
}

fn build_incoming_message<'s>(scope: &mut v8::HandleScope<'s>, response: Result<(u16, String)>) -> v8::Local<'s, v8::Value> {
    let message = v8::Object::new(scope);
    match response {
        Ok((status, body)) => {
            set_property_to(scope, message, "statusCode", v8::Integer::new(scope, status as i32).into());
            set_function_with_data_to(scope, message, "on", incoming_message_on, Rc::new(body));
        }
        Err(err) => {
            set_property_to(scope, message, "statusCode", v8::Integer::new(scope, 0).into());
            set_function_with_data_to(scope, message, "on", incoming_message_on, Rc::new(err.to_string()));
        }
    }
    set_function_to(scope, message, "setEncoding", |_scope, _args, _rv| {});
    message.into()
}

fn incoming_message_on(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let body = data_ref::<String>(&args);
    let event = args.get(0).to_rust_string_lossy(scope);
    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(1)) else {
        return;
    };
    let undefined = v8::undefined(scope);
    if event == "data" {
        let chunk = v8::String::new(scope, &body).unwrap();
        callback.call(scope, undefined.into(), &[chunk.into()]);
    } else if event == "end" {
        callback.call(scope, undefined.into(), &[]);
    }
}

fn http_get(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let req = build_client_request_object(scope, &args);
    let end_key = v8::String::new(scope, "end").unwrap();
    if let Some(end_fn) = req.get(scope, end_key.into()).and_then(|v| v8::Local::<v8::Function>::try_from(v).ok()) {
        end_fn.call(scope, req.into(), &[]);
    }
    rv.set(req.into());
}

fn build_dgram_module<'s>(scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Object> {
    let module = v8::Object::new(scope);
    set_function_to(scope, module, "createSocket", dgram_create_socket);
    module
}

fn dgram_create_socket(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let socket = v8::Object::new(scope);
    for method in ["bind", "addMembership", "setMulticastTTL", "addSourceSpecificMembership"] {
        let data = Rc::new(("dgram socket", method));
        set_function_with_data_to(scope, socket, method, dgram_deny_callback, data);
    }
    set_function_to(scope, socket, "send", |_scope, _args, _rv| {});
    set_function_to(scope, socket, "close", |_scope, _args, _rv| {});
    rv.set(socket.into());
}

fn dgram_deny_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let info = data_ref::<(&str, &str)>(&args);
    throw_exception(
        scope,
        &generic_error(format!("{}.{} is not allowed in NodeBooks runtime", info.0, info.1)),
    );
}

fn load_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    ctx: &RequireContext,
    specifier: &str,
) -> Result<v8::Local<'s, v8::Value>> {
    let resolved = resolve_specifier(&ctx.dir, specifier, &ctx.interceptor.workspace_dir)?;

    if let Some(cached) = ctx.interceptor.cache.borrow().get(&resolved) {
        return Ok(v8::Local::new(scope, cached.clone()));
    }

    let source = fs::read_to_string(&resolved)
        .with_context(|| format!("Failed to read module {:?}", resolved))?;

    let value = if resolved.extension().and_then(|e| e.to_str()) == Some("json") {
        let text = v8::String::new(scope, &source).unwrap();
        v8::json::parse(scope, text).ok_or_else(|| generic_error(format!("Invalid JSON in {:?}", resolved)))?
    } else {
        let module_dir = resolved.parent().unwrap_or(&ctx.interceptor.workspace_dir).to_path_buf();
        run_commonjs_source(scope, &source, &resolved, ctx, &module_dir)?
    };

    ctx.interceptor.cache.borrow_mut().insert(resolved.clone(), v8::Global::new(scope, value));

    let cache_entry = v8::Object::new(scope);
    set_property_to(scope, cache_entry, "id", v8::String::new(scope, &resolved.to_string_lossy()).unwrap().into());
    set_property_to(scope, cache_entry, "exports", value);
    set_property_to(scope, cache_entry, "loaded", v8::Boolean::new(scope, true).into());
    let cache_object = v8::Local::new(scope, ctx.interceptor.cache_object.clone());
    let key = v8::String::new(scope, &resolved.to_string_lossy()).unwrap();
    cache_object.set(scope, key.into(), cache_entry.into());

    Ok(value)
}

/// Wraps `source` as `(function(module, exports, require, __filename, __dirname) { ... })`
/// and runs it, returning `module.exports`.
fn run_commonjs_source<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
    resolved: &Path,
    ctx: &RequireContext,
    module_dir: &Path,
) -> Result<v8::Local<'s, v8::Value>> {
    let wrapped = format!(
        "(function(module, exports, require, __filename, __dirname) {{\n{source}\n}})"
    );
    let code = v8::String::new(scope, &wrapped).unwrap();
    let resource_name = v8::String::new(scope, &resolved.to_string_lossy()).unwrap();
    let source_map = v8::undefined(scope);
    let origin = v8::ScriptOrigin::new(
        scope,
        resource_name.into(),
        0,
        0,
        false,
        0,
        source_map.into(),
        false,
        false,
        false,
    );

    let try_catch = &mut v8::TryCatch::new(scope);
    let Some(script) = v8::Script::compile(try_catch, code, Some(&origin)) else {
        let exception = try_catch.exception().unwrap();
        let js_error = crate::errors::JsError::from_v8_exception(try_catch, exception, None);
        anyhow::bail!(generic_error(js_error.message));
    };
    let Some(wrapper_fn) = script.run(try_catch) else {
        let exception = try_catch.exception().unwrap();
        let js_error = crate::errors::JsError::from_v8_exception(try_catch, exception, None);
        anyhow::bail!(generic_error(js_error.message));
    };
    let scope = try_catch;
    let wrapper_fn = v8::Local::<v8::Function>::try_from(wrapper_fn)
        .map_err(|_| generic_error("module wrapper did not evaluate to a function"))?;

    let module_obj = v8::Object::new(scope);
    let exports_obj = v8::Object::new(scope);
    set_property_to(scope, module_obj, "exports", exports_obj.into());

    let sub_require = build_require_function(scope, ctx.interceptor.clone(), module_dir.to_path_buf());
    let filename = v8::String::new(scope, &resolved.to_string_lossy()).unwrap();
    let dirname = v8::String::new(scope, &module_dir.to_string_lossy()).unwrap();

    let undefined = v8::undefined(scope);
    let call_result = wrapper_fn.call(
        scope,
        undefined.into(),
        &[module_obj.into(), exports_obj.into(), sub_require.into(), filename.into(), dirname.into()],
    );
    if call_result.is_none() {
        if let Some(exception) = scope.exception() {
            let js_error = crate::errors::JsError::from_v8_exception(scope, exception, None);
            anyhow::bail!(generic_error(js_error.message));
        }
        anyhow::bail!(generic_error("module evaluation failed"));
    }

    let exports_key = v8::String::new(scope, "exports").unwrap();
    Ok(module_obj.get(scope, exports_key.into()).unwrap_or_else(|| exports_obj.into()))
}

/// Simplified Node-style resolution: relative/absolute paths resolve
/// directly; bare specifiers search `node_modules` starting at `from_dir`
/// and walking up to (and including) the workspace root, never escaping it.
fn resolve_specifier(from_dir: &Path, specifier: &str, workspace_dir: &Path) -> Result<PathBuf> {
    if specifier.starts_with('.') {
        let base = confine_to_workspace(from_dir.join(specifier), specifier, workspace_dir)?;
        return resolve_file_or_dir(&base)
            .ok_or_else(|| generic_error(format!("Cannot find module '{specifier}'")));
    }
    if Path::new(specifier).is_absolute() {
        let cleaned = confine_to_workspace(PathBuf::from(specifier), specifier, workspace_dir)?;
        return resolve_file_or_dir(&cleaned)
            .ok_or_else(|| generic_error(format!("Cannot find module '{specifier}'")));
    }

    let mut dir = from_dir.to_path_buf();
    loop {
        let candidate = dir.join("node_modules").join(specifier);
        if let Some(resolved) = resolve_file_or_dir(&candidate) {
            return Ok(resolved);
        }
        if dir == workspace_dir {
            break;
        }
        match dir.parent() {
            Some(parent) if parent.starts_with(workspace_dir) => dir = parent.to_path_buf(),
            _ => break,
        }
    }

    Err(generic_error(format!("Cannot find module '{specifier}'")))
}

/// Cleans `candidate` and rejects it unless it stays inside `workspace_dir`,
/// the same confinement `fsproxy::resolve_path` enforces for `fs` calls —
/// a relative `require('../../etc/passwd')` or an absolute `require('/etc/passwd')`
/// must not escape the sandbox either.
fn confine_to_workspace(candidate: PathBuf, specifier: &str, workspace_dir: &Path) -> Result<PathBuf> {
    let cleaned = path_clean::clean(candidate);
    if !cleaned.starts_with(workspace_dir) {
        return Err(generic_error(format!(
            "Access to path \"{specifier}\" is not allowed in this notebook runtime"
        )));
    }
    Ok(cleaned)
}

fn resolve_file_or_dir(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    for ext in [".js", ".cjs", ".json"] {
        let candidate = append_extension(path, ext);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if path.is_dir() {
        let package_json = path.join("package.json");
        if let Ok(contents) = fs::read_to_string(&package_json) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) {
                if let Some(main) = value.get("main").and_then(|m| m.as_str()) {
                    if let Some(resolved) = resolve_file_or_dir(&path.join(main)) {
                        return Some(resolved);
                    }
                }
            }
        }
        let index = path.join("index.js");
        if index.is_file() {
            return Some(index);
        }
    }
    None
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(ext);
    path.with_file_name(name)
}
