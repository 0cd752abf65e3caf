//! Filesystem proxy (part of Sandbox Host, spec §4.3). Wraps the host `fs`
//! module so every path-accepting method is confined to the notebook's
//! workspace directory; every other method is a thin pass-through.
//!
//! Node's real `fs` module is both synchronous and callback/Promise based.
//! Since this runtime has no background I/O reactor (SPEC_FULL.md §10),
//! the async forms perform the same blocking syscall as their `*Sync`
//! counterpart and only differ in how the result reaches the caller: a
//! Node-style `(err, data)` callback invoked before the binding returns, or
//! a `Promise` resolved/rejected immediately under `fs.promises`.

use crate::bindings::{
    create_object_under, set_function_to, set_function_with_data_to, set_property_to,
    throw_exception,
};
use crate::errors::{generic_error, IoError};
use anyhow::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

pub struct FsProxyState {
    pub workspace_dir: PathBuf,
}

/// Resolves a v8 path-like argument (`string`, `URL`, or `Buffer`) against
/// the workspace directory and rejects anything that escapes it.
fn resolve_path(
    scope: &mut v8::HandleScope,
    state: &FsProxyState,
    value: v8::Local<v8::Value>,
) -> Result<PathBuf> {
    let raw = value_to_path_string(scope, value)?;
    let candidate = Path::new(&raw);
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        state.workspace_dir.join(candidate)
    };
    let cleaned = path_clean::clean(&absolute);

    if !cleaned.starts_with(&state.workspace_dir) {
        anyhow::bail!(generic_error(format!(
            "Access to path \"{raw}\" is not allowed in this notebook runtime"
        )));
    }
    Ok(cleaned)
}

fn value_to_path_string(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Result<String> {
    if value.is_string() {
        return Ok(value.to_rust_string_lossy(scope));
    }
    if value.is_uint8_array() {
        let view = v8::Local::<v8::Uint8Array>::try_from(value)
            .map_err(|_| generic_error("path argument must be a string, Buffer, or URL"))?;
        let mut buf = vec![0u8; view.byte_length()];
        view.copy_contents(&mut buf);
        return Ok(String::from_utf8_lossy(&buf).into_owned());
    }
    if let Some(obj) = value.to_object(scope) {
        let key = v8::String::new(scope, "href").unwrap();
        if let Some(href) = obj.get(scope, key.into()) {
            if href.is_string() {
                let href = href.to_rust_string_lossy(scope);
                if let Ok(url) = url::Url::parse(&href) {
                    if let Ok(path) = url.to_file_path() {
                        return Ok(path.to_string_lossy().into_owned());
                    }
                }
            }
        }
    }
    anyhow::bail!(generic_error("path argument must be a string, Buffer, or URL"))
}

/// Builds the `fs` module object (and its `.promises` sub-object) exposed
/// to `require("fs")`/`require("fs/promises")` inside the sandbox.
pub fn build(scope: &mut v8::HandleScope, workspace_dir: PathBuf) -> v8::Local<'_, v8::Object> {
    let state = Rc::new(FsProxyState { workspace_dir });
    let target = v8::Object::new(scope);

    macro_rules! bind {
        ($name:literal, $func:expr) => {
            set_function_with_data_to(scope, target, $name, $func, state.clone());
        };
    }

    bind!("readFileSync", read_file_sync);
    bind!("readFile", read_file_async);
    bind!("writeFileSync", write_file_sync);
    bind!("writeFile", write_file_async);
    bind!("appendFileSync", append_file_sync);
    bind!("appendFile", append_file_async);
    bind!("existsSync", exists_sync);
    bind!("mkdirSync", mkdir_sync);
    bind!("mkdir", mkdir_async);
    bind!("rmSync", rm_sync);
    bind!("rm", rm_async);
    bind!("rmdirSync", rm_sync);
    bind!("rmdir", rm_async);
    bind!("unlinkSync", unlink_sync);
    bind!("unlink", unlink_async);
    bind!("statSync", stat_sync);
    bind!("stat", stat_async);
    bind!("lstatSync", stat_sync);
    bind!("lstat", stat_async);
    bind!("accessSync", access_sync);
    bind!("access", access_async);
    bind!("readdirSync", readdir_sync);
    bind!("readdir", readdir_async);
    bind!("copyFileSync", copy_file_sync);
    bind!("copyFile", copy_file_async);
    bind!("cpSync", copy_file_sync);
    bind!("cp", copy_file_async);
    bind!("renameSync", rename_sync);
    bind!("rename", rename_async);
    bind!("realpathSync", realpath_sync);
    bind!("realpath", realpath_async);
    bind!("readlinkSync", readlink_sync);
    bind!("readlink", readlink_async);
    bind!("symlinkSync", symlink_sync);
    bind!("symlink", symlink_async);
    bind!("linkSync", link_sync);
    bind!("link", link_async);
    bind!("watch", watch_unsupported);
    bind!("createReadStream", create_read_stream);
    bind!("createWriteStream", create_write_stream);

    let promises = create_object_under(scope, target, "promises");
    set_function_with_data_to(scope, promises, "readFile", promises_read_file, state.clone());
    set_function_with_data_to(scope, promises, "writeFile", promises_write_file, state.clone());
    set_function_with_data_to(scope, promises, "mkdir", promises_mkdir, state.clone());
    set_function_with_data_to(scope, promises, "rm", promises_rm, state.clone());
    set_function_with_data_to(scope, promises, "stat", promises_stat, state.clone());
    set_function_with_data_to(scope, promises, "readdir", promises_readdir, state.clone());
    set_function_with_data_to(scope, promises, "access", promises_access, state.clone());

    target
}

fn throw_io(scope: &mut v8::HandleScope, err: anyhow::Error) {
    throw_exception(scope, &err);
}

fn io_err(path: &Path, err: io::Error) -> anyhow::Error {
    anyhow::Error::new(IoError(err)).context(format!("{}", path.display()))
}

fn read_file_sync(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    let encoding = args.get(1);

    match fs::read(&path) {
        Ok(bytes) => rv.set(bytes_to_value(scope, &bytes, encoding)),
        Err(e) => throw_io(scope, io_err(&path, e)),
    }
}

fn bytes_to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    bytes: &[u8],
    encoding: v8::Local<v8::Value>,
) -> v8::Local<'s, v8::Value> {
    let has_encoding = encoding.is_string()
        || (encoding.is_object()
            && !encoding.is_undefined()
            && !encoding.is_null());
    if has_encoding {
        let text = String::from_utf8_lossy(bytes);
        return v8::String::new(scope, &text).unwrap().into();
    }
    v8::Uint8Array::new(
        v8::ArrayBuffer::new_backing_store_from_vec(bytes.to_vec())
            .make_shared()
            .into(),
        0,
        bytes.len(),
    )
    .map(|arr| arr.into())
    .unwrap_or_else(|| v8::undefined(scope).into())
}

fn read_file_async(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let encoding = args.get(1);
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(bytes_to_value(scope, &bytes, encoding))
    });
}

/// Shared shape for the `(path, ..., callback)` async methods: runs the
/// synchronous equivalent immediately and invokes the trailing callback
/// with `(err, result)` before returning (no real async I/O, see module
/// doc comment).
fn invoke_node_callback<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
    op: impl FnOnce(
        &mut v8::HandleScope<'s>,
        &FsProxyState,
        &v8::FunctionCallbackArguments<'s>,
    ) -> Result<v8::Local<'s, v8::Value>>,
) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let callback_arg = args.get(args.length() - 1);
    let callback = v8::Local::<v8::Function>::try_from(callback_arg).ok();

    let result = op(scope, &state, &args);
    let undefined = v8::undefined(scope);

    match (callback, result) {
        (Some(cb), Ok(value)) => {
            cb.call(scope, undefined.into(), &[undefined.into(), value]);
        }
        (Some(cb), Err(err)) => {
            let message = v8::String::new(scope, &err.to_string()).unwrap();
            let error = v8::Exception::error(scope, message);
            cb.call(scope, undefined.into(), &[error, undefined.into()]);
        }
        (None, Ok(_)) => {}
        (None, Err(err)) => throw_io(scope, err),
    }
}

fn write_file_sync(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    let data = value_to_bytes(scope, args.get(1));
    if let Err(e) = fs::write(&path, data) {
        throw_io(scope, io_err(&path, e));
    }
}

fn write_file_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let data = value_to_bytes(scope, args.get(1));
        fs::write(&path, data).map_err(|e| io_err(&path, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn append_file_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    use std::io::Write;
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    let data = value_to_bytes(scope, args.get(1));
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(&data));
    if let Err(e) = result {
        throw_io(scope, io_err(&path, e));
    }
}

fn append_file_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        use std::io::Write;
        let path = resolve_path(scope, state, args.get(0))?;
        let data = value_to_bytes(scope, args.get(1));
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(&data))
            .map_err(|e| io_err(&path, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn value_to_bytes(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Vec<u8> {
    if value.is_uint8_array() {
        if let Ok(view) = v8::Local::<v8::Uint8Array>::try_from(value) {
            let mut buf = vec![0u8; view.byte_length()];
            view.copy_contents(&mut buf);
            return buf;
        }
    }
    value.to_rust_string_lossy(scope).into_bytes()
}

fn exists_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let exists = resolve_path(scope, &state, args.get(0))
        .map(|p| p.exists())
        .unwrap_or(false);
    rv.set(v8::Boolean::new(scope, exists).into());
}

fn mkdir_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    let recursive = option_bool(scope, args.get(1), "recursive");
    let result = if recursive { fs::create_dir_all(&path) } else { fs::create_dir(&path) };
    if let Err(e) = result {
        throw_io(scope, io_err(&path, e));
    }
}

fn mkdir_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let recursive = option_bool(scope, args.get(1), "recursive");
        let result = if recursive { fs::create_dir_all(&path) } else { fs::create_dir(&path) };
        result.map_err(|e| io_err(&path, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn option_bool(scope: &mut v8::HandleScope, options: v8::Local<v8::Value>, key: &str) -> bool {
    let Some(obj) = options.to_object(scope) else {
        return false;
    };
    let key = v8::String::new(scope, key).unwrap();
    obj.get(scope, key.into())
        .map(|v| v.boolean_value(scope))
        .unwrap_or(false)
}

fn rm_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    let recursive = option_bool(scope, args.get(1), "recursive");
    let result = if path.is_dir() {
        if recursive { fs::remove_dir_all(&path) } else { fs::remove_dir(&path) }
    } else {
        fs::remove_file(&path)
    };
    if let Err(e) = result {
        throw_io(scope, io_err(&path, e));
    }
}

fn rm_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let recursive = option_bool(scope, args.get(1), "recursive");
        let result = if path.is_dir() {
            if recursive { fs::remove_dir_all(&path) } else { fs::remove_dir(&path) }
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| io_err(&path, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn unlink_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    if let Err(e) = fs::remove_file(&path) {
        throw_io(scope, io_err(&path, e));
    }
}

fn unlink_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn stat_object<'s>(scope: &mut v8::HandleScope<'s>, metadata: &fs::Metadata) -> v8::Local<'s, v8::Object> {
    let obj = v8::Object::new(scope);
    set_property_to(scope, obj, "size", v8::Number::new(scope, metadata.len() as f64).into());
    let is_dir = v8::Boolean::new(scope, metadata.is_dir());
    let is_file = v8::Boolean::new(scope, metadata.is_file());
    let is_symlink = v8::Boolean::new(scope, metadata.is_symlink());
    set_property_to(scope, obj, "isDirectoryValue", is_dir.into());
    set_property_to(scope, obj, "isFileValue", is_file.into());
    set_property_to(scope, obj, "isSymbolicLinkValue", is_symlink.into());
    set_function_to(scope, obj, "isDirectory", |scope, args, mut rv| {
        let this = args.this();
        let key = v8::String::new(scope, "isDirectoryValue").unwrap();
        rv.set(this.get(scope, key.into()).unwrap_or_else(|| v8::Boolean::new(scope, false).into()));
    });
    set_function_to(scope, obj, "isFile", |scope, args, mut rv| {
        let this = args.this();
        let key = v8::String::new(scope, "isFileValue").unwrap();
        rv.set(this.get(scope, key.into()).unwrap_or_else(|| v8::Boolean::new(scope, false).into()));
    });
    set_function_to(scope, obj, "isSymbolicLink", |scope, args, mut rv| {
        let this = args.this();
        let key = v8::String::new(scope, "isSymbolicLinkValue").unwrap();
        rv.set(this.get(scope, key.into()).unwrap_or_else(|| v8::Boolean::new(scope, false).into()));
    });
    if let Ok(modified) = metadata.modified() {
        if let Ok(since_epoch) = modified.duration_since(UNIX_EPOCH) {
            let ms = since_epoch.as_millis() as f64;
            set_property_to(scope, obj, "mtimeMs", v8::Number::new(scope, ms).into());
        }
    }
    obj
}

fn stat_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    match fs::metadata(&path) {
        Ok(meta) => rv.set(stat_object(scope, &meta).into()),
        Err(e) => throw_io(scope, io_err(&path, e)),
    }
}

fn stat_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let meta = fs::metadata(&path).map_err(|e| io_err(&path, e))?;
        Ok(stat_object(scope, &meta).into())
    });
}

fn access_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    if !path.exists() {
        throw_io(scope, io_err(&path, io::Error::new(io::ErrorKind::NotFound, "no such file or directory")));
    }
}

fn access_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        if !path.exists() {
            anyhow::bail!(io_err(&path, io::Error::new(io::ErrorKind::NotFound, "no such file or directory")));
        }
        Ok(v8::undefined(scope).into())
    });
}

fn readdir_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    match read_dir_names(&path) {
        Ok(names) => {
            let array = v8::Array::new(scope, names.len() as i32);
            for (i, name) in names.iter().enumerate() {
                let value = v8::String::new(scope, name).unwrap();
                array.set_index(scope, i as u32, value.into());
            }
            rv.set(array.into());
        }
        Err(e) => throw_io(scope, io_err(&path, e)),
    }
}

fn read_dir_names(path: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn readdir_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let names = read_dir_names(&path).map_err(|e| io_err(&path, e))?;
        let array = v8::Array::new(scope, names.len() as i32);
        for (i, name) in names.iter().enumerate() {
            let value = v8::String::new(scope, name).unwrap();
            array.set_index(scope, i as u32, value.into());
        }
        Ok(array.into())
    });
}

fn copy_file_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let (from, to) = match (
        resolve_path(scope, &state, args.get(0)),
        resolve_path(scope, &state, args.get(1)),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return throw_io(scope, e),
    };
    if let Err(e) = fs::copy(&from, &to) {
        throw_io(scope, io_err(&from, e));
    }
}

fn copy_file_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let from = resolve_path(scope, state, args.get(0))?;
        let to = resolve_path(scope, state, args.get(1))?;
        fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn rename_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let (from, to) = match (
        resolve_path(scope, &state, args.get(0)),
        resolve_path(scope, &state, args.get(1)),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return throw_io(scope, e),
    };
    if let Err(e) = fs::rename(&from, &to) {
        throw_io(scope, io_err(&from, e));
    }
}

fn rename_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let from = resolve_path(scope, state, args.get(0))?;
        let to = resolve_path(scope, state, args.get(1))?;
        fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn realpath_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    match fs::canonicalize(&path) {
        Ok(real) => rv.set(v8::String::new(scope, &real.to_string_lossy()).unwrap().into()),
        Err(e) => throw_io(scope, io_err(&path, e)),
    }
}

fn realpath_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let real = fs::canonicalize(&path).map_err(|e| io_err(&path, e))?;
        Ok(v8::String::new(scope, &real.to_string_lossy()).unwrap().into())
    });
}

fn readlink_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };
    match fs::read_link(&path) {
        Ok(target) => rv.set(v8::String::new(scope, &target.to_string_lossy()).unwrap().into()),
        Err(e) => throw_io(scope, io_err(&path, e)),
    }
}

fn readlink_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let path = resolve_path(scope, state, args.get(0))?;
        let target = fs::read_link(&path).map_err(|e| io_err(&path, e))?;
        Ok(v8::String::new(scope, &target.to_string_lossy()).unwrap().into())
    });
}

#[cfg(unix)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    if original.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}

fn symlink_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let (target, link) = match (
        resolve_path(scope, &state, args.get(0)),
        resolve_path(scope, &state, args.get(1)),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return throw_io(scope, e),
    };
    if let Err(e) = make_symlink(&target, &link) {
        throw_io(scope, io_err(&link, e));
    }
}

fn symlink_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let target = resolve_path(scope, state, args.get(0))?;
        let link = resolve_path(scope, state, args.get(1))?;
        make_symlink(&target, &link).map_err(|e| io_err(&link, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn link_sync(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let (original, link) = match (
        resolve_path(scope, &state, args.get(0)),
        resolve_path(scope, &state, args.get(1)),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return throw_io(scope, e),
    };
    if let Err(e) = fs::hard_link(&original, &link) {
        throw_io(scope, io_err(&link, e));
    }
}

fn link_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, rv: v8::ReturnValue) {
    invoke_node_callback(scope, args, rv, |scope, state, args| {
        let original = resolve_path(scope, state, args.get(0))?;
        let link = resolve_path(scope, state, args.get(1))?;
        fs::hard_link(&original, &link).map_err(|e| io_err(&link, e))?;
        Ok(v8::undefined(scope).into())
    });
}

fn watch_unsupported(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    throw_io(
        scope,
        generic_error("fs.watch is not supported in this notebook runtime"),
    );
}

fn create_read_stream(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };

    let stream = v8::Object::new(scope);
    let listeners = v8::Array::new(scope, 0);
    set_property_to(scope, stream, "__listeners", listeners.into());

    match fs::read(&path) {
        Ok(bytes) => {
            let data = bytes_to_value(scope, &bytes, v8::undefined(scope).into());
            set_property_to(scope, stream, "__data", data);
            set_property_to(scope, stream, "__error", v8::undefined(scope).into());
        }
        Err(e) => {
            let message = v8::String::new(scope, &io_err(&path, e).to_string()).unwrap();
            set_property_to(scope, stream, "__error", message.into());
        }
    }

    set_function_to(scope, stream, "on", stream_on);
    rv.set(stream.into());
}

fn create_write_stream(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let path = match resolve_path(scope, &state, args.get(0)) {
        Ok(p) => p,
        Err(e) => return throw_io(scope, e),
    };

    let stream = v8::Object::new(scope);
    set_property_to(scope, stream, "__path", v8::String::new(scope, &path.to_string_lossy()).unwrap().into());
    set_function_to(scope, stream, "on", stream_on);
    set_function_to(scope, stream, "write", stream_write);
    set_function_to(scope, stream, "end", stream_end);
    rv.set(stream.into());
}

/// `.on(event, cb)`: since the underlying read already completed
/// synchronously, `data`/`error`/`end` fire immediately against whatever
/// `create_read_stream` stashed on the object.
fn stream_on(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let this = args.this();
    let event = args.get(0).to_rust_string_lossy(scope);
    let callback = match v8::Local::<v8::Function>::try_from(args.get(1)) {
        Ok(f) => f,
        Err(_) => return,
    };
    let undefined = v8::undefined(scope);

    let error_key = v8::String::new(scope, "__error").unwrap();
    let has_error = this
        .get(scope, error_key.into())
        .map(|v| !v.is_undefined())
        .unwrap_or(false);

    if event == "error" && has_error {
        let err = this.get(scope, error_key.into()).unwrap();
        callback.call(scope, undefined.into(), &[err]);
    } else if event == "data" && !has_error {
        let data_key = v8::String::new(scope, "__data").unwrap();
        if let Some(data) = this.get(scope, data_key.into()) {
            callback.call(scope, undefined.into(), &[data]);
        }
    } else if event == "end" && !has_error {
        callback.call(scope, undefined.into(), &[]);
    } else if event == "finish" {
        callback.call(scope, undefined.into(), &[]);
    }

    rv.set(this.into());
}

/// Appends `chunk` to the file backing a write stream object. Shared by
/// `.write()` (returns a boolean) and `.end()` (ignores the result).
fn append_chunk(scope: &mut v8::HandleScope, this: v8::Local<v8::Object>, chunk: v8::Local<v8::Value>) -> bool {
    let path_key = v8::String::new(scope, "__path").unwrap();
    let Some(path_value) = this.get(scope, path_key.into()) else {
        return false;
    };
    let path = PathBuf::from(path_value.to_rust_string_lossy(scope));
    let data = value_to_bytes(scope, chunk);

    use std::io::Write as _;
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(&data));

    match result {
        Ok(()) => true,
        Err(e) => {
            throw_io(scope, io_err(&path, e));
            false
        }
    }
}

fn stream_write(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let this = args.this();
    let ok = append_chunk(scope, this, args.get(0));
    rv.set(v8::Boolean::new(scope, ok).into());
}

fn stream_end(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let chunk = args.get(0);
    if !chunk.is_undefined() && !chunk.is_function() {
        append_chunk(scope, args.this(), chunk);
    }
}

fn promises_read_file(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => match fs::read(&path) {
            Ok(bytes) => {
                let value = bytes_to_value(scope, &bytes, args.get(1));
                resolver.resolve(scope, value);
            }
            Err(e) => reject_with(scope, resolver, io_err(&path, e)),
        },
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_write_file(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => {
            let data = value_to_bytes(scope, args.get(1));
            match fs::write(&path, data) {
                Ok(()) => {
                    let undefined = v8::undefined(scope);
                    resolver.resolve(scope, undefined.into());
                }
                Err(e) => reject_with(scope, resolver, io_err(&path, e)),
            }
        }
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_mkdir(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => {
            let recursive = option_bool(scope, args.get(1), "recursive");
            let result = if recursive { fs::create_dir_all(&path) } else { fs::create_dir(&path) };
            match result {
                Ok(()) => {
                    let undefined = v8::undefined(scope);
                    resolver.resolve(scope, undefined.into());
                }
                Err(e) => reject_with(scope, resolver, io_err(&path, e)),
            }
        }
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_rm(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => {
            let recursive = option_bool(scope, args.get(1), "recursive");
            let result = if path.is_dir() {
                if recursive { fs::remove_dir_all(&path) } else { fs::remove_dir(&path) }
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    let undefined = v8::undefined(scope);
                    resolver.resolve(scope, undefined.into());
                }
                Err(e) => reject_with(scope, resolver, io_err(&path, e)),
            }
        }
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_stat(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => match fs::metadata(&path) {
            Ok(meta) => {
                let obj = stat_object(scope, &meta);
                resolver.resolve(scope, obj.into());
            }
            Err(e) => reject_with(scope, resolver, io_err(&path, e)),
        },
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_readdir(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) => match read_dir_names(&path) {
            Ok(names) => {
                let array = v8::Array::new(scope, names.len() as i32);
                for (i, name) in names.iter().enumerate() {
                    let value = v8::String::new(scope, name).unwrap();
                    array.set_index(scope, i as u32, value.into());
                }
                resolver.resolve(scope, array.into());
            }
            Err(e) => reject_with(scope, resolver, io_err(&path, e)),
        },
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn promises_access(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = crate::bindings::data_ref::<FsProxyState>(&args);
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    match resolve_path(scope, &state, args.get(0)) {
        Ok(path) if path.exists() => {
            let undefined = v8::undefined(scope);
            resolver.resolve(scope, undefined.into());
        }
        Ok(path) => reject_with(
            scope,
            resolver,
            io_err(&path, io::Error::new(io::ErrorKind::NotFound, "no such file or directory")),
        ),
        Err(e) => reject_with(scope, resolver, e),
    }
    rv.set(resolver.get_promise(scope).into());
}

fn reject_with(scope: &mut v8::HandleScope, resolver: v8::Local<v8::PromiseResolver>, err: anyhow::Error) {
    let message = v8::String::new(scope, &err.to_string()).unwrap();
    let error = v8::Exception::error(scope, message);
    resolver.reject(scope, error);
}
