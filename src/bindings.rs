//! Generic v8 plumbing shared by every proxy/binding module (console,
//! process, fs, the module interceptor). There is no generic binding
//! registry or default-context bootstrap here -- this crate builds one
//! curated context per notebook binding in `sandbox.rs` instead.

use crate::errors::extract_error_code;
use crate::errors::IoError;
use anyhow::Error;
use std::ffi::c_void;

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.set(scope, key.into(), value);
}

/// Adds a read-only property with the given name and value, into the given object.
pub fn set_constant_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.define_own_property(scope, key.into(), value, v8::PropertyAttribute::READ_ONLY);
}

/// Adds a `Function` object which calls the given Rust function.
pub fn set_function_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let template = v8::FunctionTemplate::new(scope, callback);
    let val = template.get_function(scope).unwrap();

    target.set(scope, key.into(), val.into());
}

/// Adds a `Function` that closes over a Rust value via v8's `data` slot,
/// retrievable inside the callback as `args.data()`. Used to bind console/
/// process/fs proxy state without a global registry.
pub fn set_function_with_data_to<T: 'static>(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
    data: std::rc::Rc<T>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let addr = std::rc::Rc::into_raw(data) as *mut c_void;
    let external = v8::External::new(scope, addr);
    let template = v8::FunctionTemplate::builder_raw(callback)
        .data(external.into())
        .build(scope);
    let val = template.get_function(scope).unwrap();
    target.set(scope, key.into(), val.into());
}

/// Recovers a `Rc<T>` bound via `set_function_with_data_to`, bumping its
/// strong count so the original leaked reference stays valid.
pub fn data_ref<T>(args: &v8::FunctionCallbackArguments) -> std::rc::Rc<T> {
    let external = v8::Local::<v8::External>::try_from(args.data()).unwrap();
    let ptr = external.value() as *const T;
    unsafe {
        std::rc::Rc::increment_strong_count(ptr);
        std::rc::Rc::from_raw(ptr)
    }
}

/// Creates a plain object with a given name under a `target` object.
pub fn create_object_under<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<v8::Object>,
    name: &str,
) -> v8::Local<'s, v8::Object> {
    let template = v8::ObjectTemplate::new(scope);
    let key = v8::String::new(scope, name).unwrap();
    let value = template.new_instance(scope).unwrap();

    target.set(scope, key.into(), value.into());
    value
}

/// Stores a Rust type inside a v8 object's internal field. The object must
/// have been created from a template with `set_internal_field_count(1)` (or
/// more, using a different `index`).
pub fn set_internal_ref<T>(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    index: usize,
    data: T,
) {
    let boxed_ref = Box::new(data);
    let addr = Box::leak(boxed_ref) as *mut T as *mut c_void;
    let v8_ext = v8::External::new(scope, addr);

    target.set_internal_field(index, v8_ext.into());
}

/// Gets a previously stored Rust type from a v8 object.
pub fn get_internal_ref<'s, T>(
    scope: &mut v8::HandleScope<'s>,
    source: v8::Local<v8::Object>,
    index: usize,
) -> &'s mut T {
    let v8_ref = source.get_internal_field(scope, index).unwrap();
    let stored_item = unsafe { v8::Local::<v8::External>::cast(v8_ref) };
    let stored_item = stored_item.value() as *mut T;

    unsafe { &mut *stored_item }
}

/// Sets a Node-style `.code` property (`ENOENT`, `EACCES`, ...) on a thrown
/// exception when the underlying error carries one.
pub fn set_exception_code(
    scope: &mut v8::HandleScope<'_>,
    exception: v8::Local<v8::Value>,
    error: &Error,
) {
    let exception = match exception.to_object(scope) {
        Some(exception) => exception,
        None => return,
    };
    if let Some(error) = error.downcast_ref::<IoError>() {
        if let Some(code) = extract_error_code(error) {
            let key = v8::String::new(scope, "code").unwrap();
            let value = v8::String::new(scope, code).unwrap();
            exception.set(scope, key.into(), value.into());
        }
    }
}

/// Throws a plain `Error` built from an `anyhow::Error`.
pub fn throw_exception(scope: &mut v8::HandleScope, err: &Error) {
    let message = err.to_string();
    let message = v8::String::new(scope, &message).unwrap();
    let exception = v8::Exception::error(scope, message);
    set_exception_code(scope, exception, err);
    scope.throw_exception(exception);
}

/// Throws a `TypeError`.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}
