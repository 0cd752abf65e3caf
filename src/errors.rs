use anyhow::Error;
use colored::*;
use std::borrow::Cow;
use std::fmt::Display;

use crate::output::ErrorOutput;
use crate::workspace::PrepareError;

// A simple error type that lets the creator specify both the error message and
// the error class name.
#[derive(Debug)]
pub struct CustomError {
    class: &'static str,
    message: Cow<'static, str>,
}

impl CustomError {
    pub fn new(class: &'static str, message: impl Into<Cow<'static, str>>) -> Error {
        CustomError {
            class,
            message: message.into(),
        }
        .into()
    }

    pub fn generic(message: impl Into<Cow<'static, str>>) -> Error {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<Cow<'static, str>>) -> Error {
        Self::new("TypeError", message)
    }
}

pub fn generic_error(message: impl Into<Cow<'static, str>>) -> Error {
    CustomError::generic(message)
}

/// Wraps a `std::io::Error` so the fs proxy can set a Node-style `.code`
/// (`ENOENT`, `EACCES`, ...) on the exception it throws into the sandbox.
#[derive(Debug)]
pub struct IoError(pub std::io::Error);

impl std::error::Error for IoError {}

impl Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps an `IoError`'s `ErrorKind` to the Node.js error code conventionally
/// attached to `fs` exceptions.
pub fn extract_error_code(error: &IoError) -> Option<&'static str> {
    use std::io::ErrorKind::*;
    match error.0.kind() {
        NotFound => Some("ENOENT"),
        PermissionDenied => Some("EACCES"),
        AlreadyExists => Some("EEXIST"),
        InvalidInput => Some("EINVAL"),
        _ => None,
    }
}

impl std::error::Error for CustomError {}

impl Display for CustomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.red().bold(), self.message)
    }
}

// Represents an exception coming from V8, fully materialized so it can
// outlive the HandleScope it was captured from.
#[derive(Debug, PartialEq, Clone)]
pub struct JsError {
    pub message: String,
    pub resource_name: String,
    pub source_line: Option<String>,
    pub line_number: Option<i64>,
    pub start_column: Option<i64>,
    pub end_column: Option<i64>,
    pub stack: Option<String>,
}

impl JsError {
    /// Builds a `JsError` from a caught v8 exception. `prefix` is prepended
    /// to the message (used for unhandled promise rejections, reported as
    /// `"(in promise) <message>"`).
    // https://github.com/denoland/rusty_v8/blob/0d093a02f658781d52e6d70d138768fc19a79d54/examples/shell.rs#L158
    pub fn from_v8_exception<'a>(
        scope: &'a mut v8::HandleScope,
        exception: v8::Local<'a, v8::Value>,
        prefix: Option<&str>,
    ) -> Self {
        // Create a new HandleScope so we can create local handles.
        let scope = &mut v8::HandleScope::new(scope);
        let message = v8::Exception::create_message(scope, exception);

        // Getting the error type from the exception.
        let exception_string = exception
            .to_string(scope)
            .unwrap()
            .to_rust_string_lossy(scope);

        let exception_string = match prefix {
            Some(prefix) => format!("{prefix}{exception_string}"),
            None => exception_string,
        };

        let resource_name = message.get_script_resource_name(scope).map_or_else(
            || "(unknown)".into(),
            |s| s.to_string(scope).unwrap().to_rust_string_lossy(scope),
        );

        let source_line = message
            .get_source_line(scope)
            .map(|s| s.to_string(scope).unwrap().to_rust_string_lossy(scope));

        let line_number = message
            .get_line_number(scope)
            .and_then(|v| v.try_into().ok());

        let start_column = message.get_start_column().try_into().ok();
        let end_column = message.get_end_column().try_into().ok();

        // Non-Error throws (numbers, strings, plain objects) don't carry a
        // `.stack` property; only reach for it when the exception is an object.
        let stack = exception.to_object(scope).and_then(|exception| {
            let key = v8::String::new(scope, "stack").unwrap();
            let stack = exception.get(scope, key.into())?;
            let stack: v8::Local<v8::String> = stack.try_into().ok()?;
            Some(stack.to_rust_string_lossy(scope))
        });

        JsError {
            message: exception_string,
            resource_name,
            source_line,
            line_number,
            start_column,
            end_column,
            stack,
        }
    }

    /// Splits `ename`/`evalue` out of the captured message, following the
    /// "ClassName: message" convention V8 uses for `Error` subclasses.
    pub fn into_output(self) -> ErrorOutput {
        let (ename, evalue) = match self.message.split_once(": ") {
            Some((class, rest)) if is_identifier_like(class) => {
                (class.to_string(), rest.to_string())
            }
            _ => ("Error".to_string(), self.message.clone()),
        };

        let traceback = match self.stack {
            Some(stack) => stack.lines().map(String::from).collect(),
            None => vec![self.message.clone()],
        };

        ErrorOutput {
            ename,
            evalue,
            traceback,
        }
    }
}

fn is_identifier_like(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl std::error::Error for JsError {}

// Should display the minified version of the error. (used in repl)
impl Display for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Unwrapping values.
        let line = self.line_number.unwrap_or_default();
        let column = self.start_column.unwrap_or_default();
        write!(
            f,
            "{} {} ({}:{}:{})",
            "Uncaught".red().bold(),
            self.message,
            self.resource_name,
            line,
            column
        )
    }
}

impl JsError {
    /// Renders the full diagnostic (source line, caret underline, stack).
    /// Used by the CLI and by `NB_DEBUG` tracing; the execution loop itself
    /// only needs `into_output`.
    pub fn pretty(&self) -> String {
        let mut out = format!("{} {}\n", "Uncaught".red().bold(), self.message);

        if let Some(source_line) = self.source_line.as_ref() {
            out.push_str(source_line);
            out.push('\n');

            let start_column = self.start_column.unwrap_or_default();
            let end_column = self.end_column.unwrap_or_default();

            for _ in 0..start_column {
                out.push(' ');
            }
            for _ in start_column..end_column {
                out.push_str(&"^".red().to_string());
            }
            out.push('\n');
        }

        if let Some(stack) = self.stack.as_ref() {
            out.push_str(&stack.dimmed().to_string());
        }

        out
    }
}

pub fn unwrap_or_exit<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{:?}", e);
            std::process::exit(1);
        }
    }
}

/// The classified failure kinds from the error-handling design, collapsed
/// into one type so the execution loop has a single place to turn a
/// failure into cell output.
#[derive(Debug)]
pub enum RunError {
    /// Workspace preparation (package.json sync, dependency install, UI
    /// package materialization) failed; the workspace metadata fingerprint
    /// is left untouched so the next `execute` call retries. Carries any
    /// diagnostic lines (e.g. `[env] Install failed: ...`) that should still
    /// reach the cell's stderr even though the run never started.
    Preparation(PrepareError),
    /// The compiled script or the awaited promise exceeded the cell's
    /// timeout budget.
    Timeout(u64),
    /// An ordinary thrown value or rejection surfaced from user code.
    Script(JsError),
}

impl RunError {
    pub fn into_output(self) -> ErrorOutput {
        match self {
            RunError::Preparation(err) => ErrorOutput {
                ename: "Error".to_string(),
                evalue: format!("Failed to install notebook dependencies: {}", err.source),
                traceback: vec![],
            },
            RunError::Timeout(ms) => ErrorOutput {
                ename: "Error".to_string(),
                evalue: format!("Execution timed out after {ms}ms and was stopped."),
                traceback: vec![],
            },
            RunError::Script(js_error) => js_error.into_output(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_class_from_message() {
        let err = JsError {
            message: "TypeError: x is not a function".into(),
            resource_name: "cell".into(),
            source_line: None,
            line_number: None,
            start_column: None,
            end_column: None,
            stack: None,
        };
        let output = err.into_output();
        assert_eq!(output.ename, "TypeError");
        assert_eq!(output.evalue, "x is not a function");
    }

    #[test]
    fn falls_back_to_error_class_for_non_error_throws() {
        let err = JsError {
            message: "42".into(),
            resource_name: "cell".into(),
            source_line: None,
            line_number: None,
            start_column: None,
            end_column: None,
            stack: None,
        };
        let output = err.into_output();
        assert_eq!(output.ename, "Error");
        assert_eq!(output.evalue, "42");
    }

    #[test]
    fn preparation_error_message_has_install_failure_prefix() {
        let err = RunError::Preparation(PrepareError {
            source: "npm exited with code 1".to_string(),
            diagnostics: vec![],
        });
        let output = err.into_output();
        assert!(output
            .evalue
            .starts_with("Failed to install notebook dependencies:"));
    }

    #[test]
    fn preparation_error_carries_diagnostics() {
        let err = PrepareError {
            source: "boom".to_string(),
            diagnostics: vec![crate::output::NotebookOutput::stream(
                crate::output::StreamName::Stderr,
                "[env] Install failed: boom\n".to_string(),
            )],
        };
        assert_eq!(err.diagnostics.len(), 1);
    }
}
