//! `nodebooks-runtime`: a sandboxed V8 embedding that executes one notebook
//! cell at a time, sharing a per-notebook workspace, module cache, and
//! global scope across runs. See `execute::JsRuntime` for the public entry
//! point.

mod bindings;
mod emitter;
mod env;
mod errors;
mod execute;
mod fsproxy;
mod interceptor;
mod output;
mod rewriter;
mod sandbox;
mod timers;
mod transpilers;
mod workspace;

pub use emitter::{OutputSink, SharedSink};
pub use env::{CellLanguage, CellMetadata, CodeCell, NotebookEnv};
pub use errors::{JsError, RunError};
pub use execute::{ExecuteRequest, JsRuntime, JsRuntimeOptions, DEFAULT_TIMEOUT_MS};
pub use output::{
    DisplayMetadata, DisplayOutput, ErrorOutput, ExecuteResult, ExecutionStatus, NotebookOutput,
    OutputExecution, StreamName, StreamOutput,
};
pub use workspace::{DependencyInstaller, NpmInstaller, PrepareError, Workspace, WorkspaceManager};
