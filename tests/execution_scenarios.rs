//! End-to-end execution-loop scenarios (spec §8 "TESTABLE PROPERTIES",
//! seed scenarios S1-S7), exercised through the public `JsRuntime` API with
//! a synchronous, no-op dependency installer so no real `npm` ever runs.

use nodebooks_runtime::{
    CellLanguage, CellMetadata, CodeCell, DependencyInstaller, ExecuteRequest, ExecutionStatus,
    JsRuntime, JsRuntimeOptions, NotebookEnv, NotebookOutput,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

#[derive(Debug)]
struct NoopInstaller;

impl DependencyInstaller for NoopInstaller {
    fn install(&self, _cwd: &Path, _packages: &BTreeMap<String, String>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn runtime() -> JsRuntime {
    let root = tempdir().expect("tempdir").into_path();
    JsRuntime::with_options(JsRuntimeOptions {
        workspace_root: Some(root),
        install_dependencies: Some(Arc::new(NoopInstaller)),
        seed: Some(1),
    })
}

fn cell(id: &str, language: CellLanguage) -> CodeCell {
    CodeCell {
        id: id.to_string(),
        language,
        metadata: CellMetadata { timeout_ms: None },
    }
}

fn run(runtime: &mut JsRuntime, notebook_id: &str, cell: &CodeCell, code: &str) -> nodebooks_runtime::ExecuteResult {
    runtime.execute(ExecuteRequest::new(cell, code, notebook_id, &NotebookEnv::default()))
}

fn text_plain(output: &NotebookOutput) -> Option<&str> {
    match output {
        NotebookOutput::DisplayData(display) => display
            .data
            .get("text/plain")
            .and_then(|v| v.as_str()),
        _ => None,
    }
}

/// S1: a bare trailing expression becomes the terminal display.
#[test]
fn s1_expression_capture() {
    let mut runtime = runtime();
    let cell = cell("s1", CellLanguage::Js);
    let result = run(&mut runtime, "nb-s1", &cell, "const a = 2;\nconst b = 3;\na + b");

    assert_eq!(result.execution.status, ExecutionStatus::Ok);
    let last = result.outputs.last().expect("a terminal display output");
    assert_eq!(text_plain(last), Some("5"));
}

/// S2: `console.log` calls become streamed stdout outputs, in order.
#[test]
fn s2_streamed_stdout() {
    let mut runtime = runtime();
    let cell = cell("s2", CellLanguage::Js);
    let result = run(&mut runtime, "nb-s2", &cell, "console.log('first'); console.log('second');");

    assert_eq!(result.execution.status, ExecutionStatus::Ok);
    let stdout_lines: Vec<&str> = result
        .outputs
        .iter()
        .filter_map(|o| match o {
            NotebookOutput::Stream(s) if s.name == nodebooks_runtime::StreamName::Stdout => Some(s.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(stdout_lines, vec!["first", "second"]);
}

/// S3: `@nodebooks/ui` helpers stream a display immediately and suppress
/// the terminal display for the same value.
#[test]
fn s3_ui_helper_streams_and_suppresses_terminal_display() {
    let mut runtime = runtime();
    let cell = cell("s3", CellLanguage::Js);
    let result = run(
        &mut runtime,
        "nb-s3",
        &cell,
        "const { UiMarkdown } = require('@nodebooks/ui');\nUiMarkdown('# hi');",
    );

    assert_eq!(result.execution.status, ExecutionStatus::Ok);
    let displays: Vec<_> = result
        .outputs
        .iter()
        .filter_map(|o| match o {
            NotebookOutput::DisplayData(d) => Some(d),
            _ => None,
        })
        .collect();
    assert_eq!(displays.len(), 1, "exactly one display: the streamed UI one, no terminal duplicate");
    assert_eq!(displays[0].metadata.streamed, Some(true));
}

/// S4: a path resolving outside the workspace throws, surfaced as an error
/// output whose message matches the spec's pattern.
#[test]
fn s4_path_confinement() {
    let mut runtime = runtime();
    let cell = cell("s4", CellLanguage::Js);
    let result = run(
        &mut runtime,
        "nb-s4",
        &cell,
        "require('fs').readFileSync('/etc/passwd', 'utf8');",
    );

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(error.evalue.contains("is not allowed"), "got: {}", error.evalue);
}

/// S5: server-creating modules throw a denial message instead of binding a
/// socket.
#[test]
fn s5_server_denial() {
    let mut runtime = runtime();
    let cell = cell("s5", CellLanguage::Js);
    let result = run(
        &mut runtime,
        "nb-s5",
        &cell,
        "require('http').createServer(() => {});",
    );

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(error.evalue.contains("server creation is not allowed"), "got: {}", error.evalue);
}

/// S6: a cell that never returns is stopped at the hard timeout and
/// reported as an error, with the partial stream preserved.
#[test]
fn s6_hard_timeout() {
    let mut runtime = runtime();
    let mut cell = cell("s6", CellLanguage::Js);
    cell.metadata.timeout_ms = Some(50);
    let result = run(&mut runtime, "nb-s6", &cell, "console.log('before'); while (true) {}");

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(
        error.evalue.contains("timed") && error.evalue.contains("out"),
        "got: {}",
        error.evalue
    );
    assert!(result
        .outputs
        .iter()
        .any(|o| matches!(o, NotebookOutput::Stream(s) if s.text == "before")));
    assert!(
        result.outputs.iter().any(|o| matches!(
            o,
            NotebookOutput::Stream(s) if s.text.contains("[timeout] Execution exceeded 50ms")
        )),
        "expected a stderr stream line with the literal timeout message"
    );
}

/// S7: a `setTimeout` that resolves within budget is awaited as part of
/// timer quiescence before the terminal display is built.
#[test]
fn s7_timer_quiescence_waits_for_pending_timeout() {
    let mut runtime = runtime();
    let cell = cell("s7", CellLanguage::Js);
    let result = run(
        &mut runtime,
        "nb-s7",
        &cell,
        "let done = false;\nsetTimeout(() => { done = true; console.log('fired'); }, 10);\ndone;",
    );

    assert_eq!(result.execution.status, ExecutionStatus::Ok);
    assert!(result
        .outputs
        .iter()
        .any(|o| matches!(o, NotebookOutput::Stream(s) if s.text == "fired")));
}

/// Child-process access is denied the same way server creation is.
#[test]
fn child_process_denial() {
    let mut runtime = runtime();
    let cell = cell("cp", CellLanguage::Js);
    let result = run(&mut runtime, "nb-cp", &cell, "require('child_process');");

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(error.evalue.contains("disabled in NodeBooks runtime"), "got: {}", error.evalue);
}

/// Bindings declared in one cell persist into the next cell run within the
/// same notebook binding (spec §9 "Shared mutable global state").
#[test]
fn bindings_persist_across_cells_in_the_same_notebook() {
    let mut runtime = runtime();
    let cell_a = cell("persist-a", CellLanguage::Js);
    let cell_b = cell("persist-b", CellLanguage::Js);

    let first = run(&mut runtime, "nb-persist", &cell_a, "const counter = 41;");
    assert_eq!(first.execution.status, ExecutionStatus::Ok);

    let second = run(&mut runtime, "nb-persist", &cell_b, "counter + 1");
    assert_eq!(second.execution.status, ExecutionStatus::Ok);
    let last = second.outputs.last().expect("a terminal display output");
    assert_eq!(text_plain(last), Some("42"));
}

/// `require()` resolution is confined to the workspace directory the same
/// way the `fs` proxy is (spec §4.4): neither a `../`-escaping relative
/// specifier nor an absolute host path may be loaded as a module.
#[test]
fn require_relative_escape_denied() {
    let mut runtime = runtime();
    let cell = cell("require-escape", CellLanguage::Js);
    let result = run(
        &mut runtime,
        "nb-require-escape",
        &cell,
        "require('../../../../../../etc/passwd');",
    );

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(error.evalue.contains("is not allowed"), "got: {}", error.evalue);
}

#[test]
fn require_absolute_escape_denied() {
    let mut runtime = runtime();
    let cell = cell("require-absolute", CellLanguage::Js);
    let result = run(&mut runtime, "nb-require-absolute", &cell, "require('/etc/passwd');");

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert!(error.evalue.contains("is not allowed"), "got: {}", error.evalue);
}

/// A non-`Error` throw (a bare string) is still reported with `ename =
/// "Error"` and the value's string form as `evalue` (spec §7 "Non-Error
/// throws").
#[test]
fn non_error_throw_gets_error_class() {
    let mut runtime = runtime();
    let cell = cell("throw", CellLanguage::Js);
    let result = run(&mut runtime, "nb-throw", &cell, "throw 'boom';");

    assert_eq!(result.execution.status, ExecutionStatus::Error);
    let error = result.execution.error.expect("error output");
    assert_eq!(error.ename, "Error");
    assert_eq!(error.evalue, "boom");
}
