//! Thin demo binary (SPEC_FULL.md §14): runs a single cell's source through
//! `JsRuntime::execute` and prints the resulting `ExecuteResult` as JSON.
//! Not the crate's core surface -- embedders are expected to depend on the
//! `nodebooks_runtime` library directly and call `JsRuntime::execute`
//! themselves; this binary exists for quick manual checks and scripting.

use clap::Parser;
use colored::*;
use nodebooks_runtime::{CellLanguage, CellMetadata, CodeCell, ExecuteRequest, JsRuntime, JsRuntimeOptions, NotebookEnv};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single NodeBooks cell and print its outputs as JSON", long_about = None)]
struct Cli {
    #[arg(help = "Path to a .js/.ts file to run; omit to read the cell's source from stdin")]
    script: Option<PathBuf>,
    #[arg(
        help = "Treat the source as TypeScript instead of inferring from the file extension",
        long
    )]
    typescript: bool,
    #[arg(help = "npm dependency as name@version, repeatable", long = "package", value_name = "NAME@VERSION")]
    package: Vec<String>,
    #[arg(help = "Environment variable as NAME=VALUE, repeatable", long = "env", value_name = "NAME=VALUE")]
    env: Vec<String>,
    #[arg(help = "Hard execution timeout in milliseconds", long = "timeout-ms")]
    timeout_ms: Option<u64>,
    #[arg(help = "Directory to use as the notebook's workspace root", long = "workspace")]
    workspace: Option<PathBuf>,
    #[arg(help = "Make V8's Math.random() predictable", long = "seed")]
    seed: Option<i64>,
}

fn read_source(cli: &Cli) -> (String, CellLanguage) {
    let language = if cli.typescript {
        CellLanguage::Ts
    } else {
        match cli.script.as_ref().and_then(|p| p.extension()) {
            Some(ext) if ext == "ts" || ext == "tsx" => CellLanguage::Ts,
            _ => CellLanguage::Js,
        }
    };

    let source = match &cli.script {
        Some(path) => std::fs::read_to_string(path).unwrap_or_else(|err| {
            eprintln!("{}: failed to read {:?}: {err}", "Error".red().bold(), path);
            std::process::exit(1);
        }),
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer).unwrap_or_else(|err| {
                eprintln!("{}: failed to read stdin: {err}", "Error".red().bold());
                std::process::exit(1);
            });
            buffer
        }
    };

    (source, language)
}

fn parse_pairs(values: &[String], separator: char, what: &str) -> BTreeMap<String, String> {
    values
        .iter()
        .filter_map(|raw| match raw.split_once(separator) {
            Some((key, value)) => Some((key.to_string(), value.to_string())),
            None => {
                eprintln!("{}: expected {what} in KEY{separator}VALUE form, got {raw:?}", "Error".red().bold());
                std::process::exit(1);
            }
        })
        .collect()
}

pub fn run() {
    let cli = Cli::parse();
    let (source, language) = read_source(&cli);

    let packages = parse_pairs(&cli.package, '@', "a package");
    let variables = parse_pairs(&cli.env, '=', "an environment variable");
    let env = NotebookEnv::new(packages, variables);

    let options = JsRuntimeOptions {
        workspace_root: cli.workspace.clone(),
        install_dependencies: None,
        seed: cli.seed,
    };
    let mut runtime = JsRuntime::with_options(options);

    let cell = CodeCell {
        id: "cli-cell".to_string(),
        language,
        metadata: CellMetadata { timeout_ms: None },
    };

    let mut request = ExecuteRequest::new(&cell, &source, "cli-notebook", &env);
    request.timeout_ms = cli.timeout_ms;

    let result = runtime.execute(request);
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("{}: failed to serialize result: {err}", "Error".red().bold());
            std::process::exit(1);
        }
    }

    if result.execution.status == nodebooks_runtime::ExecutionStatus::Error {
        std::process::exit(1);
    }
}
