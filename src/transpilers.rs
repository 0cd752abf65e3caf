//! Transpilation (C5 step 6 "Transpile to CommonJS"): strips TypeScript
//! types and lowers the `import` declarations rewriter.rs keeps at file
//! scope into `require` calls, since a cell runs as a plain `v8::Script`,
//! not a native ES module -- `import`/`export` are never valid syntax for
//! the thing we actually hand to `v8::Script::compile`.

use crate::env::CellLanguage;
use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use swc_common::errors::{ColorConfig, Handler};
use swc_common::sync::Lrc;
use swc_common::{FileName, FilePathMapping, Globals, Mark, SourceMap, GLOBALS};
use swc_ecma_codegen::text_writer::JsWriter;
use swc_ecma_codegen::Emitter;
use swc_ecma_parser::lexer::Lexer;
use swc_ecma_parser::{EsSyntax, Parser, StringInput, Syntax, TsSyntax};
use swc_ecma_transforms_base::fixer::fixer;
use swc_ecma_transforms_base::hygiene::hygiene;
use swc_ecma_transforms_base::resolver;
use swc_ecma_transforms_typescript::strip;

/// Parses `source` with the grammar its `language` implies, strips
/// TypeScript-only syntax when present, and re-emits plain JavaScript.
/// `import` declarations are left untouched here -- `lower_esm_imports`
/// handles those in a second, syntax-unaware pass, same as dune's own
/// `TypeScript::compile` leaves module structure alone and only strips
/// types (examples/aalykiot-dune/src/transpilers.rs).
fn strip_types(filename: &str, source: &str, language: CellLanguage) -> Result<String> {
    if language == CellLanguage::Js {
        return Ok(source.to_string());
    }

    let globals = Globals::default();
    let cm: Lrc<SourceMap> = Lrc::new(SourceMap::new(FilePathMapping::empty()));
    let handler = Handler::with_tty_emitter(ColorConfig::Auto, true, false, Some(cm.clone()));

    let fm = cm.new_source_file(
        FileName::Custom(filename.to_string()).into(),
        source.into(),
    );

    let lexer = Lexer::new(
        Syntax::Typescript(TsSyntax {
            tsx: false,
            decorators: true,
            no_early_errors: true,
            ..Default::default()
        }),
        Default::default(),
        StringInput::from(&*fm),
        None,
    );

    let mut parser = Parser::new_from(lexer);
    let program = match parser
        .parse_program()
        .map_err(|e| e.into_diagnostic(&handler).emit())
    {
        Ok(program) => program,
        Err(_) => bail!("Cell source failed to parse as TypeScript"),
    };

    let mut output = Vec::new();

    GLOBALS.set(&globals, || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();

        let program = program
            .apply(resolver(unresolved_mark, top_level_mark, false))
            .apply(strip(unresolved_mark, top_level_mark))
            .apply(hygiene())
            .apply(fixer(None));

        let mut emitter = Emitter {
            cfg: swc_ecma_codegen::Config::default(),
            cm: cm.clone(),
            comments: None,
            wr: JsWriter::new(cm.clone(), "\n", &mut output, None),
        };
        emitter.emit_program(&program).unwrap();
    });

    Ok(String::from_utf8_lossy(&output).to_string())
}

lazy_static! {
    static ref TYPE_ONLY_IMPORT_RE: Regex =
        Regex::new(r"(?m)^[ \t]*import\s+type\s+.+?;?[ \t]*$").unwrap();
    static ref NAMESPACE_IMPORT_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+\*\s*as\s+([A-Za-z_$][\w$]*)\s+from\s+(["'])([^"']+)\2\s*;?[ \t]*$"#
    )
    .unwrap();
    static ref DEFAULT_AND_NAMED_IMPORT_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+([A-Za-z_$][\w$]*)\s*,\s*\{([^}]*)\}\s+from\s+(["'])([^"']+)\3\s*;?[ \t]*$"#
    )
    .unwrap();
    static ref DEFAULT_IMPORT_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+([A-Za-z_$][\w$]*)\s+from\s+(["'])([^"']+)\2\s*;?[ \t]*$"#
    )
    .unwrap();
    static ref NAMED_IMPORT_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+\{([^}]*)\}\s+from\s+(["'])([^"']+)\2\s*;?[ \t]*$"#
    )
    .unwrap();
    static ref SIDE_EFFECT_IMPORT_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+(["'])([^"']+)\1\s*;?[ \t]*$"#
    )
    .unwrap();
}

/// Turns a `{ a, b as c, type D }` clause into the destructuring-pattern
/// equivalent (`a, b: c`), dropping any inline `type`-only names -- swc's
/// `strip()` already erases whole `import type ...` statements, but a
/// *partially* type-only named clause (`import { type A, b } from 'x'`)
/// survives it and would otherwise produce an invalid destructure target.
fn convert_named_clause(list: &str) -> String {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with("type "))
        .map(|entry| match entry.split_once(" as ") {
            Some((name, alias)) => format!("{}: {}", name.trim(), alias.trim()),
            None => entry.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lowers every `import` declaration left at file scope by rewriter.rs
/// into the `require` form the module interceptor's CommonJS loader
/// understands (spec §4.5 step 6). Runs as plain text substitution rather
/// than an AST transform -- import declarations are syntactically simple
/// enough (no nested strings, no nested braces) that a handful of regexes
/// cover every shape without the risk of hand-building swc AST nodes for
/// a dependency version this crate never compiles against.
pub fn lower_esm_imports(source: &str) -> String {
    let source = TYPE_ONLY_IMPORT_RE.replace_all(source, "");

    let source = NAMESPACE_IMPORT_RE.replace_all(&source, |caps: &Captures| {
        format!("const {} = require(\"{}\");", &caps[1], &caps[3])
    });

    let source = DEFAULT_AND_NAMED_IMPORT_RE.replace_all(&source, |caps: &Captures| {
        let named = convert_named_clause(&caps[2]);
        if named.is_empty() {
            format!("const {} = require(\"{}\");", &caps[1], &caps[4])
        } else {
            format!(
                "const {} = require(\"{}\"); const {{ {} }} = require(\"{}\");",
                &caps[1], &caps[4], named, &caps[4]
            )
        }
    });

    let source = DEFAULT_IMPORT_RE.replace_all(&source, |caps: &Captures| {
        format!("const {} = require(\"{}\");", &caps[1], &caps[3])
    });

    let source = NAMED_IMPORT_RE.replace_all(&source, |caps: &Captures| {
        let named = convert_named_clause(&caps[1]);
        format!("const {{ {} }} = require(\"{}\");", named, &caps[3])
    });

    let source = SIDE_EFFECT_IMPORT_RE.replace_all(&source, |caps: &Captures| {
        format!("require(\"{}\");", &caps[2])
    });

    source.into_owned()
}

/// The single entrypoint the execution loop calls: strip TypeScript
/// (no-op for `.js` cells) then lower `import`s to `require`s, producing
/// source ready for `v8::Script::compile`.
pub fn to_commonjs(filename: &str, source: &str, language: CellLanguage) -> Result<String> {
    let stripped = strip_types(filename, source, language)?;
    Ok(lower_esm_imports(&stripped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plain_types() {
        let source = "const x: number = 1;\nx";
        let out = to_commonjs("cell.ts", source, CellLanguage::Ts).unwrap();
        assert!(!out.contains(": number"));
        assert!(out.contains("const x = 1;"));
    }

    #[test]
    fn leaves_javascript_untouched_by_the_typescript_pass() {
        let source = "const x = 1;\nx";
        let out = to_commonjs("cell.js", source, CellLanguage::Js).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn lowers_default_import() {
        let out = lower_esm_imports("import axios from \"axios\";\naxios.get('/');");
        assert_eq!(out, "const axios = require(\"axios\");\naxios.get('/');");
    }

    #[test]
    fn lowers_named_import_with_alias() {
        let out = lower_esm_imports("import { readFile as rf } from \"fs\";\nrf();");
        assert_eq!(out, "const { readFile: rf } = require(\"fs\");\nrf();");
    }

    #[test]
    fn lowers_namespace_import() {
        let out = lower_esm_imports("import * as path from \"path\";\npath.join('a');");
        assert_eq!(out, "const path = require(\"path\");\npath.join('a');");
    }

    #[test]
    fn lowers_default_plus_named_import() {
        let out = lower_esm_imports("import React, { useState } from \"react\";\nuseState();");
        assert!(out.contains("const React = require(\"react\");"));
        assert!(out.contains("const { useState } = require(\"react\");"));
    }

    #[test]
    fn lowers_side_effect_only_import() {
        let out = lower_esm_imports("import \"dotenv/config\";\n1");
        assert_eq!(out, "require(\"dotenv/config\");\n1");
    }

    #[test]
    fn drops_type_only_import_entirely() {
        let out = lower_esm_imports("import type { Foo } from \"./types\";\n1");
        assert_eq!(out.trim(), "1");
    }

    #[test]
    fn drops_inline_type_only_named_specifier() {
        let out = lower_esm_imports("import { type Foo, bar } from \"./mod\";\nbar();");
        assert_eq!(out, "const { bar } = require(\"./mod\");\nbar();");
    }

    #[test]
    fn handles_multiline_named_import() {
        let source = "import {\n  a,\n  b,\n} from \"mod\";\na + b";
        let out = lower_esm_imports(source);
        assert_eq!(out, "const { a, b } = require(\"mod\");\na + b");
    }
}
