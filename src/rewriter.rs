//! Source rewriter: lifts top-level declarations onto the shared
//! `globalThis` so a cell's bindings persist across re-execution, and wraps
//! the cell body in an async IIFE that captures the terminal expression's
//! value. This is a character-level scanner, not a real parser: it only
//! ever makes decisions outside strings/template literals/comments and at
//! a tracked paren/bracket/brace depth.

use crate::env::CellLanguage;
use lazy_static::lazy_static;
use regex::Regex;

const RESULT_VAR: &str = "__nodebooks_result__";

lazy_static! {
    static ref DECL_RE: Regex =
        Regex::new(r"\b(export\s+)?(const|let|var)\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref FUNCTION_RE: Regex = Regex::new(
        r"\b(export\s+)?(async\s+)?(function\s*\*?\s*)([A-Za-z_$][\w$]*)\s*\("
    )
    .unwrap();
    static ref CLASS_RE: Regex = Regex::new(r"\b(export\s+)?(class\s+)([A-Za-z_$][\w$]*)").unwrap();
    static ref IMPORT_RE: Regex = Regex::new(r"^\s*import\b").unwrap();
    static ref INTERFACE_RE: Regex = Regex::new(r"^\s*(export\s+)?interface\b").unwrap();
    static ref TYPE_ALIAS_RE: Regex = Regex::new(r"^\s*(export\s+)?type\s+[A-Za-z_$]").unwrap();
    static ref GENERIC_ARROW_RE: Regex =
        Regex::new(r"^<\s*[A-Za-z_$][\w$]*(\s+extends\s+[^>]*)?\s*>\s*\(").unwrap();
    static ref BARE_IDENT_RE: Regex =
        Regex::new(r"^[A-Za-z_$][\w$]*(\.[A-Za-z_$][\w$]*)*;?$").unwrap();
    static ref CONTROL_LEAD_RE: Regex = Regex::new(
        r"^(if|for|while|switch|try|catch|finally|with|else|class|function|const|let|var|export|import|return|throw|break|continue|case|default)\b"
    )
    .unwrap();
}

/// Masks out string/template-literal/comment contents with spaces so later
/// passes only ever see real code characters at their original byte
/// offsets. Newlines are preserved (for ASI and ordinary line counting).
fn mask_source(source: &str) -> Vec<char> {
    let chars: Vec<char> = source.chars().collect();
    let mut masked = chars.clone();
    let n = chars.len();
    let mut i = 0;

    let blank = |masked: &mut Vec<char>, from: usize, to: usize| {
        for j in from..to {
            if masked[j] != '\n' {
                masked[j] = ' ';
            }
        }
    };

    while i < n {
        match chars[i] {
            '/' if i + 1 < n && chars[i + 1] == '/' => {
                let start = i;
                while i < n && chars[i] != '\n' {
                    i += 1;
                }
                blank(&mut masked, start, i);
            }
            '/' if i + 1 < n && chars[i + 1] == '*' => {
                let start = i;
                i += 2;
                while i + 1 < n && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(n);
                blank(&mut masked, start, i);
            }
            quote @ ('\'' | '"') => {
                let start = i;
                i += 1;
                while i < n {
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    if chars[i] == '\n' {
                        // Unterminated string literal; bail out of the scan.
                        break;
                    }
                    i += 1;
                }
                blank(&mut masked, start, i);
            }
            '`' => {
                let start = i;
                i += 1;
                let mut expr_depth = 0i32;
                while i < n {
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if expr_depth == 0 && chars[i] == '$' && i + 1 < n && chars[i + 1] == '{' {
                        expr_depth += 1;
                        i += 2;
                        continue;
                    }
                    if expr_depth > 0 {
                        match chars[i] {
                            '{' => expr_depth += 1,
                            '}' => expr_depth -= 1,
                            _ => {}
                        }
                        i += 1;
                        continue;
                    }
                    if chars[i] == '`' {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                blank(&mut masked, start, i);
            }
            _ => i += 1,
        }
    }

    masked
}

#[derive(Clone, Copy, Default)]
struct Depths {
    paren: i32,
    bracket: i32,
    brace: i32,
}

impl Depths {
    fn all_zero(&self) -> bool {
        self.paren == 0 && self.bracket == 0 && self.brace == 0
    }

    fn apply(&mut self, ch: char) {
        match ch {
            '(' => self.paren += 1,
            ')' => self.paren -= 1,
            '[' => self.bracket += 1,
            ']' => self.bracket -= 1,
            '{' => self.brace += 1,
            '}' => self.brace -= 1,
            _ => {}
        }
    }
}

/// Computes the running `Depths` *before* each character index, over the
/// masked source (so depth never changes inside strings/comments).
fn depth_table(masked: &[char]) -> Vec<Depths> {
    let mut table = Vec::with_capacity(masked.len() + 1);
    let mut depth = Depths::default();
    for &ch in masked {
        table.push(depth);
        depth.apply(ch);
    }
    table.push(depth);
    table
}

/// Walks backward from `idx` over the masked source skipping whitespace,
/// and returns whether `idx` is a legal statement-start position (start of
/// text, or immediately after `;`, `{`, `}`).
fn is_statement_start(masked: &[char], idx: usize) -> bool {
    let mut j = idx;
    while j > 0 && masked[j - 1].is_whitespace() {
        j -= 1;
    }
    j == 0 || matches!(masked[j - 1], ';' | '{' | '}')
}

/// Pass A: lift top-level `const|let|var`, `function`, and `class`
/// declarations onto `globalThis`.
fn lift_declarations(source: &str) -> String {
    let masked = mask_source(source);
    let masked_str: String = masked.iter().collect();
    let depths = depth_table(&masked);
    let mut out = String::with_capacity(source.len() + 64);
    let chars: Vec<char> = source.chars().collect();
    let mut cursor = 0usize;

    // Collect every candidate match (start byte offset in char-indices,
    // kind, groups) up front, then splice them in order.
    enum Kind {
        Decl,
        Function,
        Class,
    }

    let mut matches: Vec<(usize, usize, Kind)> = Vec::new();

    for m in DECL_RE.find_iter(&masked_str) {
        matches.push((char_index(&masked_str, m.start()), char_index(&masked_str, m.end()), Kind::Decl));
    }
    for m in FUNCTION_RE.find_iter(&masked_str) {
        matches.push((
            char_index(&masked_str, m.start()),
            char_index(&masked_str, m.end()),
            Kind::Function,
        ));
    }
    for m in CLASS_RE.find_iter(&masked_str) {
        matches.push((char_index(&masked_str, m.start()), char_index(&masked_str, m.end()), Kind::Class));
    }
    matches.sort_by_key(|(start, _, _)| *start);

    for (start, _end, kind) in matches {
        if start < cursor {
            continue; // overlapped by an earlier rewrite
        }
        if !depths[start].all_zero() || !is_statement_start(&masked, start) {
            continue;
        }

        let caps_region: String = chars[start..].iter().collect();

        match kind {
            Kind::Decl => {
                let caps = match DECL_RE.captures(&caps_region) {
                    Some(c) if c.get(0).unwrap().start() == 0 => c,
                    _ => continue,
                };
                let keyword = caps.get(2).unwrap().as_str();
                let name = caps.get(3).unwrap().as_str().to_string();
                let head_end = start + caps.get(0).unwrap().end();

                // Find `=` (skipping a possible `: Type` annotation) then the
                // initializer's terminating `;` at all-zero depth, or an ASI
                // line break.
                let (init_start, stmt_end) =
                    match find_initializer_end(&chars, &masked, &depths, head_end) {
                        Some(range) => range,
                        None => continue,
                    };

                let initializer: String = chars[init_start..stmt_end].iter().collect();
                let initializer = initializer.trim_end_matches(';').trim_end();

                out.push_str(&chars[cursor..start].iter().collect::<String>());
                out.push_str(&format!(
                    "var {name} = (globalThis.{name} = {init});",
                    name = name,
                    init = initializer
                ));
                let _ = keyword;
                cursor = stmt_end;
            }
            Kind::Function => {
                let caps = match FUNCTION_RE.captures(&caps_region) {
                    Some(c) if c.get(0).unwrap().start() == 0 => c,
                    _ => continue,
                };
                let is_async = caps.get(2).is_some();
                let func_kw = caps.get(3).unwrap().as_str(); // "function" or "function*" (with spacing)
                let name = caps.get(4).unwrap().as_str();

                out.push_str(&chars[cursor..start].iter().collect::<String>());
                out.push_str(&format!(
                    "globalThis.{name} = {}{}{name}(",
                    if is_async { "async " } else { "" },
                    func_kw.trim_end(),
                    name = name
                ));
                cursor = start + caps.get(0).unwrap().end();
            }
            Kind::Class => {
                let caps = match CLASS_RE.captures(&caps_region) {
                    Some(c) if c.get(0).unwrap().start() == 0 => c,
                    _ => continue,
                };
                let name = caps.get(3).unwrap().as_str();

                out.push_str(&chars[cursor..start].iter().collect::<String>());
                out.push_str(&format!("globalThis.{name} = class {name}", name = name));
                cursor = start + caps.get(0).unwrap().end();
            }
        }
    }

    out.push_str(&chars[cursor..].iter().collect::<String>());
    out
}

/// Converts a byte offset from a `regex` match (on `masked_str`, which is
/// ASCII-preserving-length for every multi-byte char it might mask... in
/// practice cell source is close enough to ASCII that this is exact for
/// all but exotic identifiers) into a char index.
fn char_index(s: &str, byte_offset: usize) -> usize {
    s[..byte_offset].chars().count()
}

/// From just after `NAME` (and an optional `: Type` annotation) finds the
/// initializer's `=` and the statement's end: either the first `;` at
/// all-zero depth, or (ASI) the end of the current line when the next
/// non-comment line doesn't open with a continuation token.
fn find_initializer_end(
    chars: &[char],
    masked: &[char],
    depths: &[Depths],
    from: usize,
) -> Option<(usize, usize)> {
    let n = chars.len();
    let mut i = from;

    // Skip an optional `: Type` annotation up to the top-level `=`.
    while i < n && masked[i] != '=' {
        i += 1;
    }
    if i >= n {
        return None;
    }
    // Avoid `==`, `===`, `=>`.
    while i < n
        && (masked.get(i + 1) == Some(&'=') || masked.get(i + 1) == Some(&'>'))
    {
        i += 1;
        while i < n && masked[i] != '=' {
            i += 1;
        }
        if i >= n {
            return None;
        }
    }
    let init_start = i + 1;
    let mut j = init_start;

    while j < n {
        if masked[j] == ';' && depths[j].all_zero() {
            return Some((init_start, j + 1));
        }
        j += 1;
    }

    // ASI fallback: end at the first line break where accumulated text is
    // non-empty and the following line doesn't continue the expression.
    let mut k = init_start;
    while k < n {
        if masked[k] == '\n' && depths[k].all_zero() {
            let accumulated: String = chars[init_start..k].iter().collect();
            if accumulated.trim().is_empty() {
                k += 1;
                continue;
            }
            let rest: String = chars[k + 1..].iter().collect();
            let next_line = rest.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
            let continuation = next_line.trim_start();
            const CONT_TOKENS: &[&str] = &[
                ".", "[", "(", "+", "-", "*", "/", "%", "&", "|", "^", "?", ":", ",", "!", "=",
                "<", ">", "??", "?.", "**",
            ];
            if CONT_TOKENS.iter().any(|t| continuation.starts_with(t)) {
                k += 1;
                continue;
            }
            return Some((init_start, k));
        }
        k += 1;
    }

    // Ran off the end of the source: treat EOF as the terminator.
    if n > init_start {
        Some((init_start, n))
    } else {
        None
    }
}

/// Pass B: split off the header (imports, `interface`/`type` declarations),
/// find the last top-level expression statement, and wrap the remainder in
/// an async IIFE that captures it.
fn wrap_with_capture(source: &str, language: CellLanguage) -> String {
    let (header, body) = split_header(source);
    let masked = mask_source(&body);
    let depths = depth_table(&masked);
    let chars: Vec<char> = body.chars().collect();

    let statements = split_statements(&chars, &masked, &depths);

    let chosen = statements.iter().rev().find(|s| {
        let text = s.text.trim();
        if text.is_empty() {
            return false;
        }
        if CONTROL_LEAD_RE.is_match(text) {
            return false;
        }
        if text.chars().all(|c| ";{}() \t\r\n".contains(c)) {
            return false;
        }
        true
    });

    let body_out = match chosen {
        None => body.clone(),
        Some(stmt) => {
            let expr_text = stmt.text.trim().trim_end_matches(';').to_string();

            match language {
                CellLanguage::Ts => {
                    if BARE_IDENT_RE.is_match(expr_text.trim_end_matches(';')) {
                        splice_capture(&body, stmt.start, stmt.end, &expr_text)
                    } else {
                        body.clone()
                    }
                }
                CellLanguage::Js => {
                    if GENERIC_ARROW_RE.is_match(expr_text.trim()) {
                        format!("{body}\nreturn ({expr_text})")
                    } else {
                        splice_capture(&body, stmt.start, stmt.end, &expr_text)
                    }
                }
            }
        }
    };

    let has_capture = body_out.contains(RESULT_VAR);
    let wrapped = if has_capture {
        format!(
            "(async()=>{{\nlet {RESULT_VAR};\n{body_out}\nreturn {RESULT_VAR}\n}})()",
            RESULT_VAR = RESULT_VAR,
            body_out = body_out
        )
    } else {
        format!("(async()=>{{\n{body_out}\n}})()", body_out = body_out)
    };

    if header.trim().is_empty() {
        wrapped
    } else {
        format!("{header}\n{wrapped}", header = header.trim_end())
    }
}

fn splice_capture(body: &str, start: usize, end: usize, expr_text: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    let before: String = chars[..start].iter().collect();
    let after: String = chars[end..].iter().collect();
    format!(
        "{before}{RESULT_VAR} = ({expr});{after}",
        before = before,
        RESULT_VAR = RESULT_VAR,
        expr = expr_text,
        after = after
    )
}

struct Statement {
    start: usize,
    end: usize,
    text: String,
}

/// Splits `body` into top-level statement ranges, delimited by `;` at
/// all-zero depth, and also committed at brace open/close transitions so
/// block statements without a trailing `;` still end a statement.
fn split_statements(chars: &[char], masked: &[char], depths: &[Depths]) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut prev_brace = 0i32;
    let n = chars.len();

    for i in 0..n {
        let d = depths[i];
        if masked[i] == ';' && d.all_zero() {
            statements.push(Statement {
                start,
                end: i + 1,
                text: chars[start..i + 1].iter().collect(),
            });
            start = i + 1;
        } else if masked[i] == '}' && d.brace == 1 {
            // Closing a top-level block; commit the statement ending here.
            statements.push(Statement {
                start,
                end: i + 1,
                text: chars[start..i + 1].iter().collect(),
            });
            start = i + 1;
        }
        prev_brace = d.brace;
    }
    let _ = prev_brace;

    if start < n {
        statements.push(Statement {
            start,
            end: n,
            text: chars[start..n].iter().collect(),
        });
    }

    statements
}

/// Splits top-level `import` statements and `interface`/`type` declarations
/// out of `source` into a header string (kept at file scope verbatim), and
/// returns the remaining body with those ranges removed.
fn split_header(source: &str) -> (String, String) {
    let masked = mask_source(source);
    let depths = depth_table(&masked);
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();

    let mut header = String::new();
    let mut body = String::new();
    let mut i = 0usize;

    while i < n {
        if !depths[i].all_zero() || !is_statement_start(&masked, i) {
            body.push(chars[i]);
            i += 1;
            continue;
        }

        let rest: String = chars[i..].iter().collect();
        let line_end = rest.find('\n').map(|p| i + p).unwrap_or(n);
        let first_line: String = chars[i..line_end].iter().collect();

        if IMPORT_RE.is_match(&first_line) {
            // Multi-line import until the terminating `;` at zero depth.
            let mut j = i;
            while j < n && !(masked[j] == ';' && depths[j].all_zero()) {
                j += 1;
            }
            j = (j + 1).min(n);
            header.push_str(&chars[i..j].iter().collect::<String>());
            header.push('\n');
            i = j;
            continue;
        }

        if INTERFACE_RE.is_match(&first_line) {
            // Balanced-brace scan starting at the first `{`.
            let mut j = i;
            while j < n && masked[j] != '{' {
                j += 1;
            }
            if j >= n {
                body.push_str(&chars[i..].iter().collect::<String>());
                break;
            }
            let mut depth = 0i32;
            while j < n {
                match masked[j] {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            j += 1;
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            header.push_str(&chars[i..j].iter().collect::<String>());
            header.push('\n');
            i = j;
            continue;
        }

        if TYPE_ALIAS_RE.is_match(&first_line) {
            let mut j = i;
            while j < n && !(masked[j] == ';' && depths[j].all_zero()) {
                j += 1;
            }
            j = (j + 1).min(n);
            header.push_str(&chars[i..j].iter().collect::<String>());
            header.push('\n');
            i = j;
            continue;
        }

        body.push(chars[i]);
        i += 1;
    }

    (header, body)
}

/// Runs Pass A then Pass B over a cell's source.
pub fn rewrite(source: &str, language: CellLanguage) -> String {
    let lifted = lift_declarations(source);
    wrap_with_capture(&lifted, language)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn js(source: &str) -> String {
        rewrite(source, CellLanguage::Js)
    }

    #[test]
    fn lifts_const_to_global_this() {
        let out = lift_declarations("const a = 2;\nconst b = 3;\na + b");
        assert!(out.contains("var a = (globalThis.a = 2);"));
        assert!(out.contains("var b = (globalThis.b = 3);"));
    }

    #[test]
    fn lifts_function_and_class() {
        let out = lift_declarations("function greet(name) { return name; }\nclass Foo {}");
        assert!(out.contains("globalThis.greet = function greet("));
        assert!(out.contains("globalThis.Foo = class Foo {}"));
    }

    #[test]
    fn strips_export_keyword() {
        let out = lift_declarations("export const a = 1;");
        assert!(out.contains("var a = (globalThis.a = 1);"));
        assert!(!out.contains("export"));
    }

    #[test]
    fn does_not_lift_nested_declarations() {
        let out = lift_declarations("function outer() { const x = 1; return x; }");
        assert!(out.contains("const x = 1;"));
        assert!(!out.contains("globalThis.x"));
    }

    #[test]
    fn ignores_declarations_inside_strings_and_comments() {
        let out = lift_declarations("// const fake = 1;\nconst real = \"const nope = 2;\";");
        assert!(out.contains("var real = (globalThis.real = \"const nope = 2;\");"));
        assert!(!out.contains("globalThis.fake"));
        assert!(!out.contains("globalThis.nope"));
    }

    #[test]
    fn handles_multiline_initializer_with_asi() {
        let out = lift_declarations("const total = 1 +\n  2 +\n  3\nconsole.log(total)");
        assert!(out.contains("globalThis.total = 1 +\n  2 +\n  3"));
    }

    #[test]
    fn expression_capture_s1() {
        let out = js("const a = 2;\nconst b = 3;\na + b");
        assert!(out.contains(&format!("{RESULT_VAR} = (a + b);", RESULT_VAR = RESULT_VAR)));
        assert!(out.starts_with("(async()=>{"));
    }

    #[test]
    fn re_execution_is_idempotent_shape() {
        let first = js("const x = 41; x + 1");
        let second = js("const x = 41; x + 1");
        assert_eq!(first, second);
        assert!(first.contains("var x = (globalThis.x = 41)"));
    }

    #[test]
    fn console_log_only_has_no_terminal_capture() {
        let out = js("console.log(\"hello\")");
        assert!(!out.contains(RESULT_VAR));
    }

    #[test]
    fn ts_variant_only_captures_bare_identifier() {
        let captured = rewrite("const a = 2;\na", CellLanguage::Ts);
        assert!(captured.contains(RESULT_VAR));

        let not_captured = rewrite("const a = 2;\na + 1", CellLanguage::Ts);
        assert!(!not_captured.contains(RESULT_VAR));
    }

    #[test]
    fn imports_and_types_stay_at_file_scope() {
        let out = rewrite(
            "import { z } from \"zod\";\ninterface Foo { a: number }\ntype Bar = number;\nconst a: Bar = 1;\na",
            CellLanguage::Ts,
        );
        assert!(out.starts_with("import { z } from \"zod\";"));
        assert!(out.contains("interface Foo { a: number }"));
        assert!(out.contains("type Bar = number;"));
        assert!(out.contains("(async()=>{"));
    }
}
