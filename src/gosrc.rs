//! A small Go source scanner: enough of the language surface to recover
//! package clauses, doc comments, imports, build constraints and exported
//! top-level declarations. Bodies are skipped by brace matching; this is a
//! documentation scanner, not a compiler front end.

use thiserror::Error;

use crate::record::SymbolKind;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("unterminated {0}")]
    Unterminated(&'static str),

    #[error("missing package clause")]
    NoPackageClause,

    #[error("malformed declaration near line {0}")]
    Malformed(usize),
}

/// One top-level declaration.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Decl {
    pub kind: SymbolKind,
    pub name: String,
    /// Receiver base type for methods.
    pub receiver: Option<String>,
    pub signature: String,
    pub doc: Option<String>,
}

/// Scanned view of one `.go` file.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SourceFile {
    pub package_name: String,
    pub package_doc: Option<String>,
    pub imports: Vec<String>,
    pub decls: Vec<Decl>,
    /// Raw `//go:build` expression, if any.
    pub go_build: Option<String>,
    /// Raw `// +build` lines, if any.
    pub plus_build: Vec<String>,
}

const GOOS_LIST: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js", "linux",
    "netbsd", "openbsd", "plan9", "solaris", "wasip1", "windows", "zos",
];

const GOARCH_LIST: &[&str] = &[
    "386", "amd64", "arm", "arm64", "loong64", "mips", "mips64", "mips64le", "mipsle", "ppc64",
    "ppc64le", "riscv64", "s390x", "wasm",
];

const UNIX_GOOS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "linux",
    "netbsd", "openbsd", "solaris",
];

pub fn is_goos(s: &str) -> bool {
    GOOS_LIST.contains(&s)
}

pub fn is_goarch(s: &str) -> bool {
    GOARCH_LIST.contains(&s)
}

/// Whether a file participates in a build context, considering only its
/// name (`_GOOS.go`, `_GOARCH.go`, `_GOOS_GOARCH.go` suffixes).
pub fn filename_matches(file_name: &str, goos: &str, goarch: &str) -> bool {
    let Some(stem) = file_name.strip_suffix(".go") else {
        return false;
    };
    let parts: Vec<&str> = stem.split('_').collect();
    match parts.as_slice() {
        [first, .., os, arch] if !first.is_empty() && is_goos(os) && is_goarch(arch) => {
            *os == goos && *arch == goarch
        }
        [first, .., last] if !first.is_empty() && is_goarch(last) => *last == goarch,
        [first, .., last] if !first.is_empty() && is_goos(last) => *last == goos,
        _ => true,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TokKind {
    Ident,
    Str,
    Other,
}

#[derive(Clone, Debug)]
struct Tok {
    kind: TokKind,
    /// For `Ident` the identifier, for `Str` the decoded value, for
    /// `Other` the punctuation or literal text.
    text: String,
    line: usize,
    start: usize,
    end: usize,
}

#[derive(Clone, Debug)]
struct CommentBlock {
    text: String,
    end_line: usize,
}

struct Lexed {
    toks: Vec<Tok>,
    comments: Vec<CommentBlock>,
}

fn lex(src: &str) -> Result<Lexed, ScanError> {
    let mut toks: Vec<Tok> = Vec::new();
    let mut comments: Vec<CommentBlock> = Vec::new();
    let mut pending: Option<CommentBlock> = None;

    let mut i = 0;
    let mut line = 1;

    while i < src.len() {
        let c = src[i..].chars().next().expect("index is a char boundary");

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }

        if c == '/' && src[i..].starts_with("//") {
            let start = i + 2;
            let end = src[start..]
                .find('\n')
                .map(|n| start + n)
                .unwrap_or(src.len());
            let text = &src[start..end];
            match &mut pending {
                // Adjacent lines extend the block; anything else starts a
                // fresh one.
                Some(block) if block.end_line + 1 == line => {
                    block.text.push('\n');
                    block.text.push_str(text);
                    block.end_line = line;
                }
                _ => {
                    if let Some(done) = pending.take() {
                        comments.push(done);
                    }
                    pending = Some(CommentBlock {
                        text: text.to_string(),
                        end_line: line,
                    });
                }
            }
            i = end;
            continue;
        }

        if c == '/' && src[i..].starts_with("/*") {
            let Some(n) = src[i + 2..].find("*/") else {
                return Err(ScanError::Unterminated("block comment"));
            };
            let text = &src[i + 2..i + 2 + n];
            line += text.matches('\n').count();
            if let Some(done) = pending.take() {
                comments.push(done);
            }
            pending = Some(CommentBlock {
                text: text.to_string(),
                end_line: line,
            });
            i += n + 4;
            continue;
        }

        // A real token: whatever comment preceded it is complete.
        if let Some(done) = pending.take() {
            comments.push(done);
        }

        match c {
            '"' | '`' => {
                let (value, next, lines) = lex_string(src, i, c)?;
                toks.push(Tok {
                    kind: TokKind::Str,
                    text: value,
                    line,
                    start: i,
                    end: next,
                });
                line += lines;
                i = next;
            }
            '\'' => {
                let (_, next, lines) = lex_string(src, i, '\'')?;
                toks.push(Tok {
                    kind: TokKind::Other,
                    text: "'".into(),
                    line,
                    start: i,
                    end: next,
                });
                line += lines;
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                for ch in src[i..].chars() {
                    if ch.is_alphanumeric() || ch == '_' {
                        j += ch.len_utf8();
                    } else {
                        break;
                    }
                }
                toks.push(Tok {
                    kind: TokKind::Ident,
                    text: src[start..j].to_string(),
                    line,
                    start,
                    end: j,
                });
                i = j;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut j = i;
                for ch in src[i..].chars() {
                    if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
                        j += ch.len_utf8();
                    } else {
                        break;
                    }
                }
                toks.push(Tok {
                    kind: TokKind::Other,
                    text: src[start..j].to_string(),
                    line,
                    start,
                    end: j,
                });
                i = j;
            }
            c => {
                toks.push(Tok {
                    kind: TokKind::Other,
                    text: c.to_string(),
                    line,
                    start: i,
                    end: i + c.len_utf8(),
                });
                i += c.len_utf8();
            }
        }
    }

    if let Some(done) = pending.take() {
        comments.push(done);
    }
    Ok(Lexed { toks, comments })
}

fn lex_string(src: &str, start: usize, quote: char) -> Result<(String, usize, usize), ScanError> {
    let mut value = String::new();
    let mut lines = 0;
    let mut i = start + quote.len_utf8();
    loop {
        let Some(c) = src[i..].chars().next() else {
            return Err(ScanError::Unterminated("string literal"));
        };
        if c == quote {
            return Ok((value, i + c.len_utf8(), lines));
        }
        if c == '\n' {
            if quote != '`' {
                return Err(ScanError::Unterminated("string literal"));
            }
            lines += 1;
        }
        if c == '\\' && quote != '`' {
            // Keep the escaped character verbatim; import paths never
            // contain escapes, so fidelity here does not matter.
            let next = src[i + 1..]
                .chars()
                .next()
                .ok_or(ScanError::Unterminated("string literal"))?;
            value.push(next);
            i += 1 + next.len_utf8();
            continue;
        }
        value.push(c);
        i += c.len_utf8();
    }
}

/// Strip directive lines (`go:build`, `+build`, `go:generate`, ...) from a
/// doc comment block.
fn clean_doc(block: &str) -> Option<String> {
    let cleaned: Vec<&str> = block
        .lines()
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .filter(|l| !l.trim_start().starts_with("go:") && !l.trim_start().starts_with("+build"))
        .collect();
    let text = cleaned.join("\n").trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Scan one Go source file.
pub fn scan_file(src: &str) -> Result<SourceFile, ScanError> {
    let Lexed { toks, comments } = lex(src)?;

    let mut out = SourceFile::default();

    // Build constraints must precede the package clause, which is the
    // first statement of a valid file.
    let first_tok_line = toks.first().map(|t| t.line).unwrap_or(usize::MAX);
    for block in comments.iter().filter(|b| b.end_line < first_tok_line) {
        for l in block.text.lines() {
            let l = l.trim();
            if let Some(expr) = l.strip_prefix("go:build ") {
                if out.go_build.is_none() {
                    out.go_build = Some(expr.trim().to_string());
                }
            } else if let Some(rest) = l.strip_prefix("+build ") {
                out.plus_build.push(rest.trim().to_string());
            }
        }
    }

    let doc_for = |line: usize| -> Option<String> {
        comments
            .iter()
            .rev()
            .find(|b| b.end_line + 1 == line)
            .and_then(|b| clean_doc(&b.text))
    };

    let mut depth_paren = 0i32;
    let mut depth_brace = 0i32;
    let mut depth_brack = 0i32;
    let mut idx = 0usize;

    while idx < toks.len() {
        let tok = &toks[idx];
        let at_top = depth_paren == 0 && depth_brace == 0 && depth_brack == 0;

        if !(at_top && tok.kind == TokKind::Ident) {
            if tok.kind == TokKind::Other {
                match tok.text.as_str() {
                    "(" => depth_paren += 1,
                    ")" => depth_paren -= 1,
                    "{" => depth_brace += 1,
                    "}" => depth_brace -= 1,
                    "[" => depth_brack += 1,
                    "]" => depth_brack -= 1,
                    _ => {}
                }
            }
            idx += 1;
            continue;
        }

        match tok.text.as_str() {
            "package" => {
                let name = toks
                    .get(idx + 1)
                    .filter(|t| t.kind == TokKind::Ident)
                    .ok_or(ScanError::NoPackageClause)?;
                out.package_name = name.text.clone();
                out.package_doc = doc_for(tok.line);
                idx += 2;
            }
            "import" => {
                idx += 1;
                match toks.get(idx) {
                    Some(t) if t.kind == TokKind::Str => {
                        out.imports.push(t.text.clone());
                        idx += 1;
                    }
                    Some(t) if t.text == "(" => {
                        idx += 1;
                        while let Some(t) = toks.get(idx) {
                            if t.text == ")" {
                                idx += 1;
                                break;
                            }
                            if t.kind == TokKind::Str {
                                out.imports.push(t.text.clone());
                            }
                            idx += 1;
                        }
                    }
                    _ => return Err(ScanError::Malformed(tok.line)),
                }
            }
            "func" => {
                idx = scan_func(&toks, idx, src, &doc_for, &mut out)?;
            }
            "type" => {
                idx = scan_group(&toks, idx, src, &doc_for, SymbolKind::Type, &mut out)?;
            }
            "const" => {
                idx = scan_group(&toks, idx, src, &doc_for, SymbolKind::Const, &mut out)?;
            }
            "var" => {
                idx = scan_group(&toks, idx, src, &doc_for, SymbolKind::Var, &mut out)?;
            }
            _ => {
                idx += 1;
            }
        }
    }

    if out.package_name.is_empty() {
        return Err(ScanError::NoPackageClause);
    }
    Ok(out)
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scan a `func` declaration starting at `toks[start]`; returns the index
/// past the declaration (body skipped).
fn scan_func(
    toks: &[Tok],
    start: usize,
    src: &str,
    doc_for: &impl Fn(usize) -> Option<String>,
    out: &mut SourceFile,
) -> Result<usize, ScanError> {
    let func_tok = &toks[start];
    let mut idx = start + 1;

    let mut receiver = None;
    if toks.get(idx).is_some_and(|t| t.text == "(") {
        // Receiver base type: the last identifier at the top level of the
        // receiver parentheses, outside any generic parameter list.
        let mut parens = 0i32;
        let mut bracks = 0i32;
        let mut last_ident = None;
        loop {
            let t = toks.get(idx).ok_or(ScanError::Malformed(func_tok.line))?;
            match t.text.as_str() {
                "(" => parens += 1,
                ")" => {
                    parens -= 1;
                    if parens == 0 {
                        idx += 1;
                        break;
                    }
                }
                "[" => bracks += 1,
                "]" => bracks -= 1,
                _ if t.kind == TokKind::Ident && bracks == 0 => last_ident = Some(t.text.clone()),
                _ => {}
            }
            idx += 1;
        }
        receiver = last_ident;
    }

    let name = toks
        .get(idx)
        .filter(|t| t.kind == TokKind::Ident)
        .ok_or(ScanError::Malformed(func_tok.line))?
        .clone();
    idx += 1;

    // Walk to the body brace, or to the newline ending a bodyless
    // (assembly-backed) declaration.
    let mut depth_paren = 0i32;
    let mut depth_brack = 0i32;
    let mut seen_params = false;
    let mut sig_end = name.end;
    let mut body = None;
    while let Some(t) = toks.get(idx) {
        let balanced = depth_paren == 0 && depth_brack == 0;
        if balanced && seen_params && t.line > toks[idx - 1].line {
            break;
        }
        match t.text.as_str() {
            "(" => depth_paren += 1,
            ")" => {
                depth_paren -= 1;
                if depth_paren == 0 {
                    seen_params = true;
                }
            }
            "[" => depth_brack += 1,
            "]" => depth_brack -= 1,
            "{" if balanced && seen_params => {
                body = Some(idx);
                break;
            }
            _ => {}
        }
        sig_end = t.end;
        idx += 1;
    }

    let end = match body {
        Some(body_idx) => {
            let mut depth = 0i32;
            let mut j = body_idx;
            loop {
                let t = toks.get(j).ok_or(ScanError::Unterminated("function body"))?;
                match t.text.as_str() {
                    "{" => depth += 1,
                    "}" => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            j + 1
        }
        None => idx,
    };

    let kind = if receiver.is_some() {
        SymbolKind::Method
    } else {
        SymbolKind::Func
    };
    out.decls.push(Decl {
        kind,
        name: name.text.clone(),
        receiver,
        signature: collapse_ws(&src[func_tok.start..sig_end]),
        doc: doc_for(func_tok.line),
    });

    Ok(end)
}

/// Scan a `type`, `const` or `var` declaration (grouped or single).
fn scan_group(
    toks: &[Tok],
    start: usize,
    src: &str,
    doc_for: &impl Fn(usize) -> Option<String>,
    kind: SymbolKind,
    out: &mut SourceFile,
) -> Result<usize, ScanError> {
    let kw = &toks[start];
    let mut idx = start + 1;

    let grouped = toks.get(idx).is_some_and(|t| t.text == "(");
    if grouped {
        idx += 1;
    }

    loop {
        let Some(first) = toks.get(idx) else {
            if grouped {
                return Err(ScanError::Unterminated("declaration group"));
            }
            break;
        };
        if grouped && first.text == ")" {
            idx += 1;
            break;
        }
        if first.kind != TokKind::Ident {
            idx += 1;
            continue;
        }

        // One spec: a name list, then everything up to the end of the
        // spec with nesting balanced.
        let spec_start = idx;
        let spec_line = first.line;
        let mut names = vec![first.text.clone()];
        let mut j = idx + 1;
        while kind != SymbolKind::Type
            && toks.get(j).is_some_and(|t| t.text == ",")
            && toks.get(j + 1).is_some_and(|t| t.kind == TokKind::Ident)
        {
            names.push(toks[j + 1].text.clone());
            j += 2;
        }

        let mut depth_paren = 0i32;
        let mut depth_brace = 0i32;
        let mut depth_brack = 0i32;
        let mut sig_end = toks[j - 1].end;
        let mut last_line = spec_line;
        while let Some(t) = toks.get(j) {
            let balanced = depth_paren == 0 && depth_brace == 0 && depth_brack == 0;
            if balanced && grouped && t.text == ")" {
                break;
            }
            if balanced && t.line > last_line {
                break;
            }
            match t.text.as_str() {
                "(" => depth_paren += 1,
                ")" => depth_paren -= 1,
                "{" => depth_brace += 1,
                "}" => depth_brace -= 1,
                "[" => depth_brack += 1,
                "]" => depth_brack -= 1,
                _ => {}
            }
            last_line = t.line;
            sig_end = t.end;
            j += 1;
        }

        let doc = doc_for(spec_line).or_else(|| doc_for(kw.line));
        let prefix = match kind {
            SymbolKind::Type => "type ",
            SymbolKind::Const => "const ",
            SymbolKind::Var => "var ",
            _ => "",
        };
        let body = collapse_ws(&src[toks[spec_start].start..sig_end]);
        // Struct and interface bodies do not belong in a signature line.
        let signature = match body.split_once('{') {
            Some((head, _)) => format!("{prefix}{}", head.trim_end()),
            None => format!("{prefix}{body}"),
        };

        for name in names {
            out.decls.push(Decl {
                kind,
                name,
                receiver: None,
                signature: signature.clone(),
                doc: doc.clone(),
            });
        }

        idx = j;
        if !grouped {
            break;
        }
    }

    Ok(idx)
}

/// Evaluate a file's build constraints for one `(goos, goarch)` pair.
pub fn constraints_match(file: &SourceFile, goos: &str, goarch: &str) -> bool {
    if let Some(expr) = &file.go_build {
        return eval_build_expr(expr, goos, goarch).unwrap_or(false);
    }
    // Legacy lines: every line must hold; within a line space is OR and
    // comma is AND.
    file.plus_build.iter().all(|l| {
        l.split_whitespace().any(|opt| {
            opt.split(',').all(|term| {
                let (neg, tag) = match term.strip_prefix('!') {
                    Some(t) => (true, t),
                    None => (false, term),
                };
                neg != tag_value(tag, goos, goarch)
            })
        })
    })
}

fn tag_value(tag: &str, goos: &str, goarch: &str) -> bool {
    tag == goos
        || tag == goarch
        || (tag == "unix" && UNIX_GOOS.contains(&goos))
        || tag.starts_with("go1")
}

/// Recursive-descent evaluation of a `//go:build` expression.
fn eval_build_expr(expr: &str, goos: &str, goarch: &str) -> Option<bool> {
    struct P<'a> {
        toks: Vec<&'a str>,
        pos: usize,
    }

    impl<'a> P<'a> {
        fn peek(&self) -> Option<&'a str> {
            self.toks.get(self.pos).copied()
        }
        fn next(&mut self) -> Option<&'a str> {
            let t = self.peek()?;
            self.pos += 1;
            Some(t)
        }
    }

    fn tokenize(expr: &str) -> Vec<&str> {
        let mut toks = Vec::new();
        let mut rest = expr.trim();
        while !rest.is_empty() {
            let len = if rest.starts_with("&&") || rest.starts_with("||") {
                2
            } else if rest.starts_with('!') || rest.starts_with('(') || rest.starts_with(')') {
                1
            } else {
                rest.find(|c: char| c.is_whitespace() || "!()&|".contains(c))
                    .unwrap_or(rest.len())
            };
            toks.push(&rest[..len]);
            rest = rest[len..].trim_start();
        }
        toks
    }

    fn or_expr(p: &mut P<'_>, goos: &str, goarch: &str) -> Option<bool> {
        let mut v = and_expr(p, goos, goarch)?;
        while p.peek() == Some("||") {
            p.next();
            let rhs = and_expr(p, goos, goarch)?;
            v = v || rhs;
        }
        Some(v)
    }

    fn and_expr(p: &mut P<'_>, goos: &str, goarch: &str) -> Option<bool> {
        let mut v = unary(p, goos, goarch)?;
        while p.peek() == Some("&&") {
            p.next();
            let rhs = unary(p, goos, goarch)?;
            v = v && rhs;
        }
        Some(v)
    }

    fn unary(p: &mut P<'_>, goos: &str, goarch: &str) -> Option<bool> {
        match p.next()? {
            "!" => Some(!unary(p, goos, goarch)?),
            "(" => {
                let v = or_expr(p, goos, goarch)?;
                if p.next()? != ")" {
                    return None;
                }
                Some(v)
            }
            tag => Some(tag_value(tag, goos, goarch)),
        }
    }

    let mut p = P {
        toks: tokenize(expr),
        pos: 0,
    };
    let v = or_expr(&mut p, goos, goarch)?;
    if p.pos != p.toks.len() {
        return None;
    }
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_package_and_doc() {
        let src = "// Package a does things.\n//\n// In detail.\npackage a\n";
        let f = scan_file(src).unwrap();
        assert_eq!(f.package_name, "a");
        assert_eq!(
            f.package_doc.as_deref(),
            Some("Package a does things.\n\nIn detail.")
        );
    }

    #[test]
    fn blank_line_detaches_doc() {
        let src = "// Stale comment.\n\npackage a\n";
        let f = scan_file(src).unwrap();
        assert_eq!(f.package_doc, None);
    }

    #[test]
    fn scans_imports() {
        let src = r#"package a

import "fmt"

import (
    "strings"
    xmaps "golang.org/x/exp/maps"
    _ "embed"
)
"#;
        let f = scan_file(src).unwrap();
        assert_eq!(
            f.imports,
            vec!["fmt", "strings", "golang.org/x/exp/maps", "embed"]
        );
    }

    #[test]
    fn scans_funcs_and_methods() {
        let src = r#"package a

// F does a thing.
func F(x int) (int, error) {
    if x > 0 {
        return x, nil
    }
    return 0, nil
}

type T struct{ X int }

// M reports.
func (t *T) M() bool { return t.X > 0 }

func unexported() {}
"#;
        let f = scan_file(src).unwrap();
        let names: Vec<_> = f.decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["F", "T", "M", "unexported"]);

        let fdecl = &f.decls[0];
        assert_eq!(fdecl.kind, SymbolKind::Func);
        assert_eq!(fdecl.signature, "func F(x int) (int, error)");
        assert_eq!(fdecl.doc.as_deref(), Some("F does a thing."));

        let t = &f.decls[1];
        assert_eq!(t.kind, SymbolKind::Type);
        assert_eq!(t.signature, "type T struct");

        let m = &f.decls[2];
        assert_eq!(m.kind, SymbolKind::Method);
        assert_eq!(m.receiver.as_deref(), Some("T"));
        assert_eq!(m.signature, "func (t *T) M() bool");
    }

    #[test]
    fn multiline_signature_and_bodyless_func() {
        let src = "package a\n\nfunc F(\n\tx int,\n\ty int,\n) (int, error) {\n\treturn x + y, nil\n}\n\nfunc Add(a, b int64) int64\n\nfunc G() {}\n";
        let f = scan_file(src).unwrap();
        let names: Vec<_> = f.decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["F", "Add", "G"]);
        assert_eq!(f.decls[1].signature, "func Add(a, b int64) int64");
    }

    #[test]
    fn generic_receiver() {
        let src = "package a\n\nfunc (m *Map[K, V]) Get(k K) V { var v V; return v }\n";
        let f = scan_file(src).unwrap();
        assert_eq!(f.decls[0].receiver.as_deref(), Some("Map"));
        assert_eq!(f.decls[0].kind, SymbolKind::Method);
    }

    #[test]
    fn scans_const_var_groups() {
        let src = r#"package a

const (
    // A is first.
    A = 1
    B, C = 2, 3
    d = 4
)

var V = map[string]int{"x": 1}
"#;
        let f = scan_file(src).unwrap();
        let names: Vec<_> = f.decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "d", "V"]);
        assert_eq!(f.decls[0].doc.as_deref(), Some("A is first."));
        assert_eq!(f.decls[0].kind, SymbolKind::Const);
        assert_eq!(f.decls[4].kind, SymbolKind::Var);
        assert_eq!(f.decls[4].signature, "var V = map[string]int");
    }

    #[test]
    fn type_groups() {
        let src = r#"package a

type (
    Pair struct {
        X, Y int
    }
    Alias = string
)
"#;
        let f = scan_file(src).unwrap();
        let names: Vec<_> = f.decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Pair", "Alias"]);
        assert_eq!(f.decls[0].signature, "type Pair struct");
    }

    #[test]
    fn build_constraints() {
        let src = "//go:build linux && amd64\n\npackage a\n";
        let f = scan_file(src).unwrap();
        assert_eq!(f.go_build.as_deref(), Some("linux && amd64"));
        assert!(constraints_match(&f, "linux", "amd64"));
        assert!(!constraints_match(&f, "darwin", "amd64"));

        let src = "//go:build (linux || darwin) && !cgo\n\npackage a\n";
        let f = scan_file(src).unwrap();
        assert!(constraints_match(&f, "darwin", "amd64"));
        assert!(!constraints_match(&f, "windows", "amd64"));

        let src = "// +build linux darwin\n// +build amd64\n\npackage a\n";
        let f = scan_file(src).unwrap();
        assert!(constraints_match(&f, "linux", "amd64"));
        assert!(!constraints_match(&f, "linux", "arm64"));
    }

    #[test]
    fn directive_only_comment_is_not_doc() {
        let src = "//go:build linux\n\npackage a\n";
        let f = scan_file(src).unwrap();
        assert_eq!(f.package_doc, None);
    }

    #[test]
    fn filename_constraints() {
        assert!(filename_matches("f_linux.go", "linux", "amd64"));
        assert!(!filename_matches("f_linux.go", "darwin", "amd64"));
        assert!(filename_matches("f_linux_amd64.go", "linux", "amd64"));
        assert!(!filename_matches("f_linux_amd64.go", "linux", "arm64"));
        assert!(filename_matches("f_amd64.go", "windows", "amd64"));
        assert!(filename_matches("plain.go", "linux", "amd64"));
        // A bare GOOS name is not a suffix.
        assert!(filename_matches("linux.go", "darwin", "amd64"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert_eq!(
            scan_file("package a\nvar X = \"oops\n"),
            Err(ScanError::Unterminated("string literal"))
        );
    }

    #[test]
    fn missing_package_clause() {
        assert_eq!(scan_file("var X = 1\n"), Err(ScanError::NoPackageClause));
    }
}
