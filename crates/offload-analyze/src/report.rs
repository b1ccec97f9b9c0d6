use crate::error::{AnalyzeError, AnalyzeErrorKind};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::span::Span;

/// Functions the packager treats as touching the remote shared filesystem rather
/// than the job's local sandbox. Calling any of these sets [`DependencyReport::requires_remote_fs`].
const FS_FUNCTIONS: &[&str] = &[
    "cluster_ls",
    "cluster_find",
    "cluster_stat",
    "cluster_exists",
    "cluster_isdir",
    "cluster_isfile",
    "cluster_glob",
    "cluster_du",
    "cluster_count_files",
];

/// Bare-name calls whose first string-literal argument names a data file the
/// bundle must carry or recreate on the remote side.
const FILE_OPS: &[&str] = &["open", "read", "write", "load", "dump", "save"];

/// Attribute/method names that imply a file handle is being read or written,
/// even though the path itself is out of static view.
const METHOD_FILE_OPS: &[&str] = &["read", "write", "readline", "writelines"];

const PATH_LIKE_EXTENSIONS: &[&str] = &[
    ".txt", ".csv", ".json", ".xml", ".yaml", ".yml", ".h5", ".hdf5", ".pickle", ".pkl", ".npy",
    ".npz", ".dat", ".log", ".conf", ".cfg", ".ini",
];

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// A single `import` or `from ... import ...` statement found in the captured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Dotted module path. Carries a leading run of dots for relative imports
    /// (`from . import x` records `module = "."`).
    pub module: String,
    /// Names pulled in by a `from` import (`a` / `b as c`). Empty for a plain `import`.
    pub names: Vec<String>,
    /// Alias bound by a plain `import x as y`.
    pub alias: Option<String>,
    pub is_from_import: bool,
    pub span: Span,
}

/// A bare-name call (`foo(...)`) that isn't one of the recognized filesystem or
/// file-operation builtins. The analyzer cannot tell whether `foo` resolves to a
/// function defined earlier in the same capture, a builtin, or nothing at all —
/// Rust has no access to the Python interpreter's global namespace the way the
/// original tool did via `func.__globals__`. Callers treat this list as
/// candidates, not confirmed local dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCall {
    pub name: String,
    pub span: Span,
}

/// A strong reference to a data file: a literal path passed directly to
/// `open`/`load`/`dump`/`save`/`read`/`write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRef {
    pub path: String,
    pub call: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRefKind {
    /// `.read()` / `.write()` / `.readline()` / `.writelines()` on some handle
    /// whose path isn't visible at the call site.
    MethodCall(String),
    /// A bare string constant that looks like a path (separator or known extension)
    /// but wasn't passed to a recognized file-opening call.
    PathLiteral,
}

/// A weak reference to a file: the analyzer suspects file I/O but can't name
/// the concrete path (or the path is implied rather than passed as a literal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: Option<String>,
    pub kind: FileRefKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsCall {
    pub name: String,
    pub args: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub imports: Vec<ImportRecord>,
    pub local_calls: Vec<LocalCall>,
    pub data_refs: Vec<DataRef>,
    pub file_refs: Vec<FileRef>,
    pub fs_calls: Vec<FsCall>,
    pub requires_remote_fs: bool,
}

/// Walk the captured source of `function_name` and report its imports, calls,
/// and file touches.
///
/// `source` is the function's own source text (decorator line through the last
/// statement), exactly what the caller captured — not the whole enclosing
/// module. This mirrors the original tool's use of `inspect.getsource(func)`:
/// only names imported or referenced inside the function body are visible here.
pub fn analyze(source: &str, function_name: &str) -> Result<DependencyReport, AnalyzeError> {
    if !defines_function(source, function_name) {
        return Err(AnalyzeError::new(
            AnalyzeErrorKind::FunctionNotFound,
            Span::default(),
            format!("no `def {function_name}` or `{function_name} = lambda` in captured source"),
        ));
    }

    let tokens: Vec<Token> = Lexer::new(source)
        .tokenize()
        .into_iter()
        .filter(|t| !matches!(t.kind, TokenKind::Indent(_) | TokenKind::Newline))
        .collect();

    let mut report = DependencyReport::default();
    let mut i = 0usize;
    while i < tokens.len() {
        match &tokens[i].kind {
            TokenKind::Ident(name) if name == "import" => {
                i = parse_import(&tokens, i, &mut report);
            }
            TokenKind::Ident(name) if name == "from" => {
                i = parse_from_import(&tokens, i, &mut report);
            }
            TokenKind::Ident(name) => {
                let prev_is_dot = i > 0 && matches!(tokens[i - 1].kind, TokenKind::Dot);
                let next_is_call =
                    matches!(tokens.get(i + 1).map(|t| &t.kind), Some(TokenKind::LParen));
                if next_is_call && prev_is_dot {
                    if METHOD_FILE_OPS.contains(&name.as_str()) {
                        report.file_refs.push(FileRef {
                            path: None,
                            kind: FileRefKind::MethodCall(name.clone()),
                            span: tokens[i].span,
                        });
                    }
                    i += 1;
                } else if next_is_call && !is_keyword(name) {
                    i = handle_call(name.clone(), &tokens, i, source, &mut report);
                } else {
                    i += 1;
                }
            }
            TokenKind::Str(s) => {
                if looks_like_path(s) {
                    report.file_refs.push(FileRef {
                        path: Some(s.clone()),
                        kind: FileRefKind::PathLiteral,
                        span: tokens[i].span,
                    });
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    report.requires_remote_fs = !report.fs_calls.is_empty();
    Ok(report)
}

fn handle_call(
    name: String,
    tokens: &[Token],
    i: usize,
    source: &str,
    report: &mut DependencyReport,
) -> usize {
    let span = tokens[i].span;
    let lparen_idx = i + 1;

    if FS_FUNCTIONS.contains(&name.as_str()) {
        let args = collect_call_args(tokens, lparen_idx, source);
        report.fs_calls.push(FsCall { name, args, span });
        return i + 2;
    }

    if FILE_OPS.contains(&name.as_str()) {
        if let Some(Token {
            kind: TokenKind::Str(s),
            ..
        }) = tokens.get(lparen_idx + 1)
        {
            report.data_refs.push(DataRef {
                path: s.clone(),
                call: name,
                span,
            });
            return lparen_idx + 2;
        }
    }

    report.local_calls.push(LocalCall { name, span });
    i + 2
}

fn matching_close(tokens: &[Token], open_idx: usize) -> usize {
    let mut depth = 0i32;
    let mut j = open_idx;
    while j < tokens.len() {
        match &tokens[j].kind {
            TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                depth -= 1;
                if depth == 0 {
                    return j;
                }
            }
            _ => {}
        }
        j += 1;
    }
    tokens.len().saturating_sub(1)
}

fn collect_call_args(tokens: &[Token], lparen_idx: usize, source: &str) -> Vec<String> {
    let close_idx = matching_close(tokens, lparen_idx);
    if close_idx <= lparen_idx + 1 {
        return Vec::new();
    }
    let start = tokens[lparen_idx + 1].span.start as usize;
    let end = tokens[close_idx].span.start as usize;
    split_top_level_commas(&source[start..end])
}

fn split_top_level_commas(text: &str) -> Vec<String> {
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut current = String::new();
    let mut parts = Vec::new();
    for ch in text.chars() {
        if let Some(q) = in_str {
            current.push(ch);
            if ch == q {
                in_str = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                in_str = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_dotted_name(tokens: &[Token], mut i: usize) -> (String, usize) {
    let mut parts = Vec::new();
    loop {
        match tokens.get(i).map(|t| &t.kind) {
            Some(TokenKind::Ident(n)) => {
                parts.push(n.clone());
                i += 1;
            }
            _ => break,
        }
        if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Dot)) {
            i += 1;
            continue;
        }
        break;
    }
    (parts.join("."), i)
}

fn parse_import(tokens: &[Token], mut i: usize, report: &mut DependencyReport) -> usize {
    let stmt_span = tokens[i].span;
    i += 1;
    loop {
        let (module, next_i) = parse_dotted_name(tokens, i);
        i = next_i;
        let mut alias = None;
        if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident(k)) if k == "as") {
            i += 1;
            if let Some(Token {
                kind: TokenKind::Ident(a),
                ..
            }) = tokens.get(i)
            {
                alias = Some(a.clone());
                i += 1;
            }
        }
        report.imports.push(ImportRecord {
            module,
            names: Vec::new(),
            alias,
            is_from_import: false,
            span: stmt_span,
        });
        if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Comma)) {
            i += 1;
            continue;
        }
        break;
    }
    i
}

fn parse_from_import(tokens: &[Token], mut i: usize, report: &mut DependencyReport) -> usize {
    let stmt_span = tokens[i].span;
    i += 1;
    let mut dots = 0usize;
    while matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Dot)) {
        dots += 1;
        i += 1;
    }
    let (rest, next_i) = parse_dotted_name(tokens, i);
    i = next_i;
    let module = format!("{}{}", ".".repeat(dots), rest);

    if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident(k)) if k == "import") {
        i += 1;
    }

    let mut names = Vec::new();
    let in_parens = matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::LParen));
    if in_parens {
        i += 1;
    }
    if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Op(s)) if s == "*") {
        names.push("*".to_string());
        i += 1;
    } else {
        loop {
            match tokens.get(i).map(|t| &t.kind) {
                Some(TokenKind::Ident(n)) => {
                    let mut name = n.clone();
                    i += 1;
                    if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Ident(k)) if k == "as")
                    {
                        i += 1;
                        if let Some(Token {
                            kind: TokenKind::Ident(a),
                            ..
                        }) = tokens.get(i)
                        {
                            name = format!("{name} as {a}");
                            i += 1;
                        }
                    }
                    names.push(name);
                }
                _ => break,
            }
            if matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::Comma)) {
                i += 1;
                continue;
            }
            break;
        }
    }
    if in_parens && matches!(tokens.get(i).map(|t| &t.kind), Some(TokenKind::RParen)) {
        i += 1;
    }

    report.imports.push(ImportRecord {
        module,
        names,
        alias: None,
        is_from_import: true,
        span: stmt_span,
    });
    i
}

fn is_keyword(name: &str) -> bool {
    PYTHON_KEYWORDS.contains(&name)
}

fn looks_like_path(s: &str) -> bool {
    if s.contains('/') || s.contains('\\') {
        return true;
    }
    PATH_LIKE_EXTENSIONS
        .iter()
        .any(|ext| s.to_ascii_lowercase().ends_with(ext))
}

fn defines_function(source: &str, function_name: &str) -> bool {
    let def_needle = format!("def {function_name}(");
    let def_needle_spaced = format!("def {function_name} (");
    let lambda_needle = format!("{function_name} = lambda");
    let lambda_needle_eq = format!("{function_name}=lambda");
    source.contains(&def_needle)
        || source.contains(&def_needle_spaced)
        || source.contains(&lambda_needle)
        || source.contains(&lambda_needle_eq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plain_and_from_imports() {
        let src = "def f():\n    import os\n    from pathlib import Path, PurePath as PP\n    return os.getcwd()\n";
        let report = analyze(src, "f").unwrap();
        assert_eq!(report.imports.len(), 2);
        assert_eq!(report.imports[0].module, "os");
        assert!(!report.imports[0].is_from_import);
        assert_eq!(report.imports[1].module, "pathlib");
        assert_eq!(report.imports[1].names, vec!["Path", "PurePath as PP"]);
    }

    #[test]
    fn strong_ref_from_open_call() {
        let src = "def f():\n    with open('input.csv') as fh:\n        return fh.read()\n";
        let report = analyze(src, "f").unwrap();
        assert_eq!(report.data_refs.len(), 1);
        assert_eq!(report.data_refs[0].path, "input.csv");
        assert_eq!(report.data_refs[0].call, "open");
        assert_eq!(report.file_refs.len(), 1);
        assert_eq!(
            report.file_refs[0].kind,
            FileRefKind::MethodCall("read".to_string())
        );
    }

    #[test]
    fn fs_call_sets_requires_remote_fs() {
        let src = "def f():\n    files = cluster_glob('/data/*.h5')\n    return files\n";
        let report = analyze(src, "f").unwrap();
        assert!(report.requires_remote_fs);
        assert_eq!(report.fs_calls[0].name, "cluster_glob");
        assert_eq!(report.fs_calls[0].args, vec!["'/data/*.h5'"]);
    }

    #[test]
    fn bare_call_becomes_local_call_candidate() {
        let src = "def f():\n    return helper(1, 2)\n";
        let report = analyze(src, "f").unwrap();
        assert_eq!(report.local_calls.len(), 1);
        assert_eq!(report.local_calls[0].name, "helper");
    }

    #[test]
    fn attribute_calls_are_not_local_calls() {
        let src = "def f():\n    return np.array([1, 2, 3])\n";
        let report = analyze(src, "f").unwrap();
        assert!(report.local_calls.is_empty());
    }

    #[test]
    fn missing_function_is_an_error() {
        let err = analyze("def other():\n    pass\n", "f").unwrap_err();
        assert_eq!(err.kind, AnalyzeErrorKind::FunctionNotFound);
    }
}
