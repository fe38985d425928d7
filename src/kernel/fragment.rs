//! Lexical extraction of the pieces of kernel source the compiler rewrites.
//!
//! This is deliberately not a parser. The scanner walks the token stream and
//! records entrypoint signatures, module-scope `identity` declarations and
//! `read`/`write` call sites together with their spans. Everything else in
//! the source passes through untouched.

use crate::diagnostic::Diagnostic;
use crate::span::{Span, Spanned};

use super::lexer::{Lexeme, Lexer};

/// Names accepted as entrypoints, plus `filter` which is rejected during
/// validation with a hint.
pub const ENTRYPOINT_NAMES: [&str; 7] = ["map", "filtro", "reduce", "scan", "group", "sort", "filter"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentKind {
    Entrypoint,
    Identity,
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceFragment {
    pub kind: FragmentKind,
    /// Position in source order across all fragment kinds.
    pub id: usize,
    pub span: Span,
    /// Span of the function or identity name.
    pub name_span: Span,
    /// Entrypoint name, or the attribute suffix of `read_x`/`write_x`/`identity_x`.
    pub key: Option<String>,
    /// Raw argument texts (parameters for entrypoints, the value for identities).
    pub args: Vec<String>,
    pub arg_spans: Vec<Span>,
    /// Leading word of an identity declaration (`const`, `let`, ...).
    pub qualifier: Option<String>,
    /// Entrypoint return type or identity type annotation.
    pub ty: Option<String>,
}

impl SourceFragment {
    fn new(kind: FragmentKind, name_span: Span, key: Option<String>) -> Self {
        Self {
            kind,
            id: 0,
            span: name_span,
            name_span,
            key,
            args: Vec::new(),
            arg_spans: Vec::new(),
            qualifier: None,
            ty: None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceFragments {
    pub entrypoints: Vec<SourceFragment>,
    pub identities: Vec<SourceFragment>,
    pub reads: Vec<SourceFragment>,
    pub writes: Vec<SourceFragment>,
}

impl SourceFragments {
    pub fn entrypoint(&self) -> Option<&SourceFragment> {
        self.entrypoints.first()
    }

    pub fn identity(&self, key: Option<&str>) -> Option<&SourceFragment> {
        self.identities.iter().find(|f| f.key() == key)
    }

    /// Batch size of the first write call, 0 when there is none.
    pub fn write_batch_size(&self) -> usize {
        self.writes.first().map_or(0, |w| w.args.len())
    }
}

/// Scan kernel source into fragments.
pub fn extract(source: &str) -> (SourceFragments, Vec<Diagnostic>) {
    let (tokens, diagnostics) = Lexer::new(source).tokenize();
    let mut scanner = Scanner {
        source,
        tokens,
        diagnostics,
        fragments: SourceFragments::default(),
        next_id: 0,
    };
    scanner.scan();
    (scanner.fragments, scanner.diagnostics)
}

struct Scanner<'src> {
    source: &'src str,
    tokens: Vec<Spanned<Lexeme>>,
    diagnostics: Vec<Diagnostic>,
    fragments: SourceFragments,
    next_id: usize,
}

impl Scanner<'_> {
    fn scan(&mut self) {
        let mut depth = 0usize;
        // First token of the current module-scope declaration.
        let mut decl_start = 0usize;
        for pos in 0..self.tokens.len() {
            match &self.tokens[pos].node {
                Lexeme::LBrace => depth += 1,
                Lexeme::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        decl_start = pos + 1;
                    }
                }
                Lexeme::Semicolon if depth == 0 => decl_start = pos + 1,
                Lexeme::Ident(name) => {
                    let name = name.clone();
                    self.visit_ident(pos, &name, depth, decl_start);
                }
                _ => {}
            }
        }
    }

    fn visit_ident(&mut self, pos: usize, name: &str, depth: usize, decl_start: usize) {
        let prev = pos.checked_sub(1).map(|p| &self.tokens[p].node);
        let after_fn = prev.and_then(Lexeme::ident) == Some("fn");

        if after_fn && depth == 0 && ENTRYPOINT_NAMES.contains(&name) {
            self.entrypoint(pos, name);
            return;
        }

        let is_identity = name == "identity" || name.starts_with("identity_");
        let next = self.tokens.get(pos + 1).map(|t| &t.node);
        if is_identity && depth == 0 && matches!(next, Some(Lexeme::Colon | Lexeme::Eq)) {
            self.identity(pos, name, decl_start);
            return;
        }

        let call = if name == "read" || name.starts_with("read_") {
            Some(FragmentKind::Read)
        } else if name == "write" || name.starts_with("write_") {
            Some(FragmentKind::Write)
        } else {
            None
        };
        let member = matches!(prev, Some(Lexeme::Op(op)) if op == ".");
        if let Some(kind) = call.filter(|_| !after_fn && !member) {
            if next == Some(&Lexeme::LParen) {
                self.call(pos, kind, name);
            }
        }
    }

    /// `fn NAME(params) [-> T]`
    fn entrypoint(&mut self, pos: usize, name: &str) {
        let name_span = self.tokens[pos].span;
        let mut frag = SourceFragment::new(FragmentKind::Entrypoint, name_span, Some(name.to_string()));
        let start = self.tokens[pos - 1].span.start;
        let Some((args, close)) = self.arguments(pos + 1) else {
            return;
        };
        let mut end = self.tokens[close].span.end;
        if self.tokens.get(close + 1).map(|t| &t.node) == Some(&Lexeme::Arrow) {
            let ty_start = close + 2;
            let mut ty_end = ty_start;
            while ty_end < self.tokens.len()
                && !matches!(self.tokens[ty_end].node, Lexeme::LBrace | Lexeme::Eof)
            {
                ty_end += 1;
            }
            if ty_end > ty_start {
                let span = self.tokens[ty_start].span.merge(self.tokens[ty_end - 1].span);
                frag.ty = Some(span.text(self.source).trim().to_string());
                end = span.end;
            }
        }
        frag.span = Span::new(start, end);
        self.set_args(&mut frag, args);
        self.push(frag);
    }

    /// `[qualifier] identity[_key] [: T] = value;` at module scope.
    fn identity(&mut self, pos: usize, name: &str, decl_start: usize) {
        let name_span = self.tokens[pos].span;
        let key = name.strip_prefix("identity_").map(str::to_string);
        let mut frag = SourceFragment::new(FragmentKind::Identity, name_span, key);

        if decl_start < pos {
            frag.qualifier = self.tokens[decl_start].node.ident().map(str::to_string);
        }

        let mut cursor = pos + 1;
        let mut eq = None;
        while cursor < self.tokens.len() {
            match self.tokens[cursor].node {
                Lexeme::Semicolon | Lexeme::Eof => break,
                Lexeme::Eq if eq.is_none() => eq = Some(cursor),
                _ => {}
            }
            cursor += 1;
        }
        let semi = cursor.min(self.tokens.len() - 1);

        let ty_end = eq.unwrap_or(semi);
        if self.tokens[pos + 1].node == Lexeme::Colon && ty_end > pos + 2 {
            let span = self.tokens[pos + 2].span.merge(self.tokens[ty_end - 1].span);
            frag.ty = Some(span.text(self.source).trim().to_string());
        }
        if let Some(eq) = eq.filter(|&eq| semi > eq + 1) {
            let span = self.tokens[eq + 1].span.merge(self.tokens[semi - 1].span);
            frag.args.push(span.text(self.source).trim().to_string());
            frag.arg_spans.push(span);
        }

        let start = self.tokens[decl_start.min(pos)].span.start;
        let end = match self.tokens[semi].node {
            Lexeme::Semicolon => self.tokens[semi].span.end,
            _ => {
                self.diagnostics.push(Diagnostic::error(
                    "expected ';' after identity declaration".to_string(),
                    name_span,
                ));
                self.tokens[semi].span.start
            }
        };
        frag.span = Span::new(start, end);
        self.push(frag);
    }

    fn call(&mut self, pos: usize, kind: FragmentKind, name: &str) {
        let name_span = self.tokens[pos].span;
        let key = name.split_once('_').map(|(_, k)| k.to_string());
        let mut frag = SourceFragment::new(kind, name_span, key);
        let Some((args, close)) = self.arguments(pos + 1) else {
            return;
        };
        frag.span = Span::new(name_span.start, self.tokens[close].span.end);
        self.set_args(&mut frag, args);
        self.push(frag);
    }

    /// Balanced scan from the `(` at `open`. Returns the span of each
    /// top-level argument and the index of the closing `)`.
    fn arguments(&mut self, open: usize) -> Option<(Vec<Span>, usize)> {
        if self.tokens.get(open).map(|t| &t.node) != Some(&Lexeme::LParen) {
            return None;
        }
        let mut parens = 1usize;
        let mut args = Vec::new();
        let mut current: Option<Span> = None;
        let mut cursor = open + 1;
        while cursor < self.tokens.len() {
            let tok = &self.tokens[cursor];
            match tok.node {
                Lexeme::LParen => parens += 1,
                Lexeme::RParen => {
                    parens -= 1;
                    if parens == 0 {
                        args.extend(current);
                        return Some((args, cursor));
                    }
                }
                Lexeme::Comma if parens == 1 => {
                    args.push(current.take().unwrap_or(Span::new(tok.span.start, tok.span.start)));
                    cursor += 1;
                    continue;
                }
                Lexeme::Eof => break,
                _ => {}
            }
            current = Some(current.map_or(tok.span, |s| s.merge(tok.span)));
            cursor += 1;
        }
        self.diagnostics.push(Diagnostic::error(
            "unclosed '(' in call".to_string(),
            self.tokens[open].span,
        ));
        None
    }

    fn set_args(&self, frag: &mut SourceFragment, spans: Vec<Span>) {
        frag.args = spans
            .iter()
            .map(|s| s.text(self.source).trim().to_string())
            .collect();
        frag.arg_spans = spans;
    }

    fn push(&mut self, mut frag: SourceFragment) {
        frag.id = self.next_id;
        self.next_id += 1;
        let list = match frag.kind {
            FragmentKind::Entrypoint => &mut self.fragments.entrypoints,
            FragmentKind::Identity => &mut self.fragments.identities,
            FragmentKind::Read => &mut self.fragments.reads,
            FragmentKind::Write => &mut self.fragments.writes,
        };
        list.push(frag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(source: &str) -> SourceFragments {
        let (frags, diags) = extract(source);
        assert!(diags.is_empty(), "unexpected errors: {:?}", diags);
        frags
    }

    #[test]
    fn test_entrypoint() {
        let src = "fn scan(i: i32, swapped: i32) {\n  write(read(i) + read(i + 1));\n}";
        let f = fragments(src);
        assert_eq!(f.entrypoints.len(), 1);
        let ep = &f.entrypoints[0];
        assert_eq!(ep.key(), Some("scan"));
        assert_eq!(ep.args, vec!["i: i32", "swapped: i32"]);
        assert_eq!(ep.span.text(src), "fn scan(i: i32, swapped: i32)");
        assert_eq!(ep.ty, None);
    }

    #[test]
    fn test_entrypoint_return_type() {
        let f = fragments("fn map(i: i32) -> f32 { write(1.0); }");
        assert_eq!(f.entrypoints[0].ty.as_deref(), Some("f32"));
    }

    #[test]
    fn test_helper_functions_are_not_entrypoints() {
        let f = fragments("fn helper(x: f32) -> f32 { return x; }\nfn map(i: i32) { write(helper(1.0)); }");
        assert_eq!(f.entrypoints.len(), 1);
        assert_eq!(f.entrypoints[0].key(), Some("map"));
    }

    #[test]
    fn test_nested_calls() {
        let src = "fn map(i: i32) { write_a(read_b(read(i), f_vec2f).x, 2.0); }";
        let f = fragments(src);
        assert_eq!(f.writes.len(), 1);
        assert_eq!(f.writes[0].key(), Some("a"));
        assert_eq!(f.writes[0].args, vec!["read_b(read(i), f_vec2f).x", "2.0"]);
        assert_eq!(f.reads.len(), 2);
        assert_eq!(f.reads[0].key(), Some("b"));
        assert_eq!(f.reads[0].args, vec!["read(i)", "f_vec2f"]);
        assert_eq!(f.reads[1].key(), None);
        assert_eq!(f.reads[1].span.text(src), "read(i)");
        assert!(f.writes[0].id < f.reads[0].id);
    }

    #[test]
    fn test_empty_call() {
        let f = fragments("fn map(i: i32) { write(read() + 1); }");
        assert!(f.reads[0].args.is_empty());
        assert_eq!(f.writes[0].args, vec!["read() + 1"]);
    }

    #[test]
    fn test_identities() {
        let src = "const identity = 1.0;\nconst identity_pos: vec2f = vec2f(1.0, 2.0);\nlet identity_x = 3;\nfn map(i: i32) { write(1.0); }";
        let f = fragments(src);
        assert_eq!(f.identities.len(), 3);
        let a = &f.identities[0];
        assert_eq!(a.key(), None);
        assert_eq!(a.qualifier.as_deref(), Some("const"));
        assert_eq!(a.args, vec!["1.0"]);
        assert_eq!(a.span.text(src), "const identity = 1.0;");
        let b = f.identity(Some("pos")).unwrap();
        assert_eq!(b.ty.as_deref(), Some("vec2f"));
        assert_eq!(b.args, vec!["vec2f(1.0, 2.0)"]);
        assert_eq!(f.identities[2].qualifier.as_deref(), Some("let"));
    }

    #[test]
    fn test_bare_identity_has_no_qualifier() {
        let f = fragments("identity = 0;\nfn map(i: i32) { write(1); }");
        assert_eq!(f.identities[0].qualifier, None);
    }

    #[test]
    fn test_identity_inside_function_ignored() {
        let f = fragments("fn map(i: i32) { let identity = 2; write(identity); }");
        assert!(f.identities.is_empty());
    }

    #[test]
    fn test_comments_hide_calls() {
        let f = fragments("fn map(i: i32) {\n  // write(2);\n  /* read(i) */\n  write(1);\n}");
        assert_eq!(f.writes.len(), 1);
        assert!(f.reads.is_empty());
    }

    #[test]
    fn test_unclosed_call() {
        let (_, diags) = extract("fn map(i: i32) { write(read(i); }");
        assert!(diags.iter().any(|d| d.message.contains("unclosed")));
    }

    #[test]
    fn test_write_batch_size() {
        let f = fragments("fn map(i: i32) { write(1, 2, 3, 4); }");
        assert_eq!(f.write_batch_size(), 4);
    }
}
