use crate::diagnostic::Diagnostic;
use crate::span::{Span, Spanned};

/// Lexical units of kernel source. Only the structure the fragment scanner
/// needs is distinguished; every other operator is carried as `Op`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lexeme {
    Ident(String),
    Number(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Eq,
    Arrow,
    Op(String),
    Eof,
}

impl Lexeme {
    pub fn ident(&self) -> Option<&str> {
        match self {
            Lexeme::Ident(s) => Some(s),
            _ => None,
        }
    }
}

pub struct Lexer<'src> {
    source: &'src [u8],
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> (Vec<Spanned<Lexeme>>, Vec<Diagnostic>) {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let is_eof = tok.node == Lexeme::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        (tokens, self.diagnostics)
    }

    fn next_token(&mut self) -> Spanned<Lexeme> {
        self.skip_whitespace_and_comments();

        if self.pos >= self.source.len() {
            return self.make_token(Lexeme::Eof, self.pos, self.pos);
        }

        let start = self.pos;
        let ch = self.source[self.pos];

        if is_ident_start(ch) {
            return self.scan_ident();
        }

        if ch.is_ascii_digit() || (ch == b'.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())) {
            return self.scan_number();
        }

        self.scan_symbol(start)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.source.len() && self.source[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }

            if self.starts_with(b"//") {
                while self.pos < self.source.len() && self.source[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }

            // Block comments nest in WGSL.
            if self.starts_with(b"/*") {
                let start = self.pos;
                let mut depth = 0usize;
                while self.pos < self.source.len() {
                    if self.starts_with(b"/*") {
                        depth += 1;
                        self.pos += 2;
                    } else if self.starts_with(b"*/") {
                        depth -= 1;
                        self.pos += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        self.pos += 1;
                    }
                }
                if depth > 0 {
                    self.diagnostics.push(
                        Diagnostic::error(
                            "unterminated block comment".to_string(),
                            Span::new(start as u32, (start + 2) as u32),
                        )
                        .with_help("close the comment with '*/'".to_string()),
                    );
                }
                continue;
            }

            break;
        }
    }

    fn scan_ident(&mut self) -> Spanned<Lexeme> {
        let start = self.pos;
        while self.pos < self.source.len() && is_ident_continue(self.source[self.pos]) {
            self.pos += 1;
        }
        let text = self.text(start, self.pos);
        self.make_token(Lexeme::Ident(text), start, self.pos)
    }

    /// Decimal, hex and float literals with optional exponent and suffix.
    fn scan_number(&mut self) -> Spanned<Lexeme> {
        let start = self.pos;
        let hex = self.starts_with(b"0x") || self.starts_with(b"0X");
        if hex {
            self.pos += 2;
        }
        while self.pos < self.source.len() {
            let c = self.source[self.pos];
            let exponent = if hex { b"pP" } else { b"eE" };
            if exponent.contains(&c) && matches!(self.peek_at(1), Some(b'+' | b'-')) {
                self.pos += 2;
            } else if c.is_ascii_alphanumeric() || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = self.text(start, self.pos);
        self.make_token(Lexeme::Number(text), start, self.pos)
    }

    fn scan_symbol(&mut self, start: usize) -> Spanned<Lexeme> {
        const PAIRS: [&[u8; 2]; 16] = [
            b"->", b"==", b"!=", b"<=", b">=", b"&&", b"||", b"<<", b">>", b"+=", b"-=", b"*=",
            b"/=", b"++", b"--", b"%=",
        ];
        if let Some(pair) = PAIRS.iter().find(|p| self.starts_with(&p[..])) {
            self.pos += 2;
            let token = if *pair == b"->" {
                Lexeme::Arrow
            } else {
                Lexeme::Op(self.text(start, self.pos))
            };
            return self.make_token(token, start, self.pos);
        }

        let ch = self.source[self.pos];
        self.pos += 1;
        let token = match ch {
            b'(' => Lexeme::LParen,
            b')' => Lexeme::RParen,
            b'{' => Lexeme::LBrace,
            b'}' => Lexeme::RBrace,
            b'[' => Lexeme::LBracket,
            b']' => Lexeme::RBracket,
            b',' => Lexeme::Comma,
            b':' => Lexeme::Colon,
            b';' => Lexeme::Semicolon,
            b'=' => Lexeme::Eq,
            _ => {
                // Keep multi-byte characters whole so spans stay on char
                // boundaries.
                while self.pos < self.source.len() && (self.source[self.pos] & 0xC0) == 0x80 {
                    self.pos += 1;
                }
                Lexeme::Op(self.text(start, self.pos))
            }
        };
        self.make_token(token, start, self.pos)
    }

    fn starts_with(&self, pattern: &[u8]) -> bool {
        self.source[self.pos..].starts_with(pattern)
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn text(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.source[start..end]).into_owned()
    }

    fn make_token(&self, token: Lexeme, start: usize, end: usize) -> Spanned<Lexeme> {
        Spanned::new(token, Span::new(start as u32, end as u32))
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Lexeme> {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty(), "unexpected errors: {:?}", diags);
        tokens.into_iter().map(|t| t.node).collect()
    }

    #[test]
    fn test_entrypoint_tokens() {
        let tokens = lex("fn map(i: i32) { write(i); }");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Ident("fn".into()),
                Lexeme::Ident("map".into()),
                Lexeme::LParen,
                Lexeme::Ident("i".into()),
                Lexeme::Colon,
                Lexeme::Ident("i32".into()),
                Lexeme::RParen,
                Lexeme::LBrace,
                Lexeme::Ident("write".into()),
                Lexeme::LParen,
                Lexeme::Ident("i".into()),
                Lexeme::RParen,
                Lexeme::Semicolon,
                Lexeme::RBrace,
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = lex("-> == != <= >= && || << >> = < - @");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Arrow,
                Lexeme::Op("==".into()),
                Lexeme::Op("!=".into()),
                Lexeme::Op("<=".into()),
                Lexeme::Op(">=".into()),
                Lexeme::Op("&&".into()),
                Lexeme::Op("||".into()),
                Lexeme::Op("<<".into()),
                Lexeme::Op(">>".into()),
                Lexeme::Eq,
                Lexeme::Op("<".into()),
                Lexeme::Op("-".into()),
                Lexeme::Op("@".into()),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("0 42u 1.5 .5 1e-3 2.0f 0xFFu");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Number("0".into()),
                Lexeme::Number("42u".into()),
                Lexeme::Number("1.5".into()),
                Lexeme::Number(".5".into()),
                Lexeme::Number("1e-3".into()),
                Lexeme::Number("2.0f".into()),
                Lexeme::Number("0xFFu".into()),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = lex("a // read(i)\n/* write(1) /* nested */ still */ b");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Ident("a".into()),
                Lexeme::Ident("b".into()),
                Lexeme::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_comment() {
        let (_, diags) = Lexer::new("a /* never closed").tokenize();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("unterminated"));
    }

    #[test]
    fn test_spans() {
        let (tokens, _) = Lexer::new("  read_pos(i)").tokenize();
        assert_eq!(tokens[0].span, Span::new(2, 10));
        assert_eq!(tokens[1].span, Span::new(10, 11));
    }
}
