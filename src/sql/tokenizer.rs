//! Hand-written SQL lexer.
//!
//! Deliberately not a grammar: downstream consumers only need identifier
//! positions, comment bodies and `$n` parameters, and must tolerate the
//! dialect drift between Postgres and Redshift. Every token carries its byte
//! span in the source so rewrites can preserve the rest of the text exactly.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// Double-quoted identifier, original case preserved.
    Quoted,
    /// Single-quoted string literal, `''` escape included.
    Str,
    Number,
    Punct,
    Whitespace,
    /// `-- ...` to end of line (newline excluded).
    LineComment,
    /// `/* ... */`, not nested; an unterminated comment runs to end of input.
    BlockComment,
    /// Positional parameter `$n`; the index is stored alongside.
    Param(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    /// Comments and whitespace: skipped by every consumer except the
    /// directive parser.
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::Quoted)
    }

    /// Identifier text as compared: quoted identifiers lose their quotes
    /// (with `""` unescaped), unquoted ones are returned verbatim.
    pub fn ident_text(&self, src: &str) -> String {
        let raw = self.text(src);
        match self.kind {
            TokenKind::Quoted => raw
                .trim_start_matches('"')
                .trim_end_matches('"')
                .replace("\"\"", "\""),
            _ => raw.to_string(),
        }
    }
}

pub fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let b = bytes[pos];

        let kind = if b.is_ascii_whitespace() {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            TokenKind::Whitespace
        } else if b == b'-' && bytes.get(pos + 1) == Some(&b'-') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            TokenKind::LineComment
        } else if b == b'/' && bytes.get(pos + 1) == Some(&b'*') {
            pos += 2;
            loop {
                match bytes.get(pos) {
                    None => break,
                    Some(b'*') if bytes.get(pos + 1) == Some(&b'/') => {
                        pos += 2;
                        break;
                    }
                    Some(_) => pos += 1,
                }
            }
            TokenKind::BlockComment
        } else if b == b'"' {
            pos += 1;
            loop {
                match bytes.get(pos) {
                    None => break,
                    Some(b'"') if bytes.get(pos + 1) == Some(&b'"') => pos += 2,
                    Some(b'"') => {
                        pos += 1;
                        break;
                    }
                    Some(_) => pos += 1,
                }
            }
            TokenKind::Quoted
        } else if b == b'\'' {
            pos += 1;
            loop {
                match bytes.get(pos) {
                    None => break,
                    Some(b'\'') if bytes.get(pos + 1) == Some(&b'\'') => pos += 2,
                    Some(b'\'') => {
                        pos += 1;
                        break;
                    }
                    Some(_) => pos += 1,
                }
            }
            TokenKind::Str
        } else if b == b'$' && bytes.get(pos + 1).is_some_and(|c| c.is_ascii_digit()) {
            pos += 1;
            let digits_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            let index: u32 = src[digits_start..pos].parse().unwrap_or(u32::MAX);
            TokenKind::Param(index)
        } else if b.is_ascii_digit() {
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if bytes.get(pos) == Some(&b'.') && bytes.get(pos + 1).is_some_and(|c| c.is_ascii_digit())
            {
                pos += 1;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            TokenKind::Number
        } else if is_word_start(b) {
            while pos < bytes.len() && is_word_continue(bytes[pos]) {
                pos += 1;
            }
            TokenKind::Word
        } else {
            // Multi-byte UTF-8 sequences land here one scalar at a time.
            pos += src[pos..].chars().next().map_or(1, |c| c.len_utf8());
            TokenKind::Punct
        };

        tokens.push(Token {
            kind,
            start,
            end: pos,
        });
    }

    tokens
}

/// Highest `$n` index in the script, 0 when it uses none.
pub fn max_param(tokens: &[Token]) -> u32 {
    tokens
        .iter()
        .filter_map(|t| match t.kind {
            TokenKind::Param(n) => Some(n),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_word_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}
