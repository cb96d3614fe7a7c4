//! Hand-rolled lexer for markup with embedded `<% %>` code.
//!
//! The tokenizer is modal: outside tags it produces [`TokenKind::Text`] runs and whole code
//! blocks; after a `<` or `<%@` it switches to tag mode and produces names, `=`, attribute values
//! and structural characters until the tag closes. Server comments (`<%-- --%>`) are skipped and
//! never surface as tokens.

use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};

use crate::{
    error::QuireError,
    markup::token::{CodeKind, Position, Token, TokenKind},
};

/// Lexer failure with the position it was detected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub at: Position,
    pub message: String,
    /// Set for internal consistency faults (misuse of the tokenizer API), as opposed to
    /// malformed input.
    pub internal: bool,
}

impl LexError {
    fn input(at: Position, message: impl Into<String>) -> Self {
        LexError {
            at,
            message: message.into(),
            internal: false,
        }
    }

    fn internal(at: Position, message: impl Into<String>) -> Self {
        LexError {
            at,
            message: message.into(),
            internal: true,
        }
    }
}

impl Display for LexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}): {}", self.at, self.message)
    }
}

/// SHA-256 over every consumed byte. Chunking does not affect the digest.
#[derive(Debug, Clone, Default)]
pub struct RollingChecksum {
    hasher: Sha256,
    digest: Option<String>,
}

impl RollingChecksum {
    pub fn new() -> Self {
        RollingChecksum::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if self.digest.is_some() {
            tracing::warn!("[Tokenizer] ignoring {} bytes fed after finalize", bytes.len());
            return;
        }
        self.hasher.update(bytes);
    }

    /// Finish the digest. Finalizing twice is an internal consistency error.
    pub fn finalize(&mut self) -> Result<String, QuireError> {
        if self.digest.is_some() {
            return Err(QuireError::Internal(
                "content checksum finalized twice".to_string(),
            ));
        }
        let digest = hex::encode(std::mem::take(&mut self.hasher).finalize());
        self.digest = Some(digest.clone());
        Ok(digest)
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Tag,
    Directive,
}

pub struct Tokenizer<'a> {
    src: &'a str,
    idx: usize,
    pos: Position,
    mode: Mode,
    expect_value: bool,
    verbatim: Option<String>,
    pushed: Option<Token>,
    last: Option<Token>,
    checksum: RollingChecksum,
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Tokenizer::with_origin(src, Position::start())
    }

    /// Tokenize `src` as if it started at `origin` in an enclosing document.
    pub fn with_origin(src: &'a str, origin: Position) -> Self {
        Tokenizer {
            src,
            idx: 0,
            pos: origin,
            mode: Mode::Text,
            expect_value: false,
            verbatim: None,
            pushed: None,
            last: None,
            checksum: RollingChecksum::new(),
        }
    }

    pub fn position(&self) -> Position {
        self.pos
    }

    /// Raw source between two positions produced by this tokenizer.
    pub fn slice(&self, begin: &Position, end: &Position) -> &'a str {
        let origin = self.pos.offset - self.idx;
        &self.src[begin.offset - origin..end.offset - origin]
    }

    /// Read the next region raw up to a case-insensitive `</{tag}>`, which is consumed.
    pub fn set_verbatim(&mut self, tag: &str) {
        self.verbatim = Some(tag.to_string());
    }

    pub fn in_tag(&self) -> bool {
        self.mode != Mode::Text
    }

    /// Abandon the current tag and continue lexing text.
    pub fn reset_to_text(&mut self) {
        self.mode = Mode::Text;
        self.expect_value = false;
    }

    /// Return the last token so the next call to [`Tokenizer::next_token`] yields it again.
    /// Only one token can be pending.
    pub fn push_back(&mut self) -> Result<(), LexError> {
        if self.pushed.is_some() {
            return Err(LexError::internal(
                self.pos,
                "push_back called twice without consuming a token",
            ));
        }
        match self.last.take() {
            Some(token) => {
                self.pushed = Some(token);
                Ok(())
            }
            None => Err(LexError::internal(self.pos, "push_back with no token read")),
        }
    }

    /// Fold any unconsumed input into the checksum and finish it.
    pub fn finish(&mut self) -> Result<String, QuireError> {
        self.advance_to(self.src.len());
        self.checksum.finalize()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.digest()
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        if let Some(token) = self.pushed.take() {
            self.last = Some(token.clone());
            return Ok(token);
        }
        let token = if let Some(tag) = self.verbatim.take() {
            self.lex_verbatim(&tag)?
        } else {
            match self.mode {
                Mode::Text => self.lex_text()?,
                Mode::Tag | Mode::Directive => self.lex_tag()?,
            }
        };
        self.last = Some(token.clone());
        Ok(token)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.idx..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.idx >= self.src.len()
    }

    /// Move to byte index `target`, updating the position and the checksum.
    fn advance_to(&mut self, target: usize) {
        if target <= self.idx {
            return;
        }
        let consumed = &self.src[self.idx..target];
        self.checksum.update(consumed.as_bytes());
        for c in consumed.chars() {
            if c == '\n' {
                self.pos.line += 1;
                self.pos.column = 1;
            } else {
                self.pos.column += 1;
            }
        }
        self.pos.offset += target - self.idx;
        self.idx = target;
    }

    fn advance(&mut self, bytes: usize) {
        self.advance_to(self.idx + bytes);
    }

    fn token(&self, kind: TokenKind, text: impl Into<String>, begin: Position) -> Token {
        Token {
            kind,
            text: text.into(),
            begin,
            end: self.pos,
        }
    }

    fn lex_text(&mut self) -> Result<Token, LexError> {
        let begin = self.pos;
        let start = self.idx;
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if rest.starts_with('<') {
                let starts_construct = rest.starts_with("<%")
                    || rest.starts_with("<!--")
                    || rest[1..]
                        .chars()
                        .next()
                        .map(|c| is_name_start(c) || c == '/')
                        .unwrap_or(false);
                if starts_construct {
                    if self.idx > start {
                        break;
                    }
                    return self.lex_construct();
                }
                if rest.starts_with("<!") {
                    // DOCTYPE and other declarations pass through as text.
                    match rest.find('>') {
                        Some(end) => {
                            self.advance(end + 1);
                            continue;
                        }
                        None => {
                            return Err(LexError::input(self.pos, "Unfinished HTML comment/DTD"))
                        }
                    }
                }
            }
            let width = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            self.advance(width);
        }
        if self.idx > start {
            Ok(self.token(TokenKind::Text, &self.src[start..self.idx], begin))
        } else {
            Ok(self.token(TokenKind::Eof, "", begin))
        }
    }

    /// Lex a construct starting at `<` in text mode.
    fn lex_construct(&mut self) -> Result<Token, LexError> {
        let begin = self.pos;
        let rest = self.rest();
        if rest.starts_with("<%--") {
            match rest[4..].find("--%>") {
                Some(end) => {
                    self.advance(4 + end + 4);
                    return self.lex_text();
                }
                None => return Err(LexError::input(begin, "Unterminated server comment.")),
            }
        }
        if rest.starts_with("<%@") {
            self.advance(3);
            self.mode = Mode::Directive;
            self.expect_value = false;
            return Ok(self.token(TokenKind::DirectiveOpen, "<%@", begin));
        }
        if rest.starts_with("<%") {
            let (kind, skip) = match rest[2..].chars().next() {
                Some('=') => (TokenKind::Code(CodeKind::Assign), 3),
                Some(':') => (TokenKind::Code(CodeKind::AssignEncoded), 3),
                Some('#') => (TokenKind::DataBinding, 3),
                _ => (TokenKind::Code(CodeKind::Render), 2),
            };
            return match rest[skip..].find("%>") {
                Some(end) => {
                    let body = rest[skip..skip + end].to_string();
                    self.advance(skip + end + 2);
                    Ok(self.token(kind, body, begin))
                }
                None => Err(LexError::input(begin, "Unterminated <% %> block.")),
            };
        }
        if rest.starts_with("<!--") {
            return match rest[4..].find("-->") {
                Some(end) => {
                    let body = rest[4..4 + end].to_string();
                    self.advance(4 + end + 3);
                    Ok(self.token(TokenKind::HtmlComment, body, begin))
                }
                None => Err(LexError::input(begin, "Unfinished HTML comment/DTD")),
            };
        }
        self.advance(1);
        self.mode = Mode::Tag;
        self.expect_value = false;
        Ok(self.token(TokenKind::Char('<'), "<", begin))
    }

    fn lex_tag(&mut self) -> Result<Token, LexError> {
        let ws = self
            .rest()
            .find(|c: char| !c.is_whitespace())
            .unwrap_or(self.rest().len());
        self.advance(ws);
        let begin = self.pos;
        if self.at_end() {
            return Ok(self.token(TokenKind::Eof, "", begin));
        }
        let rest = self.rest();
        if self.mode == Mode::Directive && rest.starts_with("%>") {
            self.advance(2);
            self.mode = Mode::Text;
            return Ok(self.token(TokenKind::DirectiveClose, "%>", begin));
        }
        if self.expect_value {
            self.expect_value = false;
            return self.lex_value();
        }
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(self.token(TokenKind::Eof, "", begin)),
        };
        if is_name_start(c) {
            let len = rest
                .find(|c: char| !is_name_char(c))
                .unwrap_or(rest.len());
            self.advance(len);
            return Ok(self.token(TokenKind::Identifier, &rest[..len], begin));
        }
        self.advance(c.len_utf8());
        match c {
            '>' => self.mode = Mode::Text,
            '=' => self.expect_value = true,
            _ => {}
        }
        Ok(self.token(TokenKind::Char(c), c.to_string(), begin))
    }

    fn lex_value(&mut self) -> Result<Token, LexError> {
        let begin = self.pos;
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => {
                let len = rest
                    .find(|c: char| {
                        c.is_whitespace() || c == '>' || c == '"' || c == '\''
                    })
                    .unwrap_or(rest.len());
                let len = if self.mode == Mode::Directive {
                    rest[..len].find("%>").unwrap_or(len)
                } else if rest[..len].ends_with('/') && rest[len..].starts_with('>') {
                    len - 1
                } else {
                    len
                };
                self.advance(len);
                return Ok(self.token(
                    TokenKind::AttValue {
                        quote: None,
                        consistent: true,
                    },
                    &rest[..len],
                    begin,
                ));
            }
        };
        let mut consistent = true;
        let mut i = 1;
        loop {
            let tail = &rest[i..];
            if tail.is_empty() {
                return Err(LexError::input(begin, "Unterminated attribute value."));
            }
            if tail.starts_with("<%") {
                match tail.find("%>") {
                    Some(end) => {
                        if tail[..end].contains(quote) {
                            consistent = false;
                        }
                        i += end + 2;
                        continue;
                    }
                    None => return Err(LexError::input(begin, "Unterminated <% %> block.")),
                }
            }
            let c = tail.chars().next().unwrap_or(quote);
            if c == quote {
                let value = &rest[1..i];
                self.advance(i + 1);
                return Ok(self.token(
                    TokenKind::AttValue {
                        quote: Some(quote),
                        consistent,
                    },
                    value,
                    begin,
                ));
            }
            i += c.len_utf8();
        }
    }

    fn lex_verbatim(&mut self, tag: &str) -> Result<Token, LexError> {
        let begin = self.pos;
        let rest = self.rest();
        let lowered = rest.to_ascii_lowercase();
        let needle = format!("</{}", tag.to_ascii_lowercase());
        let mut from = 0;
        while let Some(found) = lowered[from..].find(&needle) {
            let at = from + found;
            let after = &rest[at + needle.len()..];
            let ws = after
                .find(|c: char| !c.is_whitespace())
                .unwrap_or(after.len());
            if after[ws..].starts_with('>') {
                let body = strip_server_comments(&rest[..at]);
                self.advance(at + needle.len() + ws + 1);
                self.mode = Mode::Text;
                return Ok(self.token(TokenKind::Text, body, begin));
            }
            from = at + needle.len();
        }
        Err(LexError::input(
            begin,
            format!("Expecting </{tag}> and got EOF."),
        ))
    }
}

/// Drop `<%-- --%>` regions. An unterminated comment swallows the rest of the text.
pub fn strip_server_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<%--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("--%>") {
            Some(end) => rest = &rest[start + 4 + end + 4..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, String)> {
        let mut tokenizer = Tokenizer::new(src);
        let mut out = Vec::new();
        loop {
            let token = tokenizer.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push((token.kind, token.text));
        }
        out
    }

    #[test]
    fn test_text_and_tag() {
        let tokens = kinds("Hi <b class=\"x\">there</b>");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "Hi ".to_string()),
                (TokenKind::Char('<'), "<".to_string()),
                (TokenKind::Identifier, "b".to_string()),
                (TokenKind::Identifier, "class".to_string()),
                (TokenKind::Char('='), "=".to_string()),
                (
                    TokenKind::AttValue {
                        quote: Some('"'),
                        consistent: true
                    },
                    "x".to_string()
                ),
                (TokenKind::Char('>'), ">".to_string()),
                (TokenKind::Text, "there".to_string()),
                (TokenKind::Char('<'), "<".to_string()),
                (TokenKind::Char('/'), "/".to_string()),
                (TokenKind::Identifier, "b".to_string()),
                (TokenKind::Char('>'), ">".to_string()),
            ]
        );
    }

    #[test]
    fn test_code_blocks() {
        let tokens = kinds("<% a(); %><%= b %><%: c %><%# d %>");
        let found: Vec<TokenKind> = tokens.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            found,
            vec![
                TokenKind::Code(CodeKind::Render),
                TokenKind::Code(CodeKind::Assign),
                TokenKind::Code(CodeKind::AssignEncoded),
                TokenKind::DataBinding,
            ]
        );
        assert_eq!(tokens[1].1, " b ");
    }

    #[test]
    fn test_directive_tokens() {
        let tokens = kinds("<%@ Page Language=\"C#\" %>x");
        assert_eq!(tokens[0].0, TokenKind::DirectiveOpen);
        assert_eq!(tokens[1], (TokenKind::Identifier, "Page".to_string()));
        assert_eq!(tokens[2].0, TokenKind::Identifier);
        assert_eq!(tokens[4].1, "C#");
        assert_eq!(tokens[5].0, TokenKind::DirectiveClose);
        assert_eq!(tokens[6], (TokenKind::Text, "x".to_string()));
    }

    #[test]
    fn test_server_comments_stripped() {
        let tokens = kinds("a<%-- <b>hidden</b> --%>b");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "a".to_string()),
                (TokenKind::Text, "b".to_string()),
            ]
        );
        let mut tokenizer = Tokenizer::new("a<%-- never closed");
        assert_eq!(tokenizer.next_token().unwrap().text, "a");
        let err = tokenizer.next_token().unwrap_err();
        assert_eq!(err.message, "Unterminated server comment.");
    }

    #[test]
    fn test_lone_angle_is_text() {
        let tokens = kinds("a < b <!DOCTYPE html>");
        assert_eq!(tokens, vec![(TokenKind::Text, "a < b <!DOCTYPE html>".to_string())]);
    }

    #[test]
    fn test_positions() {
        let mut tokenizer = Tokenizer::new("ab\ncd<x>");
        let text = tokenizer.next_token().unwrap();
        assert_eq!(text.begin, Position::start());
        let open = tokenizer.next_token().unwrap();
        assert_eq!(
            open.begin,
            Position {
                offset: 5,
                line: 2,
                column: 3
            }
        );
    }

    #[test]
    fn test_single_push_back() {
        let mut tokenizer = Tokenizer::new("<a b>");
        let first = tokenizer.next_token().unwrap();
        tokenizer.push_back().unwrap();
        let err = tokenizer.push_back().unwrap_err();
        assert!(err.internal);
        assert_eq!(tokenizer.next_token().unwrap(), first);
        assert_eq!(tokenizer.next_token().unwrap().text, "a");
    }

    #[test]
    fn test_quote_alternation() {
        let tokens = kinds("<a t='<%# Eval(\"x\") %>' u=\"<%# Eval(\"y\") %>\">");
        assert_eq!(
            tokens[4].0,
            TokenKind::AttValue {
                quote: Some('\''),
                consistent: true
            }
        );
        assert_eq!(
            tokens[7].0,
            TokenKind::AttValue {
                quote: Some('"'),
                consistent: false
            }
        );
        assert_eq!(tokens[7].1, "<%# Eval(\"y\") %>");
    }

    #[test]
    fn test_unquoted_and_self_closing() {
        let tokens = kinds("<x a=1 b=two/>");
        assert_eq!(tokens[4].1, "1");
        assert_eq!(tokens[7].1, "two");
        assert_eq!(tokens[8].0, TokenKind::Char('/'));
        assert_eq!(tokens[9].0, TokenKind::Char('>'));
    }

    #[test]
    fn test_verbatim() {
        let mut tokenizer = Tokenizer::new("var x = '<b>'; <%-- c --%></SCRIPT >tail");
        tokenizer.set_verbatim("script");
        let body = tokenizer.next_token().unwrap();
        assert_eq!(body.kind, TokenKind::Text);
        assert_eq!(body.text, "var x = '<b>'; ");
        assert_eq!(tokenizer.next_token().unwrap().text, "tail");

        let mut tokenizer = Tokenizer::new("never closed </scripts>");
        tokenizer.set_verbatim("script");
        let err = tokenizer.next_token().unwrap_err();
        assert_eq!(err.message, "Expecting </script> and got EOF.");
    }

    #[test]
    fn test_checksum_chunking() {
        let src = "<%@ Page %>\n<p>Hello <%= name %></p>";
        let mut tokenizer = Tokenizer::new(src);
        while tokenizer.next_token().unwrap().kind != TokenKind::Eof {}
        let digest = tokenizer.finish().unwrap();

        for chunk in [1, 3, 7, src.len()] {
            let mut checksum = RollingChecksum::new();
            for piece in src.as_bytes().chunks(chunk) {
                checksum.update(piece);
            }
            assert_eq!(checksum.finalize().unwrap(), digest);
        }
        assert!(tokenizer.finish().is_err());
    }
}
