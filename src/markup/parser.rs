//! Pull-based markup parser.
//!
//! [`Parser`] is an iterator of [`ParseEvent`]s. It knows nothing about components or trees; the
//! tree builder consumes its events. Errors end the sequence: after an `Err` item the iterator
//! yields `None`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

use crate::{
    error::QuireError,
    markup::{
        token::{CodeKind, Position, Token, TokenKind},
        tokenizer::{LexError, Tokenizer},
        tree::{IncludeKind, ParseLocation},
    },
    paths::LogicalPath,
};

static INCLUDE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^\s*#include\s+(file|virtual)\s*=\s*(?:"([^"]*)"|'([^']*)'|(\S*))\s*$"#)
        .expect("include pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    /// `None` for bare attributes such as `disabled`.
    pub value: Option<String>,
    pub quote: Option<char>,
    pub location: ParseLocation,
    /// Location of the first character of the value.
    pub value_location: ParseLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagData {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub runat_server: bool,
    pub self_closing: bool,
    pub location: ParseLocation,
}

impl TagData {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(|a| a.value.as_deref())
    }

    /// Source form of the opening tag.
    pub fn to_markup(&self) -> String {
        let mut out = format!("<{}", self.name);
        for attr in self.attributes.iter() {
            out.push(' ');
            out.push_str(&attr.name);
            if let Some(value) = &attr.value {
                let quote = attr.quote.map(String::from).unwrap_or_default();
                out.push_str(&format!("={quote}{value}{quote}"));
            }
        }
        out.push_str(if self.self_closing { " />" } else { ">" });
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Text {
        text: String,
        location: ParseLocation,
    },
    TagOpen(TagData),
    SelfClosingTag(TagData),
    TagClose {
        name: String,
        location: ParseLocation,
    },
    /// `name` is `None` for an anonymous `<%@ attr=.. %>`, which addresses the main directive.
    Directive {
        name: Option<String>,
        attributes: Vec<Attribute>,
        location: ParseLocation,
    },
    CodeRender {
        code: String,
        kind: CodeKind,
        location: ParseLocation,
    },
    DataBinding {
        expression: String,
        location: ParseLocation,
    },
    Include {
        path: String,
        kind: IncludeKind,
        location: ParseLocation,
    },
    Comment {
        text: String,
        location: ParseLocation,
    },
}

impl ParseEvent {
    pub fn location(&self) -> &ParseLocation {
        match self {
            ParseEvent::Text { location, .. }
            | ParseEvent::TagClose { location, .. }
            | ParseEvent::Directive { location, .. }
            | ParseEvent::CodeRender { location, .. }
            | ParseEvent::DataBinding { location, .. }
            | ParseEvent::Include { location, .. }
            | ParseEvent::Comment { location, .. } => location,
            ParseEvent::TagOpen(tag) | ParseEvent::SelfClosingTag(tag) => &tag.location,
        }
    }
}

const MALFORMED_SERVER_TAG: &str = "The server tag is not well formed.";

pub struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    path: LogicalPath,
    pending: VecDeque<ParseEvent>,
    verbatim_tag: Option<String>,
    finished: bool,
    checksum: Option<String>,
}

impl<'a> Parser<'a> {
    pub fn new(path: LogicalPath, src: &'a str) -> Self {
        Parser::with_origin(path, src, Position::start())
    }

    /// Parse a fragment of a larger document, typically an attribute value, reporting locations
    /// relative to that document.
    pub fn nested(src: &'a str, origin: &ParseLocation) -> Self {
        Parser::with_origin(origin.path.clone(), src, origin.begin)
    }

    fn with_origin(path: LogicalPath, src: &'a str, origin: Position) -> Self {
        Parser {
            tokenizer: Tokenizer::with_origin(src, origin),
            path,
            pending: VecDeque::new(),
            verbatim_tag: None,
            finished: false,
            checksum: None,
        }
    }

    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    /// Hex SHA-256 of the parsed text, available once the sequence is exhausted.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    fn location(&self, begin: Position, end: Position) -> ParseLocation {
        ParseLocation::new(self.path.clone(), begin, end)
    }

    fn error_at(&self, at: Position, message: impl Into<String>) -> QuireError {
        QuireError::parse(self.location(at, at), message)
    }

    fn lex_error(&self, err: LexError) -> QuireError {
        if err.internal {
            QuireError::Internal(format!("{}{}", self.path, err))
        } else {
            self.error_at(err.at, err.message)
        }
    }

    fn next_token(&mut self) -> Result<Token, QuireError> {
        self.tokenizer
            .next_token()
            .map_err(|e| self.lex_error(e))
    }

    fn push_back(&mut self) -> Result<(), QuireError> {
        self.tokenizer.push_back().map_err(|e| self.lex_error(e))
    }

    fn step(&mut self) -> Result<Option<ParseEvent>, QuireError> {
        if let Some(tag) = self.verbatim_tag.take() {
            self.tokenizer.set_verbatim(&tag);
            let body = self.next_token()?;
            let close_location = self.location(body.end, self.tokenizer.position());
            self.pending.push_back(ParseEvent::TagClose {
                name: tag,
                location: close_location,
            });
            if !body.text.is_empty() {
                return Ok(Some(ParseEvent::Text {
                    text: body.text,
                    location: self.location(body.begin, body.end),
                }));
            }
            return Ok(self.pending.pop_front());
        }

        let token = self.next_token()?;
        let location = self.location(token.begin, token.end);
        let event = match token.kind {
            TokenKind::Eof => {
                self.checksum = Some(self.tokenizer.finish()?);
                return Ok(None);
            }
            TokenKind::Text => ParseEvent::Text {
                text: token.text,
                location,
            },
            TokenKind::Code(kind) => ParseEvent::CodeRender {
                code: token.text,
                kind,
                location,
            },
            TokenKind::DataBinding => ParseEvent::DataBinding {
                expression: token.text,
                location,
            },
            TokenKind::HtmlComment => self.comment_or_include(token.text, location)?,
            TokenKind::DirectiveOpen => self.parse_directive(token.begin)?,
            TokenKind::Char('<') => self.parse_tag(token.begin)?,
            other => {
                return Err(QuireError::Internal(format!(
                    "{location}: unexpected {other:?} outside of a tag"
                )))
            }
        };
        Ok(Some(event))
    }

    fn comment_or_include(
        &self,
        body: String,
        location: ParseLocation,
    ) -> Result<ParseEvent, QuireError> {
        match INCLUDE_REGEX.captures(&body) {
            Some(caps) => {
                let kind = if caps[1].eq_ignore_ascii_case("virtual") {
                    IncludeKind::Virtual
                } else {
                    IncludeKind::File
                };
                let path = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                if path.is_empty() {
                    return Err(QuireError::parse(location, "Empty file name."));
                }
                Ok(ParseEvent::Include {
                    path,
                    kind,
                    location,
                })
            }
            None => Ok(ParseEvent::Comment {
                text: body,
                location,
            }),
        }
    }

    /// Read `name[=value]` pairs until a token that is not an identifier, which is returned.
    fn parse_attributes(&mut self) -> Result<(Vec<Attribute>, Token, bool), QuireError> {
        let mut attributes = Vec::new();
        let mut consistent = true;
        loop {
            let token = self.next_token()?;
            if token.kind != TokenKind::Identifier {
                return Ok((attributes, token, consistent));
            }
            let equals = self.next_token()?;
            if !equals.is_char('=') {
                self.push_back()?;
                attributes.push(Attribute {
                    name: token.text,
                    value: None,
                    quote: None,
                    location: self.location(token.begin, token.end),
                    value_location: self.location(token.end, token.end),
                });
                continue;
            }
            let value = self.next_token()?;
            let (quote, value_consistent) = match value.kind {
                TokenKind::AttValue { quote, consistent } => (quote, consistent),
                _ => return Err(self.error_at(value.begin, "Expecting ATTVALUE.")),
            };
            consistent &= value_consistent;
            let mut value_begin = value.begin;
            if quote.is_some() {
                value_begin.offset += 1;
                value_begin.column += 1;
            }
            attributes.push(Attribute {
                name: token.text,
                value: Some(value.text),
                quote,
                location: self.location(token.begin, value.end),
                value_location: self.location(value_begin, value.end),
            });
        }
    }

    fn parse_directive(&mut self, begin: Position) -> Result<ParseEvent, QuireError> {
        // A leading identifier without '=' names the directive.
        let mut name = None;
        let first = self.next_token()?;
        if first.kind == TokenKind::Identifier {
            let next = self.next_token()?;
            self.push_back()?;
            if next.is_char('=') {
                // `first` is an attribute name; replay it through the attribute loop below.
                return self.finish_directive(begin, None, Some(first));
            }
            name = Some(first.text);
        } else {
            self.push_back()?;
        }
        self.finish_directive(begin, name, None)
    }

    fn finish_directive(
        &mut self,
        begin: Position,
        name: Option<String>,
        leading: Option<Token>,
    ) -> Result<ParseEvent, QuireError> {
        let mut attributes = Vec::new();
        if let Some(attr_name) = leading {
            let _equals = self.next_token()?;
            let value = self.next_token()?;
            let quote = match value.kind {
                TokenKind::AttValue { quote, .. } => quote,
                _ => return Err(self.error_at(value.begin, "Expecting ATTVALUE.")),
            };
            attributes.push(Attribute {
                name: attr_name.text,
                value: Some(value.text),
                quote,
                location: self.location(attr_name.begin, value.end),
                value_location: self.location(value.begin, value.end),
            });
        }
        let (rest, terminator, _) = self.parse_attributes()?;
        attributes.extend(rest);
        if terminator.kind != TokenKind::DirectiveClose {
            self.tokenizer.reset_to_text();
            return Err(self.error_at(terminator.begin, MALFORMED_SERVER_TAG));
        }
        check_duplicates(&attributes)?;
        if let Some(bare) = attributes.iter().find(|a| a.value.is_none()) {
            return Err(QuireError::parse(
                bare.location.clone(),
                format!("The directive attribute '{}' has no value.", bare.name),
            ));
        }
        Ok(ParseEvent::Directive {
            name,
            attributes,
            location: self.location(begin, terminator.end),
        })
    }

    fn parse_tag(&mut self, begin: Position) -> Result<ParseEvent, QuireError> {
        let first = self.next_token()?;
        if first.is_char('/') {
            let name = self.next_token()?;
            if name.kind != TokenKind::Identifier {
                self.tokenizer.reset_to_text();
                return Err(self.error_at(name.begin, "Expecting TAGNAME."));
            }
            let close = self.next_token()?;
            if !close.is_char('>') {
                self.tokenizer.reset_to_text();
                return Err(self.error_at(close.begin, "Expecting '>'."));
            }
            return Ok(ParseEvent::TagClose {
                name: name.text,
                location: self.location(begin, close.end),
            });
        }
        if first.kind != TokenKind::Identifier {
            self.tokenizer.reset_to_text();
            return Err(self.error_at(first.begin, "Expecting TAGNAME."));
        }

        let (attributes, mut terminator, consistent) = self.parse_attributes()?;
        let runat: Vec<&Attribute> = attributes
            .iter()
            .filter(|a| a.name.eq_ignore_ascii_case("runat"))
            .collect();
        let runat_server = runat.iter().any(|a| {
            a.value
                .as_deref()
                .map(|v| v.trim().eq_ignore_ascii_case("server"))
                .unwrap_or(false)
        });
        if runat.len() > 1 {
            return Err(QuireError::parse(
                runat[1].location.clone(),
                "The 'runat' attribute is specified more than once.",
            ));
        }

        let mut self_closing = false;
        if terminator.is_char('/') {
            terminator = self.next_token()?;
            self_closing = terminator.is_char('>');
        }
        if !terminator.is_char('>') {
            if runat_server {
                return Err(self.error_at(terminator.begin, MALFORMED_SERVER_TAG));
            }
            // Not a tag after all: hand the raw source back as text.
            self.tokenizer.reset_to_text();
            let text = self
                .tokenizer
                .slice(&begin, &terminator.end)
                .to_string();
            return Ok(ParseEvent::Text {
                text,
                location: self.location(begin, terminator.end),
            });
        }
        if runat_server {
            if !consistent {
                return Err(self.error_at(begin, MALFORMED_SERVER_TAG));
            }
            check_duplicates(&attributes)?;
        }

        let tag = TagData {
            name: first.text,
            attributes,
            runat_server,
            self_closing,
            location: self.location(begin, terminator.end),
        };
        if self_closing {
            return Ok(ParseEvent::SelfClosingTag(tag));
        }
        if tag.name.eq_ignore_ascii_case("script") {
            self.verbatim_tag = Some(tag.name.clone());
        }
        Ok(ParseEvent::TagOpen(tag))
    }
}

fn check_duplicates(attributes: &[Attribute]) -> Result<(), QuireError> {
    for (idx, attr) in attributes.iter().enumerate() {
        if attributes[..idx]
            .iter()
            .any(|prev| prev.name.eq_ignore_ascii_case(&attr.name))
        {
            return Err(QuireError::parse(
                attr.location.clone(),
                format!("The '{}' attribute is specified more than once.", attr.name),
            ));
        }
    }
    Ok(())
}

impl Iterator for Parser<'_> {
    type Item = Result<ParseEvent, QuireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.pending.pop_front() {
            return Some(Ok(event));
        }
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Parse a whole document eagerly.
pub fn parse_all(path: LogicalPath, src: &str) -> Result<(Vec<ParseEvent>, String), QuireError> {
    let mut parser = Parser::new(path, src);
    let events = parser.by_ref().collect::<Result<Vec<_>, _>>()?;
    let checksum = parser
        .checksum()
        .map(str::to_string)
        .ok_or_else(|| QuireError::Internal("parser stopped before end of input".to_string()))?;
    Ok((events, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(src: &str) -> Vec<ParseEvent> {
        parse_all(LogicalPath::new("/t.page"), src).unwrap().0
    }

    fn error(src: &str) -> String {
        match parse_all(LogicalPath::new("/t.page"), src) {
            Err(QuireError::Parse(err)) => err.message,
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_document() {
        let evs = events("<%@ Page Language=\"C#\" %><p class=a>Hi <%= name %></p>");
        assert!(matches!(&evs[0], ParseEvent::Directive { name: Some(n), attributes, .. } if n == "Page" && attributes.len() == 1));
        match &evs[1] {
            ParseEvent::TagOpen(tag) => {
                assert_eq!(tag.name, "p");
                assert_eq!(tag.attribute_value("CLASS"), Some("a"));
                assert!(!tag.runat_server);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&evs[2], ParseEvent::Text { text, .. } if text == "Hi "));
        assert!(matches!(&evs[3], ParseEvent::CodeRender { kind: CodeKind::Assign, code, .. } if code.trim() == "name"));
        assert!(matches!(&evs[4], ParseEvent::TagClose { name, .. } if name == "p"));
        assert_eq!(evs.len(), 5);
    }

    #[test]
    fn test_anonymous_directive() {
        let evs = events("<%@ Language=\"VB\" Debug=true %>");
        match &evs[0] {
            ParseEvent::Directive { name, attributes, .. } => {
                assert!(name.is_none());
                assert_eq!(attributes.len(), 2);
                assert_eq!(attributes[1].value.as_deref(), Some("true"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_self_closing_server_tag() {
        let evs = events("<x:Widget runat=\"server\" id=\"w1\"/>");
        match &evs[0] {
            ParseEvent::SelfClosingTag(tag) => {
                assert!(tag.runat_server);
                assert_eq!(tag.attribute_value("id"), Some("w1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_includes_and_comments() {
        let evs = events("<!-- #include file=\"a.inc\" --><!-- plain --><!-- #INCLUDE virtual='/b.inc' -->");
        assert!(matches!(&evs[0], ParseEvent::Include { path, kind: IncludeKind::File, .. } if path == "a.inc"));
        assert!(matches!(&evs[1], ParseEvent::Comment { text, .. } if text == " plain "));
        assert!(matches!(&evs[2], ParseEvent::Include { path, kind: IncludeKind::Virtual, .. } if path == "/b.inc"));
        assert_eq!(error("<!-- #include file=\"\" -->"), "Empty file name.");
    }

    #[test]
    fn test_script_is_verbatim() {
        let evs = events("<script runat=\"server\">if (a < b) { x(\"</p>\"); }</script>after");
        assert!(matches!(&evs[0], ParseEvent::TagOpen(tag) if tag.runat_server));
        assert!(matches!(&evs[1], ParseEvent::Text { text, .. } if text == "if (a < b) { x(\"</p>\"); }"));
        assert!(matches!(&evs[2], ParseEvent::TagClose { name, .. } if name == "script"));
        assert!(matches!(&evs[3], ParseEvent::Text { text, .. } if text == "after"));
        assert_eq!(
            error("<script>never closed"),
            "Expecting </script> and got EOF."
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(error("<% open"), "Unterminated <% %> block.");
        assert_eq!(error("a </ >"), "Expecting TAGNAME.");
        assert_eq!(error("</p x>"), "Expecting '>'.");
        assert_eq!(
            error("<x:W runat=server runat=server />"),
            "The 'runat' attribute is specified more than once."
        );
        assert_eq!(
            error("<x:W runat=server text=a TEXT=b />"),
            "The 'TEXT' attribute is specified more than once."
        );
        assert_eq!(error("<x:W runat=server"), MALFORMED_SERVER_TAG);
        assert_eq!(
            error("<x:W runat=server t=\"<%# F(\"a\") %>\" />"),
            MALFORMED_SERVER_TAG
        );
        assert_eq!(error("<%@ Page x=1 "), MALFORMED_SERVER_TAG);
    }

    #[test]
    fn test_unterminated_plain_tag_is_text() {
        let evs = events("a <b c=d");
        assert!(matches!(&evs[0], ParseEvent::Text { text, .. } if text == "a "));
        assert!(matches!(&evs[1], ParseEvent::Text { text, .. } if text == "<b c=d"));
    }

    #[test]
    fn test_nested_attribute_parse() {
        let outer = events("<a href=\"/x?id=<%= id %>&y\">");
        let attr = match &outer[0] {
            ParseEvent::TagOpen(tag) => tag.attribute("href").unwrap().clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(attr.value_location.begin.column, 10);
        let nested: Vec<ParseEvent> = Parser::nested(attr.value.as_deref().unwrap(), &attr.value_location)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(nested.len(), 3);
        assert!(matches!(&nested[0], ParseEvent::Text { text, .. } if text == "/x?id="));
        match &nested[1] {
            ParseEvent::CodeRender { kind, location, .. } => {
                assert_eq!(*kind, CodeKind::Assign);
                assert_eq!(location.begin.column, 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_idempotent() {
        let src = "<%@ Page %>\n<div runat=server id=d>\n<%# Item %>\n</div>";
        let first = parse_all(LogicalPath::new("/t.page"), src).unwrap();
        let second = parse_all(LogicalPath::new("/t.page"), src).unwrap();
        assert_eq!(first, second);
    }
}
