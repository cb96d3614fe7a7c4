use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Position in a source document. Lines and columns are 1-based, `offset` is a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn start() -> Self {
        Position {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::start()
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.line, self.column)
    }
}

/// Flavor of an embedded `<% %>` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeKind {
    /// `<% code %>`: statements spliced into the render method.
    Render,
    /// `<%= expr %>`: expression written to the output.
    Assign,
    /// `<%: expr %>`: expression written to the output, HTML encoded.
    AssignEncoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// Literal text outside of any tag. Also the body of a verbatim region.
    Text,
    /// Single structural character inside a tag: `<`, `/`, `=`, `>` and strays.
    Char(char),
    /// Tag, attribute or directive name.
    Identifier,
    /// Attribute value. `consistent` is false when embedded code reuses the delimiting quote.
    AttValue {
        quote: Option<char>,
        consistent: bool,
    },
    /// `<%@`
    DirectiveOpen,
    /// `%>` closing a directive.
    DirectiveClose,
    /// `<% %>`, `<%= %>` or `<%: %>`; text is the code body.
    Code(CodeKind),
    /// `<%# %>`; text is the binding expression.
    DataBinding,
    /// `<!-- -->`; text is the comment body.
    HtmlComment,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub begin: Position,
    pub end: Position,
}

impl Token {
    pub fn is_char(&self, c: char) -> bool {
        self.kind == TokenKind::Char(c)
    }
}
