//! Non-fatal findings produced while building a document tree.
//!
//! Fatal problems abort the unit with a [`crate::error::QuireError::Parse`]; everything here is
//! carried alongside a successful [`crate::markup::ParsedUnit`].

use crate::markup::tree::ParseLocation;

/// A `runat="server"` tag the component registry could not resolve. The tag is emitted as
/// literal markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedTag {
    pub prefix: String,
    pub name: String,
    pub location: ParseLocation,
}

impl UnresolvedTag {
    pub fn tag(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.prefix, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDiagnostic {
    UnresolvedTag(UnresolvedTag),

    /// Suspicious but legal input.
    Warning {
        message: String,
        location: Option<ParseLocation>,
    },

    Info(String),
}

impl ParseDiagnostic {
    pub fn warning(message: impl Into<String>, location: Option<ParseLocation>) -> Self {
        Self::Warning {
            message: message.into(),
            location,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info(message.into())
    }

    pub fn is_unresolved_tag(&self) -> bool {
        matches!(self, Self::UnresolvedTag(_))
    }

    pub fn as_unresolved_tag(&self) -> Option<&UnresolvedTag> {
        match self {
            Self::UnresolvedTag(tag) => Some(tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedTag(tag) => write!(
                f,
                "{}: Unknown server tag '{}', emitted as markup",
                tag.location,
                tag.tag()
            ),
            Self::Warning {
                message,
                location: Some(location),
            } => write!(f, "Warning: {location}: {message}"),
            Self::Warning {
                message,
                location: None,
            } => write!(f, "Warning: {message}"),
            Self::Info(msg) => write!(f, "Info: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::LogicalPath;

    #[test]
    fn test_parse_diagnostic_creation() {
        let location = ParseLocation::start_of(&LogicalPath::new("/a.page"));
        let unresolved = ParseDiagnostic::UnresolvedTag(UnresolvedTag {
            prefix: "x".to_string(),
            name: "Gadget".to_string(),
            location: location.clone(),
        });
        assert!(unresolved.is_unresolved_tag());
        assert_eq!(unresolved.as_unresolved_tag().unwrap().tag(), "x:Gadget");
        assert_eq!(
            unresolved.to_string(),
            "/a.page(1,1): Unknown server tag 'x:Gadget', emitted as markup"
        );

        let warning = ParseDiagnostic::warning("odd", Some(location));
        assert!(!warning.is_unresolved_tag());
        assert_eq!(warning.to_string(), "Warning: /a.page(1,1): odd");
        assert_eq!(ParseDiagnostic::info("fyi").to_string(), "Info: fyi");
    }
}
