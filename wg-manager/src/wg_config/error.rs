//! Structured parse errors for wg-quick configuration files

use crate::keys::KeyFormatError;
use std::fmt;

/// Section of the file the error was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Outside of any section, or the file as a whole
    Config,
    /// An `[Interface]` section
    Interface,
    /// A `[Peer]` section
    Peer,
}

/// Attribute the error is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    TopLevel,
    Address,
    AllowedIps,
    Dns,
    Endpoint,
    ExcludedApplications,
    ListenPort,
    Mtu,
    PersistentKeepalive,
    PreSharedKey,
    PrivateKey,
    PublicKey,
}

/// Why the configuration was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    InvalidKey,
    InvalidNumber,
    InvalidValue,
    MissingAttribute,
    MissingSection,
    MissingValue,
    SyntaxError,
    UnknownAttribute,
    UnknownSection,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::Config => "Config",
            Section::Interface => "Interface",
            Section::Peer => "Peer",
        })
    }
}

impl Location {
    /// The attribute name as written in a wg-quick file (empty for `TopLevel`)
    pub fn attribute_name(self) -> &'static str {
        match self {
            Location::TopLevel => "",
            Location::Address => "Address",
            Location::AllowedIps => "AllowedIPs",
            Location::Dns => "DNS",
            Location::Endpoint => "Endpoint",
            Location::ExcludedApplications => "ExcludedApplications",
            Location::ListenPort => "ListenPort",
            Location::Mtu => "MTU",
            Location::PersistentKeepalive => "PersistentKeepalive",
            Location::PreSharedKey => "PreSharedKey",
            Location::PrivateKey => "PrivateKey",
            Location::PublicKey => "PublicKey",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::TopLevel => f.write_str("top level"),
            other => f.write_str(other.attribute_name()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reason::InvalidKey => "invalid key",
            Reason::InvalidNumber => "invalid number",
            Reason::InvalidValue => "invalid value",
            Reason::MissingAttribute => "missing attribute",
            Reason::MissingSection => "missing section",
            Reason::MissingValue => "missing value",
            Reason::SyntaxError => "syntax error",
            Reason::UnknownAttribute => "unknown attribute",
            Reason::UnknownSection => "unknown section",
        })
    }
}

/// A single value failed to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("invalid IP address '{0}'")]
    Address(String),

    #[error("invalid network '{0}'")]
    Network(String),

    #[error("invalid endpoint '{input}': {problem}")]
    Endpoint { input: String, problem: &'static str },

    #[error("'{0}' is not a number")]
    Number(String),

    #[error("{value} is outside {min}..={max}")]
    Range { value: i64, min: i64, max: i64 },

    #[error(transparent)]
    Key(#[from] KeyFormatError),
}

/// A wg-quick configuration could not be parsed
///
/// Carries the section, the attribute and a reason from a closed set so that
/// callers can build precise messages without matching on text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct BadConfigError {
    section: Section,
    location: Location,
    reason: Reason,
    text: Option<String>,
    #[source]
    cause: Option<ValueError>,
}

impl BadConfigError {
    /// Create an error without an underlying value error
    pub fn new(section: Section, location: Location, reason: Reason, text: Option<&str>) -> Self {
        Self {
            section,
            location,
            reason,
            text: text.map(str::to_string),
            cause: None,
        }
    }

    /// Create an error caused by a value that failed to parse
    ///
    /// The reason is derived from the cause: key failures are `InvalidKey`,
    /// non-numeric input is `InvalidNumber`, everything else is `InvalidValue`.
    pub fn from_value(section: Section, location: Location, text: &str, cause: ValueError) -> Self {
        let reason = match cause {
            ValueError::Key(_) => Reason::InvalidKey,
            ValueError::Number(_) => Reason::InvalidNumber,
            _ => Reason::InvalidValue,
        };
        Self {
            section,
            location,
            reason,
            text: Some(text.to_string()),
            cause: Some(cause),
        }
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// The offending text, when there is one
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// The value-level failure behind this error, if any
    pub fn cause(&self) -> Option<&ValueError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for BadConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {} section", self.reason, self.section)?;
        if self.location != Location::TopLevel {
            write!(f, " at {}", self.location)?;
        }
        if let Some(text) = &self.text {
            write!(f, ": '{}'", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyFormat, KeyFormatErrorKind};

    #[test]
    fn test_reason_from_cause() {
        let err = BadConfigError::from_value(
            Section::Peer,
            Location::PublicKey,
            "abc",
            ValueError::Key(KeyFormatError {
                format: KeyFormat::Base64,
                kind: KeyFormatErrorKind::Length,
            }),
        );
        assert_eq!(err.reason(), Reason::InvalidKey);

        let err = BadConfigError::from_value(
            Section::Interface,
            Location::Mtu,
            "x",
            ValueError::Number("x".to_string()),
        );
        assert_eq!(err.reason(), Reason::InvalidNumber);

        let err = BadConfigError::from_value(
            Section::Interface,
            Location::Dns,
            "foo",
            ValueError::Address("foo".to_string()),
        );
        assert_eq!(err.reason(), Reason::InvalidValue);
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_display() {
        let err = BadConfigError::new(
            Section::Peer,
            Location::PublicKey,
            Reason::MissingAttribute,
            None,
        );
        assert_eq!(err.to_string(), "missing attribute in Peer section at PublicKey");

        let err = BadConfigError::new(
            Section::Config,
            Location::TopLevel,
            Reason::UnknownSection,
            Some("[Foo]"),
        );
        assert_eq!(err.to_string(), "unknown section in Config section: '[Foo]'");
    }
}
