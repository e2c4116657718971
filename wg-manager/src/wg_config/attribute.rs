//! `Key = Value` lines of a wg-quick file

/// One attribute line with key and value trimmed
///
/// The value may be empty (`MTU =`); the section parsers report that as a
/// missing value rather than a syntax error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

impl<'a> Attribute<'a> {
    /// Split a comment-free line into key and value
    ///
    /// Returns `None` if the line has no `=` or the key is not a single word.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(Self {
            key,
            value: value.trim(),
        })
    }

    /// Lower-cased key used for dispatch
    pub fn lower_key(&self) -> String {
        self.key.to_ascii_lowercase()
    }
}

/// Split a list value on commas, dropping empty elements
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Join list elements the way they are written back out
pub fn join_list<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Strip a trailing `#` comment and surrounding whitespace
pub fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(index) => line[..index].trim(),
        None => line.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attribute() {
        let attr = Attribute::parse("PrivateKey = abc=").unwrap();
        assert_eq!(attr.key, "PrivateKey");
        assert_eq!(attr.value, "abc=");
        assert_eq!(attr.lower_key(), "privatekey");

        let attr = Attribute::parse("MTU=1420").unwrap();
        assert_eq!(attr.key, "MTU");
        assert_eq!(attr.value, "1420");
    }

    #[test]
    fn test_parse_attribute_empty_value() {
        let attr = Attribute::parse("DNS =").unwrap();
        assert_eq!(attr.value, "");
    }

    #[test]
    fn test_parse_attribute_syntax_errors() {
        assert!(Attribute::parse("no equals sign").is_none());
        assert!(Attribute::parse("= value").is_none());
        assert!(Attribute::parse("two words = value").is_none());
        assert!(Attribute::parse("Dash-Key = value").is_none());
    }

    #[test]
    fn test_split_list() {
        let items: Vec<_> = split_list("10.0.0.1/32 ,fd00::1/128,  , 10.0.0.2").collect();
        assert_eq!(items, vec!["10.0.0.1/32", "fd00::1/128", "10.0.0.2"]);
        assert_eq!(split_list("").count(), 0);
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("  MTU = 1420 # jumbo  "), "MTU = 1420");
        assert_eq!(strip_comment("# only a comment"), "");
        assert_eq!(strip_comment("[Peer]"), "[Peer]");
    }

    #[test]
    fn test_join_list() {
        assert_eq!(join_list(&["a", "b", "c"]), "a, b, c");
        assert_eq!(join_list::<String>(&[]), "");
    }
}
