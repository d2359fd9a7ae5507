//! Control messages carried in-band on the chat stream.
//!
//! Every line sent between peers is either one of the reserved control forms
//! below or a chat payload. User text is not escaped, so a user who types a
//! line that looks like a control message sends a real control message.
//!
//! | Message              | Line                 |
//! |----------------------|----------------------|
//! | name query           | `/name?`             |
//! | name assertion       | `/name=<value>`      |
//! | drive-key query      | `/drive_key?`        |
//! | drive-key assertion  | `/drive_key=<hex64>` |

use std::fmt;

use super::identity::DriveKey;

pub const NAME_QUERY: &str = "/name?";
pub const NAME_PREFIX: &str = "/name=";
pub const DRIVE_KEY_QUERY: &str = "/drive_key?";
pub const DRIVE_KEY_PREFIX: &str = "/drive_key=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    NameQuery,
    Name(String),
    DriveKeyQuery,
    DriveKey(DriveKey),
}

impl ControlMsg {
    /// Parse a line (record separator already stripped).
    ///
    /// Returns `None` for anything that is not exactly one of the reserved
    /// forms, including a `/drive_key=` whose value is not 64 hex characters.
    pub fn parse(line: &str) -> Option<Self> {
        if line == NAME_QUERY {
            return Some(Self::NameQuery);
        }
        if line == DRIVE_KEY_QUERY {
            return Some(Self::DriveKeyQuery);
        }
        if let Some(name) = line.strip_prefix(NAME_PREFIX) {
            return Some(Self::Name(name.to_string()));
        }
        if let Some(hex) = line.strip_prefix(DRIVE_KEY_PREFIX) {
            return hex.parse().ok().map(Self::DriveKey);
        }
        None
    }
}

impl fmt::Display for ControlMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameQuery => f.write_str(NAME_QUERY),
            Self::Name(name) => write!(f, "{NAME_PREFIX}{name}"),
            Self::DriveKeyQuery => f.write_str(DRIVE_KEY_QUERY),
            Self::DriveKey(key) => write!(f, "{DRIVE_KEY_PREFIX}{}", key.to_hex()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queries() {
        assert_eq!(ControlMsg::parse("/name?"), Some(ControlMsg::NameQuery));
        assert_eq!(ControlMsg::parse("/drive_key?"), Some(ControlMsg::DriveKeyQuery));
    }

    #[test]
    fn parses_name_assertion_verbatim() {
        assert_eq!(
            ControlMsg::parse("/name=alice smith"),
            Some(ControlMsg::Name("alice smith".into()))
        );
    }

    #[test]
    fn drive_key_assertion_needs_64_hex_chars() {
        let key = DriveKey([0x5a; 32]);
        let line = ControlMsg::DriveKey(key).to_string();
        assert_eq!(ControlMsg::parse(&line), Some(ControlMsg::DriveKey(key)));

        assert_eq!(ControlMsg::parse("/drive_key=abcdef"), None);
        let non_hex = format!("/drive_key={}", "g".repeat(64));
        assert_eq!(ControlMsg::parse(&non_hex), None);
    }

    #[test]
    fn near_misses_are_chat() {
        assert_eq!(ControlMsg::parse("/name? "), None);
        assert_eq!(ControlMsg::parse(" /name?"), None);
        assert_eq!(ControlMsg::parse("/names"), None);
        assert_eq!(ControlMsg::parse("hello"), None);
    }
}
