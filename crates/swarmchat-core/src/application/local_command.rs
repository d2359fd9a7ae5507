//! Local input: drive administration commands or chat.
//!
//! `set <key> <value...>` and `get <key>` act on the local drive and never
//! leave this process. Anything else is chat.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    Set { key: String, value: String },
    Get { key: String },
    Chat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid set command")]
    InvalidSet,
    #[error("Invalid get command")]
    InvalidGet,
    #[error("Drive not ready")]
    NoDrive,
}

impl LocalInput {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        if let Some(rest) = line.strip_prefix("set ") {
            let (key, value) = split_token(rest).ok_or(CommandError::InvalidSet)?;
            let value = value
                .filter(|v| v.starts_with(char::is_whitespace))
                .ok_or(CommandError::InvalidSet)?;
            return Ok(Self::Set {
                key: key.to_string(),
                value: value.trim_start().to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix("get ") {
            return match split_token(rest) {
                Some((key, None)) => Ok(Self::Get {
                    key: key.to_string(),
                }),
                _ => Err(CommandError::InvalidGet),
            };
        }
        Ok(Self::Chat(line.to_string()))
    }
}

/// First whitespace-delimited token of `s` (leading whitespace skipped) and
/// whatever follows it, if anything.
fn split_token(s: &str) -> Option<(&str, Option<&str>)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], Some(&s[end..]))),
        None => Some((s, None)),
    }
}
