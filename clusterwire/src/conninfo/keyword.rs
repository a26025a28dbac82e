//! `keyword = value` connection strings.

use chainerror::*;

use super::ConnectionParameters;
use crate::error::*;

fn invalid(msg: String) -> Error {
    cherr!(ErrorKind::InvalidConnectionString(msg))
}

/// Parse whitespace separated `keyword = value` pairs.
///
/// Values are either bare (ending at whitespace, `\` escapes the next
/// character) or single-quoted (`\` escapes inside the quotes too).
pub(super) fn parse_keywords(conninfo: &str) -> Result<ConnectionParameters> {
    let mut params = ConnectionParameters::new();
    let mut chars = conninfo.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut keyword = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            keyword.push(c);
            chars.next();
        }

        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(invalid(format!(
                "missing \"=\" after \"{}\" in connection info string",
                keyword
            )));
        }
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            loop {
                match chars.next() {
                    None => {
                        return Err(invalid(
                            "unterminated quoted string in connection info string".to_string(),
                        ))
                    }
                    Some('\\') => {
                        if let Some(c) = chars.next() {
                            value.push(c);
                        }
                    }
                    Some('\'') => break,
                    Some(c) => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        params.set(&keyword, &value).map_err(|_| {
            invalid(format!("invalid connection option \"{}\"", keyword))
        })?;
    }

    Ok(params)
}
