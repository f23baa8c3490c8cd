//! Serialisation helpers.
//!
//! Pool sessions carry MessagePack payloads inside length-prefixed frames;
//! the RPC endpoint speaks newline-terminated JSON so that it can be driven
//! from any language (or `nc`).

use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Encode a value to MessagePack bytes.
///
/// # Errors
///
/// Returns [`NetError::Encode`] if serialisation fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NetError> {
    rmp_serde::to_vec(value).map_err(NetError::Encode)
}

/// Decode a value from MessagePack bytes.
///
/// # Errors
///
/// Returns [`NetError::Decode`] if deserialisation fails.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, NetError> {
    rmp_serde::from_slice(bytes).map_err(NetError::Decode)
}

/// Encode a value as a single JSON line, including the trailing newline.
///
/// # Errors
///
/// Returns [`NetError::Json`] if serialisation fails.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, NetError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Decode a value from one JSON line. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`NetError::Json`] if the line is not valid JSON for `T`.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, NetError> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Command, CommandReply};

    #[test]
    fn test_encode_line_is_single_line() {
        let command = Command::new("set").with_arg("name", "dt").with_arg("value", 1e-4);
        let line = encode_line(&command).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let restored: Command = decode_line(&line).unwrap();
        assert_eq!(restored, command);
    }

    #[test]
    fn test_decode_line_accepts_missing_arguments() {
        let command: Command = decode_line("  {\"verb\": \"pause\"}\r\n").unwrap();
        assert_eq!(command.verb, "pause");
        assert!(command.arguments.is_empty());
    }

    #[test]
    fn test_decode_line_rejects_garbage() {
        let result: Result<CommandReply, _> = decode_line("not json");
        assert!(matches!(result, Err(NetError::Json(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let result: Result<Command, _> = decode(&[0xFF, 0xFF]);
        assert!(matches!(result, Err(NetError::Decode(_))));
    }
}
