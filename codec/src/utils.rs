// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::DecodeError;

/// Convert `bytes` into an owned UTF-8 string.
///
/// A UTF-8 encoded string MUST NOT include an encoding of the null
/// character U+0000 [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `bytes` is not valid UTF-8 or contains NUL.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.contains(&0x00) {
        return Err(DecodeError::InvalidString);
    }
    String::from_utf8(bytes.to_vec()).map_err(Into::into)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// No chars.
    IsEmpty,

    /// Larger than 23 bytes.
    TooLong,

    /// Can only contain 0-9a-zA-Z and `-`/`_`.
    InvalidChars,
}

/// Validate client id against the canonical rules in [MQTT-3.1.3-5].
///
/// The Server MAY allow longer ids and more characters; this check covers
/// the form every conforming server must accept.
///
/// # Errors
///
/// Returns error if `client_id` is empty, too long or contains unexpected
/// characters.
pub fn check_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > 23 {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}

/// Generate a random client id, used when a client connects with
/// a zero length id.
#[must_use]
pub fn random_client_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("anzu-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utf8_string() {
        assert_eq!(to_utf8_string(b"a/b/c"), Ok("a/b/c".to_string()));
        assert_eq!(
            to_utf8_string(&[0x61, 0x00, 0x62]),
            Err(DecodeError::InvalidString)
        );
        assert_eq!(
            to_utf8_string(&[0xff, 0xfe]),
            Err(DecodeError::InvalidString)
        );
    }

    #[test]
    fn test_check_client_id() {
        assert!(check_client_id("sensor-07").is_ok());
        assert_eq!(check_client_id(""), Err(ClientIdError::IsEmpty));
        assert_eq!(
            check_client_id("a-very-long-client-id-above-limit"),
            Err(ClientIdError::TooLong)
        );
        assert_eq!(check_client_id("no spaces"), Err(ClientIdError::InvalidChars));
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(id.starts_with("anzu-"));
        assert_ne!(id, random_client_id());
    }
}
