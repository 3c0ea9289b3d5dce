// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use openssl::hash::{hash, MessageDigest};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{AuthDecision, AuthPlugin, SessionInfo};
use crate::config::{Auth, Config};
use crate::error::{Error, ErrorKind};

const SALT_LEN: usize = 12;
const HASH_MARKER: &str = "$6$";

/// Salted SHA-512 password entry, stored as `$6$<salt>$<base64 hash>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passwd {
    salt: String,
    hash: String,
}

impl Passwd {
    /// Hash a plain text password with a random salt.
    ///
    /// # Errors
    ///
    /// Returns error if the digest fails.
    pub fn generate(password: &[u8]) -> Result<Self, Error> {
        let salt: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SALT_LEN)
            .map(char::from)
            .collect();
        let hash = Self::digest(&salt, password)?;
        Ok(Self { salt, hash })
    }

    /// Parse the `$6$<salt>$<hash>` part of a password file line.
    ///
    /// # Errors
    ///
    /// Returns error if the format marker or fields are missing.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let rest = s.strip_prefix(HASH_MARKER).ok_or_else(|| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("passwd: Invalid hash format: {s}"),
            )
        })?;
        let (salt, hash) = rest.split_once('$').ok_or_else(|| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("passwd: Missing salt separator: {s}"),
            )
        })?;
        Ok(Self {
            salt: salt.to_string(),
            hash: hash.to_string(),
        })
    }

    /// Serialize into the `$6$<salt>$<hash>` form.
    #[must_use]
    pub fn dump(&self) -> String {
        format!("{HASH_MARKER}{}${}", self.salt, self.hash)
    }

    /// Check a plain text password against this entry.
    #[must_use]
    pub fn is_match(&self, password: &[u8]) -> bool {
        Self::digest(&self.salt, password).is_ok_and(|hash| hash == self.hash)
    }

    fn digest(salt: &str, password: &[u8]) -> Result<String, Error> {
        let mut input = salt.as_bytes().to_vec();
        input.extend_from_slice(password);
        let digest = hash(MessageDigest::sha512(), &input).map_err(|err| {
            Error::from_string(ErrorKind::FormatError, format!("passwd: {err}"))
        })?;
        Ok(BASE64.encode(&*digest))
    }
}

/// Parse one `username:$6$salt$hash` line. Empty lines and `#` comments
/// yield None.
fn parse_line(line: &str) -> Result<Option<(String, Passwd)>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (username, passwd) = line.split_once(':').ok_or_else(|| {
        Error::from_string(
            ErrorKind::FormatError,
            format!("passwd: Missing separator in line: {line}"),
        )
    })?;
    Ok(Some((username.to_string(), Passwd::parse(passwd)?)))
}

fn load_password_file<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Passwd>, Error> {
    let fd = File::open(path.as_ref())?;
    let reader = BufReader::new(fd);
    let mut users = BTreeMap::new();
    for line in reader.lines() {
        let line = line?;
        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some((username, passwd))) => {
                users.insert(username, passwd);
            }
            Err(err) => {
                log::error!("auth: err: {err:?}, line: {line}");
            }
        }
    }
    Ok(users)
}

/// Accepts or rejects sessions that present no credentials, based on the
/// `allow-anonymous` option.
pub struct AnonymousAuthPlugin {
    auth_config: Option<Auth>,
}

impl AnonymousAuthPlugin {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let auth_config = config.auth().cloned();
        if auth_config.is_none() {
            log::warn!("auth-anonymous: 'auth' section not found in configuration");
        }
        Self { auth_config }
    }
}

impl AuthPlugin for AnonymousAuthPlugin {
    fn name(&self) -> &str {
        "auth-anonymous"
    }

    fn authenticate<'a>(&'a self, session: &'a SessionInfo) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async move {
            let Some(auth_config) = &self.auth_config else {
                return AuthDecision::Deny;
            };
            if auth_config.allow_anonymous() {
                return AuthDecision::Allow;
            }
            if session.username.is_some() {
                AuthDecision::Allow
            } else {
                log::info!(
                    "auth-anonymous: Client {} connected without username",
                    session.client_id
                );
                AuthDecision::Deny
            }
        })
    }
}

/// Checks username/password pairs against a password file.
pub struct PasswordFileAuthPlugin {
    users: Option<BTreeMap<String, Passwd>>,
}

impl PasswordFileAuthPlugin {
    /// Load the password file named in the `auth` section.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let password_file = config.auth().and_then(Auth::password_file);
        let users = match password_file {
            Some(path) => Some(load_password_file(path)?),
            None => {
                log::warn!("auth-file: No password file configured");
                None
            }
        };
        Ok(Self { users })
    }
}

impl AuthPlugin for PasswordFileAuthPlugin {
    fn name(&self) -> &str {
        "auth-file"
    }

    fn authenticate<'a>(&'a self, session: &'a SessionInfo) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async move {
            let Some(users) = &self.users else {
                return AuthDecision::Undecided;
            };
            // Sessions without credentials are for the anonymous plugin
            // to judge.
            let Some(username) = &session.username else {
                return AuthDecision::Undecided;
            };
            let Some(passwd) = users.get(username) else {
                log::info!("auth-file: Unknown user {username}");
                return AuthDecision::Deny;
            };
            match &session.password {
                Some(password) if passwd.is_match(password) => AuthDecision::Allow,
                _ => {
                    log::info!("auth-file: Password mismatch for user {username}");
                    AuthDecision::Deny
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passwd_round_trip() {
        let passwd = Passwd::generate(b"secret").unwrap();
        let dumped = passwd.dump();
        let parsed = Passwd::parse(&dumped).unwrap();
        assert_eq!(parsed, passwd);
        assert!(parsed.is_match(b"secret"));
        assert!(!parsed.is_match(b"wrong"));
    }

    #[test]
    fn test_parse_line() {
        let passwd = Passwd::generate(b"pw").unwrap();
        let line = format!("alice:{}", passwd.dump());
        let (username, parsed) = parse_line(&line).unwrap().unwrap();
        assert_eq!(username, "alice");
        assert!(parsed.is_match(b"pw"));

        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("# comment").unwrap().is_none());
        assert!(parse_line("garbage").is_err());
    }
}
