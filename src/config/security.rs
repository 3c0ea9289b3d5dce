// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind};

/// The `auth` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    /// Accept sessions that present no username.
    ///
    /// Default is false.
    #[serde(default, rename = "allow-anonymous", alias = "allow_anonymous")]
    allow_anonymous: bool,

    /// Path to password file, with one `username:hashed-password` pair
    /// per line.
    #[serde(default, rename = "password-file", alias = "password_file")]
    password_file: Option<PathBuf>,

    /// Names of authentication plugins to run on every Connect packet.
    ///
    /// Default is `["auth-anonymous"]`; add `"auth-file"` to check
    /// credentials against the password file.
    #[serde(default = "Auth::default_plugins")]
    plugins: Vec<String>,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            password_file: None,
            plugins: Self::default_plugins(),
        }
    }
}

impl Auth {
    fn default_plugins() -> Vec<String> {
        vec!["auth-anonymous".to_string()]
    }

    #[must_use]
    pub const fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    #[must_use]
    pub const fn password_file(&self) -> Option<&PathBuf> {
        self.password_file.as_ref()
    }

    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Validate auth config.
    ///
    /// # Errors
    ///
    /// Returns error if the password file does not exist.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(password_file) = &self.password_file {
            if !password_file.exists() {
                return Err(Error::from_string(
                    ErrorKind::ConfigError,
                    format!("auth: password file {password_file:?} not found"),
                ));
            }
        }
        Ok(())
    }
}
