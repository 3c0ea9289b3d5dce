// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::Error;

mod listener;
mod log;
mod security;
mod topic_check;

pub use self::log::{Log, LogLevel};
pub use listener::{Listener, ListenerSettings, Protocol};
pub use security::Auth;
pub use topic_check::TopicCheck;

pub const DEFAULT_LISTENER: &str = "default";

/// Server main config.
///
/// ```toml
/// sys-interval = 10
///
/// [listeners.default]
/// type = "tcp"
/// bind = "0.0.0.0:1883"
///
/// [auth]
/// allow-anonymous = true
///
/// [topic-check]
/// enabled = true
/// acl = { alice = ["a/#"] }
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// Map from listener name to listener settings.
    ///
    /// The listener named `default` provides fallback values for every
    /// other listener.
    #[serde(default)]
    listeners: HashMap<String, ListenerSettings>,

    /// Time interval in seconds between `$SYS` broker stats republication.
    ///
    /// Default is 0, which disables `$SYS` messages.
    #[serde(default, rename = "sys-interval", alias = "sys_interval")]
    sys_interval: u32,

    /// Timeout in seconds before receiving a Connect packet from a freshly
    /// accepted stream.
    ///
    /// Default is 30s.
    #[serde(
        default = "Config::default_connect_timeout",
        rename = "connect-timeout",
        alias = "connect_timeout"
    )]
    connect_timeout: u64,

    /// Seconds to wait after the will message is published before a
    /// disconnected session is finalized.
    ///
    /// Default is 0.
    #[serde(
        default,
        rename = "timeout-disconnect-delay",
        alias = "timeout_disconnect_delay"
    )]
    timeout_disconnect_delay: u64,

    /// Names of event plugins to load, fired on every broker event.
    ///
    /// Default is `["event-logger", "packet-logger"]`.
    #[serde(default = "Config::default_plugins")]
    plugins: Vec<String>,

    /// Authentication section. When this section is missing every
    /// connection is denied, except as auth plugins decide.
    #[serde(default)]
    auth: Option<Auth>,

    /// Topic filtering section.
    #[serde(default, rename = "topic-check", alias = "topic_check")]
    topic_check: Option<TopicCheck>,

    #[serde(default)]
    log: Log,
}

impl Config {
    fn default_connect_timeout() -> u64 {
        30
    }

    fn default_plugins() -> Vec<String> {
        vec!["event-logger".to_string(), "packet-logger".to_string()]
    }

    /// Resolve the listener map into a list of bindable listeners.
    ///
    /// Every named listener inherits unset options from the `default`
    /// entry. The `default` entry itself is a listener if it has a bind
    /// address.
    #[must_use]
    pub fn listeners(&self) -> Vec<Listener> {
        let fallback = self
            .listeners
            .get(DEFAULT_LISTENER)
            .cloned()
            .unwrap_or_default();

        let mut names: Vec<&String> = self.listeners.keys().collect();
        names.sort();

        let mut listeners = Vec::new();
        for name in names {
            let settings = if name == DEFAULT_LISTENER {
                fallback.clone()
            } else {
                self.listeners[name].merge_with(&fallback)
            };
            if let Some(listener) = settings.into_listener(name) {
                listeners.push(listener);
            }
        }
        listeners
    }

    #[must_use]
    pub const fn sys_interval(&self) -> u32 {
        self.sys_interval
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u64 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn timeout_disconnect_delay(&self) -> u64 {
        self.timeout_disconnect_delay
    }

    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    #[must_use]
    pub const fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    #[must_use]
    pub const fn topic_check(&self) -> Option<&TopicCheck> {
        self.topic_check.as_ref()
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config are invalid.
    pub fn validate(&self) -> Result<(), Error> {
        for listener in self.listeners() {
            listener.validate()?;
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(
            r#"
[listeners.default]
type = "tcp"
bind = "127.0.0.1:1883"
"#,
        )
        .unwrap();
        let listeners = config.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].address(), "127.0.0.1:1883");
        assert_eq!(config.connect_timeout(), 30);
        assert_eq!(config.sys_interval(), 0);
        assert!(config.auth().is_none());
    }

    #[test]
    fn test_listener_inherits_default() {
        let config: Config = toml::from_str(
            r#"
[listeners.default]
type = "tcp"
max-connections = 42

[listeners.external]
bind = "0.0.0.0:1883"
"#,
        )
        .unwrap();
        let listeners = config.listeners();
        // `default` has no bind address, only `external` is bindable.
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].name(), "external");
        assert_eq!(listeners[0].max_connections(), 42);
    }

    #[test]
    fn test_parse_acl() {
        let config: Config = toml::from_str(
            r#"
[listeners.default]
type = "tcp"
bind = "127.0.0.1:1883"

[auth]
allow-anonymous = true

[topic-check]
enabled = true

[topic-check.acl]
alice = ["a/#"]
"#,
        )
        .unwrap();
        let topic_check = config.topic_check().unwrap();
        assert!(topic_check.enabled());
        assert_eq!(
            topic_check.acl().get("alice"),
            Some(&vec!["a/#".to_string()])
        );
        assert!(topic_check.publish_acl().is_none());
    }
}
