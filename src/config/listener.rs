// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind};

/// Binding protocol types.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw Mqtt protocol, in TCP.
    #[default]
    #[serde(alias = "tcp", alias = "mqtt")]
    Tcp,

    /// Raw Mqtt protocol, in TCP with TLS encryption.
    #[serde(alias = "tls", alias = "mqtts")]
    Tls,

    /// Websocket protocol.
    #[serde(alias = "ws")]
    Ws,

    /// Secure Websocket protocol.
    #[serde(alias = "wss")]
    Wss,
}

impl Protocol {
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls | Self::Wss)
    }
}

/// One entry in the `listeners` map, all fields optional so that unset
/// options fall back to the `default` entry.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ListenerSettings {
    /// Binding protocol.
    ///
    /// Default is tcp.
    #[serde(rename = "type")]
    protocol: Option<Protocol>,

    /// Binding address, including ip/host name and port.
    ///
    /// Common addresses are:
    /// - 0.0.0.0:1883, for mqtt over tcp
    /// - 0.0.0.0:8883, for mqtt over tls
    /// - 0.0.0.0:8083, for mqtt over WebSocket
    /// - 0.0.0.0:8084, for mqtt over secure WebSocket
    bind: Option<String>,

    /// The maximum number of client connections to this listener allowed.
    ///
    /// Default is 0, which means unlimited connections.
    #[serde(rename = "max-connections", alias = "max_connections")]
    max_connections: Option<usize>,

    /// Explicit TLS toggle, kept for config compatibility. Implied by
    /// `type = "tls"` or `type = "wss"`.
    ssl: Option<bool>,

    /// Path to TLS cert file.
    certfile: Option<PathBuf>,

    /// Path to TLS private key file.
    keyfile: Option<PathBuf>,

    /// Connection keep alive in seconds, used when a client connects with
    /// a zero keep alive value.
    ///
    /// Default is 60.
    #[serde(rename = "keep-alive", alias = "keep_alive")]
    keep_alive: Option<u16>,
}

impl ListenerSettings {
    /// Fill unset options from `fallback`.
    #[must_use]
    pub fn merge_with(&self, fallback: &Self) -> Self {
        Self {
            protocol: self.protocol.or(fallback.protocol),
            bind: self.bind.clone().or_else(|| fallback.bind.clone()),
            max_connections: self.max_connections.or(fallback.max_connections),
            ssl: self.ssl.or(fallback.ssl),
            certfile: self.certfile.clone().or_else(|| fallback.certfile.clone()),
            keyfile: self.keyfile.clone().or_else(|| fallback.keyfile.clone()),
            keep_alive: self.keep_alive.or(fallback.keep_alive),
        }
    }

    /// Resolve settings into a bindable listener, or None if no bind
    /// address is set.
    #[must_use]
    pub fn into_listener(self, name: &str) -> Option<Listener> {
        let address = self.bind?;
        Some(Listener {
            name: name.to_string(),
            protocol: self.protocol.unwrap_or_default(),
            address,
            max_connections: self.max_connections.unwrap_or(0),
            certfile: self.certfile,
            keyfile: self.keyfile,
            keep_alive: self.keep_alive.unwrap_or(60),
        })
    }
}

/// A resolved listener, one unique address/port and connection protocol.
#[derive(Debug, Clone)]
pub struct Listener {
    name: String,
    protocol: Protocol,
    address: String,
    max_connections: usize,
    certfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    keep_alive: u16,
}

impl Listener {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub const fn certfile(&self) -> Option<&PathBuf> {
        self.certfile.as_ref()
    }

    #[must_use]
    pub const fn keyfile(&self) -> Option<&PathBuf> {
        self.keyfile.as_ref()
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Validate listener config.
    ///
    /// # Errors
    ///
    /// Returns error if the bind address is malformed or cert files are
    /// missing for a secure protocol.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.to_socket_addrs().is_err() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "listener: Invalid bind address {} in listener {}",
                    self.address, self.name
                ),
            ));
        }

        if self.protocol.is_secure() {
            let cert_ok = self
                .certfile
                .as_ref()
                .is_some_and(|certfile| certfile.exists());
            let key_ok = self.keyfile.as_ref().is_some_and(|keyfile| keyfile.exists());
            if !cert_ok || !key_ok {
                return Err(Error::from_string(
                    ErrorKind::CertError,
                    format!(
                        "listener: certfile/keyfile required for listener {}",
                        self.name
                    ),
                ));
            }
        }

        Ok(())
    }
}
