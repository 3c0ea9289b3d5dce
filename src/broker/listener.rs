// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::{self, Protocol};
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;

fn load_tls_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(certfile)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("listener: Failed to load cert file {certfile:?}, {err}"),
            )
        })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(keyfile)?))
        .map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("listener: Failed to load key file {keyfile:?}, {err}"),
            )
        })?
        .ok_or_else(|| {
            Error::from_string(
                ErrorKind::CertError,
                format!("listener: No private key found in {keyfile:?}"),
            )
        })?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("listener: {err}"))
        })?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// One bound listener socket, accepting streams of its configured
/// protocol.
pub(crate) struct BoundListener {
    config: config::Listener,
    tcp_listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
}

impl BoundListener {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or cert files cannot
    /// be loaded.
    pub async fn bind(listener_config: config::Listener) -> Result<Self, Error> {
        let tls_acceptor = if listener_config.protocol().is_secure() {
            let (Some(certfile), Some(keyfile)) =
                (listener_config.certfile(), listener_config.keyfile())
            else {
                return Err(Error::from_string(
                    ErrorKind::CertError,
                    format!(
                        "listener: certfile/keyfile required for listener {}",
                        listener_config.name()
                    ),
                ));
            };
            Some(load_tls_acceptor(certfile, keyfile)?)
        } else {
            None
        };

        let tcp_listener = TcpListener::bind(listener_config.address())
            .await
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::SocketError,
                    format!(
                        "listener: Failed to bind {} for listener {}, {err}",
                        listener_config.address(),
                        listener_config.name()
                    ),
                )
            })?;
        log::info!(
            "listener: {} listening on {} ({:?})",
            listener_config.name(),
            tcp_listener.local_addr()?,
            listener_config.protocol()
        );

        Ok(Self {
            config: listener_config,
            tcp_listener,
            tls_acceptor,
        })
    }

    #[must_use]
    pub fn config(&self) -> &config::Listener {
        &self.config
    }

    /// Get the bound socket address, useful with ephemeral ports.
    ///
    /// # Errors
    ///
    /// Returns error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.tcp_listener.local_addr()?)
    }

    /// Accept one raw tcp connection.
    ///
    /// # Errors
    ///
    /// Returns error if the listener socket fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        Ok(self.tcp_listener.accept().await?)
    }

    /// Run the TLS and websocket handshakes the protocol asks for.
    ///
    /// Called from the per-connection task so a slow peer cannot stall
    /// the accept loop.
    ///
    /// # Errors
    ///
    /// Returns error if a handshake fails.
    pub async fn wrap(&self, tcp_stream: TcpStream) -> Result<Stream, Error> {
        match self.config.protocol() {
            Protocol::Tcp => Ok(Stream::Mqtt(tcp_stream)),
            Protocol::Tls => {
                let tls_acceptor = self.tls_acceptor.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::CertError, "listener: Missing tls acceptor")
                })?;
                let tls_stream = tls_acceptor.accept(tcp_stream).await?;
                Ok(Stream::Mqtts(Box::new(tls_stream)))
            }
            Protocol::Ws => {
                let ws_stream = tokio_tungstenite::accept_async(tcp_stream).await?;
                Ok(Stream::Ws(Box::new(ws_stream)))
            }
            Protocol::Wss => {
                let tls_acceptor = self.tls_acceptor.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::CertError, "listener: Missing tls acceptor")
                })?;
                let tls_stream = tls_acceptor.accept(tcp_stream).await?;
                let wss_stream = tokio_tungstenite::accept_async(tls_stream).await?;
                Ok(Stream::Wss(Box::new(wss_stream)))
            }
        }
    }
}
