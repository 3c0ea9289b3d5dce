// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! High level asynchronous MQTT client on top of the client handler.

use codec::{ConnectReturnCode, QoS, SubscribeAck, SubscribeTopic, SubTopic};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind};
use crate::handler::{ClientHandler, ProtocolHandler};
use crate::plugin::{PacketLoggerPlugin, Plugin, PluginManager};
use crate::session::{ApplicationMessage, Session, Will};
use crate::stream::Stream;

/// Options of a client connection to a broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    address: String,
    client_id: String,
    keep_alive: u16,
    clean_session: bool,
    username: Option<String>,
    password: Option<Vec<u8>>,
    will: Option<Will>,
}

impl ConnectOptions {
    /// New options with a random client id and a clean session.
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client_id: codec::utils::random_client_id(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        self.password = Some(password.to_vec());
        self
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn set_will(&mut self, will: Will) -> &mut Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }
}

/// An asynchronous MQTT client.
#[derive(Clone)]
pub struct Client {
    handler: ClientHandler,
}

impl Client {
    /// Connect to the broker at `options.address()` over tcp.
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unreachable or refuses the session.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        let stream = Stream::connect_tcp(options.address()).await?;
        Self::connect_with_stream(options, stream).await
    }

    /// Connect over an established stream, any transport.
    ///
    /// # Errors
    ///
    /// Returns error if the broker refuses the session.
    pub async fn connect_with_stream(
        options: &ConnectOptions,
        stream: Stream,
    ) -> Result<Self, Error> {
        let session = Arc::new(Mutex::new(Session::new(
            options.client_id(),
            options.clean_session(),
            options.keep_alive(),
        )));
        {
            let mut session = session.lock().await;
            session.set_username(options.username());
            session.set_password(options.password());
            session.set_will(options.will().cloned());
        }

        let event_plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(PacketLoggerPlugin::new())];
        let plugins = Arc::new(PluginManager::with_event_plugins(event_plugins));

        let handler = ClientHandler::new(ProtocolHandler::new(session, plugins, stream));
        let return_code = handler.connect().await?;
        if return_code != ConnectReturnCode::Accepted {
            handler.handler().stop().await;
            return Err(Error::from_string(
                ErrorKind::ConnectionRefused,
                format!("client: Broker refused connection: {return_code:?}"),
            ));
        }
        handler.start().await?;
        Ok(Self { handler })
    }

    #[must_use]
    pub const fn handler(&self) -> &ClientHandler {
        &self.handler
    }

    /// Publish one message and drive its QoS handshake to completion.
    ///
    /// # Errors
    ///
    /// Returns error if the handshake cannot complete.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.handler
            .publish(topic, payload, qos, retain)
            .await
            .map(drop)
    }

    /// Subscribe to one topic filter, returns the granted ack.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails before the Suback.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscribeAck, Error> {
        let packet_id = {
            let session = self.handler.handler().session();
            let mut session = session.lock().await;
            session.next_packet_id()?
        };
        let topics = vec![SubscribeTopic::new(topic, qos)?];
        let acks = self.handler.subscribe(topics, packet_id).await?;
        acks.into_iter().next().ok_or_else(|| {
            Error::new(ErrorKind::ProtocolError, "client: Empty Suback payload")
        })
    }

    /// Remove one subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails before the Unsuback.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        let packet_id = {
            let session = self.handler.handler().session();
            let mut session = session.lock().await;
            session.next_packet_id()?
        };
        let topics = vec![SubTopic::new(topic)?];
        self.handler.unsubscribe(topics, packet_id).await
    }

    /// Take the next message the broker delivered, FIFO.
    ///
    /// # Errors
    ///
    /// Returns `HandlerStopped` once the connection is gone.
    pub async fn next_message(&self) -> Result<ApplicationMessage, Error> {
        self.handler.next_message().await
    }

    /// Probe the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone.
    pub async fn ping(&self) -> Result<(), Error> {
        self.handler.ping().await
    }

    /// Graceful disconnect; the broker discards the will message.
    ///
    /// # Errors
    ///
    /// Returns error if the Disconnect packet cannot be sent.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.handler.disconnect().await
    }

    /// Completes when the broker closes the connection.
    pub async fn wait_disconnect(&self) {
        self.handler.wait_disconnect().await;
    }
}
