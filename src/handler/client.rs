// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    ConnectPacket, ConnectReturnCode, DisconnectPacket, MqttPacket, PacketId, QoS,
    SubscribeAck, SubscribePacket, SubscribeTopic, SubTopic, UnsubscribePacket,
};
use std::time::Duration;

use super::ProtocolHandler;
use crate::error::{Error, ErrorKind};
use crate::plugin::Event;
use crate::session::{ApplicationMessage, SessionState};

/// Client side specialization of the protocol handler: issues Connect,
/// Subscribe and Unsubscribe, and keeps the connection alive with pings.
#[derive(Clone)]
pub struct ClientHandler {
    handler: ProtocolHandler,
}

impl ClientHandler {
    #[must_use]
    pub const fn new(handler: ProtocolHandler) -> Self {
        Self { handler }
    }

    #[must_use]
    pub const fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }

    /// Build a Connect packet from the session, send it and wait for the
    /// ConnectAck.
    ///
    /// # Errors
    ///
    /// Returns error if the exchange fails; an unfavorable return code is
    /// reported in the Ok value for the caller to judge.
    pub async fn connect(&self) -> Result<ConnectReturnCode, Error> {
        let packet = {
            let session = self.handler.session();
            let session = session.lock().await;
            let mut packet = ConnectPacket::new(session.client_id());
            packet
                .set_clean_session(session.clean_session())
                .set_keep_alive(session.keep_alive());
            if let Some(username) = session.username() {
                packet.set_username(username);
            }
            if let Some(password) = session.password() {
                packet.set_password(password);
            }
            if let Some(will) = session.will() {
                packet.set_will(&will.topic, &will.message, will.qos, will.retain)?;
            }
            packet
        };

        self.handler.send_packet(&packet).await?;

        match self.handler.read_packet_direct().await? {
            MqttPacket::ConnectAck(ack) => {
                if ack.return_code() == ConnectReturnCode::Accepted {
                    let session = self.handler.session();
                    session.lock().await.set_state(SessionState::Connected);
                    self.handler
                        .plugins()
                        .fire_event(&Event::Connected {
                            client_id: self.handler.client_id().await,
                        })
                        .await;
                }
                Ok(ack.return_code())
            }
            packet => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!(
                    "client: Expected ConnectAck as first packet, got {packet:?}"
                ),
            )),
        }
    }

    /// Start the reader task, retries and the keep alive ping task.
    ///
    /// # Errors
    ///
    /// Returns error if the handler was already started or stopped.
    pub async fn start(&self) -> Result<(), Error> {
        self.handler.start().await?;

        let keep_alive = {
            let session = self.handler.session();
            let keep_alive = session.lock().await.keep_alive();
            Duration::from_secs(u64::from(keep_alive))
        };
        if !keep_alive.is_zero() {
            let handler = self.handler.clone();
            tokio::spawn(async move {
                ping_loop(handler, keep_alive).await;
            });
        }
        Ok(())
    }

    /// Subscribe to `topics` and wait for the per-topic return codes.
    ///
    /// # Errors
    ///
    /// Returns error if the handler stops before the Suback arrives.
    pub async fn subscribe(
        &self,
        topics: Vec<SubscribeTopic>,
        packet_id: PacketId,
    ) -> Result<Vec<SubscribeAck>, Error> {
        let packet = SubscribePacket::with_topics(packet_id, topics)?;
        for topic in packet.topics() {
            self.handler
                .plugins()
                .fire_event(&Event::Subscribe {
                    client_id: self.handler.client_id().await,
                    filter: topic.topic().to_string(),
                    qos: topic.qos(),
                })
                .await;
        }
        let ack = self.handler.subscribe_packet(&packet).await?;
        Ok(ack.acknowledgements().to_vec())
    }

    /// Unsubscribe from `topics` and wait for the Unsuback.
    ///
    /// # Errors
    ///
    /// Returns error if the handler stops before the ack arrives.
    pub async fn unsubscribe(
        &self,
        topics: Vec<SubTopic>,
        packet_id: PacketId,
    ) -> Result<(), Error> {
        let packet = UnsubscribePacket::with_topics(packet_id, topics)?;
        for topic in packet.topics() {
            self.handler
                .plugins()
                .fire_event(&Event::Unsubscribe {
                    client_id: self.handler.client_id().await,
                    filter: topic.as_ref().to_string(),
                })
                .await;
        }
        self.handler.unsubscribe_packet(&packet).await.map(drop)
    }

    /// Publish an application message, delegated to the generic handler.
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
    ) -> Result<ApplicationMessage, Error> {
        self.handler.publish(topic, payload, qos, retain).await
    }

    /// Send Disconnect and stop the handler. The broker discards the will
    /// message on this path.
    ///
    /// # Errors
    ///
    /// Returns error if the packet cannot be sent.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let result = self.handler.send_packet(&DisconnectPacket::new()).await;
        self.handler.stop().await;
        result.map(drop)
    }

    /// Send Pingreq and wait for the Pingresp.
    ///
    /// # Errors
    ///
    /// Returns error if the handler stops first.
    pub async fn ping(&self) -> Result<(), Error> {
        self.handler.ping().await
    }

    /// Take the next message the broker delivered, FIFO.
    ///
    /// # Errors
    ///
    /// Returns `HandlerStopped` once the connection is gone and the queue
    /// is drained.
    pub async fn next_message(&self) -> Result<ApplicationMessage, Error> {
        self.handler.next_delivery().await
    }

    /// Completes when the broker closes the connection or the handler is
    /// stopped.
    pub async fn wait_disconnect(&self) {
        self.handler.wait_disconnect().await;
    }
}

/// Emit a ping whenever no packet was written for a full keep alive
/// period.
async fn ping_loop(handler: ProtocolHandler, keep_alive: Duration) {
    loop {
        if handler.is_stopped() {
            break;
        }
        let idle = handler.write_idle().await;
        if idle >= keep_alive {
            if let Err(err) = handler.ping().await {
                log::warn!("client: Ping failed: {err}");
                break;
            }
            continue;
        }
        let wait = keep_alive - idle;
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = handler.wait_disconnect() => break,
        }
    }
}
