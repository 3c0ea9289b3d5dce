// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::MqttPacket;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::ProtocolHandler;
use crate::broker::{Broker, QueuedDelivery};
use crate::error::ErrorKind;
use crate::session::SessionState;

/// Broker side specialization of the protocol handler. Consumes the
/// control packets the generic layer forwarded, enforces keep alive and
/// feeds received messages into broker dispatch.
#[derive(Clone)]
pub struct BrokerHandler {
    handler: ProtocolHandler,
    broker: Arc<Broker>,

    /// Keep alive negotiated in the Connect packet; zero disables the
    /// check.
    keep_alive: Duration,
}

impl BrokerHandler {
    #[must_use]
    pub fn new(handler: ProtocolHandler, broker: Arc<Broker>, keep_alive: u16) -> Self {
        Self {
            handler,
            broker,
            keep_alive: Duration::from_secs(u64::from(keep_alive)),
        }
    }

    #[must_use]
    pub const fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }

    /// Drive this connection until it disconnects.
    ///
    /// Returns true if the client disconnected gracefully with a
    /// Disconnect packet.
    pub async fn run(
        &self,
        mut control_rx: mpsc::UnboundedReceiver<MqttPacket>,
        outbound_rx: mpsc::UnboundedReceiver<QueuedDelivery>,
    ) -> bool {
        let client_id = self.handler.client_id().await;

        let delivery_task = {
            let this = self.clone();
            tokio::spawn(async move {
                this.delivery_loop().await;
            })
        };
        let outbound_task = {
            let this = self.clone();
            tokio::spawn(async move {
                this.outbound_loop(outbound_rx).await;
            })
        };

        // From [MQTT-3.1.2-24]: if the Server does not receive a Control
        // Packet within one and a half times the Keep Alive time period,
        // it MUST disconnect the Network Connection.
        let read_limit = self.keep_alive + self.keep_alive / 2;

        let mut graceful = false;
        loop {
            let wait = if self.keep_alive.is_zero() {
                // Keep alive disabled; wake up occasionally anyway.
                Duration::from_secs(3600)
            } else {
                read_limit.saturating_sub(self.handler.read_idle().await)
            };
            tokio::select! {
                maybe_packet = control_rx.recv() => match maybe_packet {
                    Some(packet) => {
                        if self.handle_control(packet, &mut graceful).await {
                            break;
                        }
                    }
                    None => break,
                },
                // The reader stopping (peer gone, takeover) must end this
                // loop promptly; the control channel stays open as long as
                // the handler exists.
                () = self.handler.wait_disconnect() => {
                    // Packets queued before the reader stopped still
                    // count, the final Disconnect in particular.
                    while let Ok(packet) = control_rx.try_recv() {
                        if self.handle_control(packet, &mut graceful).await {
                            break;
                        }
                    }
                    break;
                }
                () = tokio::time::sleep(wait) => {
                    if !self.keep_alive.is_zero()
                        && self.handler.read_idle().await >= read_limit
                    {
                        log::warn!(
                            "broker: {client_id}: keep alive limit reached, \
                             disconnecting client"
                        );
                        break;
                    }
                }
            }
        }

        self.handler.stop().await;
        delivery_task.abort();
        outbound_task.abort();
        graceful
    }

    /// Handle one control packet, returns true when the connection must
    /// close.
    async fn handle_control(&self, packet: MqttPacket, graceful: &mut bool) -> bool {
        let client_id = self.handler.client_id().await;
        match packet {
            MqttPacket::Subscribe(subscribe) => {
                if let Err(err) = self.broker.handle_subscribe(self, &subscribe).await {
                    log::error!("broker: {client_id}: Subscribe failed: {err}");
                    return true;
                }
                false
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                if let Err(err) = self.broker.handle_unsubscribe(self, &unsubscribe).await {
                    log::error!("broker: {client_id}: Unsubscribe failed: {err}");
                    return true;
                }
                false
            }
            MqttPacket::Disconnect(_) => {
                // Graceful close discards the will message [MQTT-3.1.2-10].
                *graceful = true;
                let session = self.handler.session();
                let mut session = session.lock().await;
                session.clear_will();
                session.set_state(SessionState::Disconnected);
                true
            }
            packet => {
                // A second Connect packet is a protocol violation
                // [MQTT-3.1.0-2], as is everything else only a server
                // may send. Close without replying.
                log::error!(
                    "broker: {client_id}: Unexpected packet {:?}, closing",
                    packet
                );
                true
            }
        }
    }

    /// Feed messages the peer published into broker dispatch, preserving
    /// receipt order.
    async fn delivery_loop(&self) {
        let client_id = self.handler.client_id().await;
        loop {
            match self.handler.next_delivery().await {
                Ok(msg) => {
                    self.broker.on_message_received(&client_id, msg).await;
                }
                Err(_err) => break,
            }
        }
    }

    /// Serialize broker-to-subscriber deliveries so one subscriber sees
    /// them in dispatch order.
    async fn outbound_loop(&self, mut outbound_rx: mpsc::UnboundedReceiver<QueuedDelivery>) {
        while let Some(delivery) = outbound_rx.recv().await {
            match self
                .handler
                .publish(
                    &delivery.topic,
                    &delivery.payload,
                    delivery.qos,
                    delivery.retain,
                )
                .await
            {
                Ok(_msg) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::HandlerStopped | ErrorKind::Cancelled
                    ) =>
                {
                    break;
                }
                Err(err) => {
                    log::warn!(
                        "broker: Failed to deliver {} to {}: {err}",
                        delivery.topic,
                        self.handler.client_id().await
                    );
                }
            }
        }
    }
}
