// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-connection session state: identity, subscriptions, inflight
//! message tables and the delivery queue.

use codec::{
    PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, SubscribePattern,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, ErrorKind};

/// Lifecycle state of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, Connect not yet exchanged.
    #[default]
    New,

    /// Connect/ConnectAck exchange finished.
    Connected,

    /// Network connection is gone. The session may be re-attached later
    /// if it is not a clean session.
    Disconnected,
}

/// Will message stored from the Connect packet, published by the broker
/// when the client disconnects ungracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Delivery progress of an outgoing QoS 1/2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    New,
    Published,
    PubrecReceived,
    PubrelSent,
    Complete,
}

/// Delivery progress of an incoming QoS 2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    Received,
    PubrecSent,
    PubrelReceived,
}

/// Direction specific handshake state of an application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Outgoing(OutgoingState),
    Incoming(IncomingState),
}

/// An application message together with every protocol packet of its
/// handshake seen so far.
#[derive(Debug, Clone)]
pub struct ApplicationMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    packet_id: PacketId,
    state: FlowState,

    pub publish_packet: Option<PublishPacket>,
    pub puback_packet: Option<PublishAckPacket>,
    pub pubrec_packet: Option<PublishReceivedPacket>,
    pub pubrel_packet: Option<PublishReleasePacket>,
    pub pubcomp_packet: Option<PublishCompletePacket>,
}

impl ApplicationMessage {
    /// Create an outgoing message from the Publish packet being sent.
    #[must_use]
    pub fn outgoing(packet: &PublishPacket) -> Self {
        Self {
            topic: packet.topic().to_string(),
            payload: packet.message().to_vec(),
            qos: packet.qos(),
            retain: packet.retain(),
            packet_id: packet.packet_id(),
            state: FlowState::Outgoing(OutgoingState::New),
            publish_packet: Some(packet.clone()),
            puback_packet: None,
            pubrec_packet: None,
            pubrel_packet: None,
            pubcomp_packet: None,
        }
    }

    /// Create an incoming message from a received Publish packet.
    #[must_use]
    pub fn incoming(packet: &PublishPacket) -> Self {
        Self {
            topic: packet.topic().to_string(),
            payload: packet.message().to_vec(),
            qos: packet.qos(),
            retain: packet.retain(),
            packet_id: packet.packet_id(),
            state: FlowState::Incoming(IncomingState::Received),
            publish_packet: Some(packet.clone()),
            puback_packet: None,
            pubrec_packet: None,
            pubrel_packet: None,
            pubcomp_packet: None,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub const fn state(&self) -> FlowState {
        self.state
    }

    /// Advance the outgoing handshake state machine.
    ///
    /// Illegal transitions are logged and dropped; returns false in that
    /// case and the state is unchanged.
    pub fn advance_outgoing(&mut self, next: OutgoingState) -> bool {
        let FlowState::Outgoing(current) = self.state else {
            log::warn!(
                "session: Outgoing transition requested on incoming message {}",
                self.packet_id
            );
            return false;
        };
        let legal = matches!(
            (current, next),
            (OutgoingState::New, OutgoingState::Published)
                | (OutgoingState::Published, OutgoingState::PubrecReceived)
                | (OutgoingState::PubrecReceived, OutgoingState::PubrelSent)
                | (OutgoingState::PubrelSent, OutgoingState::Complete)
        );
        if legal {
            self.state = FlowState::Outgoing(next);
        } else {
            log::warn!(
                "session: Dropping illegal transition {current:?} -> {next:?}, packet id {}",
                self.packet_id
            );
        }
        legal
    }

    /// Advance the incoming handshake state machine.
    ///
    /// Illegal transitions are logged and dropped; returns false in that
    /// case and the state is unchanged.
    pub fn advance_incoming(&mut self, next: IncomingState) -> bool {
        let FlowState::Incoming(current) = self.state else {
            log::warn!(
                "session: Incoming transition requested on outgoing message {}",
                self.packet_id
            );
            return false;
        };
        let legal = matches!(
            (current, next),
            (IncomingState::Received, IncomingState::PubrecSent)
                | (IncomingState::PubrecSent, IncomingState::PubrelReceived)
        );
        if legal {
            self.state = FlowState::Incoming(next);
        } else {
            log::warn!(
                "session: Dropping illegal transition {current:?} -> {next:?}, packet id {}",
                self.packet_id
            );
        }
        legal
    }
}

/// State of one client connection, kept across reconnects when the clean
/// session flag is unset.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_session: bool,
    keep_alive: u16,
    will: Option<Will>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    state: SessionState,

    /// Traversal ordered, every matching filter applies on dispatch.
    subscriptions: Vec<SubscribePattern>,

    inflight_in: BTreeMap<u16, ApplicationMessage>,
    inflight_out: BTreeMap<u16, ApplicationMessage>,

    /// Received messages waiting for the application, FIFO.
    delivery_queue: VecDeque<ApplicationMessage>,
    delivery_notify: Arc<Notify>,
}

impl Session {
    #[must_use]
    pub fn new(client_id: &str, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            will: None,
            username: None,
            password: None,
            state: SessionState::New,
            subscriptions: Vec::new(),
            inflight_in: BTreeMap::new(),
            inflight_out: BTreeMap::new(),
            delivery_queue: VecDeque::new(),
            delivery_notify: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_client_id(&mut self, client_id: &str) {
        self.client_id = client_id.to_string();
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) {
        self.keep_alive = keep_alive;
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn set_will(&mut self, will: Option<Will>) {
        self.will = will;
    }

    /// Discard the will message, done on graceful disconnect
    /// [MQTT-3.1.2-10].
    pub fn clear_will(&mut self) {
        self.will = None;
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: Option<&str>) {
        self.username = username.map(ToString::to_string);
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn set_password(&mut self, password: Option<&[u8]>) {
        self.password = password.map(<[u8]>::to_vec);
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Snapshot of session identity, handed to plugins.
    #[must_use]
    pub fn info(&self) -> crate::plugin::SessionInfo {
        crate::plugin::SessionInfo {
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            clean_session: self.clean_session,
        }
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[SubscribePattern] {
        &self.subscriptions
    }

    /// Add a subscription, replacing an existing one with an identical
    /// filter [MQTT-3.8.4-3].
    pub fn upsert_subscription(&mut self, pattern: SubscribePattern) {
        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|p| p.topic().filter() == pattern.topic().filter())
        {
            *existing = pattern;
        } else {
            self.subscriptions.push(pattern);
        }
    }

    /// Remove the subscription with this exact `filter`, returns true if
    /// one was removed.
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        let old_len = self.subscriptions.len();
        self.subscriptions.retain(|p| p.topic().filter() != filter);
        self.subscriptions.len() != old_len
    }

    /// Allocate the smallest packet id not used by either inflight table.
    ///
    /// Id 0 is reserved and never returned.
    ///
    /// # Errors
    ///
    /// Returns `PacketIdExhausted` if all 65535 ids are outstanding.
    pub fn next_packet_id(&mut self) -> Result<PacketId, Error> {
        for id in 1..=u16::MAX {
            if !self.inflight_in.contains_key(&id) && !self.inflight_out.contains_key(&id) {
                return Ok(PacketId::new(id));
            }
        }
        Err(Error::from_string(
            ErrorKind::PacketIdExhausted,
            format!(
                "session: No free packet id in session {}, retry later",
                self.client_id
            ),
        ))
    }

    /// Track an outgoing QoS 1/2 message until its handshake completes.
    ///
    /// # Errors
    ///
    /// Returns error if the packet id is already in flight.
    pub fn put_inflight_out(&mut self, msg: ApplicationMessage) -> Result<(), Error> {
        let id = msg.packet_id().value();
        if self.inflight_out.contains_key(&id) {
            return Err(Error::from_string(
                ErrorKind::SendError,
                format!("session: Duplicate outgoing packet id {id}"),
            ));
        }
        self.inflight_out.insert(id, msg);
        Ok(())
    }

    /// Track an incoming QoS 2 message until Pubcomp is sent.
    ///
    /// # Errors
    ///
    /// Returns error if the packet id is already in flight.
    pub fn put_inflight_in(&mut self, msg: ApplicationMessage) -> Result<(), Error> {
        let id = msg.packet_id().value();
        if self.inflight_in.contains_key(&id) {
            return Err(Error::from_string(
                ErrorKind::SendError,
                format!("session: Duplicate incoming packet id {id}"),
            ));
        }
        self.inflight_in.insert(id, msg);
        Ok(())
    }

    pub fn remove_inflight_out(&mut self, packet_id: PacketId) -> Option<ApplicationMessage> {
        self.inflight_out.remove(&packet_id.value())
    }

    pub fn remove_inflight_in(&mut self, packet_id: PacketId) -> Option<ApplicationMessage> {
        self.inflight_in.remove(&packet_id.value())
    }

    #[must_use]
    pub fn inflight_out(&self, packet_id: PacketId) -> Option<&ApplicationMessage> {
        self.inflight_out.get(&packet_id.value())
    }

    #[must_use]
    pub fn inflight_in(&self, packet_id: PacketId) -> Option<&ApplicationMessage> {
        self.inflight_in.get(&packet_id.value())
    }

    pub fn inflight_out_mut(&mut self, packet_id: PacketId) -> Option<&mut ApplicationMessage> {
        self.inflight_out.get_mut(&packet_id.value())
    }

    pub fn inflight_in_mut(&mut self, packet_id: PacketId) -> Option<&mut ApplicationMessage> {
        self.inflight_in.get_mut(&packet_id.value())
    }

    /// Snapshot both inflight tables, used by retry on reconnect.
    #[must_use]
    pub fn inflight_snapshot(&self) -> (Vec<ApplicationMessage>, Vec<ApplicationMessage>) {
        (
            self.inflight_out.values().cloned().collect(),
            self.inflight_in.values().cloned().collect(),
        )
    }

    /// Append a received message to the delivery queue and wake the
    /// consumer.
    pub fn deliver(&mut self, msg: ApplicationMessage) {
        self.delivery_queue.push_back(msg);
        self.delivery_notify.notify_one();
    }

    /// Pop the oldest delivered message, if any.
    pub fn pop_delivery(&mut self) -> Option<ApplicationMessage> {
        self.delivery_queue.pop_front()
    }

    #[must_use]
    pub fn delivery_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.delivery_notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing_msg(id: u16, qos: QoS) -> ApplicationMessage {
        let mut packet = PublishPacket::new("a/b", qos, b"x").unwrap();
        packet.set_packet_id(PacketId::new(id));
        ApplicationMessage::outgoing(&packet)
    }

    #[test]
    fn test_next_packet_id_skips_inflight() {
        let mut session = Session::new("c1", true, 60);
        assert_eq!(session.next_packet_id().unwrap(), PacketId::new(1));

        session
            .put_inflight_out(outgoing_msg(1, QoS::AtLeastOnce))
            .unwrap();
        session
            .put_inflight_out(outgoing_msg(2, QoS::AtLeastOnce))
            .unwrap();
        assert_eq!(session.next_packet_id().unwrap(), PacketId::new(3));

        session.remove_inflight_out(PacketId::new(1));
        assert_eq!(session.next_packet_id().unwrap(), PacketId::new(1));
    }

    #[test]
    fn test_duplicate_packet_id_is_rejected() {
        let mut session = Session::new("c1", true, 60);
        session
            .put_inflight_out(outgoing_msg(7, QoS::ExactOnce))
            .unwrap();
        assert!(session
            .put_inflight_out(outgoing_msg(7, QoS::ExactOnce))
            .is_err());
        // The same id is still free on the incoming side.
        let mut packet = PublishPacket::new("a/b", QoS::ExactOnce, b"x").unwrap();
        packet.set_packet_id(PacketId::new(7));
        assert!(session
            .put_inflight_in(ApplicationMessage::incoming(&packet))
            .is_ok());
    }

    #[test]
    fn test_delivery_queue_is_fifo() {
        let mut session = Session::new("c1", true, 60);
        let first = outgoing_msg(1, QoS::AtMostOnce);
        let mut second_packet = PublishPacket::new("c/d", QoS::AtMostOnce, b"y").unwrap();
        second_packet.set_packet_id(PacketId::new(0));
        let second = ApplicationMessage::incoming(&second_packet);

        session.deliver(first);
        session.deliver(second);
        assert_eq!(session.pop_delivery().unwrap().topic(), "a/b");
        assert_eq!(session.pop_delivery().unwrap().topic(), "c/d");
        assert!(session.pop_delivery().is_none());
    }

    #[test]
    fn test_subscription_upsert() {
        let mut session = Session::new("c1", true, 60);
        session.upsert_subscription(SubscribePattern::parse("a/+", QoS::AtMostOnce).unwrap());
        session.upsert_subscription(SubscribePattern::parse("b/#", QoS::AtLeastOnce).unwrap());
        assert_eq!(session.subscriptions().len(), 2);

        // Same filter replaces in place, order preserved.
        session.upsert_subscription(SubscribePattern::parse("a/+", QoS::ExactOnce).unwrap());
        assert_eq!(session.subscriptions().len(), 2);
        assert_eq!(session.subscriptions()[0].qos(), QoS::ExactOnce);

        assert!(session.remove_subscription("a/+"));
        assert!(!session.remove_subscription("a/+"));
        assert_eq!(session.subscriptions().len(), 1);
    }

    #[test]
    fn test_outgoing_state_machine() {
        let mut msg = outgoing_msg(1, QoS::ExactOnce);
        assert!(msg.advance_outgoing(OutgoingState::Published));
        // Pubcomp before Pubrec is illegal and dropped.
        assert!(!msg.advance_outgoing(OutgoingState::Complete));
        assert_eq!(msg.state(), FlowState::Outgoing(OutgoingState::Published));
        assert!(msg.advance_outgoing(OutgoingState::PubrecReceived));
        assert!(msg.advance_outgoing(OutgoingState::PubrelSent));
        assert!(msg.advance_outgoing(OutgoingState::Complete));
    }
}
