// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The broker: session registry, subscription matching, retained store
//! and the listener front end.

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, EncodePacket,
    MqttPacket, Packet, ProtocolLevel, QoS, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    SubscribePattern, Topic, UnsubscribeAckPacket, UnsubscribePacket,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::config::{self, Config};
use crate::error::{Error, ErrorKind};
use crate::handler::{BrokerHandler, ProtocolHandler};
use crate::plugin::{
    AclAction, Event, PluginContext, PluginManager, SessionInfo, SysStats,
};
use crate::session::{ApplicationMessage, Session, SessionState, Will};
use crate::stream::{connection_closed_error, Stream, StreamReader, StreamWriter};

mod listener;
mod retain;
mod sys;

use listener::BoundListener;
pub use retain::{RetainedMessage, RetainedStore};

/// One message on its way from broker dispatch to a subscriber's
/// connection.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// The currently attached connection of a client id.
struct ConnectionHandle {
    /// Distinguishes this connection from a takeover successor under the
    /// same client id.
    id: u64,
    handler: ProtocolHandler,
    outbound_tx: mpsc::UnboundedSender<QueuedDelivery>,
}

/// Everything shared between connections, under the broker lock.
#[derive(Default)]
struct BrokerState {
    /// Every known session, attached or kept for an unclean reconnect.
    sessions: HashMap<String, Arc<Mutex<Session>>>,

    /// Currently attached connections by client id.
    connections: HashMap<String, ConnectionHandle>,

    retained: RetainedStore,

    /// QoS 1/2 deliveries for detached unclean sessions, flushed on
    /// reconnect.
    pending: HashMap<String, Vec<QueuedDelivery>>,
}

/// The MQTT broker.
pub struct Broker {
    config: Arc<Config>,
    plugins: Arc<PluginManager>,
    stats: Arc<SysStats>,
    state: Mutex<BrokerState>,
    started_at: Instant,
    next_connection_id: AtomicU64,
}

impl Broker {
    /// Build a broker and its plugins from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if a configured plugin is unknown or fails to
    /// initialize.
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        let config = Arc::new(config);
        let stats = Arc::new(SysStats::new());
        let ctx = PluginContext {
            config: Arc::clone(&config),
            sys_stats: Arc::clone(&stats),
        };
        let plugins = Arc::new(PluginManager::from_config(&ctx)?);
        Ok(Arc::new(Self {
            config,
            plugins,
            stats,
            state: Mutex::new(BrokerState::default()),
            started_at: Instant::now(),
            next_connection_id: AtomicU64::new(1),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &SysStats {
        &self.stats
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Bind every configured listener and start accepting connections.
    ///
    /// Returns the bound socket addresses, useful with ephemeral ports.
    ///
    /// # Errors
    ///
    /// Returns error if no listener is configured or an address cannot
    /// be bound.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<SocketAddr>, Error> {
        let listener_configs = self.config.listeners();
        if listener_configs.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "broker: No listener with a bind address configured",
            ));
        }

        let mut addrs = Vec::new();
        for listener_config in listener_configs {
            let bound = BoundListener::bind(listener_config).await?;
            addrs.push(bound.local_addr()?);
            let broker = Arc::clone(self);
            tokio::spawn(async move {
                broker.accept_loop(bound).await;
            });
        }

        if self.config.sys_interval() > 0
            && self.config.plugins().iter().any(|name| name == "broker-sys")
        {
            sys::spawn_sys_task(Arc::clone(self));
        }

        Ok(addrs)
    }

    /// Run until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        log::info!("broker: Shutting down");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, bound: BoundListener) {
        let bound = Arc::new(bound);
        let active = Arc::new(AtomicUsize::new(0));
        let max_connections = bound.config().max_connections();

        loop {
            match bound.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    if max_connections > 0 && active.load(Ordering::Relaxed) >= max_connections
                    {
                        log::warn!(
                            "broker: Listener {} at max connections, rejecting {peer_addr}",
                            bound.config().name()
                        );
                        drop(tcp_stream);
                        continue;
                    }
                    active.fetch_add(1, Ordering::Relaxed);

                    let broker = Arc::clone(&self);
                    let bound = Arc::clone(&bound);
                    let active = Arc::clone(&active);
                    tokio::spawn(async move {
                        match bound.wrap(tcp_stream).await {
                            Ok(stream) => {
                                broker.client_connected(stream, bound.config()).await;
                            }
                            Err(err) => {
                                log::info!(
                                    "broker: Handshake with {peer_addr} failed: {err}"
                                );
                            }
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(err) => {
                    log::error!(
                        "broker: Listener {} failed to accept: {err}",
                        bound.config().name()
                    );
                    break;
                }
            }
        }
    }

    async fn client_connected(self: &Arc<Self>, stream: Stream, listener: &config::Listener) {
        if let Err(err) = self.handle_connection(stream, listener).await {
            log::info!("broker: Connection ended: {err}");
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: Stream,
        listener: &config::Listener,
    ) -> Result<(), Error> {
        let (mut reader, mut writer) = stream.split();
        let mut buf = Vec::new();

        // The first packet must be a Connect, within the configured
        // timeout.
        let connect_timeout = Duration::from_secs(self.config.connect_timeout());
        let first = match tokio::time::timeout(
            connect_timeout,
            read_first_packet(&mut reader, &mut buf),
        )
        .await
        {
            Err(_elapsed) => {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    "broker: No Connect packet within timeout",
                ));
            }
            Ok(result) => result?,
        };

        let connect = match first {
            Ok(MqttPacket::Connect(connect)) => connect,
            Ok(packet) => {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!(
                        "broker: Expected Connect as first packet, got {:?}",
                        packet.packet_type()
                    ),
                ));
            }
            Err(
                err @ (DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel),
            ) => {
                send_connack_direct(
                    &mut writer,
                    ConnectReturnCode::UnacceptableProtocolVersion,
                )
                .await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        if connect.protocol_level() != ProtocolLevel::V311 {
            send_connack_direct(
                &mut writer,
                ConnectReturnCode::UnacceptableProtocolVersion,
            )
            .await;
            return Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!(
                    "broker: Unsupported protocol level {:?}",
                    connect.protocol_level()
                ),
            ));
        }

        let clean_session = connect.clean_session();
        let client_id = if connect.client_id().is_empty() {
            // A zero length client id requires a clean session; the
            // broker assigns a unique id [MQTT-3.1.3-7].
            if !clean_session {
                send_connack_direct(&mut writer, ConnectReturnCode::IdentifierRejected)
                    .await;
                return Err(Error::new(
                    ErrorKind::ProtocolError,
                    "broker: Empty client id with unclean session",
                ));
            }
            codec::utils::random_client_id()
        } else {
            connect.client_id().to_string()
        };

        let session_info = SessionInfo {
            client_id: client_id.clone(),
            username: connect.username().map(ToString::to_string),
            password: connect.password().map(<[u8]>::to_vec),
            clean_session,
        };
        if !self.plugins.map_plugin_auth(&session_info).await {
            let return_code = if connect.username().is_some() {
                ConnectReturnCode::BadUserNameOrPassword
            } else {
                ConnectReturnCode::NotAuthorized
            };
            send_connack_direct(&mut writer, return_code).await;
            return Err(Error::from_string(
                ErrorKind::ConnectionRefused,
                format!("broker: Client {client_id} failed authentication"),
            ));
        }

        // A second Connect under an attached client id disconnects the
        // old connection before the ConnectAck is sent.
        let old_connection = { self.state.lock().await.connections.remove(&client_id) };
        if let Some(old_connection) = old_connection {
            log::info!("broker: Session takeover for client id {client_id}");
            old_connection.handler.stop().await;
        }

        let (session, session_present) = {
            let mut state = self.state.lock().await;
            if clean_session {
                state.sessions.remove(&client_id);
                state.pending.remove(&client_id);
            }
            let entry = if clean_session {
                None
            } else {
                state.sessions.get(&client_id).cloned()
            };
            match entry {
                Some(session) => (session, true),
                None => {
                    let session =
                        Arc::new(Mutex::new(Session::new(&client_id, clean_session, 0)));
                    state.sessions.insert(client_id.clone(), Arc::clone(&session));
                    (session, false)
                }
            }
        };

        let keep_alive = if connect.keep_alive() == 0 {
            listener.keep_alive()
        } else {
            connect.keep_alive()
        };

        {
            let mut session = session.lock().await;
            session.set_keep_alive(keep_alive);
            session.set_username(connect.username());
            session.set_password(connect.password());
            session.set_will(build_will(&connect));
            session.set_state(SessionState::Connected);
        }

        let handler = ProtocolHandler::from_halves(
            Arc::clone(&session),
            Arc::clone(&self.plugins),
            reader,
            writer,
            buf,
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().await;
            state.connections.insert(
                client_id.clone(),
                ConnectionHandle {
                    id: connection_id,
                    handler: handler.clone(),
                    outbound_tx: outbound_tx.clone(),
                },
            );
            self.stats.set_clients_total(state.sessions.len() as u64);
        }

        // The first packet sent to the client MUST be the ConnectAck
        // [MQTT-3.2.0-1].
        handler
            .send_packet(&ConnectAckPacket::new(
                session_present,
                ConnectReturnCode::Accepted,
            ))
            .await?;

        self.plugins
            .fire_event(&Event::BrokerClientConnected {
                client_id: client_id.clone(),
            })
            .await;
        self.plugins
            .fire_event(&Event::Connected {
                client_id: client_id.clone(),
            })
            .await;

        let control_rx = handler.take_control_receiver().await.ok_or_else(|| {
            Error::new(ErrorKind::ChannelError, "broker: Control channel taken")
        })?;
        let broker_handler = BrokerHandler::new(handler.clone(), Arc::clone(self), keep_alive);
        handler.start().await?;

        // Flush QoS 1/2 messages queued while this unclean session was
        // offline.
        let pending = { self.state.lock().await.pending.remove(&client_id) };
        if let Some(pending) = pending {
            for delivery in pending {
                let _ = outbound_tx.send(delivery);
            }
        }

        log::info!("broker: Client {client_id} connected");
        let graceful = broker_handler.run(control_rx, outbound_rx).await;
        self.client_disconnected(&client_id, connection_id, graceful)
            .await;
        Ok(())
    }

    async fn client_disconnected(
        self: &Arc<Self>,
        client_id: &str,
        connection_id: u64,
        graceful: bool,
    ) {
        let (still_owner, session) = {
            let mut state = self.state.lock().await;
            let still_owner = state
                .connections
                .get(client_id)
                .is_some_and(|handle| handle.id == connection_id);
            if still_owner {
                state.connections.remove(client_id);
            }
            (still_owner, state.sessions.get(client_id).cloned())
        };

        self.plugins
            .fire_event(&Event::BrokerClientDisconnected {
                client_id: client_id.to_string(),
            })
            .await;
        log::info!("broker: Client {client_id} disconnected, graceful: {graceful}");

        if !still_owner {
            // A takeover successor owns the session now.
            return;
        }
        let Some(session) = session else {
            return;
        };

        let (clean_session, will) = {
            let mut session = session.lock().await;
            session.set_state(SessionState::Disconnected);
            (session.clean_session(), session.will().cloned())
        };

        if !graceful {
            if let Some(will) = will {
                log::info!("broker: Publishing will of client {client_id}");
                self.publish_message(&will.topic, &will.message, will.qos, will.retain)
                    .await;
            }
        }

        if clean_session {
            let delay = self.config.timeout_disconnect_delay();
            let broker = Arc::clone(self);
            let client_id = client_id.to_string();
            let finalize = async move {
                let mut state = broker.state.lock().await;
                if !state.connections.contains_key(&client_id) {
                    state.sessions.remove(&client_id);
                    state.pending.remove(&client_id);
                    broker.stats.set_clients_total(state.sessions.len() as u64);
                }
            };
            if delay == 0 {
                finalize.await;
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    finalize.await;
                });
            }
        }
    }

    /// One message arrived from a connected publisher. Gate it through
    /// the topic plugins, update the retained store and fan it out.
    pub(crate) async fn on_message_received(&self, publisher_id: &str, msg: ApplicationMessage) {
        self.plugins
            .fire_event(&Event::BrokerMessageReceived {
                client_id: publisher_id.to_string(),
                topic: msg.topic().to_string(),
                qos: msg.qos(),
                retain: msg.retain(),
            })
            .await;

        let info = {
            let session = { self.state.lock().await.sessions.get(publisher_id).cloned() };
            match session {
                Some(session) => session.lock().await.info(),
                None => SessionInfo {
                    client_id: publisher_id.to_string(),
                    ..SessionInfo::default()
                },
            }
        };
        if !self
            .plugins
            .map_plugin_topic(&info, msg.topic(), AclAction::Publish)
            .await
        {
            // The per-QoS acks were already sent by the handler; the
            // message is silently dropped.
            log::info!(
                "broker: Publish to {} by {publisher_id} denied, dropped",
                msg.topic()
            );
            return;
        }

        self.publish_message(msg.topic(), msg.payload(), msg.qos(), msg.retain())
            .await;
    }

    /// Update the retained store and fan the message out to matching
    /// subscribers. Used for client publishes, will messages and `$SYS`
    /// stats.
    pub(crate) async fn publish_message(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) {
        if retain {
            self.state.lock().await.retained.apply(topic, payload, qos);
        }
        self.dispatch(topic, payload, qos).await;
    }

    /// Enqueue a copy for every matching subscription of every session,
    /// at min(publish QoS, subscription QoS). The subscriber list is
    /// snapshot at publish time.
    async fn dispatch(&self, topic: &str, payload: &[u8], qos: QoS) {
        let snapshot: Vec<(
            String,
            Arc<Mutex<Session>>,
            Option<mpsc::UnboundedSender<QueuedDelivery>>,
        )> = {
            let state = self.state.lock().await;
            state
                .sessions
                .iter()
                .map(|(id, session)| {
                    (
                        id.clone(),
                        Arc::clone(session),
                        state
                            .connections
                            .get(id)
                            .map(|handle| handle.outbound_tx.clone()),
                    )
                })
                .collect()
        };

        for (client_id, session, outbound_tx) in snapshot {
            let matched: Vec<QoS> = {
                let session = session.lock().await;
                session
                    .subscriptions()
                    .iter()
                    .filter(|pattern| pattern.topic().is_match(topic))
                    .map(SubscribePattern::qos)
                    .collect()
            };

            for sub_qos in matched {
                let delivery = QueuedDelivery {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos: qos.min(sub_qos),
                    retain: false,
                };
                match &outbound_tx {
                    Some(outbound_tx) => {
                        if outbound_tx.send(delivery).is_err() {
                            log::debug!(
                                "broker: Dropping delivery to detaching client {client_id}"
                            );
                        }
                    }
                    None => {
                        // Offline unclean session: QoS 1/2 messages wait
                        // for the reconnect.
                        if delivery.qos != QoS::AtMostOnce {
                            self.state
                                .lock()
                                .await
                                .pending
                                .entry(client_id.clone())
                                .or_default()
                                .push(delivery);
                        }
                    }
                }
            }
        }
    }

    /// Apply a Subscribe packet: per-filter topic gate, session update,
    /// Suback, then matching retained messages.
    pub(crate) async fn handle_subscribe(
        &self,
        broker_handler: &BrokerHandler,
        packet: &SubscribePacket,
    ) -> Result<(), Error> {
        let handler = broker_handler.handler();
        let session = handler.session();
        let info = { session.lock().await.info() };
        let client_id = info.client_id.clone();

        let mut acks = Vec::new();
        let mut granted: Vec<(Topic, QoS)> = Vec::new();
        for topic in packet.topics() {
            if !self
                .plugins
                .map_plugin_topic(&info, topic.topic(), AclAction::Subscribe)
                .await
            {
                acks.push(SubscribeAck::Failed);
                continue;
            }
            match SubscribePattern::parse(topic.topic(), topic.qos()) {
                Ok(pattern) => {
                    let filter = pattern.topic().clone();
                    session.lock().await.upsert_subscription(pattern);
                    acks.push(SubscribeAck::QoS(topic.qos()));
                    granted.push((filter, topic.qos()));
                    self.plugins
                        .fire_event(&Event::Subscribe {
                            client_id: client_id.clone(),
                            filter: topic.topic().to_string(),
                            qos: topic.qos(),
                        })
                        .await;
                }
                Err(err) => {
                    log::error!(
                        "broker: Invalid subscribe filter {}, err: {err:?}",
                        topic.topic()
                    );
                    acks.push(SubscribeAck::Failed);
                }
            }
        }

        let suback = SubscribeAckPacket::with_vec(packet.packet_id(), acks);
        handler.send_packet(&suback).await?;

        // Retained messages follow the Suback, with the retain flag set
        // and at min(retained QoS, granted QoS).
        let outbound_tx = {
            self.state
                .lock()
                .await
                .connections
                .get(&client_id)
                .map(|handle| handle.outbound_tx.clone())
        };
        let Some(outbound_tx) = outbound_tx else {
            return Ok(());
        };
        for (filter, sub_qos) in granted {
            let retained = { self.state.lock().await.retained.matches(&filter) };
            for msg in retained {
                let _ = outbound_tx.send(QueuedDelivery {
                    topic: msg.topic,
                    payload: msg.payload,
                    qos: msg.qos.min(sub_qos),
                    retain: true,
                });
            }
        }
        Ok(())
    }

    /// Apply an Unsubscribe packet and reply with the Unsuback.
    pub(crate) async fn handle_unsubscribe(
        &self,
        broker_handler: &BrokerHandler,
        packet: &UnsubscribePacket,
    ) -> Result<(), Error> {
        let handler = broker_handler.handler();
        let session = handler.session();
        let client_id = handler.client_id().await;

        for topic in packet.topics() {
            let removed = { session.lock().await.remove_subscription(topic.as_ref()) };
            if removed {
                self.plugins
                    .fire_event(&Event::Unsubscribe {
                        client_id: client_id.clone(),
                        filter: topic.as_ref().to_string(),
                    })
                    .await;
            } else {
                log::debug!(
                    "broker: {client_id}: Unsubscribe of unknown filter {}",
                    topic.as_ref()
                );
            }
        }

        handler
            .send_packet(&UnsubscribeAckPacket::new(packet.packet_id()))
            .await
            .map(drop)
    }
}

fn build_will(connect: &ConnectPacket) -> Option<Will> {
    let topic = connect.will_topic()?;
    Some(Will {
        topic: topic.to_string(),
        message: connect.will_message().unwrap_or_default().to_vec(),
        qos: connect.connect_flags().will_qos,
        retain: connect.connect_flags().will_retain,
    })
}

/// Read the first packet of a fresh connection, keeping protocol errors
/// distinguishable from socket errors so the Connect gate can pick the
/// right ConnectAck return code.
async fn read_first_packet(
    reader: &mut StreamReader,
    buf: &mut Vec<u8>,
) -> Result<Result<MqttPacket, DecodeError>, Error> {
    loop {
        if !buf.is_empty() {
            let mut ba = ByteArray::new(buf);
            match MqttPacket::decode(&mut ba) {
                Ok(packet) => {
                    let consumed = ba.offset();
                    buf.drain(..consumed);
                    return Ok(Ok(packet));
                }
                Err(DecodeError::InsufficientData) => {}
                Err(err) => return Ok(Err(err)),
            }
        }
        let n_read = reader.read_buf(buf).await?;
        if n_read == 0 {
            return Err(connection_closed_error());
        }
    }
}

/// Reply a refusal ConnectAck on a connection that never gets a handler.
async fn send_connack_direct(writer: &mut StreamWriter, return_code: ConnectReturnCode) {
    let packet = ConnectAckPacket::new(false, return_code);
    let mut buf = Vec::new();
    if packet.encode(&mut buf).is_ok() {
        if let Err(err) = writer.write_all(&buf).await {
            log::debug!("broker: Failed to send refusal ConnectAck: {err}");
        }
    }
    writer.shutdown().await;
}
