// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Protocol handler tests with a scripted peer on the other side of a
//! real tcp connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

use anzu::error::ErrorKind;
use anzu::handler::ProtocolHandler;
use anzu::plugin::PluginManager;
use anzu::session::Session;
use anzu::stream::Stream;
use codec::{
    MqttPacket, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS,
};

mod common;
use common::{read_packet, write_packet};

const WAIT: Duration = Duration::from_secs(5);

async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn new_handler(session: &Arc<Mutex<Session>>, stream: TcpStream) -> ProtocolHandler {
    let plugins = Arc::new(PluginManager::with_event_plugins(Vec::new()));
    ProtocolHandler::new(Arc::clone(session), plugins, Stream::Mqtt(stream))
}

#[tokio::test]
async fn test_publish_qos0() {
    let (client, mut peer) = connected_pair().await;
    let session = Arc::new(Mutex::new(Session::new("c1", true, 0)));
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let msg = timeout(WAIT, handler.publish("a/topic", b"test_data", QoS::AtMostOnce, false))
        .await
        .unwrap()
        .unwrap();
    assert!(msg.publish_packet.is_some());
    assert!(msg.puback_packet.is_none());
    assert!(msg.pubrec_packet.is_none());
    assert!(msg.pubrel_packet.is_none());
    assert!(msg.pubcomp_packet.is_none());

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected Publish, got {packet:?}");
    };
    assert_eq!(publish.topic(), "a/topic");
    assert_eq!(publish.qos(), QoS::AtMostOnce);
    // A QoS 0 publish carries no packet id and no inflight entry.
    assert_eq!(publish.packet_id(), PacketId::new(0));
    assert!(session.lock().await.inflight_out(PacketId::new(1)).is_none());

    handler.stop().await;
}

#[tokio::test]
async fn test_publish_qos1() {
    let (client, mut peer) = connected_pair().await;
    let session = Arc::new(Mutex::new(Session::new("c1", true, 0)));
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let publish_handler = handler.clone();
    let publish_task = tokio::spawn(async move {
        publish_handler
            .publish("a/topic", b"test_data", QoS::AtLeastOnce, false)
            .await
    });

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected Publish, got {packet:?}");
    };
    let packet_id = publish.packet_id();
    assert_ne!(packet_id.value(), 0);
    assert!(session.lock().await.inflight_out(packet_id).is_some());

    write_packet(&mut peer, &PublishAckPacket::new(packet_id)).await;

    let msg = timeout(WAIT, publish_task).await.unwrap().unwrap().unwrap();
    assert!(msg.publish_packet.is_some());
    assert!(msg.puback_packet.is_some());
    assert!(msg.pubrec_packet.is_none());
    // Exactly one Puback completes the handshake and frees the id.
    assert!(session.lock().await.inflight_out(packet_id).is_none());

    handler.stop().await;
}

#[tokio::test]
async fn test_publish_qos2() {
    let (client, mut peer) = connected_pair().await;
    let session = Arc::new(Mutex::new(Session::new("c1", true, 0)));
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let publish_handler = handler.clone();
    let publish_task = tokio::spawn(async move {
        publish_handler
            .publish("a/topic", b"test_data", QoS::ExactOnce, false)
            .await
    });

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected Publish, got {packet:?}");
    };
    let packet_id = publish.packet_id();

    write_packet(&mut peer, &PublishReceivedPacket::new(packet_id)).await;

    // Pubrec must be answered with Pubrel before Pubcomp ends the flow.
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::PublishRelease(pubrel) = packet else {
        panic!("expected PublishRelease, got {packet:?}");
    };
    assert_eq!(pubrel.packet_id(), packet_id);

    write_packet(&mut peer, &PublishCompletePacket::new(packet_id)).await;

    let msg = timeout(WAIT, publish_task).await.unwrap().unwrap().unwrap();
    assert!(msg.publish_packet.is_some());
    assert!(msg.pubrec_packet.is_some());
    assert!(msg.pubrel_packet.is_some());
    assert!(msg.pubcomp_packet.is_some());
    assert!(msg.puback_packet.is_none());
    assert!(session.lock().await.inflight_out(packet_id).is_none());

    handler.stop().await;
}

#[tokio::test]
async fn test_incoming_qos2_duplicate_publish_delivers_once() {
    let (client, mut peer) = connected_pair().await;
    let session = Arc::new(Mutex::new(Session::new("c1", true, 0)));
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let packet_id = PacketId::new(5);
    let mut publish = PublishPacket::new("a/b", QoS::ExactOnce, b"payload").unwrap();
    publish.set_packet_id(packet_id);

    let mut buf = Vec::new();
    write_packet(&mut peer, &publish).await;
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    assert_eq!(
        packet,
        MqttPacket::PublishReceived(PublishReceivedPacket::new(packet_id))
    );

    // Retransmission with the dup flag: recognized by the packet id in
    // the inflight-in table, answered with Pubrec again.
    let mut dup = publish.clone();
    dup.set_dup(true).unwrap();
    write_packet(&mut peer, &dup).await;
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    assert_eq!(
        packet,
        MqttPacket::PublishReceived(PublishReceivedPacket::new(packet_id))
    );

    write_packet(&mut peer, &PublishReleasePacket::new(packet_id)).await;
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    assert_eq!(
        packet,
        MqttPacket::PublishComplete(PublishCompletePacket::new(packet_id))
    );

    // The application sees the message exactly once.
    let msg = timeout(WAIT, handler.next_delivery()).await.unwrap().unwrap();
    assert_eq!(msg.topic(), "a/b");
    assert_eq!(msg.payload(), b"payload");
    assert!(
        timeout(Duration::from_millis(300), handler.next_delivery())
            .await
            .is_err()
    );

    handler.stop().await;
}

#[tokio::test]
async fn test_qos2_reconnect_resumes_with_pubrel() {
    let session = Arc::new(Mutex::new(Session::new("c1", false, 0)));

    // First connection: Publish, receive Pubrec, lose the connection
    // before Pubcomp.
    let (client, mut peer) = connected_pair().await;
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let publish_handler = handler.clone();
    let publish_task = tokio::spawn(async move {
        publish_handler
            .publish("a/topic", b"test_data", QoS::ExactOnce, false)
            .await
    });

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected Publish, got {packet:?}");
    };
    let packet_id = publish.packet_id();
    write_packet(&mut peer, &PublishReceivedPacket::new(packet_id)).await;

    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    assert!(matches!(packet, MqttPacket::PublishRelease(_)));
    drop(peer);

    // The caller sees a cancellation; the inflight entry survives.
    let result = timeout(WAIT, publish_task).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(session.lock().await.inflight_out(packet_id).is_some());
    handler.stop().await;

    // Second connection with the same session: the handler resumes with
    // Pubrel, not Publish.
    let (client, mut peer) = connected_pair().await;
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::PublishRelease(pubrel) = packet else {
        panic!("expected PublishRelease on reconnect, got {packet:?}");
    };
    assert_eq!(pubrel.packet_id(), packet_id);

    write_packet(&mut peer, &PublishCompletePacket::new(packet_id)).await;

    // The completed handshake frees the inflight entry.
    timeout(WAIT, async {
        loop {
            if session.lock().await.inflight_out(packet_id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    handler.stop().await;
}

#[tokio::test]
async fn test_qos1_reconnect_republishes_with_dup() {
    let session = Arc::new(Mutex::new(Session::new("c1", false, 0)));

    let (client, mut peer) = connected_pair().await;
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let publish_handler = handler.clone();
    let publish_task = tokio::spawn(async move {
        publish_handler
            .publish("a/topic", b"test_data", QoS::AtLeastOnce, false)
            .await
    });

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected Publish, got {packet:?}");
    };
    assert!(!publish.dup());
    let packet_id = publish.packet_id();
    drop(peer);
    let _cancelled = timeout(WAIT, publish_task).await.unwrap().unwrap();
    handler.stop().await;

    let (client, mut peer) = connected_pair().await;
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let mut buf = Vec::new();
    let packet = timeout(WAIT, read_packet(&mut peer, &mut buf)).await.unwrap();
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected re-Publish on reconnect, got {packet:?}");
    };
    assert!(publish.dup());
    assert_eq!(publish.packet_id(), packet_id);

    write_packet(&mut peer, &PublishAckPacket::new(packet_id)).await;
    timeout(WAIT, async {
        loop {
            if session.lock().await.inflight_out(packet_id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    handler.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_publish() {
    let (client, mut _peer) = connected_pair().await;
    let session = Arc::new(Mutex::new(Session::new("c1", true, 0)));
    let handler = new_handler(&session, client);
    handler.start().await.unwrap();

    let publish_handler = handler.clone();
    let publish_task = tokio::spawn(async move {
        publish_handler
            .publish("a/topic", b"test_data", QoS::AtLeastOnce, false)
            .await
    });
    // Let the publish reach its waiter before stopping.
    tokio::time::sleep(Duration::from_millis(100)).await;
    handler.stop().await;

    let result = timeout(WAIT, publish_task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // Operations after stop fail fast.
    let err = handler
        .publish("a/topic", b"x", QoS::AtMostOnce, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandlerStopped);
}
