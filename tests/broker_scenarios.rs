// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End to end scenarios against an in-process broker over real tcp
//! connections.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use anzu::broker::Broker;
use anzu::client::{Client, ConnectOptions};
use anzu::config::Config;
use anzu::session::Will;
use codec::{ConnectPacket, EncodePacket, QoS, SubscribeAck};

mod common;
use common::write_packet;

const WAIT: Duration = Duration::from_secs(5);

const BASE_CONFIG: &str = r#"
[listeners.default]
type = "tcp"
bind = "127.0.0.1:0"

[auth]
allow-anonymous = true
"#;

async fn start_broker(config_text: &str) -> String {
    let config: Config = toml::from_str(config_text).unwrap();
    let broker = Broker::new(config).unwrap();
    let addrs = broker.start().await.unwrap();
    addrs[0].to_string()
}

#[tokio::test]
async fn test_connect_and_ping() {
    let addr = start_broker(BASE_CONFIG).await;
    let mut options = ConnectOptions::new(&addr);
    options.set_client_id("c1");

    let client = Client::connect(&options).await.unwrap();
    timeout(WAIT, client.ping()).await.unwrap().unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_denied_without_auth_section() {
    let addr = start_broker(
        r#"
[listeners.default]
type = "tcp"
bind = "127.0.0.1:0"
"#,
    )
    .await;

    let mut options = ConnectOptions::new(&addr);
    options.set_client_id("c1");
    let result = Client::connect(&options).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_qos0_pubsub() {
    let addr = start_broker(BASE_CONFIG).await;

    let subscriber = Client::connect(ConnectOptions::new(&addr).set_client_id("sub0"))
        .await
        .unwrap();
    let ack = subscriber.subscribe("a/#", QoS::AtMostOnce).await.unwrap();
    assert_eq!(ack, SubscribeAck::QoS(QoS::AtMostOnce));

    let publisher = Client::connect(ConnectOptions::new(&addr).set_client_id("pub0"))
        .await
        .unwrap();
    publisher
        .publish("a/b", b"hi", QoS::AtMostOnce, false)
        .await
        .unwrap();

    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.topic(), "a/b");
    assert_eq!(msg.payload(), b"hi");
    assert_eq!(msg.qos(), QoS::AtMostOnce);
}

#[tokio::test]
async fn test_qos1_pubsub_downgrades_to_subscription_qos() {
    let addr = start_broker(BASE_CONFIG).await;

    let subscriber = Client::connect(ConnectOptions::new(&addr).set_client_id("sub1"))
        .await
        .unwrap();
    let ack = subscriber.subscribe("a/+", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(ack, SubscribeAck::QoS(QoS::AtLeastOnce));

    let publisher = Client::connect(ConnectOptions::new(&addr).set_client_id("pub1"))
        .await
        .unwrap();
    // The publisher completes only once the broker sent its Puback.
    publisher
        .publish("a/x", b"p", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.topic(), "a/x");
    assert_eq!(msg.qos(), QoS::AtLeastOnce);
    assert_ne!(msg.packet_id().value(), 0);

    // A QoS 2 publish to a QoS 1 subscription arrives downgraded.
    publisher
        .publish("a/y", b"q", QoS::ExactOnce, false)
        .await
        .unwrap();
    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.qos(), QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_qos2_exactly_once() {
    let addr = start_broker(BASE_CONFIG).await;

    let subscriber = Client::connect(ConnectOptions::new(&addr).set_client_id("sub2"))
        .await
        .unwrap();
    subscriber.subscribe("q2/t", QoS::ExactOnce).await.unwrap();

    let publisher = Client::connect(ConnectOptions::new(&addr).set_client_id("pub2"))
        .await
        .unwrap();
    publisher
        .publish("q2/t", b"once", QoS::ExactOnce, false)
        .await
        .unwrap();

    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.payload(), b"once");
    assert_eq!(msg.qos(), QoS::ExactOnce);
    assert!(
        timeout(Duration::from_millis(300), subscriber.next_message())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_retained_message() {
    let addr = start_broker(BASE_CONFIG).await;

    let publisher = Client::connect(ConnectOptions::new(&addr).set_client_id("rpub"))
        .await
        .unwrap();
    publisher
        .publish("sensors/1", b"42", QoS::AtMostOnce, true)
        .await
        .unwrap();

    // A later subscriber receives the retained message with the retain
    // flag set.
    let subscriber = Client::connect(ConnectOptions::new(&addr).set_client_id("rsub"))
        .await
        .unwrap();
    subscriber
        .subscribe("sensors/+", QoS::AtMostOnce)
        .await
        .unwrap();
    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.topic(), "sensors/1");
    assert_eq!(msg.payload(), b"42");
    assert!(msg.retain());

    // An empty retained payload deletes the entry.
    publisher
        .publish("sensors/1", b"", QoS::AtMostOnce, true)
        .await
        .unwrap();
    let late = Client::connect(ConnectOptions::new(&addr).set_client_id("rsub2"))
        .await
        .unwrap();
    late.subscribe("sensors/+", QoS::AtMostOnce).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), late.next_message())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_subscribe_acl() {
    let addr = start_broker(
        r#"
[listeners.default]
type = "tcp"
bind = "127.0.0.1:0"

[auth]
allow-anonymous = true

[topic-check]
enabled = true

[topic-check.acl]
alice = ["a/#"]
"#,
    )
    .await;

    let mut options = ConnectOptions::new(&addr);
    options.set_client_id("alice-1").set_username("alice");
    let client = Client::connect(&options).await.unwrap();

    let ack = client.subscribe("b/c", QoS::AtMostOnce).await.unwrap();
    assert_eq!(ack, SubscribeAck::Failed);

    let ack = client.subscribe("a/x/y", QoS::AtMostOnce).await.unwrap();
    assert_eq!(ack, SubscribeAck::QoS(QoS::AtMostOnce));
}

#[tokio::test]
async fn test_session_takeover_disconnects_old_connection() {
    let addr = start_broker(BASE_CONFIG).await;

    let first = Client::connect(ConnectOptions::new(&addr).set_client_id("dup"))
        .await
        .unwrap();

    let second = Client::connect(ConnectOptions::new(&addr).set_client_id("dup"))
        .await
        .unwrap();

    // The old connection is gone before the new ConnectAck was sent.
    timeout(WAIT, first.wait_disconnect()).await.unwrap();
    second.ping().await.unwrap();
    second.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_will_published_on_keepalive_timeout() {
    let addr = start_broker(BASE_CONFIG).await;

    let watcher = Client::connect(ConnectOptions::new(&addr).set_client_id("watcher"))
        .await
        .unwrap();
    watcher
        .subscribe("will/#", QoS::AtMostOnce)
        .await
        .unwrap();

    // A bare Connect with a will and a 1s keep alive, then silence: the
    // broker must close the connection after 1.5 keep alive periods and
    // publish the will.
    let mut tcp_stream = TcpStream::connect(&addr).await.unwrap();
    let mut connect = ConnectPacket::new("mute");
    connect.set_keep_alive(1);
    connect
        .set_will("will/mute", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    write_packet(&mut tcp_stream, &connect).await;

    let msg = timeout(Duration::from_secs(10), watcher.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic(), "will/mute");
    assert_eq!(msg.payload(), b"gone");
}

#[tokio::test]
async fn test_clean_disconnect_discards_will() {
    let addr = start_broker(BASE_CONFIG).await;

    let watcher = Client::connect(ConnectOptions::new(&addr).set_client_id("watcher2"))
        .await
        .unwrap();
    watcher
        .subscribe("will/#", QoS::AtMostOnce)
        .await
        .unwrap();

    let mut options = ConnectOptions::new(&addr);
    options.set_client_id("polite").set_will(Will {
        topic: "will/polite".to_string(),
        message: b"gone".to_vec(),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let client = Client::connect(&options).await.unwrap();
    client.disconnect().await.unwrap();

    assert!(
        timeout(Duration::from_millis(500), watcher.next_message())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_sys_topics_republished() {
    let addr = start_broker(
        r#"
plugins = ["broker-sys"]
sys-interval = 1

[listeners.default]
type = "tcp"
bind = "127.0.0.1:0"

[auth]
allow-anonymous = true
"#,
    )
    .await;

    let client = Client::connect(ConnectOptions::new(&addr).set_client_id("syswatch"))
        .await
        .unwrap();
    client
        .subscribe("$SYS/broker/uptime", QoS::AtMostOnce)
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(5), client.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic(), "$SYS/broker/uptime");

    // `#` at the root must not leak $SYS traffic.
    let other = Client::connect(ConnectOptions::new(&addr).set_client_id("plainwatch"))
        .await
        .unwrap();
    other.subscribe("#", QoS::AtMostOnce).await.unwrap();
    assert!(
        timeout(Duration::from_millis(1500), other.next_message())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_offline_qos1_queued_for_unclean_session() {
    let addr = start_broker(BASE_CONFIG).await;

    // An unclean subscriber disconnects; QoS 1 messages published while
    // it is away arrive after the reconnect.
    let mut options = ConnectOptions::new(&addr);
    options.set_client_id("persist").set_clean_session(false);
    let subscriber = Client::connect(&options).await.unwrap();
    subscriber
        .subscribe("queued/t", QoS::AtLeastOnce)
        .await
        .unwrap();
    subscriber.disconnect().await.unwrap();

    let publisher = Client::connect(ConnectOptions::new(&addr).set_client_id("qpub"))
        .await
        .unwrap();
    publisher
        .publish("queued/t", b"while-away", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let subscriber = Client::connect(&options).await.unwrap();
    let msg = timeout(WAIT, subscriber.next_message()).await.unwrap().unwrap();
    assert_eq!(msg.topic(), "queued/t");
    assert_eq!(msg.payload(), b"while-away");
}

// Keep the imports of the direct-encode helper honest.
#[tokio::test]
async fn test_raw_connect_is_acknowledged() {
    let addr = start_broker(BASE_CONFIG).await;
    let mut tcp_stream = TcpStream::connect(&addr).await.unwrap();

    let connect = ConnectPacket::new("raw");
    let mut buf = Vec::new();
    connect.encode(&mut buf).unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut tcp_stream, &buf)
        .await
        .unwrap();

    let mut read_buf = Vec::new();
    let packet = timeout(WAIT, common::read_packet(&mut tcp_stream, &mut read_buf))
        .await
        .unwrap();
    let codec::MqttPacket::ConnectAck(ack) = packet else {
        panic!("expected ConnectAck, got {packet:?}");
    };
    assert_eq!(ack.return_code(), codec::ConnectReturnCode::Accepted);
    assert!(!ack.session_present());
}
