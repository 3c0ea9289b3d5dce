// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Periodic republication of broker statistics on the `$SYS` topic tree.

use codec::QoS;
use std::sync::Arc;
use std::time::Duration;

use super::Broker;

pub(crate) fn spawn_sys_task(broker: Arc<Broker>) {
    let period = Duration::from_secs(u64::from(broker.config().sys_interval()));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; stats right after start are
        // not worth a broadcast.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            broker.republish_sys().await;
        }
    });
}

impl Broker {
    /// Publish the current statistics, retained so that late subscribers
    /// see the last values.
    pub(crate) async fn republish_sys(&self) {
        let stats = self.stats();
        let entries = [
            ("$SYS/broker/uptime", self.uptime().as_secs().to_string()),
            (
                "$SYS/broker/clients/connected",
                stats.clients_connected().to_string(),
            ),
            (
                "$SYS/broker/clients/total",
                stats.clients_total().to_string(),
            ),
            (
                "$SYS/broker/messages/received",
                stats.messages_received().to_string(),
            ),
            (
                "$SYS/broker/messages/sent",
                stats.messages_sent().to_string(),
            ),
            (
                "$SYS/broker/bytes/received",
                stats.bytes_received().to_string(),
            ),
            ("$SYS/broker/bytes/sent", stats.bytes_sent().to_string()),
        ];

        for (topic, value) in entries {
            self.publish_message(topic, value.as_bytes(), QoS::AtMostOnce, true)
                .await;
        }
    }
}
