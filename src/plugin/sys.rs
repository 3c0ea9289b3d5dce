// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Event, Plugin};
use crate::error::Error;

/// Broker statistics republished on the `$SYS` topic tree.
#[derive(Debug, Default)]
pub struct SysStats {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    clients_connected: AtomicU64,
    clients_total: AtomicU64,
}

impl SysStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_packet_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_client_disconnected(&self) {
        let _ = self
            .clients_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    pub fn set_clients_total(&self, total: u64) {
        self.clients_total.store(total, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn clients_connected(&self) -> u64 {
        self.clients_connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn clients_total(&self) -> u64 {
        self.clients_total.load(Ordering::Relaxed)
    }
}

/// Feeds broker statistics from fired events. The broker republishes the
/// counters every `sys-interval` seconds.
pub struct BrokerSysPlugin {
    stats: Arc<SysStats>,
}

impl BrokerSysPlugin {
    #[must_use]
    pub const fn new(stats: Arc<SysStats>) -> Self {
        Self { stats }
    }
}

impl Plugin for BrokerSysPlugin {
    fn name(&self) -> &str {
        "broker-sys"
    }

    fn handle_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match event {
                Event::PacketReceived { bytes, .. } => self.stats.on_packet_received(*bytes),
                Event::PacketSent { bytes, .. } => self.stats.on_packet_sent(*bytes),
                Event::BrokerClientConnected { .. } => self.stats.on_client_connected(),
                Event::BrokerClientDisconnected { .. } => self.stats.on_client_disconnected(),
                _ => {}
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_follow_events() {
        let stats = Arc::new(SysStats::new());
        let plugin = BrokerSysPlugin::new(Arc::clone(&stats));

        let event = Event::PacketReceived {
            client_id: "c1".to_string(),
            packet_type: codec::PacketType::PingRequest,
            bytes: 2,
        };
        plugin.handle_event(&event).await.unwrap();
        plugin.handle_event(&event).await.unwrap();
        assert_eq!(stats.messages_received(), 2);
        assert_eq!(stats.bytes_received(), 4);

        plugin
            .handle_event(&Event::BrokerClientConnected {
                client_id: "c1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stats.clients_connected(), 1);
        plugin
            .handle_event(&Event::BrokerClientDisconnected {
                client_id: "c1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stats.clients_connected(), 0);
        // Underflow clamps at zero.
        plugin
            .handle_event(&Event::BrokerClientDisconnected {
                client_id: "c1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stats.clients_connected(), 0);
    }
}
