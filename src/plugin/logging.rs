// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use futures::future::BoxFuture;

use super::{Event, Plugin};
use crate::error::Error;

/// Logs the name of every fired event.
#[derive(Debug, Default, Clone)]
pub struct EventLoggerPlugin;

impl EventLoggerPlugin {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Plugin for EventLoggerPlugin {
    fn name(&self) -> &str {
        "event-logger"
    }

    fn handle_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            log::info!("### '{}' EVENT FIRED ###", event.name());
            Ok(())
        })
    }
}

/// Logs every packet sent to or received from a peer.
#[derive(Debug, Default, Clone)]
pub struct PacketLoggerPlugin;

impl PacketLoggerPlugin {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Plugin for PacketLoggerPlugin {
    fn name(&self) -> &str {
        "packet-logger"
    }

    fn handle_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match event {
                Event::PacketReceived {
                    client_id,
                    packet_type,
                    ..
                } => {
                    log::debug!("{client_id} <-in-- {packet_type:?}");
                }
                Event::PacketSent {
                    client_id,
                    packet_type,
                    ..
                } => {
                    log::debug!("{client_id} -out-> {packet_type:?}");
                }
                _ => {}
            }
            Ok(())
        })
    }
}
