// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Plugin registry, event fan-out and authentication/topic voting.

use codec::{PacketType, QoS};
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, ErrorKind};

mod auth;
mod logging;
mod sys;
mod topic_checking;

pub use auth::{AnonymousAuthPlugin, PasswordFileAuthPlugin};
pub use logging::{EventLoggerPlugin, PacketLoggerPlugin};
pub use sys::{BrokerSysPlugin, SysStats};
pub use topic_checking::{TopicAclPlugin, TopicTabooPlugin};

/// Snapshot of session identity handed to plugins.
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub clean_session: bool,
}

/// Action being checked by topic filtering plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Publish,
    Subscribe,
}

/// Verdict of one authentication plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,

    /// The plugin has no opinion on this session. Does not veto.
    Undecided,
}

/// Events fired by the protocol handlers and the broker.
#[derive(Debug, Clone)]
pub enum Event {
    PacketReceived {
        client_id: String,
        packet_type: PacketType,
        bytes: usize,
    },
    PacketSent {
        client_id: String,
        packet_type: PacketType,
        bytes: usize,
    },
    Connected {
        client_id: String,
    },
    Disconnected {
        client_id: String,
    },
    Subscribe {
        client_id: String,
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        client_id: String,
        filter: String,
    },
    BrokerClientConnected {
        client_id: String,
    },
    BrokerClientDisconnected {
        client_id: String,
    },
    BrokerMessageReceived {
        client_id: String,
        topic: String,
        qos: QoS,
        retain: bool,
    },
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PacketReceived { .. } => "mqtt_packet_received",
            Self::PacketSent { .. } => "mqtt_packet_sent",
            Self::Connected { .. } => "mqtt_connected",
            Self::Disconnected { .. } => "mqtt_disconnected",
            Self::Subscribe { .. } => "mqtt_subscribe",
            Self::Unsubscribe { .. } => "mqtt_unsubscribe",
            Self::BrokerClientConnected { .. } => "broker_client_connected",
            Self::BrokerClientDisconnected { .. } => "broker_client_disconnected",
            Self::BrokerMessageReceived { .. } => "broker_message_received",
        }
    }
}

/// Everything a plugin gets at construction time.
#[derive(Clone)]
pub struct PluginContext {
    pub config: Arc<Config>,
    pub sys_stats: Arc<SysStats>,
}

/// An event plugin. Events the plugin does not care about fall through
/// the default no-op handler.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn handle_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), Error>> {
        let _ = event;
        Box::pin(async { Ok(()) })
    }
}

/// An authentication plugin, voting on every Connect packet.
pub trait AuthPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn authenticate<'a>(&'a self, session: &'a SessionInfo) -> BoxFuture<'a, AuthDecision>;
}

/// A topic filtering plugin, voting on subscribe and publish actions.
pub trait TopicPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn allow_topic<'a>(
        &'a self,
        session: &'a SessionInfo,
        topic: &'a str,
        action: AclAction,
    ) -> BoxFuture<'a, bool>;
}

fn make_event_plugin(name: &str, ctx: &PluginContext) -> Result<Arc<dyn Plugin>, Error> {
    match name {
        "event-logger" => Ok(Arc::new(EventLoggerPlugin::new())),
        "packet-logger" => Ok(Arc::new(PacketLoggerPlugin::new())),
        "broker-sys" => Ok(Arc::new(BrokerSysPlugin::new(Arc::clone(&ctx.sys_stats)))),
        _ => Err(Error::from_string(
            ErrorKind::ConfigError,
            format!("plugin: Unknown event plugin name: {name}"),
        )),
    }
}

fn make_auth_plugin(name: &str, ctx: &PluginContext) -> Result<Arc<dyn AuthPlugin>, Error> {
    match name {
        "auth-anonymous" => Ok(Arc::new(AnonymousAuthPlugin::new(&ctx.config))),
        "auth-file" => Ok(Arc::new(PasswordFileAuthPlugin::new(&ctx.config)?)),
        _ => Err(Error::from_string(
            ErrorKind::ConfigError,
            format!("plugin: Unknown auth plugin name: {name}"),
        )),
    }
}

fn make_topic_plugin(name: &str, ctx: &PluginContext) -> Result<Arc<dyn TopicPlugin>, Error> {
    match name {
        "topic-taboo" => Ok(Arc::new(TopicTabooPlugin::new(&ctx.config))),
        "topic-acl" => Ok(Arc::new(TopicAclPlugin::new(&ctx.config))),
        _ => Err(Error::from_string(
            ErrorKind::ConfigError,
            format!("plugin: Unknown topic plugin name: {name}"),
        )),
    }
}

/// Holds every registered plugin and fans events and votes out to them.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    auth_plugins: Vec<Arc<dyn AuthPlugin>>,
    topic_plugins: Vec<Arc<dyn TopicPlugin>>,
}

impl PluginManager {
    /// Instantiate every plugin named in `config`.
    ///
    /// # Errors
    ///
    /// Returns error if a plugin name is unknown or a plugin fails to
    /// initialize.
    pub fn from_config(ctx: &PluginContext) -> Result<Self, Error> {
        let config = &ctx.config;

        let mut plugins = Vec::new();
        for name in config.plugins() {
            plugins.push(make_event_plugin(name, ctx)?);
        }

        let mut auth_plugins = Vec::new();
        let auth_names = config
            .auth()
            .map_or_else(|| vec!["auth-anonymous".to_string()], |a| a.plugins().to_vec());
        for name in &auth_names {
            auth_plugins.push(make_auth_plugin(name, ctx)?);
        }

        let mut topic_plugins = Vec::new();
        if let Some(topic_check) = config.topic_check() {
            if topic_check.enabled() {
                for name in topic_check.plugins() {
                    topic_plugins.push(make_topic_plugin(name, ctx)?);
                }
            }
        }

        Ok(Self {
            plugins,
            auth_plugins,
            topic_plugins,
        })
    }

    /// Build a manager with only event plugins, used on the client side.
    #[must_use]
    pub fn with_event_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            auth_plugins: Vec::new(),
            topic_plugins: Vec::new(),
        }
    }

    /// Invoke every plugin's handler for `event` concurrently and wait for
    /// all of them.
    ///
    /// A failing plugin is logged and swallowed so that one plugin cannot
    /// break the fan-out.
    pub async fn fire_event(&self, event: &Event) {
        let tasks = self
            .plugins
            .iter()
            .map(|plugin| plugin.handle_event(event));
        for (plugin, result) in self.plugins.iter().zip(join_all(tasks).await) {
            if let Err(err) = result {
                log::error!(
                    "plugin: {} failed to handle event {}, err: {err}",
                    plugin.name(),
                    event.name()
                );
            }
        }
    }

    /// Run every auth plugin; the session is authorized iff no plugin
    /// denies it. An undecided plugin does not veto.
    pub async fn map_plugin_auth(&self, session: &SessionInfo) -> bool {
        let tasks = self
            .auth_plugins
            .iter()
            .map(|plugin| plugin.authenticate(session));
        for (plugin, decision) in self.auth_plugins.iter().zip(join_all(tasks).await) {
            match decision {
                AuthDecision::Allow | AuthDecision::Undecided => {}
                AuthDecision::Deny => {
                    log::info!(
                        "plugin: {} denied access for client {}",
                        plugin.name(),
                        session.client_id
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Run every topic plugin; `topic` is permitted iff every plugin
    /// returns true. With no topic plugins loaded everything is permitted.
    pub async fn map_plugin_topic(
        &self,
        session: &SessionInfo,
        topic: &str,
        action: AclAction,
    ) -> bool {
        let tasks = self
            .topic_plugins
            .iter()
            .map(|plugin| plugin.allow_topic(session, topic, action));
        for (plugin, allowed) in self.topic_plugins.iter().zip(join_all(tasks).await) {
            if !allowed {
                log::info!(
                    "plugin: {} denied {action:?} on topic {topic} for client {}",
                    plugin.name(),
                    session.client_id
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(config_text: &str) -> PluginContext {
        let config: Config = toml::from_str(config_text).unwrap();
        PluginContext {
            config: Arc::new(config),
            sys_stats: Arc::new(SysStats::new()),
        }
    }

    #[tokio::test]
    async fn test_missing_auth_section_denies_anonymous() {
        let ctx = test_context("");
        let manager = PluginManager::from_config(&ctx).unwrap();
        let session = SessionInfo {
            client_id: "c1".to_string(),
            ..SessionInfo::default()
        };
        assert!(!manager.map_plugin_auth(&session).await);
    }

    #[tokio::test]
    async fn test_allow_anonymous() {
        let ctx = test_context("[auth]\nallow-anonymous = true\n");
        let manager = PluginManager::from_config(&ctx).unwrap();
        let session = SessionInfo {
            client_id: "c1".to_string(),
            ..SessionInfo::default()
        };
        assert!(manager.map_plugin_auth(&session).await);
    }

    #[tokio::test]
    async fn test_unknown_plugin_name() {
        let config: Config = toml::from_str("plugins = [\"no-such-plugin\"]\n").unwrap();
        let ctx = PluginContext {
            config: Arc::new(config),
            sys_stats: Arc::new(SysStats::new()),
        };
        assert!(PluginManager::from_config(&ctx).is_err());
    }

    #[tokio::test]
    async fn test_topic_check_disabled_permits_everything() {
        let ctx = test_context("");
        let manager = PluginManager::from_config(&ctx).unwrap();
        let session = SessionInfo::default();
        assert!(
            manager
                .map_plugin_topic(&session, "any/topic", AclAction::Subscribe)
                .await
        );
    }
}
