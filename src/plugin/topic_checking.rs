// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use futures::future::BoxFuture;

use super::{AclAction, SessionInfo, TopicPlugin};
use crate::config::{Config, TopicCheck};

const ANONYMOUS_USER: &str = "anonymous";

/// Check one requested topic against one allowed filter, level by level.
///
/// `#` in the allowed filter matches everything below, `+` matches one
/// level.
fn topic_allowed(topic_requested: &str, topic_allowed: &str) -> bool {
    let requested: Vec<&str> = topic_requested.split('/').collect();
    let allowed: Vec<&str> = topic_allowed.split('/').collect();

    for index in 0..requested.len().max(allowed.len()) {
        let (Some(req_level), Some(allowed_level)) = (requested.get(index), allowed.get(index))
        else {
            return false;
        };
        if *allowed_level == "#" {
            return true;
        }
        if *allowed_level != "+" && allowed_level != req_level {
            return false;
        }
    }
    true
}

/// Refuses a fixed list of forbidden topics to everyone but the admin
/// user.
pub struct TopicTabooPlugin {
    topic_config: Option<TopicCheck>,
    taboo: Vec<&'static str>,
}

impl TopicTabooPlugin {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let topic_config = config.topic_check().cloned();
        if topic_config.is_none() {
            log::warn!("topic-taboo: 'topic-check' section not found in configuration");
        }
        Self {
            topic_config,
            taboo: vec!["prohibited", "top-secret", "data/classified"],
        }
    }
}

impl TopicPlugin for TopicTabooPlugin {
    fn name(&self) -> &str {
        "topic-taboo"
    }

    fn allow_topic<'a>(
        &'a self,
        session: &'a SessionInfo,
        topic: &'a str,
        _action: AclAction,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if self.topic_config.is_none() {
                return false;
            }
            if session.username.as_deref() == Some("admin") {
                return true;
            }
            !self.taboo.contains(&topic)
        })
    }
}

/// Checks requested topics against the per-username filter lists from the
/// `topic-check` section.
pub struct TopicAclPlugin {
    topic_config: Option<TopicCheck>,
}

impl TopicAclPlugin {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let topic_config = config.topic_check().cloned();
        if topic_config.is_none() {
            log::warn!("topic-acl: 'topic-check' section not found in configuration");
        }
        Self { topic_config }
    }
}

impl TopicPlugin for TopicAclPlugin {
    fn name(&self) -> &str {
        "topic-acl"
    }

    fn allow_topic<'a>(
        &'a self,
        session: &'a SessionInfo,
        topic: &'a str,
        action: AclAction,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(topic_config) = &self.topic_config else {
                return false;
            };

            // Publish filtering arrived later than subscribe filtering;
            // configs without a publish-acl keep their old permissive
            // behavior.
            let acl = match action {
                AclAction::Publish => match topic_config.publish_acl() {
                    Some(publish_acl) => publish_acl,
                    None => return true,
                },
                AclAction::Subscribe => topic_config.acl(),
            };

            if topic.is_empty() {
                return false;
            }

            let username = session.username.as_deref().unwrap_or(ANONYMOUS_USER);
            let Some(allowed_topics) = acl.get(username) else {
                return false;
            };

            allowed_topics
                .iter()
                .any(|allowed| topic_allowed(topic, allowed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_allowed() {
        assert!(topic_allowed("a/b/c", "a/#"));
        assert!(topic_allowed("a/b", "a/+"));
        assert!(topic_allowed("a/b", "a/b"));
        assert!(!topic_allowed("a/b", "b/#"));
        assert!(!topic_allowed("a/b/c", "a/+"));
        assert!(!topic_allowed("a", "a/b"));
    }

    fn acl_plugin(config_text: &str) -> TopicAclPlugin {
        let config: Config = toml::from_str(config_text).unwrap();
        TopicAclPlugin::new(&config)
    }

    fn alice() -> SessionInfo {
        SessionInfo {
            client_id: "c1".to_string(),
            username: Some("alice".to_string()),
            ..SessionInfo::default()
        }
    }

    #[tokio::test]
    async fn test_subscribe_acl() {
        let plugin = acl_plugin(
            r#"
[topic-check]
enabled = true

[topic-check.acl]
alice = ["a/#"]
"#,
        );
        let session = alice();
        assert!(
            plugin
                .allow_topic(&session, "a/x/y", AclAction::Subscribe)
                .await
        );
        assert!(
            !plugin
                .allow_topic(&session, "b/c", AclAction::Subscribe)
                .await
        );
    }

    #[tokio::test]
    async fn test_publish_default_allow_without_publish_acl() {
        let plugin = acl_plugin(
            r#"
[topic-check]
enabled = true

[topic-check.acl]
alice = ["a/#"]
"#,
        );
        let session = alice();
        assert!(
            plugin
                .allow_topic(&session, "b/c", AclAction::Publish)
                .await
        );
    }

    #[tokio::test]
    async fn test_anonymous_fallback_username() {
        let plugin = acl_plugin(
            r#"
[topic-check]
enabled = true

[topic-check.acl]
anonymous = ["public/#"]
"#,
        );
        let session = SessionInfo {
            client_id: "c2".to_string(),
            username: None,
            ..SessionInfo::default()
        };
        assert!(
            plugin
                .allow_topic(&session, "public/news", AclAction::Subscribe)
                .await
        );
        assert!(
            !plugin
                .allow_topic(&session, "private/x", AclAction::Subscribe)
                .await
        );
    }
}
