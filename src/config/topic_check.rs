// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::collections::HashMap;

/// The `topic-check` section, consumed by topic filtering plugins.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicCheck {
    /// Run topic filtering plugins on subscribe and publish actions.
    ///
    /// Default is false.
    #[serde(default)]
    enabled: bool,

    /// Names of topic filtering plugins.
    ///
    /// Default is `["topic-acl"]`.
    #[serde(default = "TopicCheck::default_plugins")]
    plugins: Vec<String>,

    /// Map from username to topic filters the user may subscribe to.
    ///
    /// The username `anonymous` is used for sessions that presented no
    /// username.
    #[serde(default)]
    acl: HashMap<String, Vec<String>>,

    /// Map from username to topic filters the user may publish to.
    ///
    /// When absent, publishing is permitted to every authenticated user,
    /// which keeps old configs working.
    #[serde(default, rename = "publish-acl", alias = "publish_acl")]
    publish_acl: Option<HashMap<String, Vec<String>>>,
}

impl Default for TopicCheck {
    fn default() -> Self {
        Self {
            enabled: false,
            plugins: Self::default_plugins(),
            acl: HashMap::new(),
            publish_acl: None,
        }
    }
}

impl TopicCheck {
    fn default_plugins() -> Vec<String> {
        vec!["topic-acl".to_string()]
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    #[must_use]
    pub const fn acl(&self) -> &HashMap<String, Vec<String>> {
        &self.acl
    }

    #[must_use]
    pub const fn publish_acl(&self) -> Option<&HashMap<String, Vec<String>>> {
        self.publish_acl.as_ref()
    }
}
