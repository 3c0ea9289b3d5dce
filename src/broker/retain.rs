// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{QoS, Topic};
use std::collections::HashMap;

/// The last retained message of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Map from exact topic to its last retained message.
///
/// A retained publish with an empty payload deletes the entry
/// [MQTT-3.3.1-10].
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: HashMap<String, RetainedMessage>,
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or delete the retained message of `topic`.
    pub fn apply(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        if payload.is_empty() {
            if self.messages.remove(topic).is_some() {
                log::debug!("retain: Removed retained message of {topic}");
            }
        } else {
            self.messages.insert(
                topic.to_string(),
                RetainedMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos,
                },
            );
        }
    }

    /// Collect the retained messages whose topics match `filter`.
    #[must_use]
    pub fn matches(&self, filter: &Topic) -> Vec<RetainedMessage> {
        self.messages
            .values()
            .filter(|msg| filter.is_match(&msg.topic))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_match() {
        let mut store = RetainedStore::new();
        store.apply("sensors/1", b"42", QoS::AtMostOnce);
        store.apply("sensors/2", b"43", QoS::AtLeastOnce);

        let filter = Topic::parse("sensors/+").unwrap();
        let mut matches = store.matches(&filter);
        matches.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].payload, b"42");

        let filter = Topic::parse("sensors/1").unwrap();
        assert_eq!(store.matches(&filter).len(), 1);
    }

    #[test]
    fn test_latest_wins() {
        let mut store = RetainedStore::new();
        store.apply("a", b"1", QoS::AtMostOnce);
        store.apply("a", b"2", QoS::AtMostOnce);
        assert_eq!(store.len(), 1);
        let filter = Topic::parse("a").unwrap();
        assert_eq!(store.matches(&filter)[0].payload, b"2");
    }

    #[test]
    fn test_empty_payload_deletes() {
        let mut store = RetainedStore::new();
        store.apply("a/b", b"1", QoS::AtMostOnce);
        store.apply("a/b", b"", QoS::AtMostOnce);
        assert!(store.is_empty());
        let filter = Topic::parse("a/b").unwrap();
        assert!(store.matches(&filter).is_empty());
    }
}
