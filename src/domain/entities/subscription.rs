//! Topic subscriptions and the messages routed through them

use std::fmt;

use chrono::{DateTime, Utc};

use crate::application::errors::CommandError;

/// An MQTT topic filter, e.g. `home/+/temperature` or `sensors/#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Validates MQTT filter syntax: `+` must occupy a whole level and `#`
    /// must be the whole last level.
    pub fn parse(filter: &str) -> Result<Self, CommandError> {
        let filter = filter.trim();
        if filter.is_empty() {
            return Err(CommandError::InvalidArgs("topic filter is empty".to_string()));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
                return Err(CommandError::InvalidArgs(format!(
                    "'#' must be the last level on its own: {}",
                    filter
                )));
            }
            if level.contains('+') && *level != "+" {
                return Err(CommandError::InvalidArgs(format!(
                    "'+' must occupy a whole level: {}",
                    filter
                )));
            }
        }

        Ok(Self(filter.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.contains(['+', '#'])
    }

    /// MQTT matching. Topics starting with `$` are not matched by a
    /// wildcard in the first level.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && self.0.starts_with(['+', '#']) {
            return false;
        }

        let mut filter_levels = self.0.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(f), Some(t)) if f == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user's subscription to a topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub chat_id: String,
    pub filter: TopicFilter,
    pub created_at: String,
}

/// One publish on a topic, addressed to one subscribed chat.
///
/// Consumed exactly once by a dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMessage {
    pub chat_id: String,
    pub topic: String,
    pub filter: TopicFilter,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl SubscriptionMessage {
    pub fn new(chat_id: impl Into<String>, topic: impl Into<String>, filter: TopicFilter, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            chat_id: chat_id.into(),
            topic: topic.into(),
            filter,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("a/#/b").is_err());
        assert!(TopicFilter::parse("a/b#").is_err());
        assert!(TopicFilter::parse("a/+b").is_err());
        assert!(TopicFilter::parse("a/+/#").is_ok());
    }

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(filter("home/kitchen/temp").matches("home/kitchen/temp"));
        assert!(!filter("home/kitchen/temp").matches("home/kitchen"));

        assert!(filter("home/+/temp").matches("home/hall/temp"));
        assert!(!filter("home/+/temp").matches("home/hall/humidity"));
        assert!(!filter("home/+").matches("home/hall/temp"));

        assert!(filter("home/#").matches("home"));
        assert!(filter("home/#").matches("home/hall/temp"));
        assert!(filter("#").matches("anything/at/all"));
    }

    #[test]
    fn dollar_topics_need_explicit_prefix() {
        assert!(!filter("#").matches("$SYS/uptime"));
        assert!(!filter("+/uptime").matches("$SYS/uptime"));
        assert!(filter("$SYS/#").matches("$SYS/uptime"));
    }

    #[test]
    fn payload_text_is_lossy() {
        let msg = SubscriptionMessage::new("1", "a/b", filter("a/#"), vec![b'o', b'k', 0xff]);
        assert_eq!(msg.payload_text(), "ok\u{fffd}");
    }
}
