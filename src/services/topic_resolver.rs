//! Topic derivation - which topics the bridge subscribes to
//!
//! Pure function of the registered device configs. Per device:
//! 1. the device's own publish topic, verbatim
//! 2. the per-device inbox topic, when a client credential is known
//! 3. a coarse wildcard scoped by the device id, when neither is known
//!
//! Output is grouped by tier (most specific first), then registration order,
//! with the optional diagnostic catch-all last.

use crate::domain::device::DeviceConfig;
use crate::infra::config::Config;

/// Characters that cannot appear inside a single topic level
const UNSAFE_TOPIC_CHARS: [char; 4] = [':', '/', '+', '#'];

/// Ordered, de-duplicated set of topics the bridge intends to subscribe to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet(Vec<String>);

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a topic unless already present. Returns true if it was added.
    pub fn push(&mut self, topic: String) -> bool {
        if self.0.iter().any(|t| *t == topic) {
            return false;
        }
        self.0.push(topic);
        true
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.0.iter().any(|t| t == topic)
    }

    /// Remove a topic. Returns true if it was present.
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t != topic);
        self.0.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a SubscriptionSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Replace characters that are not allowed inside a topic level
pub fn safe_identifier(id: &str) -> String {
    id.chars().map(|c| if UNSAFE_TOPIC_CHARS.contains(&c) { '_' } else { c }).collect()
}

#[derive(Debug, Clone)]
pub struct TopicResolver {
    inbox_prefix: String,
    wildcard_prefix: String,
    diagnostic_topic: Option<String>,
}

impl TopicResolver {
    pub fn new(
        inbox_prefix: impl Into<String>,
        wildcard_prefix: impl Into<String>,
        diagnostic_topic: Option<String>,
    ) -> Self {
        Self {
            inbox_prefix: inbox_prefix.into(),
            wildcard_prefix: wildcard_prefix.into(),
            diagnostic_topic,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.inbox_prefix(),
            config.wildcard_prefix(),
            config.diagnostic_topic().map(str::to_string),
        )
    }

    pub fn diagnostic_topic(&self) -> Option<&str> {
        self.diagnostic_topic.as_deref()
    }

    /// Inbox topic for server-to-device messages
    pub fn inbox_topic(&self, device_id: &str) -> String {
        format!("{}{}", self.inbox_prefix, safe_identifier(device_id))
    }

    fn wildcard_topic(&self, device_id: &str) -> String {
        format!("{}{}/#", self.wildcard_prefix, safe_identifier(device_id))
    }

    /// Resolve the subscription set for the given devices
    pub fn resolve(&self, configs: &[DeviceConfig]) -> SubscriptionSet {
        let mut publish_topics = Vec::new();
        let mut inbox_topics = Vec::new();
        let mut wildcard_topics = Vec::new();

        for device in configs {
            let publish = device.publish_topic.as_deref().filter(|t| !t.is_empty());
            let credential = device.client_credential_id.as_deref().filter(|c| !c.is_empty());

            if let Some(topic) = publish {
                publish_topics.push(topic.to_string());
            }
            if credential.is_some() {
                inbox_topics.push(self.inbox_topic(&device.device_id));
            }
            if publish.is_none() && credential.is_none() {
                wildcard_topics.push(self.wildcard_topic(&device.device_id));
            }
        }

        let mut set = SubscriptionSet::new();
        for topic in publish_topics.into_iter().chain(inbox_topics).chain(wildcard_topics) {
            set.push(topic);
        }

        // Diagnostic visibility only makes sense once there is something to watch
        if !configs.is_empty() {
            if let Some(topic) = &self.diagnostic_topic {
                set.push(topic.clone());
            }
        }

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TopicResolver {
        TopicResolver::new("devices/p2p/", "devices/", None)
    }

    fn topics(set: &SubscriptionSet) -> Vec<&str> {
        set.iter().collect()
    }

    #[test]
    fn test_publish_topic_only() {
        let device = DeviceConfig::new("dev1", "broker").with_publish_topic("x/y/publish");
        let set = resolver().resolve(&[device]);
        assert_eq!(topics(&set), vec!["x/y/publish"]);
    }

    #[test]
    fn test_publish_topic_plus_diagnostic() {
        let resolver = TopicResolver::new("devices/p2p/", "devices/", Some("#".to_string()));
        let device = DeviceConfig::new("dev1", "broker").with_publish_topic("x/y/publish");
        let set = resolver.resolve(&[device]);
        assert_eq!(topics(&set), vec!["x/y/publish", "#"]);
    }

    #[test]
    fn test_inbox_topic_replaces_separators() {
        let device = DeviceConfig::new("aa:bb:cc:dd:ee:ff", "broker")
            .with_client_credential_id("GID_test@@@aa_bb_cc_dd_ee_ff");
        let set = resolver().resolve(&[device]);
        assert_eq!(topics(&set), vec!["devices/p2p/aa_bb_cc_dd_ee_ff"]);
    }

    #[test]
    fn test_both_known_collects_both_most_specific_first() {
        let device = DeviceConfig::new("aa:bb", "broker")
            .with_client_credential_id("cid")
            .with_publish_topic("device-server");
        let set = resolver().resolve(&[device]);
        assert_eq!(topics(&set), vec!["device-server", "devices/p2p/aa_bb"]);
    }

    #[test]
    fn test_wildcard_fallback_when_nothing_known() {
        let device = DeviceConfig::new("aa:bb", "broker");
        let set = resolver().resolve(&[device]);
        assert_eq!(topics(&set), vec!["devices/aa_bb/#"]);
    }

    #[test]
    fn test_empty_strings_count_as_unknown() {
        let device = DeviceConfig::new("d1", "broker")
            .with_client_credential_id("")
            .with_publish_topic("");
        let set = resolver().resolve(&[device]);
        assert_eq!(topics(&set), vec!["devices/d1/#"]);
    }

    #[test]
    fn test_tiers_ordered_across_devices_and_deduplicated() {
        let devices = vec![
            DeviceConfig::new("a", "broker").with_client_credential_id("ca"),
            DeviceConfig::new("b", "broker"),
            DeviceConfig::new("c", "broker").with_publish_topic("device-server"),
            DeviceConfig::new("d", "broker")
                .with_publish_topic("device-server")
                .with_client_credential_id("cd"),
        ];
        let set = resolver().resolve(&devices);
        assert_eq!(
            topics(&set),
            vec!["device-server", "devices/p2p/a", "devices/p2p/d", "devices/b/#"]
        );
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let devices = vec![
            DeviceConfig::new("a", "broker").with_client_credential_id("ca"),
            DeviceConfig::new("b", "broker").with_publish_topic("b/out"),
        ];
        let r = resolver();
        assert_eq!(r.resolve(&devices), r.resolve(&devices));
    }

    #[test]
    fn test_no_devices_resolves_empty_even_with_diagnostic() {
        let resolver = TopicResolver::new("devices/p2p/", "devices/", Some("#".to_string()));
        assert!(resolver.resolve(&[]).is_empty());
    }

    #[test]
    fn test_safe_identifier() {
        assert_eq!(safe_identifier("aa:bb/cc+dd#"), "aa_bb_cc_dd_");
        assert_eq!(safe_identifier("plain-id"), "plain-id");
    }

    #[test]
    fn test_subscription_set_push_dedup() {
        let mut set = SubscriptionSet::new();
        assert!(set.push("a".to_string()));
        assert!(!set.push("a".to_string()));
        assert_eq!(set.len(), 1);
        assert!(set.contains("a"));
    }
}
