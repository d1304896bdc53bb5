//! Topic matching and construction for the device topic namespace
//!
//! Patterns are `/`-separated segments where `+` matches exactly one level and
//! a trailing `#` matches zero or more remaining levels. Segments are compared
//! literally: no escaping, and empty segments produced by `//` or by leading or
//! trailing slashes are ordinary (empty) segments.

/// Single-level wildcard segment
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard segment, only meaningful as the final segment
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Subscription pattern for telemetry from every device
pub const DEVICE_DATA_PATTERN: &str = "devices/+/data";
/// Subscription pattern for status from every device
pub const DEVICE_STATUS_PATTERN: &str = "devices/+/status";
/// Catch-all pattern for anything under the `devices/` prefix
pub const DEVICE_CATCH_ALL_PATTERN: &str = "devices/#";

/// Decide whether a concrete `topic` matches a subscription `pattern`
///
/// Total and side-effect free for any pair of strings.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if pattern_parts.last() == Some(&MULTI_LEVEL_WILDCARD) {
        pattern_parts.pop();
        // Extra topic levels beyond the prefix are accepted unconditionally
        return topic_parts.len() >= pattern_parts.len()
            && segments_match(&pattern_parts, &topic_parts);
    }

    pattern_parts.len() == topic_parts.len() && segments_match(&pattern_parts, &topic_parts)
}

/// Positional comparison of the pattern prefix against the topic
fn segments_match(pattern_parts: &[&str], topic_parts: &[&str]) -> bool {
    pattern_parts
        .iter()
        .zip(topic_parts)
        .all(|(pattern, topic)| *pattern == SINGLE_LEVEL_WILDCARD || pattern == topic)
}

/// True when the pattern contains a wildcard segment
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split('/')
        .any(|segment| segment == SINGLE_LEVEL_WILDCARD || segment == MULTI_LEVEL_WILDCARD)
}

/// Construction and parsing of the `devices/{id}/{kind}` namespace
pub struct TopicBuilder;

impl TopicBuilder {
    /// `devices/{device_id}/data`
    pub fn data_topic(device_id: &str) -> String {
        format!("devices/{device_id}/data")
    }

    /// `devices/{device_id}/status`
    pub fn status_topic(device_id: &str) -> String {
        format!("devices/{device_id}/status")
    }

    /// Extract the device id segment from a `devices/{id}/...` topic
    pub fn device_id_from_topic(topic: &str) -> Option<&str> {
        let mut parts = topic.split('/');
        match (parts.next(), parts.next()) {
            (Some("devices"), Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("devices/+/data", "devices/dev-1/data"));
        assert!(!matches("devices/+/data", "devices/dev-1/data/extra"));
        assert!(!matches("devices/+/data", "devices/dev-1/status"));
        assert!(!matches("devices/+/data", "devices/data"));
        assert!(matches("+/+/+", "a/b/c"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("devices/#", "devices/dev-1/status"));
        assert!(matches("devices/#", "devices/dev-1/a/b/c"));
        assert!(!matches("devices/#", "other/x"));
        assert!(matches("#", "anything/at/all"));
        assert!(matches("devices/+/#", "devices/dev-1/data"));
        assert!(!matches("devices/+/#", "sensors/dev-1/data"));
    }

    #[test]
    fn test_hash_with_zero_extra_segments() {
        // The prefix alone is enough
        assert!(matches("devices/#", "devices"));
        assert!(matches("devices/+/#", "devices/dev-1"));
        assert!(!matches("devices/+/#", "devices"));
    }

    #[test]
    fn test_exact_patterns() {
        assert!(matches("devices/dev-1/data", "devices/dev-1/data"));
        assert!(!matches("devices/dev-1/data", "devices/dev-2/data"));
        assert!(!matches("devices/dev-1/data", "devices/dev-1/data/"));
    }

    #[test]
    fn test_empty_segments_are_literal() {
        assert!(matches("devices//data", "devices//data"));
        assert!(matches("devices/+/data", "devices//data"));
        assert!(!matches("devices/+/data", "/devices/x/data"));
        assert!(matches("+/devices/+/data", "/devices/x/data"));
        assert!(matches("", ""));
        assert!(!matches("", "a"));
        assert!(matches("#", ""));
    }

    #[test]
    fn test_hash_only_special_at_end() {
        // A non-final '#' is an ordinary literal segment
        assert!(matches("a/#/c", "a/#/c"));
        assert!(!matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("devices/+/data"));
        assert!(is_wildcard("devices/#"));
        assert!(!is_wildcard("devices/dev-1/data"));
        assert!(!is_wildcard("devices/a+b/data"));
    }

    #[test]
    fn test_topic_builder() {
        assert_eq!(TopicBuilder::data_topic("dev-1"), "devices/dev-1/data");
        assert_eq!(TopicBuilder::status_topic("dev-1"), "devices/dev-1/status");
        assert_eq!(
            TopicBuilder::device_id_from_topic("devices/dev-1/data"),
            Some("dev-1")
        );
        assert_eq!(TopicBuilder::device_id_from_topic("devices//data"), None);
        assert_eq!(TopicBuilder::device_id_from_topic("other/dev-1/data"), None);
        assert_eq!(TopicBuilder::device_id_from_topic("devices"), None);
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[a-z0-9-]{1,6}",
        ]
    }

    fn topic_segments() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(segment(), 1..6)
    }

    proptest! {
        #[test]
        fn matches_never_panics(pattern in ".*", topic in ".*") {
            let _ = matches(&pattern, &topic);
        }

        #[test]
        fn topic_matches_itself(parts in topic_segments()) {
            let topic = parts.join("/");
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn plus_pattern_matches_iff_same_length(
            parts in topic_segments(),
            mask in prop::collection::vec(any::<bool>(), 6),
            extra in 0usize..3,
        ) {
            let topic = parts.join("/");
            let pattern_parts: Vec<String> = parts
                .iter()
                .zip(&mask)
                .map(|(part, wild)| if *wild { "+".to_string() } else { part.clone() })
                .collect();
            let pattern = pattern_parts.join("/");
            prop_assert!(matches(&pattern, &topic));

            // More topic levels than a non-# pattern never match
            let mut longer = parts.clone();
            longer.extend(std::iter::repeat("x".to_string()).take(extra + 1));
            prop_assert!(!matches(&pattern, &longer.join("/")));
        }

        #[test]
        fn hash_pattern_accepts_any_suffix(
            prefix in topic_segments(),
            suffix in prop::collection::vec(segment(), 0..4),
        ) {
            let pattern = format!("{}/#", prefix.join("/"));
            let mut topic_parts = prefix.clone();
            topic_parts.extend(suffix);
            prop_assert!(matches(&pattern, &topic_parts.join("/")));
        }

        #[test]
        fn hash_pattern_rejects_shorter_topics(prefix in prop::collection::vec("[a-z]{1,4}", 2..5)) {
            let pattern = format!("{}/#", prefix.join("/"));
            let shorter = prefix[..prefix.len() - 1].join("/");
            prop_assert!(!matches(&pattern, &shorter));
        }
    }
}
