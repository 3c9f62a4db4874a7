//! Topic name and filter validation
//!
//! Per MQTT v3.1.1 section 4.7:
//! - Topic names (PUBLISH) must not contain wildcards
//! - Multi-level wildcard (#) must be the last level
//! - Single-level wildcard (+) must occupy an entire level

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();

        match level {
            "#" => {
                // Per MQTT-4.7.1-2: # must be the last level
                if !is_last {
                    return Err("multi-level wildcard must be the last level");
                }
            }
            "+" => {}
            _ => {
                // Per MQTT-4.7.1-3: wildcards must occupy an entire level
                if level.contains('#') || level.contains('+') {
                    return Err("wildcard must occupy an entire topic level");
                }
            }
        }
    }

    Ok(())
}

/// Check whether a topic name matches a filter, outside the trie.
/// Used for matching retained topics against a new subscription.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // Per MQTT-4.7.2-1: $-topics don't match filters starting with a wildcard
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_reject_wildcards() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("/leading").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn filters_constrain_wildcard_placement() {
        assert!(validate_topic_filter("a/b/c").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+/c").is_err());
    }

    #[test]
    fn direct_filter_matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("$SYS/x", "#"));
        assert!(topic_matches_filter("$SYS/x", "$SYS/#"));
    }
}
