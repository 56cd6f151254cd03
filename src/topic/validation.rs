//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #) or NUL
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy an entire level and be last
//! - Single-level wildcard (+) must occupy an entire level
//! - Shared subscriptions are `$share/{group}/{filter}`
//! - Topics starting with $ are system topics with special matching rules

use super::TopicError;

/// Maximum encoded length of a topic name or filter in bytes
const MAX_TOPIC_LENGTH: usize = 65535;

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::InvalidTopic("topic name cannot be empty"));
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::InvalidTopic("topic name exceeds maximum length"));
    }

    if topic.contains('\0') {
        return Err(TopicError::InvalidTopic(
            "topic name cannot contain null character",
        ));
    }

    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::InvalidTopic(
            "topic name cannot contain wildcards",
        ));
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
///
/// Shared subscription filters (`$share/{group}/{filter}`) are accepted;
/// the group name and the inner filter are each validated.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::InvalidTopicFilter("topic filter cannot be empty"));
    }

    if filter.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::InvalidTopicFilter(
            "topic filter exceeds maximum length",
        ));
    }

    if filter.contains('\0') {
        return Err(TopicError::InvalidTopicFilter(
            "topic filter cannot contain null character",
        ));
    }

    let actual_filter = if filter.starts_with("$share/") {
        validate_shared_subscription(filter)?.1
    } else {
        filter
    };

    let levels: Vec<&str> = actual_filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            // # must be the entire level and the last level
            if *level != "#" {
                return Err(TopicError::InvalidTopicFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if i != levels.len() - 1 {
                return Err(TopicError::InvalidTopicFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }

        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidTopicFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    Ok(())
}

/// Validate and split a shared subscription filter
///
/// Returns `(group, inner_filter)` for a well-formed
/// `$share/{group}/{filter}`.
pub fn validate_shared_subscription(filter: &str) -> Result<(&str, &str), TopicError> {
    let rest = filter.strip_prefix("$share/").ok_or(
        TopicError::InvalidSharedSubscription("filter must begin with $share/"),
    )?;

    let slash_pos = rest.find('/').ok_or(TopicError::InvalidSharedSubscription(
        "missing separator after group name",
    ))?;

    let group = &rest[..slash_pos];
    let inner = &rest[slash_pos + 1..];

    if group.is_empty() {
        return Err(TopicError::InvalidSharedSubscription(
            "group name cannot be empty",
        ));
    }
    if group.contains('+') || group.contains('#') {
        return Err(TopicError::InvalidSharedSubscription(
            "group name cannot contain wildcards",
        ));
    }
    if inner.is_empty() {
        return Err(TopicError::InvalidSharedSubscription(
            "inner filter cannot be empty",
        ));
    }

    Ok((group, inner))
}

/// Parse a shared subscription filter
///
/// Returns `(share_group, actual_filter)` if it's a well-formed shared
/// subscription, or None.
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    validate_shared_subscription(filter).ok()
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            // # matches everything remaining
            return true;
        }

        if ti >= topic_levels.len() {
            // No more topic levels but filter has more non-# levels
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    // Both must be exhausted for a match
    ti == topic_levels.len()
}
