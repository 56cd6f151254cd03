//! Topic names, topic filters and their validation
//!
//! Implements the bytewise validation rules for MQTT topic names and
//! filters, shared-subscription filter parsing, and a linear filter
//! matcher used as the oracle for the trie-based router.

mod validation;

pub use validation::{
    parse_shared_subscription, topic_matches_filter, validate_shared_subscription,
    validate_topic_filter, validate_topic_name,
};

use std::fmt;

/// Errors produced by topic name/filter validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Topic name violates a publish-topic rule; carries the cause
    InvalidTopic(&'static str),
    /// Topic filter violates a subscribe-filter rule; carries the cause
    InvalidTopicFilter(&'static str),
    /// Shared subscription filter is malformed
    InvalidSharedSubscription(&'static str),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(cause) => write!(f, "invalid topic name: {}", cause),
            Self::InvalidTopicFilter(cause) => write!(f, "invalid topic filter: {}", cause),
            Self::InvalidSharedSubscription(cause) => {
                write!(f, "invalid shared subscription: {}", cause)
            }
        }
    }
}

impl std::error::Error for TopicError {}
