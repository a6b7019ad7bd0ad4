//! MQTT topic name utilities.
//!
//! The broker stores every topic under a normalised name that ends in `/`,
//! so `sensors/temp` and `sensors/temp/` address the same node. Subscription
//! filters may additionally end in `/#`, the multi-level wildcard; the
//! single-level `+` wildcard is not expanded and is treated as a literal
//! level.

use core::fmt;

/// Maximum topic name/filter length in bytes (UTF-8 encoded).
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Error type for topic validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Topic is empty (zero length).
    Empty,
    /// Topic exceeds maximum length.
    TooLong,
    /// Topic contains a null character (U+0000).
    ContainsNullChar,
    /// Wildcard characters are not allowed in publish topics.
    WildcardInPublishTopic,
    /// Multi-level wildcard (#) must be the last level of a filter.
    InvalidMultiLevelWildcard,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Empty => write!(f, "topic name cannot be empty"),
            TopicError::TooLong => write!(
                f,
                "topic name exceeds maximum length of {} bytes",
                MAX_TOPIC_LENGTH
            ),
            TopicError::ContainsNullChar => {
                write!(f, "topic name cannot contain null character")
            }
            TopicError::WildcardInPublishTopic => {
                write!(f, "wildcard characters (+, #) not allowed in publish topics")
            }
            TopicError::InvalidMultiLevelWildcard => {
                write!(f, "multi-level wildcard (#) must be the last level")
            }
        }
    }
}

impl std::error::Error for TopicError {}

/// A parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches a single topic, by normalised name.
    Exact(String),
    /// `prefix/#` — matches the prefix topic and every descendant.
    Prefix(String),
}

impl Filter {
    /// The normalised topic name the filter is anchored at.
    pub fn topic_name(&self) -> &str {
        match self {
            Filter::Exact(name) | Filter::Prefix(name) => name,
        }
    }
}

/// Normalise a topic name so that it ends in `/`.
pub fn normalize(topic: &str) -> String {
    if topic.ends_with('/') {
        topic.to_string()
    } else {
        format!("{}/", topic)
    }
}

/// Parse a subscription filter into its normalised form.
///
/// A trailing `/#` (or a bare `#`) marks a multi-level wildcard anchored at
/// the remaining prefix; anything else is an exact subscription.
pub fn parse_filter(filter: &str) -> Result<Filter, TopicError> {
    validate_common(filter)?;

    if filter == "#" {
        return Ok(Filter::Prefix("/".to_string()));
    }

    if let Some(prefix) = filter.strip_suffix("/#") {
        return Ok(Filter::Prefix(normalize(prefix)));
    }

    if filter.contains('#') {
        return Err(TopicError::InvalidMultiLevelWildcard);
    }

    Ok(Filter::Exact(normalize(filter)))
}

/// Validate a topic name used in a PUBLISH packet.
///
/// Publish topic names must not be empty, must not exceed 65535 bytes, must
/// not contain null characters and must not contain wildcard characters.
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInPublishTopic);
    }

    Ok(())
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }

    if topic.contains('\0') {
        return Err(TopicError::ContainsNullChar);
    }

    Ok(())
}
