//! MQTT topic filter helpers
//!
//! Listeners attach to topic filters, so wildcard matching decides which
//! live streams an incoming message reaches.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic filter is empty")]
    Empty,
    #[error("multi-level wildcard must be the last level: {0}")]
    MisplacedMultiLevelWildcard(String),
    #[error("wildcard must occupy a whole level: {0}")]
    PartialWildcard(String),
    #[error("topic contains a null character")]
    NullCharacter,
}

/// Validate a subscription topic filter
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NullCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(TopicError::PartialWildcard(filter.to_string()));
            }
            if index != levels.len() - 1 {
                return Err(TopicError::MisplacedMultiLevelWildcard(filter.to_string()));
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::PartialWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Check whether a concrete topic matches a subscription filter
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    // `$`-prefixed system topics never match a leading wildcard
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn has_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}
