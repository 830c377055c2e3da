//! Topic name validation
//!
//! A topic name becomes a directory under the data dir and a descriptor file
//! name, so only a conservative character set is accepted.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum topic name length
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

/// Must start with an alphanumeric character, then alphanumerics, dots,
/// hyphens and underscores
static TOPIC_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").expect("topic name regex is valid")
});

/// Names that collide with directories the storage layer owns
const RESERVED_TOPIC_NAMES: &[&str] = &["metadata"];

/// Validate a topic name
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidTopicName("topic name cannot be empty".into()));
    }

    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err(Error::InvalidTopicName(format!(
            "{}: {} chars (max: {})",
            name,
            name.len(),
            MAX_TOPIC_NAME_LENGTH
        )));
    }

    if !TOPIC_NAME_REGEX.is_match(name) || name.contains("..") {
        return Err(Error::InvalidTopicName(name.to_string()));
    }

    if RESERVED_TOPIC_NAMES.contains(&name) {
        return Err(Error::InvalidTopicName(format!("{} is reserved", name)));
    }

    Ok(())
}
